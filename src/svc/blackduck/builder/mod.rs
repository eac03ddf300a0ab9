//! # Builder module
//!
//! This module provide the component builders of an instance. A builder is a
//! pure function of the custom resource and of a few inputs resolved by the
//! reconciler, it returns the component set the diff/apply engine converges
//! the cluster to. Builders are selected by the declared version through the
//! release table.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;

use crate::svc::{
    blackduck::database::Credentials,
    component::ComponentList,
    crd::blackduck::{self, Blackduck},
};

pub mod components;
pub mod flavor;
pub mod release;

// -----------------------------------------------------------------------------
// Constants

pub const SERVICE_ACCOUNT: &str = "serviceaccount";
pub const CONFIG: &str = "configmap";
pub const SECRET: &str = "secret";
pub const POSTGRES: &str = "postgres";
pub const CFSSL: &str = "cfssl";
pub const LOGSTASH: &str = "logstash";
pub const REGISTRATION: &str = "registration";
pub const ZOOKEEPER: &str = "zookeeper";
pub const AUTHENTICATION: &str = "authentication";
pub const WEBAPP: &str = "webapp";
pub const SCAN: &str = "scan";
pub const JOBRUNNER: &str = "jobrunner";
pub const SOLR: &str = "solr";
pub const DOCUMENTATION: &str = "documentation";
pub const WEBSERVER: &str = "webserver";
pub const WEBSERVER_EXPOSED: &str = "webserver-exposed";
pub const BINARY_SCANNER: &str = "binaryscanner";
pub const RABBITMQ: &str = "rabbitmq";
pub const UPLOAD_CACHE: &str = "uploadcache";
pub const ROUTE: &str = "route";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to select flavor, {0}")]
    Flavor(flavor::Error),
    #[error("failed to select release, {0}")]
    Release(release::Error),
    #[error("failed to read exposure, {0}")]
    Exposure(blackduck::Error),
}

impl From<flavor::Error> for Error {
    fn from(err: flavor::Error) -> Self {
        Self::Flavor(err)
    }
}

impl From<release::Error> for Error {
    fn from(err: release::Error) -> Self {
        Self::Release(err)
    }
}

impl From<blackduck::Error> for Error {
    fn from(err: blackduck::Error) -> Self {
        Self::Exposure(err)
    }
}

// -----------------------------------------------------------------------------
// Inputs structure

/// values resolved by the reconciler before building components
#[derive(Clone, Debug)]
pub struct Inputs<'a> {
    /// registry used for images which are not overridden
    pub registry: &'a str,
    pub credentials: &'a Credentials,
}

// -----------------------------------------------------------------------------
// ComponentBuilder trait

pub trait ComponentBuilder: Send + Sync {
    /// returns the version of the application built
    fn version(&self) -> &'static str;

    /// returns the storage claims of the instance, none without persistent
    /// storage
    fn claims(&self, instance: &Blackduck) -> Vec<PersistentVolumeClaim>;

    /// returns the whole component set of the instance
    fn components(&self, instance: &Blackduck, inputs: &Inputs<'_>)
        -> Result<ComponentList, Error>;
}

/// returns the builder of the version declared by the instance
pub fn builder(instance: &Blackduck) -> Result<&'static dyn ComponentBuilder, Error> {
    Ok(release::Release::find(&instance.version())?)
}

/// returns the name of a sub-resource of the instance
pub fn name(instance: &str, suffix: &str) -> String {
    format!("{}-{}-{}", instance, blackduck::APP, suffix)
}
