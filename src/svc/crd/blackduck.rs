//! # Blackduck custom resource
//!
//! This module provide the blackduck custom resource, its definition and
//! helpers to read the declared spec

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const APP: &str = "blackduck";
pub const ENVIRON_BINARY_UPLOADS: &str = "USE_BINARY_UPLOADS";
pub const ENVIRON_VERSION: &str = "HUB_VERSION";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, PartialEq, Eq, Clone, Debug)]
pub enum Error {
    #[error("failed to parse state '{0}', available options are 'Running', 'Stopped' or 'DbMigrate'")]
    State(String),
    #[error("failed to parse exposure '{0}', available options are 'NODEPORT', 'LOADBALANCER', 'OPENSHIFT' or 'NONE'")]
    Exposure(String),
}

// -----------------------------------------------------------------------------
// State enumeration

/// state of an instance, used both as declared target and as reported state
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum State {
    Pending,
    Creating,
    Running,
    Stopped,
    DbMigrate,
    Error,
    UnexpectedState,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::DbMigrate => write!(f, "DbMigrate"),
            Self::Error => write!(f, "Error"),
            Self::UnexpectedState => write!(f, "UnexpectedState"),
        }
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "dbmigrate" => Ok(Self::DbMigrate),
            "error" => Ok(Self::Error),
            "unexpectedstate" => Ok(Self::UnexpectedState),
            _ => Err(Error::State(s.to_string())),
        }
    }
}

/// read an empty string as an absent state and tolerate unknown values which
/// are reported as [`State::UnexpectedState`]
fn state_from_str<'de, D>(deserializer: D) -> Result<Option<State>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;

    Ok(match s.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(s.parse().unwrap_or(State::UnexpectedState)),
    })
}

// -----------------------------------------------------------------------------
// Exposure enumeration

/// how the web server of an instance is exposed outside of the cluster
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Exposure {
    NodePort,
    LoadBalancer,
    Route,
    None,
}

impl FromStr for Exposure {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NODEPORT" => Ok(Self::NodePort),
            "LOADBALANCER" => Ok(Self::LoadBalancer),
            "OPENSHIFT" | "ROUTE" => Ok(Self::Route),
            "" | "NONE" => Ok(Self::None),
            _ => Err(Error::Exposure(s.to_string())),
        }
    }
}

// -----------------------------------------------------------------------------
// ExternalDatabase structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ExternalDatabase {
    #[serde(rename = "postgresHost")]
    pub host: String,
    #[serde(rename = "postgresPort")]
    pub port: u16,
    #[serde(rename = "postgresAdmin")]
    pub admin: String,
    #[serde(rename = "postgresUser")]
    pub user: String,
    #[serde(rename = "postgresSsl")]
    pub ssl: bool,
    #[serde(rename = "postgresAdminPassword", default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(rename = "postgresUserPassword", default, skip_serializing_if = "Option::is_none")]
    pub user_password: Option<String>,
}

// -----------------------------------------------------------------------------
// Claim structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Claim {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(rename = "storageClass", default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(rename = "volumeName", default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

// -----------------------------------------------------------------------------
// RegistryConfiguration structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RegistryConfiguration {
    #[serde(rename = "registry", default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(rename = "namespace", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "pullSecrets", default)]
    pub pull_secrets: Vec<String>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "synopsys.com")]
#[kube(version = "v1")]
#[kube(kind = "Blackduck")]
#[kube(singular = "blackduck")]
#[kube(plural = "blackducks")]
#[kube(shortname = "bds")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"State", "type":"string", "description":"State of the instance", "jsonPath":".status.state"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Address", "type":"string", "description":"Exposed address of the instance", "jsonPath":".status.ip"}"#
)]
pub struct Spec {
    /// namespace in which components are deployed, defaults to the namespace
    /// of the custom resource
    #[serde(rename = "namespace", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "size", default)]
    pub size: String,
    #[serde(rename = "version", default)]
    pub version: String,
    #[serde(rename = "exposeService", default)]
    pub expose_service: String,
    /// name of an instance whose database is cloned on first install
    #[serde(rename = "dbPrototype", default, skip_serializing_if = "Option::is_none")]
    pub db_prototype: Option<String>,
    #[serde(rename = "externalPostgres", default, skip_serializing_if = "Option::is_none")]
    pub external_postgres: Option<ExternalDatabase>,
    #[serde(rename = "pvcStorageClass", default, skip_serializing_if = "Option::is_none")]
    pub pvc_storage_class: Option<String>,
    #[serde(rename = "livenessProbes", default)]
    pub liveness_probes: bool,
    #[serde(rename = "scanType", default, skip_serializing_if = "Option::is_none")]
    pub scan_type: Option<String>,
    #[serde(rename = "persistentStorage", default)]
    pub persistent_storage: bool,
    #[serde(rename = "pvc", default)]
    pub pvc: Vec<Claim>,
    #[serde(rename = "certificateName", default, skip_serializing_if = "Option::is_none")]
    pub certificate_name: Option<String>,
    #[serde(rename = "certificate", default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(rename = "certificateKey", default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
    #[serde(rename = "proxyCertificate", default, skip_serializing_if = "Option::is_none")]
    pub proxy_certificate: Option<String>,
    #[serde(rename = "authCustomCa", default, skip_serializing_if = "Option::is_none")]
    pub auth_custom_ca: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(
        rename = "desiredState",
        default,
        deserialize_with = "state_from_str",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<String>")]
    pub desired_state: Option<State>,
    /// `KEY:VALUE` environment overrides
    #[serde(rename = "environs", default)]
    pub environs: Vec<String>,
    /// full image references overriding the image of the matching component
    #[serde(rename = "imageRegistries", default)]
    pub image_registries: Vec<String>,
    #[serde(rename = "licenseKey", default, skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    #[serde(rename = "registryConfiguration", default, skip_serializing_if = "Option::is_none")]
    pub registry_configuration: Option<RegistryConfiguration>,
    #[serde(rename = "adminPassword", default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(rename = "userPassword", default, skip_serializing_if = "Option::is_none")]
    pub user_password: Option<String>,
    #[serde(rename = "postgresPassword", default, skip_serializing_if = "Option::is_none")]
    pub postgres_password: Option<String>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(
        rename = "state",
        default,
        deserialize_with = "state_from_str",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<String>")]
    pub state: Option<State>,
    #[serde(rename = "ip", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(rename = "pvcVolumeName", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pvc_volume_name: BTreeMap<String, String>,
    #[serde(rename = "fqdn", default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    #[serde(rename = "errorMessage", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "observedGeneration", default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

// -----------------------------------------------------------------------------
// Blackduck implementation

impl Blackduck {
    /// returns the namespace in which the components of the instance live
    pub fn target_namespace(&self) -> String {
        match &self.spec.namespace {
            Some(namespace) if !namespace.is_empty() => namespace.to_owned(),
            _ => self.namespace().unwrap_or_else(|| self.name_any()),
        }
    }

    pub fn desired_state(&self) -> Option<State> {
        self.spec.desired_state
    }

    pub fn state(&self) -> Option<State> {
        self.status.as_ref().and_then(|status| status.state)
    }

    pub fn exposure(&self) -> Result<Exposure, Error> {
        self.spec.expose_service.parse()
    }

    /// returns the environment overrides as a map, entries without a colon
    /// are ignored
    pub fn environs(&self) -> BTreeMap<String, String> {
        self.spec
            .environs
            .iter()
            .filter_map(|environ| environ.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect()
    }

    pub fn binary_analysis(&self) -> bool {
        matches!(
            self.environs().get(ENVIRON_BINARY_UPLOADS).map(String::as_str),
            Some("1") | Some("true")
        )
    }

    /// returns the version of the application, `HUB_VERSION` environment
    /// override takes precedence over the declared version
    pub fn version(&self) -> String {
        self.environs()
            .remove(ENVIRON_VERSION)
            .unwrap_or_else(|| self.spec.version.to_owned())
    }

    pub fn license_key(&self) -> Option<&str> {
        self.spec
            .license_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
    }

    pub fn db_prototype(&self) -> Option<&str> {
        self.spec
            .db_prototype
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }

    /// returns if the latest declared generation has not yet been reconciled
    pub fn generation_changed(&self) -> bool {
        let observed = self
            .status
            .as_ref()
            .and_then(|status| status.observed_generation);

        match (self.metadata.generation, observed) {
            (Some(generation), Some(observed)) => generation > observed,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_desired_state_is_absent() {
        let bd: Blackduck = serde_json::from_value(serde_json::json!({
            "apiVersion": "synopsys.com/v1",
            "kind": "Blackduck",
            "metadata": { "name": "bd1", "namespace": "operators" },
            "spec": { "size": "small", "desiredState": "" },
            "status": { "state": "Running" }
        }))
        .unwrap();

        assert_eq!(bd.desired_state(), None);
        assert_eq!(bd.state(), Some(State::Running));
        assert_eq!(bd.target_namespace(), "operators");
    }

    #[test]
    fn unknown_desired_state_is_unexpected() {
        let spec: Spec = serde_json::from_value(serde_json::json!({
            "desiredState": "Paused"
        }))
        .unwrap();

        assert_eq!(spec.desired_state, Some(State::UnexpectedState));
    }

    #[test]
    fn environs_drive_version_and_binary_analysis() {
        let mut bd = Blackduck::new(
            "bd1",
            Spec {
                namespace: Some("bd1".into()),
                version: "2019.4.2".into(),
                environs: vec![
                    "USE_BINARY_UPLOADS:1".into(),
                    "HUB_VERSION:2019.6.0".into(),
                    "garbage".into(),
                ],
                ..Default::default()
            },
        );

        assert!(bd.binary_analysis());
        assert_eq!(bd.version(), "2019.6.0");
        assert_eq!(bd.target_namespace(), "bd1");

        bd.spec.environs.clear();
        assert!(!bd.binary_analysis());
        assert_eq!(bd.version(), "2019.4.2");
    }

    #[test]
    fn exposure_from_str() {
        assert_eq!("nodeport".parse::<Exposure>().unwrap(), Exposure::NodePort);
        assert_eq!("LOADBALANCER".parse::<Exposure>().unwrap(), Exposure::LoadBalancer);
        assert_eq!("OPENSHIFT".parse::<Exposure>().unwrap(), Exposure::Route);
        assert_eq!("".parse::<Exposure>().unwrap(), Exposure::None);
        assert!("ingress".parse::<Exposure>().is_err());
    }

    #[test]
    fn generation_changed_compares_observed_generation() {
        let mut bd = Blackduck::new("bd1", Spec::default());
        assert!(!bd.generation_changed());

        bd.metadata.generation = Some(2);
        assert!(bd.generation_changed());

        bd.status = Some(Status {
            observed_generation: Some(2),
            ..Default::default()
        });
        assert!(!bd.generation_changed());
    }
}
