//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface function
//! implementation

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use kube::CustomResourceExt;

use crate::{
    cmd::Executor,
    svc::{
        cfg::Configuration,
        crd::{blackduck::Blackduck, route::Route},
    },
};

// -----------------------------------------------------------------------------
// CustomResource enum

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub enum CustomResource {
    Blackduck,
    Route,
}

impl FromStr for CustomResource {
    type Err = Box<dyn std::error::Error + Send + Sync>;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blackduck" => Ok(Self::Blackduck),
            "route" => Ok(Self::Route),
            _ => Err(format!(
                "failed to parse '{}', available options are 'blackduck' or 'route'",
                s
            )
            .into()),
        }
    }
}

impl CustomResource {
    pub fn to_yaml(&self) -> Result<String, Error> {
        match self {
            Self::Blackduck => serde_yaml::to_string(&Blackduck::crd()),
            Self::Route => serde_yaml::to_string(&Route::crd()),
        }
        .map_err(Error::Serialize)
    }
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// CustomResourceDefinition enum

#[derive(Subcommand, Clone, Debug)]
pub enum CustomResourceDefinition {
    /// View custom resource definition
    #[clap(name = "view", aliases = &["v"])]
    View {
        #[clap(name = "custom-resource")]
        custom_resource: Option<CustomResource>,
    },
}

#[async_trait]
impl Executor for CustomResourceDefinition {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::View { custom_resource } => view(config, custom_resource).await,
        }
    }
}

// -----------------------------------------------------------------------------
// view function

/// returns the definitions to print, every known one if none is given
pub fn definitions(custom_resource: &Option<CustomResource>) -> Result<Vec<String>, Error> {
    match custom_resource {
        Some(cr) => Ok(vec![cr.to_yaml()?]),
        None => [CustomResource::Blackduck, CustomResource::Route]
            .iter()
            .map(CustomResource::to_yaml)
            .collect(),
    }
}

#[cfg_attr(feature = "trace", tracing::instrument(skip(_config)))]
pub async fn view(
    _config: Arc<Configuration>,
    custom_resource: &Option<CustomResource>,
) -> Result<(), Error> {
    let crds = definitions(custom_resource)?;

    print!("{}", crds.join("---\n"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_resources_are_parsed_case_insensitive() {
        assert_eq!(
            "Blackduck".parse::<CustomResource>().unwrap(),
            CustomResource::Blackduck
        );
        assert_eq!("route".parse::<CustomResource>().unwrap(), CustomResource::Route);
        assert!("postgresql".parse::<CustomResource>().is_err());
    }

    #[test]
    fn blackduck_definition_is_namespaced() {
        let crds = definitions(&Some(CustomResource::Blackduck)).unwrap();

        assert_eq!(crds.len(), 1);
        assert!(crds[0].contains("name: blackducks.synopsys.com"));
        assert!(crds[0].contains("scope: Namespaced"));
    }

    #[test]
    fn every_definition_is_printed_by_default() {
        let crds = definitions(&None).unwrap();

        assert_eq!(crds.len(), 2);
        assert!(crds[1].contains("route.openshift.io"));
    }
}
