//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, net::SocketAddr, path::PathBuf, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_NAMESPACE: &str = "synopsys-operator";
pub const DEFAULT_SECRET: &str = "blackduck-secret";
pub const DEFAULT_CRD: &str = "blackducks.synopsys.com";
pub const DEFAULT_REGISTRY: &str = "docker.io/blackducksoftware";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    /// namespace in which the operator runs and holds its own secret
    #[serde(rename = "namespace")]
    pub namespace: String,
    /// secret holding the default database credentials
    #[serde(rename = "secret")]
    pub secret: String,
    #[serde(rename = "threadiness")]
    pub threadiness: usize,
    /// number of time a failing key is re-enqueued, 0 disables requeue
    #[serde(rename = "max_retries")]
    pub max_retries: u32,
    #[serde(rename = "crd")]
    pub crd: String,
    #[serde(rename = "registry")]
    pub registry: String,
    #[serde(rename = "dry_run")]
    pub dry_run: bool,
}

// -----------------------------------------------------------------------------
// Reconciler structure

/// Polling bounds of the reconciler, every duration is expressed in
/// milliseconds
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Reconciler {
    #[serde(rename = "poll_interval")]
    pub poll_interval: u64,
    #[serde(rename = "credential_interval")]
    pub credential_interval: u64,
    #[serde(rename = "credential_attempts")]
    pub credential_attempts: u32,
    #[serde(rename = "pod_wait_timeout")]
    pub pod_wait_timeout: u64,
    #[serde(rename = "clone_timeout")]
    pub clone_timeout: u64,
    #[serde(rename = "address_attempts")]
    pub address_attempts: u32,
    #[serde(rename = "volume_attempts")]
    pub volume_attempts: u32,
    #[serde(rename = "registration_attempts")]
    pub registration_attempts: u32,
    #[serde(rename = "registration_interval")]
    pub registration_interval: u64,
    #[serde(rename = "probe_timeout")]
    pub probe_timeout: u64,
}

impl Reconciler {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    pub fn credential_interval(&self) -> Duration {
        Duration::from_millis(self.credential_interval)
    }

    pub fn pod_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pod_wait_timeout)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_millis(self.clone_timeout)
    }

    pub fn registration_interval(&self) -> Duration {
        Duration::from_millis(self.registration_interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout)
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            poll_interval: 10_000,
            credential_interval: 5_000,
            credential_attempts: i32::MAX as u32,
            pod_wait_timeout: 600_000,
            clone_timeout: 30 * 60 * 1_000,
            address_attempts: 10,
            volume_attempts: 60,
            registration_attempts: 20,
            registration_interval: 10_000,
            probe_timeout: 10_000,
        }
    }
}

// -----------------------------------------------------------------------------
// Server structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Server {
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
}

// -----------------------------------------------------------------------------
// Sentry structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Sentry {
    #[serde(rename = "dsn")]
    pub dsn: Option<String>,
}

// -----------------------------------------------------------------------------
// Jaeger structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Jaeger {
    #[serde(rename = "endpoint")]
    pub endpoint: Option<String>,
    #[serde(rename = "user")]
    pub user: Option<String>,
    #[serde(rename = "password")]
    pub password: Option<String>,
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load file '{0:?}', {1}")]
    File(PathBuf, ConfigError),
    #[error("failed to load configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "reconciler")]
    pub reconciler: Reconciler,
    #[serde(rename = "server")]
    pub server: Server,
    /// url of the external aggregator notified of instances' url
    #[serde(rename = "federator", default)]
    pub federator: Option<String>,
    #[serde(rename = "sentry", default)]
    pub sentry: Sentry,
    #[serde(rename = "jaeger", default)]
    pub jaeger: Jaeger,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            operator: Operator {
                namespace: DEFAULT_NAMESPACE.to_string(),
                secret: DEFAULT_SECRET.to_string(),
                threadiness: 5,
                max_retries: 0,
                crd: DEFAULT_CRD.to_string(),
                registry: DEFAULT_REGISTRY.to_string(),
                dry_run: false,
            },
            reconciler: Reconciler::default(),
            server: Server {
                listen: ([0, 0, 0, 0], 8000).into(),
            },
            federator: None,
            sentry: Sentry::default(),
            jaeger: Jaeger::default(),
        }
    }
}

/// returns a configuration builder filled with defaults values and the
/// environment source
fn builder() -> Result<ConfigBuilder<DefaultState>, Error> {
    let reconciler = Reconciler::default();
    let defaults: Vec<(&str, config::Value)> = vec![
        ("operator.namespace", DEFAULT_NAMESPACE.into()),
        ("operator.secret", DEFAULT_SECRET.into()),
        ("operator.threadiness", 5i64.into()),
        ("operator.max_retries", 0i64.into()),
        ("operator.crd", DEFAULT_CRD.into()),
        ("operator.registry", DEFAULT_REGISTRY.into()),
        ("operator.dry_run", false.into()),
        ("reconciler.poll_interval", (reconciler.poll_interval as i64).into()),
        ("reconciler.credential_interval", (reconciler.credential_interval as i64).into()),
        ("reconciler.credential_attempts", (reconciler.credential_attempts as i64).into()),
        ("reconciler.pod_wait_timeout", (reconciler.pod_wait_timeout as i64).into()),
        ("reconciler.clone_timeout", (reconciler.clone_timeout as i64).into()),
        ("reconciler.address_attempts", (reconciler.address_attempts as i64).into()),
        ("reconciler.volume_attempts", (reconciler.volume_attempts as i64).into()),
        ("reconciler.registration_attempts", (reconciler.registration_attempts as i64).into()),
        ("reconciler.registration_interval", (reconciler.registration_interval as i64).into()),
        ("reconciler.probe_timeout", (reconciler.probe_timeout as i64).into()),
        ("server.listen", DEFAULT_LISTEN.into()),
    ];

    let mut builder = Config::builder();
    for (key, value) in defaults {
        builder = builder
            .set_default(key, value)
            .map_err(|err| Error::Default(key.into(), err))?;
    }

    Ok(builder.add_source(
        Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_"))
            .separator("__")
            .try_parsing(true),
    ))
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        builder()?
            .add_source(File::from(path.to_owned()).required(true))
            .build()
            .map_err(|err| Error::File(path, err))?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let mut paths = vec![
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
        ];

        if let Some(home) = std::env::var_os("HOME") {
            let home = PathBuf::from(home);
            paths.push(home.join(format!(".config/{}/config", env!("CARGO_PKG_NAME"))));
            paths.push(home.join(format!(".local/share/{}/config", env!("CARGO_PKG_NAME"))));
        }

        paths.push(PathBuf::from("config"));

        let mut builder = builder()?;
        for path in paths {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Cast)
    }

    /// log hints about the loaded configuration
    pub fn help(&self) {
        info!(
            namespace = &self.operator.namespace,
            threadiness = self.operator.threadiness,
            crd = &self.operator.crd,
            "Loaded configuration"
        );

        if self.operator.threadiness == 0 {
            warn!("Threadiness is set to 0, no custom resource will be reconciled");
        }

        if self.operator.dry_run {
            warn!("Dry run is enabled, components will not be written to the cluster");
        }

        if self.federator.is_none() {
            info!("No federator is configured, instances' url will not be published");
        }
    }
}
