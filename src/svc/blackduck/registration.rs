//! # Registration module
//!
//! This module provide the registration of an instance with its license key.
//! The web server is probed first, then the registration endpoint is called
//! from the registration pod which holds the system certificate.

use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::svc::{
    blackduck::builder,
    crd::blackduck::APP,
    k8s::{
        cluster::Cluster,
        readiness::{self, Poller},
        selector::{Selector, COMPONENT},
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const CERTIFICATE: &str = "/opt/blackduck/hub/hub-registration/security/blackduck_system.crt";
pub const CERTIFICATE_KEY: &str = "/opt/blackduck/hub/hub-registration/security/blackduck_system.key";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create http client, {0}")]
    Client(reqwest::Error),
    #[error("failed to execute request on '{0}', {1}")]
    Request(String, reqwest::Error),
    #[error("{0}")]
    Readiness(readiness::Error),
    #[error("unable to register the blackduck {0}")]
    Register(String),
}

impl From<readiness::Error> for Error {
    fn from(err: readiness::Error) -> Self {
        Self::Readiness(err)
    }
}

// -----------------------------------------------------------------------------
// Probe trait

/// check the registration state of an instance through its web server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    /// returns if the instance is registered, none if the answer does not
    /// tell
    async fn registered(&self, url: &str) -> Result<Option<bool>, Error>;
}

// -----------------------------------------------------------------------------
// HttpProbe structure

#[derive(Deserialize, Clone, Debug)]
struct Summary {
    #[serde(rename = "valid", default)]
    valid: Option<bool>,
}

/// probe reaching the web server of the instance, which serves a self signed
/// certificate
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(Error::Client)?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn registered(&self, url: &str) -> Result<Option<bool>, Error> {
        let endpoint = format!("{}/api/v1/registrations?summary=true", url);
        let res = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|err| Error::Request(endpoint.to_owned(), err))?;

        if !res.status().is_success() {
            debug!(
                endpoint = &endpoint,
                status = res.status().as_u16(),
                "Registration summary is not available"
            );
            return Ok(None);
        }

        let summary: Summary = res
            .json()
            .await
            .map_err(|err| Error::Request(endpoint.to_owned(), err))?;

        Ok(summary.valid)
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the command activating the license key from the registration pod
pub fn command(key: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "curl -k -X POST \"https://127.0.0.1:8443/registration/HubRegistration?registrationid={}&action=activate\" -k --cert {} --key {}",
            key, CERTIFICATE, CERTIFICATE_KEY
        ),
    ]
}

/// register the instance with the license key, returns whether a
/// registration has been made
#[cfg_attr(feature = "trace", tracing::instrument(skip(cluster, poller, probe, key)))]
pub async fn register<C, P>(
    cluster: &C,
    poller: &Poller,
    probe: &P,
    namespace: &str,
    name: &str,
    key: &str,
    attempts: u32,
) -> Result<bool, Error>
where
    C: Cluster,
    P: Probe,
{
    let url = super::webserver_url(namespace, name);
    match probe.registered(&url).await {
        Ok(Some(true)) => {
            debug!(namespace = namespace, name = name, "Instance is already registered");
            return Ok(false);
        }
        Ok(_) => {}
        Err(err) => {
            warn!(
                namespace = namespace,
                name = name,
                error = err.to_string(),
                "Could not probe the registration state, register anyway"
            );
        }
    }

    let selector = Selector::instance(APP, name).equals(COMPONENT, builder::REGISTRATION);
    let selector = &selector;
    let registered = poller
        .attempts(attempts, move || async move {
            let pod = match readiness::running_pod(cluster, namespace, selector).await? {
                Some(pod) => pod,
                None => {
                    debug!(namespace = namespace, "Wait for the registration pod to be running");
                    return Ok(None);
                }
            };

            match cluster
                .exec(namespace, &pod.name_any(), Some(builder::REGISTRATION), command(key))
                .await
            {
                Ok(_) => Ok(Some(())),
                Err(err) => {
                    warn!(
                        namespace = namespace,
                        pod = pod.name_any(),
                        error = err.to_string(),
                        "Failed to register the instance, retry"
                    );
                    Ok(None)
                }
            }
        })
        .await?;

    match registered {
        Some(()) => {
            info!(namespace = namespace, name = name, "Registered the instance");
            Ok(true)
        }
        None => Err(Error::Register(namespace.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::svc::k8s::{cluster::memory::MemoryCluster, resource};

    fn poller() -> Poller {
        Poller::new(Duration::from_millis(1), CancellationToken::new())
    }

    fn seed_registration_pod(cluster: &MemoryCluster) {
        cluster.seed(Pod {
            metadata: resource::metadata(
                "bd1",
                "bd1-blackduck-registration-0",
                resource::labels(APP, "bd1", builder::REGISTRATION),
            ),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    #[tokio::test]
    async fn license_key_is_activated_from_the_registration_pod() {
        let cluster = MemoryCluster::default();
        seed_registration_pod(&cluster);

        let mut probe = MockProbe::new();
        probe
            .expect_registered()
            .withf(|url| url.starts_with("https://bd1-blackduck-webserver.bd1.svc:443"))
            .times(1)
            .returning(|_| Ok(Some(false)));

        let registered = register(&cluster, &poller(), &probe, "bd1", "bd1", "LICENSE-1", 3)
            .await
            .unwrap();

        assert!(registered);
        let commands = cluster.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, "bd1-blackduck-registration-0");
        assert!(commands[0].1[2].contains("registrationid=LICENSE-1&action=activate"));
    }

    #[tokio::test]
    async fn registered_instance_is_left_untouched() {
        let cluster = MemoryCluster::default();
        seed_registration_pod(&cluster);

        let mut probe = MockProbe::new();
        probe.expect_registered().returning(|_| Ok(Some(true)));

        let registered = register(&cluster, &poller(), &probe, "bd1", "bd1", "LICENSE-1", 3)
            .await
            .unwrap();

        assert!(!registered);
        assert!(cluster.commands().is_empty());
    }

    #[tokio::test]
    async fn exhausted_attempts_are_reported() {
        let cluster = MemoryCluster::default();
        seed_registration_pod(&cluster);
        cluster.on_exec(|_, _| Err("connection refused".into()));

        let mut probe = MockProbe::new();
        probe
            .expect_registered()
            .returning(|url| Err(Error::Register(url.to_string())));

        let err = register(&cluster, &poller(), &probe, "bd1", "bd1", "LICENSE-1", 3)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "unable to register the blackduck bd1");
        assert_eq!(cluster.commands().len(), 3);
    }
}
