//! # Federator module
//!
//! This module provide the notification of an external aggregator with the
//! url of every running instance. Listing the instances and notifying the
//! aggregator happen under a single lock so that the last notification
//! always carries the latest list.

use async_trait::async_trait;
use kube::ResourceExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::svc::{
    crd::blackduck::{Blackduck, State},
    k8s::{
        cluster::{self, Cluster},
        selector::Selector,
    },
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create http client, {0}")]
    Client(reqwest::Error),
    #[error("failed to notify federator '{0}', {1}")]
    Request(String, reqwest::Error),
    #[error("federator '{0}' answered with status {1}")]
    Status(String, u16),
    #[error("failed to list instances, {0}")]
    Cluster(cluster::Error),
}

impl From<cluster::Error> for Error {
    fn from(err: cluster::Error) -> Self {
        Self::Cluster(err)
    }
}

// -----------------------------------------------------------------------------
// Notifier trait

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, urls: Vec<String>) -> Result<(), Error>;
}

// -----------------------------------------------------------------------------
// HttpNotifier structure

#[derive(Serialize, Clone, Debug)]
struct Hubs {
    #[serde(rename = "HubURLs")]
    urls: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct HttpNotifier {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(federator: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder().build().map_err(Error::Client)?;

        Ok(Self {
            endpoint: format!("{}/sethubs", federator.trim_end_matches('/')),
            client,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn notify(&self, urls: Vec<String>) -> Result<(), Error> {
        let res = self
            .client
            .put(&self.endpoint)
            .json(&Hubs { urls })
            .send()
            .await
            .map_err(|err| Error::Request(self.endpoint.to_owned(), err))?;

        if !res.status().is_success() {
            return Err(Error::Status(self.endpoint.to_owned(), res.status().as_u16()));
        }

        debug!(endpoint = &self.endpoint, "Notified federator");
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Federator structure

/// shared by every worker, serialize the synchronizations of the aggregator
pub struct Federator<N> {
    notifier: N,
    lock: Mutex<()>,
}

impl<N> Federator<N>
where
    N: Notifier,
{
    pub fn new(notifier: N) -> Self {
        Self {
            notifier,
            lock: Mutex::new(()),
        }
    }

    /// send the url of every running instance to the aggregator, the lock is
    /// held from the listing until the aggregator answered
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, cluster)))]
    pub async fn synchronize<C>(&self, cluster: &C) -> Result<(), Error>
    where
        C: Cluster,
    {
        let _guard = self.lock.lock().await;

        let urls = running(cluster).await?;
        debug!(instances = urls.len(), "Synchronize federator");
        self.notifier.notify(urls).await
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the url of every running instance
pub async fn running<C>(cluster: &C) -> Result<Vec<String>, Error>
where
    C: Cluster,
{
    let instances: Vec<Blackduck> = cluster.list_all(&Selector::default()).await?;

    Ok(instances
        .iter()
        .filter(|instance| instance.state() == Some(State::Running))
        .map(|instance| super::webserver_url(&instance.target_namespace(), &instance.name_any()))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::svc::{
        crd::blackduck::{Spec, Status},
        k8s::cluster::memory::MemoryCluster,
    };

    fn instance(name: &str, state: State) -> Blackduck {
        let mut bd = Blackduck::new(name, Spec::default());
        bd.metadata.namespace = Some(name.to_string());
        bd.status = Some(Status {
            state: Some(state),
            ..Default::default()
        });
        bd
    }

    #[tokio::test]
    async fn only_running_instances_are_listed() {
        let cluster = MemoryCluster::default();
        cluster.seed(instance("bd1", State::Running));
        cluster.seed(instance("bd2", State::Stopped));

        let urls = running(&cluster).await.unwrap();

        assert_eq!(urls, vec!["https://bd1-blackduck-webserver.bd1.svc:443".to_string()]);
    }

    /// records every notification, the first one sees another instance
    /// becoming running while it is in flight
    struct Recorder {
        cluster: Arc<MemoryCluster>,
        bodies: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, urls: Vec<String>) -> Result<(), Error> {
            let first = self.bodies.lock().unwrap().is_empty();
            if first {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.cluster.seed(instance("bd2", State::Running));
            }

            self.bodies.lock().unwrap().push(urls);
            Ok(())
        }
    }

    #[tokio::test]
    async fn synchronize_sends_the_latest_list_last() {
        let cluster = Arc::new(MemoryCluster::default());
        cluster.seed(instance("bd1", State::Running));

        let federator = Federator::new(Recorder {
            cluster: cluster.to_owned(),
            bodies: Default::default(),
        });

        let (a, b) = tokio::join!(
            federator.synchronize(cluster.as_ref()),
            federator.synchronize(cluster.as_ref())
        );
        a.unwrap();
        b.unwrap();

        let bodies = federator.notifier.bodies.lock().unwrap().to_owned();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], vec!["https://bd1-blackduck-webserver.bd1.svc:443".to_string()]);
        assert_eq!(bodies.last(), Some(&running(cluster.as_ref()).await.unwrap()));
        assert_eq!(bodies[1].len(), 2);
    }

    #[tokio::test]
    async fn synchronize_notifies_the_running_instances() {
        let cluster = MemoryCluster::default();
        cluster.seed(instance("bd1", State::Running));

        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|urls| urls == &["https://bd1-blackduck-webserver.bd1.svc:443".to_string()])
            .times(1)
            .returning(|_| Ok(()));

        Federator::new(notifier).synchronize(&cluster).await.unwrap();
    }

    #[test]
    fn payload_uses_the_aggregator_field_name() {
        let payload = serde_json::to_value(Hubs {
            urls: vec!["https://a".into()],
        })
        .unwrap();

        assert_eq!(payload, serde_json::json!({ "HubURLs": ["https://a"] }));
    }
}
