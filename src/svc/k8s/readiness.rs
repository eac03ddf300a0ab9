//! # Readiness module
//!
//! This module provide the polling primitives used to gate the phases of a
//! reconciliation: pods running, service endpoint ready, job completion and
//! exposed address assignment. Every wait is bounded and can be aborted
//! early through a cancellation token.

use std::{future::Future, time::Duration};

use k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{Endpoints, Pod, Service},
};
use kube::ResourceExt;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::svc::k8s::{
    cluster::{self, Cluster},
    selector::Selector,
};

// -----------------------------------------------------------------------------
// Constants

pub const PHASE_RUNNING: &str = "Running";
pub const PHASE_SUCCEEDED: &str = "Succeeded";
pub const NODE_ADDRESS_PLACEHOLDER: &str = "<<NODE_IP_ADDRESS>>";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Cluster(cluster::Error),
    #[error("timed out waiting for {0} in namespace '{1}' after {2:?}")]
    Timeout(String, String, Duration),
    #[error("could not find {0} in namespace '{1}'")]
    NotFound(String, String),
    #[error("{0} in namespace '{1}' has failed")]
    Failed(String, String),
    #[error("wait has been cancelled")]
    Cancelled,
}

impl From<cluster::Error> for Error {
    fn from(err: cluster::Error) -> Self {
        Self::Cluster(err)
    }
}

// -----------------------------------------------------------------------------
// Poller structure

/// fixed interval poller, bounded either by a number of attempts or by a
/// deadline
#[derive(Clone, Debug)]
pub struct Poller {
    interval: Duration,
    token: CancellationToken,
}

impl Poller {
    pub fn new(interval: Duration, token: CancellationToken) -> Self {
        Self { interval, token }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// returns a poller sharing the cancellation token with another interval
    pub fn every(&self, interval: Duration) -> Self {
        Self::new(interval, self.token.to_owned())
    }

    /// sleep for one interval, unless the token is cancelled first
    pub async fn tick(&self) -> Result<(), Error> {
        tokio::select! {
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = sleep(self.interval) => Ok(()),
        }
    }

    /// call `f` up to `attempts` times, one interval apart, until it yields
    /// a value
    pub async fn attempts<F, Fut, T>(&self, attempts: u32, mut f: F) -> Result<Option<T>, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, Error>>,
    {
        for attempt in 0..attempts {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(value) = f().await? {
                return Ok(Some(value));
            }

            if attempt + 1 < attempts {
                self.tick().await?;
            }
        }

        Ok(None)
    }

    /// call `f` one interval apart until it yields a value or the timeout
    /// elapses
    pub async fn within<F, Fut, T>(&self, timeout: Duration, mut f: F) -> Result<Option<T>, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, Error>>,
    {
        let deadline = Instant::now() + timeout;

        loop {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(value) = f().await? {
                return Ok(Some(value));
            }

            if Instant::now() + self.interval > deadline {
                return Ok(None);
            }

            self.tick().await?;
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

fn pod_done(pod: &Pod) -> bool {
    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or_default();

    phase.eq_ignore_ascii_case(PHASE_RUNNING) || phase.eq_ignore_ascii_case(PHASE_SUCCEEDED)
}

/// returns the first pod of the namespace matching the selector which is
/// running
pub async fn running_pod<C>(cluster: &C, namespace: &str, selector: &Selector) -> Result<Option<Pod>, Error>
where
    C: Cluster,
{
    let pods: Vec<Pod> = cluster.list(namespace, selector).await?;

    Ok(pods.into_iter().find(|pod| {
        pod.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(|phase| phase.eq_ignore_ascii_case(PHASE_RUNNING))
            .unwrap_or(false)
    }))
}

/// wait for every pod of the namespace matching the selector to run, pods
/// of completed jobs are accepted
#[cfg_attr(feature = "trace", tracing::instrument(skip(cluster, poller)))]
pub async fn wait_for_pods_running<C>(
    cluster: &C,
    poller: &Poller,
    namespace: &str,
    selector: &Selector,
    timeout: Duration,
) -> Result<(), Error>
where
    C: Cluster,
{
    let ready = poller
        .within(timeout, move || async move {
            let pods: Vec<Pod> = cluster.list(namespace, selector).await?;
            let pending: Vec<String> = pods
                .iter()
                .filter(|pod| !pod_done(pod))
                .map(ResourceExt::name_any)
                .collect();

            if pending.is_empty() {
                return Ok(Some(()));
            }

            debug!(
                namespace = namespace,
                pending = pending.join(","),
                "Wait for pods to be running"
            );

            Ok(None)
        })
        .await?;

    ready.ok_or_else(|| Error::Timeout(format!("pods '{}'", selector), namespace.into(), timeout))
}

/// wait for the endpoints of the service to expose at least one ready address
#[cfg_attr(feature = "trace", tracing::instrument(skip(cluster, poller)))]
pub async fn wait_for_service_endpoint<C>(
    cluster: &C,
    poller: &Poller,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<(), Error>
where
    C: Cluster,
{
    let ready = poller
        .within(timeout, move || async move {
            let endpoints: Option<Endpoints> = cluster.get(namespace, name).await?;
            let ready = endpoints
                .and_then(|endpoints| endpoints.subsets)
                .unwrap_or_default()
                .iter()
                .any(|subset| subset.addresses.as_ref().map(|a| !a.is_empty()).unwrap_or(false));

            if !ready {
                debug!(namespace = namespace, name = name, "Wait for service endpoint");
            }

            Ok(ready.then_some(()))
        })
        .await?;

    ready.ok_or_else(|| {
        Error::Timeout(format!("service endpoint '{}'", name), namespace.into(), timeout)
    })
}

/// wait for the job to succeed, a job which reports failed pods after the
/// backoff limit fails the wait
#[cfg_attr(feature = "trace", tracing::instrument(skip(cluster, poller)))]
pub async fn wait_for_job<C>(
    cluster: &C,
    poller: &Poller,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<(), Error>
where
    C: Cluster,
{
    let done = poller
        .within(timeout, move || async move {
            let job: Job = cluster
                .get(namespace, name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("job '{}'", name), namespace.into()))?;

            let status = job.status.unwrap_or_default();
            if status.succeeded.unwrap_or(0) > 0 {
                return Ok(Some(()));
            }

            let backoff = job.spec.and_then(|spec| spec.backoff_limit).unwrap_or(6);
            if status.failed.unwrap_or(0) > backoff {
                return Err(Error::Failed(format!("job '{}'", name), namespace.into()));
            }

            trace!(namespace = namespace, name = name, "Wait for job to complete");
            Ok(None)
        })
        .await?;

    done.ok_or_else(|| Error::Timeout(format!("job '{}'", name), namespace.into(), timeout))
}

/// poll the service for the address assigned by the load balancer
#[cfg_attr(feature = "trace", tracing::instrument(skip(cluster, poller)))]
pub async fn load_balancer_address<C>(
    cluster: &C,
    poller: &Poller,
    namespace: &str,
    name: &str,
    attempts: u32,
) -> Result<String, Error>
where
    C: Cluster,
{
    let address = poller
        .attempts(attempts, move || async move {
            let service: Service = cluster
                .get(namespace, name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("service '{}'", name), namespace.into()))?;

            Ok(service
                .status
                .and_then(|status| status.load_balancer)
                .and_then(|lb| lb.ingress)
                .unwrap_or_default()
                .into_iter()
                .find_map(|ingress| ingress.ip.or(ingress.hostname))
                .filter(|address| !address.is_empty()))
        })
        .await?;

    address.ok_or_else(|| {
        Error::Timeout(
            format!("load balancer address of service '{}'", name),
            namespace.into(),
            poller.interval() * attempts,
        )
    })
}

/// returns the node ports of the service prefixed by a node address
/// placeholder, comma separated
#[cfg_attr(feature = "trace", tracing::instrument(skip(cluster, poller)))]
pub async fn node_port_address<C>(
    cluster: &C,
    poller: &Poller,
    namespace: &str,
    name: &str,
    attempts: u32,
) -> Result<String, Error>
where
    C: Cluster,
{
    let address = poller
        .attempts(attempts, move || async move {
            let service: Option<Service> = cluster.get(namespace, name).await?;
            let ports: Vec<String> = service
                .and_then(|service| service.spec)
                .and_then(|spec| spec.ports)
                .unwrap_or_default()
                .iter()
                .filter_map(|port| port.node_port)
                .map(|port| format!("{}:{}", NODE_ADDRESS_PLACEHOLDER, port))
                .collect();

            Ok((!ports.is_empty()).then(|| ports.join(",")))
        })
        .await?;

    address.ok_or_else(|| {
        Error::Timeout(
            format!("node port of service '{}'", name),
            namespace.into(),
            poller.interval() * attempts,
        )
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        batch::v1::JobStatus,
        core::v1::{
            EndpointAddress, EndpointSubset, LoadBalancerIngress, LoadBalancerStatus, PodStatus,
            ServicePort, ServiceSpec, ServiceStatus,
        },
    };

    use super::*;
    use crate::svc::k8s::{cluster::memory::MemoryCluster, resource};

    fn poller() -> Poller {
        Poller::new(Duration::from_millis(1), CancellationToken::new())
    }

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: resource::metadata("bd1", name, resource::labels("blackduck", "bd1", "webapp")),
            status: Some(PodStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn attempts_stop_at_first_value() {
        let mut calls = 0;
        let value = poller()
            .attempts(5, || {
                calls += 1;
                let current = calls;
                async move { Ok((current == 3).then_some(current)) }
            })
            .await
            .unwrap();

        assert_eq!(value, Some(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_wait() {
        let poller = Poller::new(Duration::from_secs(3600), CancellationToken::new());
        poller.token().cancel();

        let result = poller
            .within(Duration::from_secs(7200), || async { Ok::<Option<()>, Error>(None) })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn pods_running_accepts_completed_pods() {
        let cluster = MemoryCluster::default();
        cluster.seed(pod("webapp", "Running"));
        cluster.seed(pod("clone", "Succeeded"));

        wait_for_pods_running(
            &cluster,
            &poller(),
            "bd1",
            &Selector::instance("blackduck", "bd1"),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn pods_running_times_out_with_namespace() {
        let cluster = MemoryCluster::default();
        cluster.seed(pod("webapp", "Pending"));

        let err = wait_for_pods_running(
            &cluster,
            &poller(),
            "bd1",
            &Selector::instance("blackduck", "bd1"),
            Duration::from_millis(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(_, ref ns, _) if ns == "bd1"));
    }

    #[tokio::test]
    async fn service_endpoint_with_addresses_is_ready() {
        let cluster = MemoryCluster::default();
        cluster.seed(Endpoints {
            metadata: resource::metadata("bd1", "postgres", Default::default()),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        });

        wait_for_service_endpoint(&cluster, &poller(), "bd1", "postgres", Duration::from_millis(5))
            .await
            .unwrap();

        let err = wait_for_service_endpoint(&cluster, &poller(), "bd1", "other", Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'other'"));
    }

    #[tokio::test]
    async fn job_never_succeeding_times_out() {
        let cluster = MemoryCluster::default();
        cluster.seed(Job {
            metadata: resource::metadata("bd1", "clone", Default::default()),
            status: Some(JobStatus::default()),
            ..Default::default()
        });

        let err = wait_for_job(&cluster, &poller(), "bd1", "clone", Duration::from_millis(5))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(..)));
    }

    #[tokio::test]
    async fn addresses_of_exposed_services() {
        let cluster = MemoryCluster::default();
        cluster.seed(Service {
            metadata: resource::metadata("bd1", "lb", Default::default()),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some("1.2.3.4".into()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        cluster.seed(Service {
            metadata: resource::metadata("bd1", "np", Default::default()),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 443,
                    node_port: Some(30443),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });

        let lb = load_balancer_address(&cluster, &poller(), "bd1", "lb", 2).await.unwrap();
        assert_eq!(lb, "1.2.3.4");

        let np = node_port_address(&cluster, &poller(), "bd1", "np", 2).await.unwrap();
        assert_eq!(np, "<<NODE_IP_ADDRESS>>:30443");

        let err = load_balancer_address(&cluster, &poller(), "bd1", "np", 2).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(..)));
    }
}
