//! # Apply module
//!
//! This module provide the diff/apply engine. Given a scope (a namespace and a
//! label selector) and a desired component set, it lists the live objects of
//! every supported kind in the scope, creates the missing ones, updates the
//! ones which semantically differ and deletes the ones no longer desired.
//! Every object is handled independently, failures are collected and reported
//! at the end of the pass.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::svc::{
    component::{Component, ComponentList, Retention},
    k8s::{
        cluster::{self, Cluster},
        selector::Selector,
    },
};

// -----------------------------------------------------------------------------
// Operation enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Operation {
    List,
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::List => write!(f, "list"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to {0} {1} '{2}', {3}")]
    Object(Operation, String, String, cluster::Error),
    #[error("failed to apply {} component(s): {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Partial(Vec<Error>),
}

// -----------------------------------------------------------------------------
// Outcome structure

/// result of one pass of the engine
#[derive(Debug, Default)]
pub struct Outcome {
    /// whether any object has been created, updated or deleted
    pub patched: bool,
    pub errors: Vec<Error>,
}

impl Outcome {
    pub fn merge(&mut self, other: Outcome) {
        self.patched |= other.patched;
        self.errors.extend(other.errors);
    }

    /// returns the patched flag or the aggregate of per object errors
    pub fn into_result(self) -> Result<bool, Error> {
        if self.errors.is_empty() {
            return Ok(self.patched);
        }

        Err(Error::Partial(self.errors))
    }
}

// -----------------------------------------------------------------------------
// Updater structure

/// converges one scope of the cluster to a component set
pub struct Updater<'a, C> {
    cluster: &'a C,
    namespace: String,
    scope: Selector,
    retention: Retention,
    dry_run: bool,
}

impl<'a, C> Updater<'a, C>
where
    C: Cluster,
{
    pub fn new(cluster: &'a C, namespace: &str, scope: Selector) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            scope,
            retention: Retention::Default,
            dry_run: false,
        }
    }

    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// only log the operations which would have been executed
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// converge the scope to the members of the component set which belong
    /// to it, members outside of the scope are ignored
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, desired), fields(namespace = %self.namespace, scope = %self.scope)))]
    pub async fn reconcile(&self, desired: &ComponentList) -> Outcome {
        let desired = desired.select(&self.scope);
        let mut outcome = Outcome::default();

        debug!(
            namespace = &self.namespace,
            scope = self.scope.to_string(),
            components = desired.len(),
            "Reconcile components in scope"
        );

        outcome.merge(self.kind(&desired.service_accounts).await);
        outcome.merge(self.kind(&desired.role_bindings).await);
        outcome.merge(self.kind(&desired.config_maps).await);
        outcome.merge(self.kind(&desired.secrets).await);
        outcome.merge(self.kind(&desired.persistent_volume_claims).await);
        outcome.merge(self.kind(&desired.services).await);
        outcome.merge(self.kind(&desired.stateful_sets).await);
        outcome.merge(self.kind(&desired.deployments).await);
        outcome.merge(self.kind(&desired.routes).await);

        if !outcome.errors.is_empty() {
            warn!(
                namespace = &self.namespace,
                scope = self.scope.to_string(),
                errors = outcome.errors.len(),
                "Some components could not be reconciled"
            );
        }

        outcome
    }

    async fn kind<K>(&self, desired: &[K]) -> Outcome
    where
        K: Component,
    {
        let kind = K::kind(&()).to_string();
        let mut outcome = Outcome::default();

        let live: Vec<K> = match self.cluster.list(&self.namespace, &self.scope).await {
            Ok(live) => live,
            Err(err) => {
                outcome.errors.push(Error::Object(
                    Operation::List,
                    kind,
                    self.scope.to_string(),
                    err,
                ));
                return outcome;
            }
        };

        let live: BTreeMap<String, K> = live
            .into_iter()
            .map(|obj| (obj.name_any(), obj))
            .collect();

        // ---------------------------------------------------------------------
        // Step 1: create missing objects and update changed ones
        for obj in desired {
            let name = obj.name_any();
            let operation = match live.get(&name) {
                None => Operation::Create,
                Some(current) if K::changed(current, obj) => Operation::Update,
                Some(_) => continue,
            };

            if let Err(err) = self.execute(operation, &name, obj).await {
                outcome
                    .errors
                    .push(Error::Object(operation, kind.to_owned(), name, err));
            } else {
                outcome.patched = true;
            }
        }

        // ---------------------------------------------------------------------
        // Step 2: delete live objects no longer desired
        let desired: Vec<String> = desired.iter().map(ResourceExt::name_any).collect();
        for (name, obj) in live.iter().filter(|(name, _)| !desired.contains(name)) {
            if !K::deletable(obj, &self.scope, self.retention) {
                debug!(
                    kind = &kind,
                    namespace = &self.namespace,
                    name = name,
                    "Keep object which is not desired anymore but protected"
                );
                continue;
            }

            if let Err(err) = self.execute(Operation::Delete, name, obj).await {
                outcome.errors.push(Error::Object(
                    Operation::Delete,
                    kind.to_owned(),
                    name.to_owned(),
                    err,
                ));
            } else {
                outcome.patched = true;
            }
        }

        outcome
    }

    async fn execute<K>(&self, operation: Operation, name: &str, obj: &K) -> Result<(), cluster::Error>
    where
        K: Component,
    {
        let kind = K::kind(&());

        info!(
            kind = kind.as_ref(),
            namespace = &self.namespace,
            name = name,
            operation = operation.to_string(),
            dry_run = self.dry_run,
            "Reconcile component"
        );

        if self.dry_run {
            return Ok(());
        }

        match operation {
            Operation::Create => self.cluster.create(&self.namespace, obj).await.map(|_| ()),
            Operation::Update => self.cluster.apply(&self.namespace, obj).await.map(|_| ()),
            Operation::Delete => match self.cluster.delete::<K>(&self.namespace, name).await {
                // already gone
                Err(err) if err.is_not_found() => Ok(()),
                result => result,
            },
            Operation::List => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimStatus},
    };

    use super::*;
    use crate::svc::{
        component::compare::CLAIM_COMPONENT,
        k8s::{
            cluster::memory::{MemoryCluster, Verb},
            resource,
            selector::COMPONENT,
        },
    };

    fn config_map(instance: &str, name: &str, component: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: resource::metadata(instance, name, resource::labels("blackduck", instance, component)),
            data: Some(BTreeMap::from([("value".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    fn claim(instance: &str, name: &str, phase: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: resource::metadata(instance, name, resource::labels("blackduck", instance, CLAIM_COMPONENT)),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn second_pass_without_drift_patches_nothing() {
        let cluster = MemoryCluster::default();
        let desired = ComponentList {
            config_maps: vec![
                config_map("bd1", "a", "configmap", "1"),
                config_map("bd1", "b", "webapp", "2"),
            ],
            ..Default::default()
        };

        let updater = Updater::new(&cluster, "bd1", Selector::instance("blackduck", "bd1"));

        let first = updater.reconcile(&desired).await;
        assert!(first.errors.is_empty());
        assert!(first.patched);
        assert_eq!(cluster.objects::<ConfigMap>("bd1").len(), 2);

        cluster.clear_journal();
        let second = updater.reconcile(&desired).await.into_result().unwrap();
        assert!(!second);
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn create_update_delete_in_scope() {
        let cluster = MemoryCluster::default();
        cluster.seed(config_map("bd1", "changed", "webapp", "old"));
        cluster.seed(config_map("bd1", "stale", "webapp", "x"));
        cluster.seed(config_map("bd1", "same", "webapp", "x"));

        let desired = ComponentList {
            config_maps: vec![
                config_map("bd1", "changed", "webapp", "new"),
                config_map("bd1", "same", "webapp", "x"),
                config_map("bd1", "missing", "webapp", "x"),
            ],
            ..Default::default()
        };

        let outcome = Updater::new(&cluster, "bd1", Selector::instance("blackduck", "bd1"))
            .reconcile(&desired)
            .await;

        assert!(outcome.errors.is_empty());
        let mutations: Vec<_> = cluster
            .mutations()
            .into_iter()
            .map(|op| (op.verb, op.name))
            .collect();

        assert_eq!(
            mutations,
            vec![
                (Verb::Apply, "changed".to_string()),
                (Verb::Create, "missing".to_string()),
                (Verb::Delete, "stale".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn never_touches_another_instance() {
        let cluster = MemoryCluster::default();
        let owned = |instance: &str, name: &str, value: &str| ConfigMap {
            metadata: resource::metadata("shared", name, resource::labels("blackduck", instance, "configmap")),
            data: Some(BTreeMap::from([("value".to_string(), value.to_string())])),
            ..Default::default()
        };

        let mut kept = owned("bd2", "bd2-config", "x");
        kept.metadata.resource_version = Some("41".into());
        let mut orphan = owned("bd2", "bd2-orphan", "x");
        orphan.metadata.resource_version = Some("42".into());
        cluster.seed(kept.to_owned());
        cluster.seed(orphan.to_owned());

        let desired = ComponentList {
            config_maps: vec![
                owned("bd1", "bd1-config", "x"),
                owned("bd1", "bd1-settings", "y"),
                // same name as a live object of the other instance, with drift
                owned("bd2", "bd2-config", "changed"),
            ],
            ..Default::default()
        };

        let outcome = Updater::new(&cluster, "shared", Selector::instance("blackduck", "bd1"))
            .reconcile(&desired)
            .await;

        assert!(outcome.errors.is_empty());
        assert!(outcome.patched);

        let mutations: Vec<_> = cluster
            .mutations()
            .into_iter()
            .map(|op| (op.verb, op.name))
            .collect();
        assert_eq!(
            mutations,
            vec![
                (Verb::Create, "bd1-config".to_string()),
                (Verb::Create, "bd1-settings".to_string()),
            ]
        );

        assert!(cluster.object::<ConfigMap>("shared", "bd1-config").is_some());
        assert!(cluster.object::<ConfigMap>("shared", "bd1-settings").is_some());

        for expected in [kept, orphan] {
            let live = cluster
                .object::<ConfigMap>("shared", &expected.name_any())
                .expect("object of the other instance to be kept");

            assert_eq!(live.metadata.resource_version, expected.metadata.resource_version);
            assert_eq!(live.data, expected.data);
        }
    }

    #[tokio::test]
    async fn failures_are_collected_without_aborting_siblings() {
        let cluster = MemoryCluster::default();
        cluster.fail(Verb::Create, "a");

        let desired = ComponentList {
            config_maps: vec![
                config_map("bd1", "a", "configmap", "1"),
                config_map("bd1", "b", "configmap", "2"),
            ],
            deployments: vec![Deployment {
                metadata: resource::metadata("bd1", "webapp", resource::labels("blackduck", "bd1", "webapp")),
                ..Default::default()
            }],
            ..Default::default()
        };

        let outcome = Updater::new(&cluster, "bd1", Selector::instance("blackduck", "bd1"))
            .reconcile(&desired)
            .await;

        assert!(outcome.patched);
        assert_eq!(outcome.errors.len(), 1);
        assert!(cluster.object::<ConfigMap>("bd1", "b").is_some());
        assert!(cluster.object::<Deployment>("bd1", "webapp").is_some());

        let err = outcome.into_result().unwrap_err();
        assert!(err.to_string().contains("ConfigMap 'a'"));
    }

    #[tokio::test]
    async fn bound_claims_survive_unpinned_scopes() {
        let cluster = MemoryCluster::default();
        cluster.seed(claim("bd1", "blackduck-postgres", "Bound"));
        cluster.seed(claim("bd1", "blackduck-solr", "Pending"));

        let outcome = Updater::new(
            &cluster,
            "bd1",
            Selector::instance("blackduck", "bd1").without(COMPONENT, &["postgres"]),
        )
        .reconcile(&ComponentList::default())
        .await;

        assert!(outcome.errors.is_empty());
        assert!(cluster
            .object::<PersistentVolumeClaim>("bd1", "blackduck-postgres")
            .is_some());
        assert!(cluster
            .object::<PersistentVolumeClaim>("bd1", "blackduck-solr")
            .is_none());
    }

    #[tokio::test]
    async fn preserved_claims_are_never_deleted() {
        let cluster = MemoryCluster::default();
        cluster.seed(claim("bd1", "blackduck-postgres", "Bound"));
        cluster.seed(claim("bd1", "blackduck-solr", "Pending"));
        cluster.seed(config_map("bd1", "config", "configmap", "x"));

        let outcome = Updater::new(
            &cluster,
            "bd1",
            Selector::instance("blackduck", "bd1").equals(COMPONENT, CLAIM_COMPONENT),
        )
        .retention(Retention::PreserveClaims)
        .reconcile(&ComponentList::default())
        .await;

        assert!(outcome.errors.is_empty());
        assert!(!outcome.patched);
        assert_eq!(cluster.objects::<PersistentVolumeClaim>("bd1").len(), 2);
    }

    #[tokio::test]
    async fn dry_run_does_not_mutate() {
        let cluster = MemoryCluster::default();
        let desired = ComponentList {
            config_maps: vec![config_map("bd1", "a", "configmap", "1")],
            ..Default::default()
        };

        let outcome = Updater::new(&cluster, "bd1", Selector::instance("blackduck", "bd1"))
            .dry_run(true)
            .reconcile(&desired)
            .await;

        assert!(outcome.patched);
        assert!(cluster.mutations().is_empty());
    }
}
