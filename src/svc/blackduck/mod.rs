//! # Black Duck module
//!
//! This module provide the reconciler of black duck instances. It drives the
//! state machine of an instance: components are converged tier by tier, the
//! database is bootstrapped once its tier is ready, then the instance is
//! registered and its address reported in the status.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::svc::{
    blackduck::{
        builder::{ComponentBuilder, Inputs},
        database::{Database, Outcome},
        federator::{Federator, Notifier},
        registration::Probe,
    },
    cfg::Configuration,
    component::{
        apply::{self, Updater},
        compare::CLAIM_COMPONENT,
        ComponentList, Retention,
    },
    controller::Handler,
    crd::{
        blackduck::{Blackduck, Exposure, State, Status, APP},
        route::Route,
    },
    k8s::{
        cluster::{self, Cluster},
        readiness::{self, Poller},
        recorder, resource,
        selector::{Selector, COMPONENT},
    },
};

pub mod builder;
pub mod database;
pub mod federator;
pub mod registration;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the in-cluster url of the web server of the instance
pub fn webserver_url(namespace: &str, name: &str) -> String {
    format!(
        "https://{}.{}.svc:{}",
        builder::name(name, builder::WEBSERVER),
        namespace,
        builder::components::WEBSERVER_PORT
    )
}

// -----------------------------------------------------------------------------
// Action structure

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Action {
    CreateNamespace,
    UpsertComponents,
    BootstrapDatabase,
    Register,
    Stop,
    Migrate,
    Fail,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::CreateNamespace => write!(f, "CreateNamespace"),
            Self::UpsertComponents => write!(f, "UpsertComponents"),
            Self::BootstrapDatabase => write!(f, "BootstrapDatabase"),
            Self::Register => write!(f, "Register"),
            Self::Stop => write!(f, "Stop"),
            Self::Migrate => write!(f, "Migrate"),
            Self::Fail => write!(f, "Fail"),
        }
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    Cluster(cluster::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("{0}")]
    Builder(builder::Error),
    #[error("{0}")]
    Apply(apply::Error),
    #[error("{0}")]
    Database(database::Error),
    #[error("{0}")]
    Readiness(readiness::Error),
    #[error("{0}")]
    Registration(registration::Error),
}

impl From<cluster::Error> for ReconcilerError {
    fn from(err: cluster::Error) -> Self {
        Self::Cluster(err)
    }
}

impl From<serde_json::Error> for ReconcilerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Diff(err)
    }
}

impl From<builder::Error> for ReconcilerError {
    fn from(err: builder::Error) -> Self {
        Self::Builder(err)
    }
}

impl From<apply::Error> for ReconcilerError {
    fn from(err: apply::Error) -> Self {
        Self::Apply(err)
    }
}

impl From<database::Error> for ReconcilerError {
    fn from(err: database::Error) -> Self {
        Self::Database(err)
    }
}

impl From<readiness::Error> for ReconcilerError {
    fn from(err: readiness::Error) -> Self {
        Self::Readiness(err)
    }
}

impl From<registration::Error> for ReconcilerError {
    fn from(err: registration::Error) -> Self {
        Self::Registration(err)
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

pub struct Reconciler<C, P, N> {
    cluster: Arc<C>,
    config: Arc<Configuration>,
    poller: Poller,
    probe: P,
    federator: Option<Federator<N>>,
}

impl<C, P, N> Reconciler<C, P, N>
where
    C: Cluster,
    P: Probe,
    N: Notifier,
{
    pub fn new(
        cluster: Arc<C>,
        config: Arc<Configuration>,
        token: CancellationToken,
        probe: P,
        notifier: Option<N>,
    ) -> Self {
        let poller = Poller::new(config.reconciler.poll_interval(), token);

        Self {
            cluster,
            config,
            poller,
            probe,
            federator: notifier.map(Federator::new),
        }
    }

    /// converge the scope of the namespace to the component set
    async fn converge(
        &self,
        namespace: &str,
        scope: Selector,
        retention: Retention,
        desired: &ComponentList,
    ) -> Result<bool, ReconcilerError> {
        Ok(Updater::new(self.cluster.as_ref(), namespace, scope)
            .retention(retention)
            .dry_run(self.config.operator.dry_run)
            .reconcile(desired)
            .await
            .into_result()?)
    }

    /// patch the status of the instance, nothing is sent when the status is
    /// left untouched
    async fn status<F>(&self, current: &mut Blackduck, f: F) -> Result<(), ReconcilerError>
    where
        F: FnOnce(&mut Status),
    {
        let mut modified = current.to_owned();
        let mut status = modified.status.take().unwrap_or_default();
        f(&mut status);
        modified.status = Some(status);

        let patch = resource::diff(current, &modified)?;
        if patch.0.is_empty() {
            return Ok(());
        }

        let (namespace, name) = resource::namespaced_name(current);
        if self.config.operator.dry_run {
            info!(namespace = &namespace, name = &name, "Skip status update in dry run");
            *current = modified;
            return Ok(());
        }

        *current = self.cluster.patch_status(&namespace, &name, patch).await?;
        Ok(())
    }

    async fn event(&self, obj: &Blackduck, action: &Action, message: &str) {
        if let Err(err) = recorder::normal(self.cluster.as_ref(), obj, action, message).await {
            warn!(
                name = obj.name_any(),
                action = action.to_string(),
                error = err.to_string(),
                "Could not record event"
            );
        }
    }

    async fn credentials(&self, instance: &Blackduck) -> Result<database::Credentials, ReconcilerError> {
        let reconciler = &self.config.reconciler;

        Ok(database::credentials(
            self.cluster.as_ref(),
            &self.poller.every(reconciler.credential_interval()),
            instance,
            &self.config.operator.namespace,
            &self.config.operator.secret,
            reconciler.credential_attempts,
        )
        .await?)
    }

    /// drive the instance toward its desired state
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, current), fields(name = %current.name_any())))]
    pub async fn reconcile(&self, mut current: Blackduck) -> Result<(), ReconcilerError> {
        let name = current.name_any();
        let target = current.target_namespace();

        // ---------------------------------------------------------------------
        // Step 1: ensure the namespace

        if self.cluster.ensure_namespace(&target).await? {
            info!(namespace = &target, name = &name, "Created namespace of instance");
            let message = &format!("Created namespace '{}'", target);
            self.event(&current, &Action::CreateNamespace, message).await;
        }

        // ---------------------------------------------------------------------
        // Step 2: select the builder of the declared version

        let builder = builder::builder(&current)?;
        debug!(namespace = &target, name = &name, version = builder.version(), "Selected builder");

        match current.desired_state() {
            None | Some(State::Running) => self.run(&mut current, builder).await,
            Some(State::Stopped) => self.stop(&mut current, builder).await,
            Some(State::DbMigrate) => self.migrate(&mut current, builder).await,
            Some(state) => {
                warn!(namespace = &target, name = &name, state = state.to_string(), "Unexpected desired state");
                let generation = current.metadata.generation;
                self.status(&mut current, |status| {
                    status.state = Some(State::UnexpectedState);
                    status.error_message = Some(format!("unexpected desired state '{}'", state));
                    status.observed_generation = generation;
                })
                .await
            }
        }
    }

    async fn stop(&self, current: &mut Blackduck, builder: &dyn ComponentBuilder) -> Result<(), ReconcilerError> {
        let name = current.name_any();
        let target = current.target_namespace();

        info!(namespace = &target, name = &name, "Stop instance, claims are preserved");
        let desired = ComponentList {
            persistent_volume_claims: builder.claims(current),
            ..Default::default()
        };

        let scope = Selector::instance(APP, &name);
        if self.converge(&target, scope, Retention::PreserveClaims, &desired).await? {
            self.event(current, &Action::Stop, "Stopped instance").await;
        }

        let generation = current.metadata.generation;
        self.status(current, |status| {
            status.state = Some(State::Stopped);
            status.error_message = None;
            status.observed_generation = generation;
        })
        .await
    }

    async fn migrate(&self, current: &mut Blackduck, builder: &dyn ComponentBuilder) -> Result<(), ReconcilerError> {
        let name = current.name_any();
        let target = current.target_namespace();

        info!(namespace = &target, name = &name, "Keep only the database of instance");
        let credentials = self.credentials(current).await?;
        let inputs = Inputs {
            registry: &self.config.operator.registry,
            credentials: &credentials,
        };

        let desired = builder
            .components(current, &inputs)?
            .select(&Selector::default().within(COMPONENT, &[CLAIM_COMPONENT, builder::POSTGRES]));

        let scope = Selector::instance(APP, &name);
        if self.converge(&target, scope, Retention::PreserveClaims, &desired).await? {
            self.event(current, &Action::Migrate, "Scaled instance down to its database").await;
        }

        let generation = current.metadata.generation;
        self.status(current, |status| {
            status.state = Some(State::DbMigrate);
            status.error_message = None;
            status.observed_generation = generation;
        })
        .await
    }

    async fn run(&self, current: &mut Blackduck, builder: &dyn ComponentBuilder) -> Result<(), ReconcilerError> {
        let name = current.name_any();
        let target = current.target_namespace();
        let instance = Selector::instance(APP, &name);
        let reconciler = &self.config.reconciler;

        // ---------------------------------------------------------------------
        // Step 3: build the component set

        let credentials = self.credentials(current).await?;
        let inputs = Inputs {
            registry: &self.config.operator.registry,
            credentials: &credentials,
        };

        let components = builder.components(current, &inputs)?;
        let external = current.spec.external_postgres.is_some();
        let mut patched = false;

        // ---------------------------------------------------------------------
        // Step 4: storage and database tier

        info!(namespace = &target, name = &name, "Converge storage of instance");
        let scope = instance.to_owned().equals(COMPONENT, CLAIM_COMPONENT);
        patched |= self.converge(&target, scope, Retention::Default, &components).await?;

        if !external {
            info!(namespace = &target, name = &name, "Converge database tier of instance");
            let scope = instance.to_owned().equals(COMPONENT, builder::POSTGRES);
            patched |= self.converge(&target, scope, Retention::Default, &components).await?;

            let outcome = Database::new(self.cluster.as_ref(), &self.poller, &target, &name)
                .timeouts(reconciler.pod_wait_timeout(), reconciler.clone_timeout())
                .bootstrap(&credentials, current.db_prototype())
                .await?;

            let message = match &outcome {
                Outcome::Existing => None,
                Outcome::Initialized => Some("Initialized database".to_string()),
                Outcome::Cloned(from) => Some(format!("Cloned database from instance '{}'", from)),
            };

            if let Some(message) = message {
                info!(namespace = &target, name = &name, "{}", message);
                self.event(current, &Action::BootstrapDatabase, &message).await;
            }
        }

        // ---------------------------------------------------------------------
        // Step 5: configuration, certificate authority then the remainder

        info!(namespace = &target, name = &name, "Converge configuration of instance");
        let scope = instance
            .to_owned()
            .within(COMPONENT, &[builder::CONFIG, builder::SERVICE_ACCOUNT, builder::SECRET]);
        patched |= self.converge(&target, scope, Retention::Default, &components).await?;

        let scope = instance.to_owned().equals(COMPONENT, builder::CFSSL);
        patched |= self.converge(&target, scope.to_owned(), Retention::Default, &components).await?;
        readiness::wait_for_pods_running(
            self.cluster.as_ref(),
            &self.poller,
            &target,
            &scope,
            reconciler.pod_wait_timeout(),
        )
        .await?;

        info!(namespace = &target, name = &name, "Converge remaining components of instance");
        let scope = instance.to_owned().without(
            COMPONENT,
            &[
                builder::POSTGRES,
                CLAIM_COMPONENT,
                builder::CONFIG,
                builder::SERVICE_ACCOUNT,
                builder::SECRET,
                builder::CFSSL,
            ],
        );
        patched |= self.converge(&target, scope, Retention::Default, &components).await?;

        if patched {
            let message = &format!("Converged {} component(s)", components.len());
            self.event(current, &Action::UpsertComponents, message).await;
        }

        readiness::wait_for_pods_running(
            self.cluster.as_ref(),
            &self.poller,
            &target,
            &instance,
            reconciler.pod_wait_timeout(),
        )
        .await?;

        // ---------------------------------------------------------------------
        // Step 6: registration

        if let Some(key) = current.license_key() {
            let registered = registration::register(
                self.cluster.as_ref(),
                &self.poller.every(reconciler.registration_interval()),
                &self.probe,
                &target,
                &name,
                key,
                reconciler.registration_attempts,
            )
            .await?;

            if registered {
                self.event(current, &Action::Register, "Registered instance").await;
            }
        }

        // ---------------------------------------------------------------------
        // Step 7: report address, volumes and state

        let (ip, fqdn) = self.address(current).await;
        let volumes = self.volumes(&target, &builder.claims(current)).await?;
        let generation = current.metadata.generation;

        self.status(current, |status| {
            status.state = Some(State::Running);
            status.error_message = None;
            status.observed_generation = generation;
            if ip.is_some() {
                status.ip = ip;
            }
            if fqdn.is_some() {
                status.fqdn = fqdn;
            }
            status.pvc_volume_name = volumes;
        })
        .await?;

        info!(namespace = &target, name = &name, "Instance is running");

        // ---------------------------------------------------------------------
        // Step 8: notify the federator

        if let Some(federator) = &self.federator {
            if let Err(err) = federator.synchronize(self.cluster.as_ref()).await {
                warn!(namespace = &target, name = &name, error = err.to_string(), "Could not notify federator");
            }
        }

        Ok(())
    }

    /// returns the exposed address and host name of the web server, failures
    /// are logged
    async fn address(&self, current: &Blackduck) -> (Option<String>, Option<String>) {
        let name = current.name_any();
        let target = current.target_namespace();
        let service = builder::name(&name, builder::WEBSERVER_EXPOSED);
        let attempts = self.config.reconciler.address_attempts;
        let cluster = self.cluster.as_ref();

        let result = match current.exposure() {
            Ok(Exposure::NodePort) => readiness::node_port_address(cluster, &self.poller, &target, &service, attempts)
                .await
                .map(|ip| (Some(ip), None)),
            Ok(Exposure::LoadBalancer) => {
                readiness::load_balancer_address(cluster, &self.poller, &target, &service, attempts)
                    .await
                    .map(|ip| (Some(ip), None))
            }
            Ok(Exposure::Route) => {
                let route: Result<Option<Route>, cluster::Error> =
                    cluster.get(&target, &format!("{}-{}", name, APP)).await;

                route
                    .map(|route| {
                        let host = route.and_then(|route| route.host());
                        (host.to_owned(), host)
                    })
                    .map_err(readiness::Error::from)
            }
            Ok(Exposure::None) | Err(_) => Ok((None, None)),
        };

        match result {
            Ok(address) => address,
            Err(err) => {
                warn!(namespace = &target, name = &name, error = err.to_string(), "Could not resolve address of instance");
                (None, None)
            }
        }
    }

    /// returns the volume bound to each claim, claims still unbound once
    /// attempts are exhausted are omitted
    async fn volumes(
        &self,
        namespace: &str,
        claims: &[PersistentVolumeClaim],
    ) -> Result<BTreeMap<String, String>, ReconcilerError> {
        let attempts = self.config.reconciler.volume_attempts.max(1);
        let mut volumes = BTreeMap::new();

        for attempt in 0..attempts {
            for claim in claims {
                let name = claim.name_any();
                if volumes.contains_key(&name) {
                    continue;
                }

                let live: Option<PersistentVolumeClaim> = self.cluster.get(namespace, &name).await?;
                if let Some(volume) = live.and_then(|claim| claim.spec).and_then(|spec| spec.volume_name) {
                    volumes.insert(name, volume);
                }
            }

            if volumes.len() == claims.len() {
                break;
            }

            if attempt + 1 < attempts {
                self.poller.tick().await?;
            }
        }

        Ok(volumes)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, origin), fields(name = %origin.name_any())))]
    pub async fn teardown(&self, origin: &Blackduck) -> Result<(), ReconcilerError> {
        let name = origin.name_any();
        let target = origin.target_namespace();

        // ---------------------------------------------------------------------
        // Step 1: skip teardown while the definition is uninstalled

        let crd = self
            .cluster
            .custom_resource_definition(&self.config.operator.crd)
            .await?;

        match crd {
            None => {
                info!(namespace = &target, name = &name, crd = &self.config.operator.crd, "Custom resource definition is gone, leave components in place");
                return Ok(());
            }
            Some(crd) if resource::deleted(&crd) => {
                info!(namespace = &target, name = &name, crd = &self.config.operator.crd, "Custom resource definition is being deleted, leave components in place");
                return Ok(());
            }
            Some(_) => {}
        }

        // ---------------------------------------------------------------------
        // Step 2: delete every component, then the claims

        info!(namespace = &target, name = &name, "Delete components of instance");
        let instance = Selector::instance(APP, &name);
        let empty = ComponentList::default();

        self.converge(&target, instance.to_owned(), Retention::Default, &empty).await?;
        self.converge(&target, instance.equals(COMPONENT, CLAIM_COMPONENT), Retention::Default, &empty)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl<C, P, N> Handler<Blackduck> for Reconciler<C, P, N>
where
    C: Cluster,
    P: Probe,
    N: Notifier,
{
    type Error = ReconcilerError;

    async fn created(&self, obj: Arc<Blackduck>) -> Result<(), ReconcilerError> {
        if obj.desired_state().is_some() || obj.state().is_some() {
            return self.updated(obj).await;
        }

        let mut current = obj.as_ref().to_owned();
        self.status(&mut current, |status| status.state = Some(State::Pending)).await?;
        self.status(&mut current, |status| status.state = Some(State::Creating)).await?;

        self.reconcile(current).await
    }

    async fn updated(&self, obj: Arc<Blackduck>) -> Result<(), ReconcilerError> {
        let desired = obj.desired_state().unwrap_or(State::Running);
        let state = obj.state();

        if state == Some(desired) && !obj.generation_changed() {
            debug!(name = obj.name_any(), state = desired.to_string(), "Instance is in its desired state");
            return Ok(());
        }

        self.reconcile(obj.as_ref().to_owned()).await
    }

    async fn deleted(&self, obj: Arc<Blackduck>) -> Result<(), ReconcilerError> {
        self.teardown(&obj).await
    }

    async fn failed(&self, obj: Arc<Blackduck>, err: &ReconcilerError) {
        let (namespace, name) = resource::namespaced_name(obj.as_ref());
        error!(namespace = &namespace, name = &name, error = err.to_string(), "Failed to reconcile instance");

        let current: Option<Blackduck> = match self.cluster.get(&namespace, &name).await {
            Ok(current) => current,
            Err(err) => {
                warn!(namespace = &namespace, name = &name, error = err.to_string(), "Could not read instance");
                return;
            }
        };

        let mut current = match current {
            Some(current) => current,
            None => return,
        };

        let message = err.to_string();
        if let Err(err) = self
            .status(&mut current, |status| {
                status.state = Some(State::Error);
                status.error_message = Some(message.to_owned());
            })
            .await
        {
            warn!(namespace = &namespace, name = &name, error = err.to_string(), "Could not report error in status");
        }

        if let Err(err) = recorder::warning(self.cluster.as_ref(), &current, &Action::Fail, &message).await {
            warn!(namespace = &namespace, name = &name, error = err.to_string(), "Could not record event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::{
            apps::v1::Deployment,
            batch::v1::Job,
            core::v1::{EndpointAddress, EndpointSubset, Endpoints, Pod, PodStatus, Secret},
        },
        ByteString,
    };

    use super::*;
    use crate::svc::{
        blackduck::{
            builder::components::ADMIN_PASSWORD_KEY,
            federator::MockNotifier,
            registration::MockProbe,
        },
        cfg::DEFAULT_CRD,
        crd::blackduck::Spec,
        k8s::cluster::memory::{MemoryCluster, Operation, Verb},
    };

    type TestReconciler = Reconciler<MemoryCluster, MockProbe, MockNotifier>;

    fn config() -> Configuration {
        let mut config = Configuration::default();
        config.reconciler.poll_interval = 1;
        config.reconciler.credential_interval = 1;
        config.reconciler.credential_attempts = 2;
        config.reconciler.pod_wait_timeout = 200;
        config.reconciler.clone_timeout = 200;
        config.reconciler.address_attempts = 1;
        config.reconciler.volume_attempts = 1;
        config.reconciler.registration_attempts = 2;
        config.reconciler.registration_interval = 1;
        config
    }

    fn running(namespace: &str, name: &str, component: &str) -> Pod {
        Pod {
            metadata: resource::metadata(
                namespace,
                &format!("{}-blackduck-{}-0", name, component),
                resource::labels(APP, name, component),
            ),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// cluster with the operator secret and a database which answers queries
    fn cluster() -> MemoryCluster {
        let cluster = MemoryCluster::default();
        cluster.seed_crd(DEFAULT_CRD, false);
        cluster.seed(Secret {
            metadata: resource::metadata("synopsys-operator", "blackduck-secret", BTreeMap::new()),
            data: Some(BTreeMap::from([
                ("POSTGRES_PASSWORD".to_string(), ByteString(b"postgres-pw".to_vec())),
                ("ADMIN_PASSWORD".to_string(), ByteString(b"admin-pw".to_vec())),
                ("USER_PASSWORD".to_string(), ByteString(b"user-pw".to_vec())),
            ])),
            ..Default::default()
        });
        cluster.seed(running("bd1", "bd1", builder::POSTGRES));
        cluster.seed(Endpoints {
            metadata: resource::metadata("bd1", "bd1-blackduck-postgres", BTreeMap::new()),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        });
        cluster.on_exec(|_, command| {
            if command.iter().any(|arg| arg.contains("SELECT 1")) {
                Ok("1\n".into())
            } else {
                Ok(String::new())
            }
        });

        cluster
    }

    fn instance(cluster: &MemoryCluster, spec: Spec) -> Arc<Blackduck> {
        let mut bd = Blackduck::new("bd1", spec);
        bd.metadata.namespace = Some("bd1".into());
        bd.metadata.generation = Some(1);
        cluster.seed(bd.to_owned());

        Arc::new(bd)
    }

    fn spec() -> Spec {
        Spec {
            size: "small".into(),
            version: "2019.4.2".into(),
            persistent_storage: true,
            ..Default::default()
        }
    }

    fn reconciler(cluster: Arc<MemoryCluster>, probe: MockProbe) -> TestReconciler {
        Reconciler::new(cluster, Arc::new(config()), CancellationToken::new(), probe, None)
    }

    fn stored(cluster: &MemoryCluster) -> Blackduck {
        cluster.object::<Blackduck>("bd1", "bd1").unwrap()
    }

    fn position(journal: &[Operation], kind: &str, name: &str) -> usize {
        journal
            .iter()
            .position(|op| op.kind == kind && op.name == name && op.verb != Verb::PatchStatus)
            .unwrap_or_else(|| panic!("{} '{}' to be in the journal", kind, name))
    }

    #[tokio::test]
    async fn first_reconciliation_follows_the_tiers() {
        let cluster = Arc::new(cluster());
        let obj = instance(&cluster, spec());

        reconciler(cluster.clone(), MockProbe::new()).created(obj).await.unwrap();

        let journal = cluster.journal();
        let claim = position(&journal, "PersistentVolumeClaim", "bd1-blackduck-postgres");
        let database = position(&journal, "Deployment", "bd1-blackduck-postgres");
        let bootstrap = journal.iter().position(|op| op.verb == Verb::Exec).unwrap();
        let config = position(&journal, "ConfigMap", "bd1-blackduck-config");
        let cfssl = position(&journal, "Deployment", "bd1-blackduck-cfssl");
        let webapp = position(&journal, "Deployment", "bd1-blackduck-webapp");

        assert!(claim < database);
        assert!(database < bootstrap);
        assert!(bootstrap < config);
        assert!(config < cfssl);
        assert!(cfssl < webapp);

        assert!(cluster
            .commands()
            .iter()
            .any(|(_, command)| command.iter().any(|arg| arg.starts_with("CREATE DATABASE bds_hub "))));
        assert!(cluster.objects::<Job>("bd1").is_empty());

        let status = stored(&cluster).status.unwrap();
        assert_eq!(status.state, Some(State::Running));
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.error_message, None);
    }

    #[tokio::test]
    async fn prototype_database_is_cloned() {
        let cluster = Arc::new(cluster());
        cluster.complete_jobs();
        cluster.seed(Secret {
            metadata: resource::metadata("bd0", "bd0-blackduck-db-creds", BTreeMap::new()),
            string_data: Some(BTreeMap::from([(ADMIN_PASSWORD_KEY.to_string(), "bd0-pw".to_string())])),
            ..Default::default()
        });

        let mut spec = spec();
        spec.db_prototype = Some("bd0".into());
        let obj = instance(&cluster, spec);

        reconciler(cluster.clone(), MockProbe::new()).created(obj).await.unwrap();

        let job: Job = cluster.object("bd1", "bd1-blackduck-clone-job").unwrap();
        let command = job.spec.unwrap().template.spec.unwrap().containers[0]
            .command
            .to_owned()
            .unwrap()
            .join(" ");
        assert!(command.contains("bd0-blackduck-postgres.bd0.svc.cluster.local"));
        assert!(!cluster
            .commands()
            .iter()
            .any(|(_, command)| command.iter().any(|arg| arg.starts_with("CREATE DATABASE"))));
        assert_eq!(stored(&cluster).state(), Some(State::Running));
    }

    #[tokio::test]
    async fn clone_timeout_is_reported_in_status() {
        let cluster = Arc::new(cluster());
        cluster.seed(Secret {
            metadata: resource::metadata("bd0", "bd0-blackduck-db-creds", BTreeMap::new()),
            string_data: Some(BTreeMap::from([(ADMIN_PASSWORD_KEY.to_string(), "bd0-pw".to_string())])),
            ..Default::default()
        });

        let mut spec = spec();
        spec.db_prototype = Some("bd0".into());
        let obj = instance(&cluster, spec);
        let reconciler = reconciler(cluster.clone(), MockProbe::new());

        let err = reconciler.created(obj.clone()).await.unwrap_err();
        reconciler.failed(obj, &err).await;

        let status = stored(&cluster).status.unwrap();
        assert_eq!(status.state, Some(State::Error));
        assert_eq!(status.error_message.as_deref(), Some("the clone operation timed out"));
    }

    #[tokio::test]
    async fn unknown_version_fails_before_any_component() {
        let cluster = Arc::new(cluster());
        let mut spec = spec();
        spec.version = "1.0.0".into();
        let obj = instance(&cluster, spec);
        let reconciler = reconciler(cluster.clone(), MockProbe::new());

        let err = reconciler.created(obj.clone()).await.unwrap_err();
        reconciler.failed(obj, &err).await;

        assert!(cluster.objects::<Deployment>("bd1").is_empty());
        let status = stored(&cluster).status.unwrap();
        assert_eq!(status.state, Some(State::Error));
        assert!(status.error_message.unwrap().contains("'1.0.0'"));
    }

    #[tokio::test]
    async fn stopped_instance_keeps_only_its_claims() {
        let cluster = Arc::new(cluster());
        let obj = instance(&cluster, spec());
        let reconciler = reconciler(cluster.clone(), MockProbe::new());
        reconciler.created(obj).await.unwrap();
        let claims = cluster.objects::<PersistentVolumeClaim>("bd1").len();
        assert!(claims > 0);

        let mut current = stored(&cluster);
        current.spec.desired_state = Some(State::Stopped);
        cluster.seed(current.to_owned());
        reconciler.updated(Arc::new(current)).await.unwrap();

        assert!(cluster.objects::<Deployment>("bd1").is_empty());
        assert_eq!(cluster.objects::<PersistentVolumeClaim>("bd1").len(), claims);
        assert_eq!(stored(&cluster).state(), Some(State::Stopped));
    }

    #[tokio::test]
    async fn migrating_instance_keeps_its_database() {
        let cluster = Arc::new(cluster());
        let obj = instance(&cluster, spec());
        let reconciler = reconciler(cluster.clone(), MockProbe::new());
        reconciler.created(obj).await.unwrap();

        let mut current = stored(&cluster);
        current.spec.desired_state = Some(State::DbMigrate);
        cluster.seed(current.to_owned());
        reconciler.updated(Arc::new(current)).await.unwrap();

        let deployments: Vec<String> = cluster
            .objects::<Deployment>("bd1")
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        assert_eq!(deployments, vec!["bd1-blackduck-postgres".to_string()]);
        assert_eq!(stored(&cluster).state(), Some(State::DbMigrate));
    }

    #[tokio::test]
    async fn instances_in_their_desired_state_are_skipped() {
        let cluster = Arc::new(cluster());
        let obj = instance(&cluster, spec());
        let reconciler = reconciler(cluster.clone(), MockProbe::new());
        reconciler.created(obj).await.unwrap();

        cluster.clear_journal();
        reconciler.updated(Arc::new(stored(&cluster))).await.unwrap();

        assert!(cluster.journal().is_empty());
    }

    #[tokio::test]
    async fn second_pass_without_drift_mutates_nothing() {
        let cluster = Arc::new(cluster());
        let obj = instance(&cluster, spec());
        let reconciler = reconciler(cluster.clone(), MockProbe::new());
        reconciler.created(obj).await.unwrap();

        cluster.clear_journal();
        reconciler.reconcile(stored(&cluster)).await.unwrap();

        let mutations: Vec<Operation> = cluster
            .mutations()
            .into_iter()
            .filter(|op| op.kind != "Event")
            .collect();
        assert!(mutations.is_empty(), "{:?}", mutations);
    }

    #[tokio::test]
    async fn license_key_registers_the_instance() {
        let cluster = Arc::new(cluster());
        cluster.seed(running("bd1", "bd1", builder::REGISTRATION));
        let mut spec = spec();
        spec.license_key = Some("LICENSE-1".into());
        let obj = instance(&cluster, spec);

        let mut probe = MockProbe::new();
        probe.expect_registered().times(1).returning(|_| Ok(Some(false)));

        reconciler(cluster.clone(), probe).created(obj).await.unwrap();

        assert!(cluster
            .commands()
            .iter()
            .any(|(pod, command)| pod == "bd1-blackduck-registration-0"
                && command.iter().any(|arg| arg.contains("registrationid=LICENSE-1"))));
        assert_eq!(stored(&cluster).state(), Some(State::Running));
    }

    #[tokio::test]
    async fn new_namespace_is_created_for_the_instance() {
        let cluster = Arc::new(cluster());
        let mut spec = spec();
        spec.namespace = Some("bd9".into());
        spec.desired_state = Some(State::Stopped);
        let obj = instance(&cluster, spec);

        reconciler(cluster.clone(), MockProbe::new()).created(obj).await.unwrap();

        assert!(cluster.has_namespace("bd9"));
        assert_eq!(cluster.mutations()[0].verb, Verb::CreateNamespace);
        assert!(!cluster.objects::<PersistentVolumeClaim>("bd9").is_empty());
    }

    #[tokio::test]
    async fn deletion_removes_every_component() {
        let cluster = Arc::new(cluster());
        let obj = instance(&cluster, spec());
        let reconciler = reconciler(cluster.clone(), MockProbe::new());
        reconciler.created(obj.clone()).await.unwrap();

        reconciler.deleted(obj).await.unwrap();

        assert!(cluster.objects::<Deployment>("bd1").is_empty());
        assert!(cluster.objects::<PersistentVolumeClaim>("bd1").is_empty());
        assert!(cluster.has_namespace("bd1"));
    }

    #[tokio::test]
    async fn deletion_during_uninstall_leaves_components() {
        let cluster = Arc::new(cluster());
        let obj = instance(&cluster, spec());
        let reconciler = reconciler(cluster.clone(), MockProbe::new());
        reconciler.created(obj.clone()).await.unwrap();

        cluster.seed_crd(DEFAULT_CRD, true);
        cluster.clear_journal();
        reconciler.deleted(obj).await.unwrap();

        assert!(cluster.mutations().is_empty());
        assert!(!cluster.objects::<Deployment>("bd1").is_empty());
    }
}
