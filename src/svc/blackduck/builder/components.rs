//! # Components module
//!
//! This module provide the component set of a release: storage claims, the
//! database tier, configuration, secrets and the application workloads with
//! their services and exposure.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
        core::v1::{
            ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EmptyDirVolumeSource,
            EnvFromSource, EnvVar, EnvVarSource, ExecAction, LocalObjectReference,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
            PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Secret, SecretKeySelector,
            SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec, Volume,
            VolumeMount,
        },
        rbac::v1::{RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::{
        api::resource::Quantity, apis::meta::v1::LabelSelector, apis::meta::v1::ObjectMeta,
        util::intstr::IntOrString,
    },
};
use kube::ResourceExt;

use crate::svc::{
    blackduck::builder::{
        self,
        flavor::{self, Flavor},
        release::{Release, POSTGRES_IMAGE},
        ComponentBuilder, Error, Inputs,
    },
    component::{compare::CLAIM_COMPONENT, ComponentList},
    crd::{
        blackduck::{Blackduck, Exposure, APP},
        route::{Route, RoutePort, RouteSpec, RouteTargetReference, TlsConfig},
    },
    k8s::resource,
};

// -----------------------------------------------------------------------------
// Constants

pub const CLUSTER_ROLE: &str = "synopsys-operator-admin";
pub const SECRETS_DIR: &str = "/tmp/secrets";
pub const ADMIN_PASSWORD_KEY: &str = "HUB_POSTGRES_ADMIN_PASSWORD_FILE";
pub const USER_PASSWORD_KEY: &str = "HUB_POSTGRES_USER_PASSWORD_FILE";
pub const POSTGRES_PASSWORD_KEY: &str = "HUB_POSTGRES_POSTGRES_PASSWORD_FILE";
pub const POSTGRES_PORT: i32 = 5432;
pub const WEBSERVER_PORT: i32 = 443;

const HEALTHCHECK: &str = "/usr/local/bin/docker-healthcheck.sh";

/// default claims as `(suffix, size)`
const CLAIMS: &[(&str, &str)] = &[
    ("authentication", "2Gi"),
    ("cfssl", "2Gi"),
    ("registration", "2Gi"),
    ("solr", "2Gi"),
    ("webapp", "2Gi"),
    ("logstash", "20Gi"),
    ("zookeeper-data", "2Gi"),
    ("zookeeper-datalog", "2Gi"),
];

const POSTGRES_CLAIM: (&str, &str) = ("postgres", "150Gi");

const BINARY_ANALYSIS_CLAIMS: &[(&str, &str)] = &[
    ("rabbitmq", "5Gi"),
    ("uploadcache-data", "100Gi"),
    ("uploadcache-key", "2Gi"),
];

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the repository name of an image reference, without registry nor
/// tag
fn repository(reference: &str) -> &str {
    let image = reference.rsplit('/').next().unwrap_or(reference);
    image.split(|c: char| c == ':' || c == '@').next().unwrap_or(image)
}

fn value(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn secret_key(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn config_map_ref(name: String) -> EnvFromSource {
    EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: Some(name),
            optional: None,
        }),
        ..Default::default()
    }
}

fn healthcheck(args: &[&str]) -> Vec<String> {
    std::iter::once(HEALTHCHECK)
        .chain(args.iter().copied())
        .map(String::from)
        .collect()
}

/// returns the claims of the instance, `spec.pvc` entries override defaults
/// by name
pub fn claims(instance: &Blackduck) -> Vec<PersistentVolumeClaim> {
    if !instance.spec.persistent_storage {
        return vec![];
    }

    let name = instance.name_any();
    let namespace = instance.target_namespace();

    let mut defaults = vec![];
    if instance.spec.external_postgres.is_none() {
        defaults.push(POSTGRES_CLAIM);
    }
    defaults.extend_from_slice(CLAIMS);
    if instance.binary_analysis() {
        defaults.extend_from_slice(BINARY_ANALYSIS_CLAIMS);
    }

    defaults
        .into_iter()
        .map(|(suffix, size)| {
            let custom = instance.spec.pvc.iter().find(|claim| {
                claim.name == suffix || claim.name.strip_prefix("blackduck-") == Some(suffix)
            });

            let size = custom
                .and_then(|claim| claim.size.to_owned())
                .unwrap_or_else(|| size.to_string());
            let volume_name = custom.and_then(|claim| claim.volume_name.to_owned());
            let storage_class = match &volume_name {
                // a pre-provisioned volume must not go through a provisioner
                Some(_) => Some(String::new()),
                None => custom
                    .and_then(|claim| claim.storage_class.to_owned())
                    .or_else(|| instance.spec.pvc_storage_class.to_owned())
                    .filter(|class| !class.is_empty()),
            };

            let claim = builder::name(&name, suffix);
            PersistentVolumeClaim {
                metadata: resource::metadata(
                    &namespace,
                    &claim,
                    resource::labels(APP, &name, CLAIM_COMPONENT),
                ),
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                        ..Default::default()
                    }),
                    storage_class_name: storage_class,
                    volume_name,
                    ..Default::default()
                }),
                status: None,
            }
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Mount structure

enum Source {
    Claim(String),
    Secret(String),
    Empty,
}

struct Mount {
    volume: String,
    path: String,
    source: Source,
}

impl Mount {
    fn volume(&self) -> Volume {
        let mut volume = Volume {
            name: self.volume.to_owned(),
            ..Default::default()
        };

        match &self.source {
            Source::Claim(claim) => {
                volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_owned(),
                    read_only: None,
                })
            }
            Source::Secret(secret) => {
                volume.secret = Some(SecretVolumeSource {
                    secret_name: Some(secret.to_owned()),
                    default_mode: Some(0o644),
                    ..Default::default()
                })
            }
            Source::Empty => volume.empty_dir = Some(EmptyDirVolumeSource::default()),
        }

        volume
    }

    fn mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.volume.to_owned(),
            mount_path: self.path.to_owned(),
            ..Default::default()
        }
    }
}

// -----------------------------------------------------------------------------
// Workload structure

struct Workload {
    component: &'static str,
    image: String,
    replicas: i32,
    cpu: Option<&'static str>,
    memory: &'static str,
    env: Vec<EnvVar>,
    database: bool,
    ports: Vec<i32>,
    mounts: Vec<Mount>,
    probe: Option<Vec<String>>,
}

impl Workload {
    fn new(component: &'static str, image: String, memory: &'static str) -> Self {
        Self {
            component,
            image,
            replicas: 1,
            cpu: None,
            memory,
            env: vec![],
            database: false,
            ports: vec![],
            mounts: vec![],
            probe: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Context structure

struct Context<'a> {
    instance: &'a Blackduck,
    release: &'a Release,
    flavor: &'static Flavor,
    inputs: &'a Inputs<'a>,
    claims: Vec<PersistentVolumeClaim>,
    name: String,
    namespace: String,
}

impl<'a> Context<'a> {
    fn name(&self, suffix: &str) -> String {
        builder::name(&self.name, suffix)
    }

    fn labels(&self, component: &str) -> BTreeMap<String, String> {
        resource::labels(APP, &self.name, component)
    }

    fn metadata(&self, name: &str, component: &str) -> ObjectMeta {
        resource::metadata(&self.namespace, name, self.labels(component))
    }

    fn external_database(&self) -> bool {
        self.instance.spec.external_postgres.is_some()
    }

    /// returns the component label of the database configuration, which is
    /// part of the database tier unless the database is external
    fn database_component(&self, otherwise: &'static str) -> &'static str {
        if self.external_database() {
            otherwise
        } else {
            builder::POSTGRES
        }
    }

    fn registry(&self) -> String {
        match &self.instance.spec.registry_configuration {
            Some(configuration) => match (&configuration.registry, &configuration.namespace) {
                (Some(registry), Some(namespace)) => format!("{}/{}", registry, namespace),
                (Some(registry), None) => registry.to_owned(),
                _ => self.inputs.registry.to_string(),
            },
            None => self.inputs.registry.to_string(),
        }
    }

    /// returns the image reference, an entry of `imageRegistries` with the
    /// same repository takes precedence
    fn image(&self, image: &str) -> String {
        self.instance
            .spec
            .image_registries
            .iter()
            .find(|reference| repository(reference) == image)
            .cloned()
            .unwrap_or_else(|| format!("{}/{}:{}", self.registry(), image, self.release.tag(image)))
    }

    fn claim(&self, volume: &str, suffix: &str, path: &str) -> Mount {
        let claim = self.name(suffix);
        let source = if self
            .claims
            .iter()
            .any(|candidate| candidate.name_any() == claim)
        {
            Source::Claim(claim)
        } else {
            Source::Empty
        };

        Mount {
            volume: volume.to_string(),
            path: path.to_string(),
            source,
        }
    }

    fn secret(&self, volume: &str, suffix: &str, path: &str) -> Mount {
        Mount {
            volume: volume.to_string(),
            path: path.to_string(),
            source: Source::Secret(self.name(suffix)),
        }
    }

    fn empty(&self, volume: &str, path: &str) -> Mount {
        Mount {
            volume: volume.to_string(),
            path: path.to_string(),
            source: Source::Empty,
        }
    }

    // -------------------------------------------------------------------------
    // builders

    fn deployment(&self, workload: Workload) -> Deployment {
        let name = self.name(workload.component);
        let labels = self.labels(workload.component);

        let mut limits = BTreeMap::from([(
            "memory".to_string(),
            Quantity(workload.memory.to_string()),
        )]);
        if let Some(cpu) = workload.cpu {
            limits.insert("cpu".to_string(), Quantity(cpu.to_string()));
        }

        let mut env_from = vec![config_map_ref(self.name("config"))];
        if workload.database {
            env_from.push(config_map_ref(self.name("db-config")));
        }

        let probe = workload
            .probe
            .filter(|_| self.instance.spec.liveness_probes)
            .map(|command| Probe {
                exec: Some(ExecAction {
                    command: Some(command),
                }),
                initial_delay_seconds: Some(240),
                timeout_seconds: Some(10),
                period_seconds: Some(30),
                failure_threshold: Some(10),
                ..Default::default()
            });

        let container = Container {
            name: workload.component.to_string(),
            image: Some(workload.image),
            env: (!workload.env.is_empty()).then_some(workload.env),
            env_from: Some(env_from),
            ports: (!workload.ports.is_empty()).then(|| {
                workload
                    .ports
                    .iter()
                    .map(|port| ContainerPort {
                        container_port: *port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect()
            }),
            resources: Some(ResourceRequirements {
                requests: Some(limits.to_owned()),
                limits: Some(limits),
                ..Default::default()
            }),
            volume_mounts: (!workload.mounts.is_empty())
                .then(|| workload.mounts.iter().map(Mount::mount).collect()),
            liveness_probe: probe,
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(&name, workload.component),
            spec: Some(DeploymentSpec {
                replicas: Some(workload.replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.to_owned()),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: (!workload.mounts.is_empty())
                            .then(|| workload.mounts.iter().map(Mount::volume).collect()),
                        service_account_name: Some(self.name("service-account")),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    /// returns a service named after the component selecting its pods, ports
    /// are `(port, target port)`
    fn service(&self, name: String, component: &str, selected: &str, type_: &str, ports: &[(i32, i32)]) -> Service {
        Service {
            metadata: self.metadata(&name, component),
            spec: Some(ServiceSpec {
                selector: Some(self.labels(selected)),
                type_: Some(type_.to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|(port, target)| ServicePort {
                            name: Some(format!("port-{}", port)),
                            port: *port,
                            target_port: Some(IntOrString::Int(*target)),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn cluster_service(&self, component: &'static str, ports: &[(i32, i32)]) -> Service {
        self.service(self.name(component), component, component, "ClusterIP", ports)
    }

    fn secret_data(&self, suffix: &str, component: &str, data: Vec<(&str, String)>) -> Secret {
        Secret {
            metadata: self.metadata(&self.name(suffix), component),
            string_data: Some(
                data.into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    fn service_account(&self) -> (ServiceAccount, RoleBinding) {
        let name = self.name("service-account");
        let pull_secrets = self
            .instance
            .spec
            .registry_configuration
            .as_ref()
            .map(|configuration| configuration.pull_secrets.to_owned())
            .unwrap_or_default();

        let account = ServiceAccount {
            metadata: self.metadata(&name, builder::SERVICE_ACCOUNT),
            image_pull_secrets: (!pull_secrets.is_empty()).then(|| {
                pull_secrets
                    .into_iter()
                    .map(|name| LocalObjectReference { name: Some(name) })
                    .collect()
            }),
            ..Default::default()
        };

        let binding = RoleBinding {
            metadata: self.metadata(&name, builder::SERVICE_ACCOUNT),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: CLUSTER_ROLE.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.to_owned(),
                namespace: Some(self.namespace.to_owned()),
                ..Default::default()
            }]),
        };

        (account, binding)
    }

    fn config_maps(&self) -> Vec<ConfigMap> {
        let mut data = BTreeMap::from([
            ("PUBLIC_HUB_WEBSERVER_HOST".to_string(), "localhost".to_string()),
            ("PUBLIC_HUB_WEBSERVER_PORT".to_string(), WEBSERVER_PORT.to_string()),
            ("HUB_WEBSERVER_PORT".to_string(), "8443".to_string()),
            ("IPV4_ONLY".to_string(), "0".to_string()),
            ("RUN_SECRETS_DIR".to_string(), SECRETS_DIR.to_string()),
            ("HUB_VERSION".to_string(), self.release.version.to_string()),
            ("HUB_PROXY_NON_PROXY_HOSTS".to_string(), self.name(builder::SOLR)),
            ("HUB_CFSSL_HOST".to_string(), self.name(builder::CFSSL)),
            ("HUB_LOGSTASH_HOST".to_string(), self.name(builder::LOGSTASH)),
            ("HUB_REGISTRATION_HOST".to_string(), self.name(builder::REGISTRATION)),
            ("HUB_ZOOKEEPER_HOST".to_string(), self.name(builder::ZOOKEEPER)),
            ("HUB_AUTHENTICATION_HOST".to_string(), self.name(builder::AUTHENTICATION)),
            ("HUB_WEBAPP_HOST".to_string(), self.name(builder::WEBAPP)),
            ("HUB_SCAN_HOST".to_string(), self.name(builder::SCAN)),
            ("HUB_SOLR_HOST".to_string(), self.name(builder::SOLR)),
            ("HUB_DOC_HOST".to_string(), self.name(builder::DOCUMENTATION)),
        ]);

        if self.instance.binary_analysis() {
            data.insert("BLACKDUCK_UPLOAD_CACHE_HOST".into(), self.name(builder::UPLOAD_CACHE));
            data.insert("RABBIT_MQ_HOST".into(), self.name(builder::RABBITMQ));
            data.insert("RABBIT_MQ_PORT".into(), "5671".into());
        }

        // declared overrides win over computed values
        data.extend(self.instance.environs());

        let (host, port, admin, user, ssl) = match &self.instance.spec.external_postgres {
            Some(external) => (
                external.host.to_owned(),
                external.port.to_string(),
                external.admin.to_owned(),
                external.user.to_owned(),
                external.ssl,
            ),
            None => (
                self.name(builder::POSTGRES),
                POSTGRES_PORT.to_string(),
                "blackduck".to_string(),
                "blackduck_user".to_string(),
                false,
            ),
        };

        vec![
            ConfigMap {
                metadata: self.metadata(&self.name("config"), builder::CONFIG),
                data: Some(data),
                ..Default::default()
            },
            ConfigMap {
                metadata: self.metadata(&self.name("db-config"), self.database_component(builder::CONFIG)),
                data: Some(BTreeMap::from([
                    ("HUB_POSTGRES_HOST".to_string(), host),
                    ("HUB_POSTGRES_PORT".to_string(), port),
                    ("HUB_POSTGRES_ADMIN".to_string(), admin),
                    ("HUB_POSTGRES_USER".to_string(), user),
                    ("HUB_POSTGRES_ENABLE_SSL".to_string(), ssl.to_string()),
                ])),
                ..Default::default()
            },
        ]
    }

    fn secrets(&self) -> Vec<Secret> {
        let spec = &self.instance.spec;
        let credentials = self.inputs.credentials;

        let mut secrets = vec![self.secret_data(
            "db-creds",
            self.database_component(builder::SECRET),
            vec![
                (ADMIN_PASSWORD_KEY, credentials.admin.to_owned()),
                (USER_PASSWORD_KEY, credentials.user.to_owned()),
                (POSTGRES_PASSWORD_KEY, credentials.postgres.to_owned()),
            ],
        )];

        if let (Some(certificate), Some(key)) = (&spec.certificate, &spec.certificate_key) {
            secrets.push(self.secret_data(
                "webserver-certificate",
                builder::SECRET,
                vec![
                    ("WEBSERVER_CUSTOM_CERT_FILE", certificate.to_owned()),
                    ("WEBSERVER_CUSTOM_KEY_FILE", key.to_owned()),
                ],
            ));
        }

        if let Some(certificate) = &spec.proxy_certificate {
            secrets.push(self.secret_data(
                "proxy-certificate",
                builder::SECRET,
                vec![("HUB_PROXY_CERT_FILE", certificate.to_owned())],
            ));
        }

        if let Some(ca) = &spec.auth_custom_ca {
            secrets.push(self.secret_data(
                "auth-custom-ca",
                builder::SECRET,
                vec![("AUTH_CUSTOM_CA", ca.to_owned())],
            ));
        }

        secrets
    }

    fn postgres(&self) -> Deployment {
        let secret = self.name("db-creds");
        let mut workload = Workload::new(
            builder::POSTGRES,
            self.image_or(POSTGRES_IMAGE),
            self.flavor.postgres_memory,
        );

        workload.cpu = Some(self.flavor.postgres_cpu);
        workload.ports = vec![POSTGRES_PORT];
        workload.env = vec![
            value("POSTGRESQL_USER", "blackduck"),
            value("POSTGRESQL_DATABASE", "blackduck"),
            value("POSTGRESQL_MAX_CONNECTIONS", 300),
            value("POSTGRESQL_SHARED_BUFFERS", "1024MB"),
            secret_key("POSTGRESQL_PASSWORD", &secret, ADMIN_PASSWORD_KEY),
            secret_key("POSTGRESQL_ADMIN_PASSWORD", &secret, POSTGRES_PASSWORD_KEY),
        ];
        workload.mounts = vec![self.claim("postgres-persistent-vol", "postgres", "/var/lib/pgsql/data")];
        workload.probe = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "pg_isready -h localhost -U postgres".to_string(),
        ]);

        self.deployment(workload)
    }

    /// returns the override of an image given by its full reference
    fn image_or(&self, reference: &str) -> String {
        let image = repository(reference);
        self.instance
            .spec
            .image_registries
            .iter()
            .find(|candidate| repository(candidate) == image)
            .cloned()
            .unwrap_or_else(|| reference.to_string())
    }

    fn with_proxy_certificate(&self, workload: &mut Workload) {
        if self.instance.spec.proxy_certificate.is_some() {
            workload.mounts.push(self.secret(
                "blackduck-proxy-certificate",
                "proxy-certificate",
                "/tmp/secrets/proxy",
            ));
        }
    }

    fn with_database_secret(&self, workload: &mut Workload) {
        workload.database = true;
        workload
            .mounts
            .push(self.secret("db-passwords", "db-creds", SECRETS_DIR));
    }

    fn workloads(&self) -> Vec<Deployment> {
        let flavor = self.flavor;
        let mut workloads = vec![];

        let mut cfssl = Workload::new(builder::CFSSL, self.image("blackduck-cfssl"), flavor::CFSSL_MEMORY);
        cfssl.ports = vec![8888];
        cfssl.mounts = vec![self.claim("dir-cfssl", "cfssl", "/etc/cfssl")];
        cfssl.probe = Some(healthcheck(&["http://localhost:8888/api/v1/cfssl/scaninfo"]));
        workloads.push(cfssl);

        let mut logstash = Workload::new(builder::LOGSTASH, self.image("blackduck-logstash"), flavor::LOGSTASH_MEMORY);
        logstash.ports = vec![5044];
        logstash.mounts = vec![self.claim("dir-logstash", "logstash", "/var/lib/logstash/data")];
        logstash.probe = Some(healthcheck(&["http://localhost:9600/"]));
        workloads.push(logstash);

        let mut registration = Workload::new(
            builder::REGISTRATION,
            self.image("blackduck-registration"),
            flavor::REGISTRATION_MEMORY,
        );
        registration.ports = vec![8443];
        registration.mounts = vec![self.claim(
            "dir-registration",
            "registration",
            "/opt/blackduck/hub/hub-registration/config",
        )];
        registration.probe = Some(healthcheck(&[
            "https://localhost:8443/registration/health-checks/liveness",
            "/opt/blackduck/hub/hub-registration/security/root.crt",
        ]));
        self.with_proxy_certificate(&mut registration);
        workloads.push(registration);

        let mut zookeeper = Workload::new(builder::ZOOKEEPER, self.image("blackduck-zookeeper"), flavor::ZOOKEEPER_MEMORY);
        zookeeper.ports = vec![2181];
        zookeeper.mounts = vec![
            self.claim("dir-zookeeper-data", "zookeeper-data", "/opt/blackduck/zookeeper/data"),
            self.claim("dir-zookeeper-datalog", "zookeeper-datalog", "/opt/blackduck/zookeeper/datalog"),
        ];
        zookeeper.probe = Some(vec![
            "zkServer.sh".to_string(),
            "status".to_string(),
            "/opt/blackduck/zookeeper/conf/zoo.cfg".to_string(),
        ]);
        workloads.push(zookeeper);

        let mut authentication = Workload::new(
            builder::AUTHENTICATION,
            self.image("blackduck-authentication"),
            flavor::AUTHENTICATION_MEMORY,
        );
        authentication.ports = vec![8443];
        authentication.env = vec![value("HUB_MAX_MEMORY", flavor::AUTHENTICATION_HEAP)];
        authentication.mounts = vec![self.claim(
            "dir-authentication",
            "authentication",
            "/opt/blackduck/hub/hub-authentication/security",
        )];
        authentication.probe = Some(healthcheck(&[
            "https://127.0.0.1:8443/api/health-checks/liveness",
            "/opt/blackduck/hub/hub-authentication/security/root.crt",
        ]));
        self.with_database_secret(&mut authentication);
        if self.instance.spec.auth_custom_ca.is_some() {
            authentication.mounts.push(self.secret(
                "blackduck-auth-custom-ca",
                "auth-custom-ca",
                "/tmp/secrets/auth",
            ));
        }
        workloads.push(authentication);

        let mut webapp = Workload::new(builder::WEBAPP, self.image("blackduck-webapp"), flavor.webapp_memory);
        webapp.cpu = Some(flavor.webapp_cpu);
        webapp.ports = vec![8443];
        webapp.env = vec![value("HUB_MAX_MEMORY", flavor.webapp_heap)];
        webapp.mounts = vec![
            self.claim("dir-webapp", "webapp", "/opt/blackduck/hub/hub-webapp/security"),
            self.empty("dir-webapp-logs", "/opt/blackduck/hub/logs"),
        ];
        webapp.probe = Some(healthcheck(&[
            "https://127.0.0.1:8443/api/health-checks/liveness",
            "/opt/blackduck/hub/hub-webapp/security/root.crt",
        ]));
        self.with_database_secret(&mut webapp);
        self.with_proxy_certificate(&mut webapp);
        workloads.push(webapp);

        let mut scan = Workload::new(builder::SCAN, self.image("blackduck-scan"), flavor.scan_memory);
        scan.replicas = flavor.scan_replicas;
        scan.ports = vec![8443];
        scan.env = vec![value("HUB_MAX_MEMORY", flavor.scan_heap)];
        scan.mounts = vec![self.empty("dir-scan", "/opt/blackduck/hub/hub-scan/security")];
        scan.probe = Some(healthcheck(&[
            "https://127.0.0.1:8443/api/health-checks/liveness",
            "/opt/blackduck/hub/hub-scan/security/root.crt",
        ]));
        self.with_database_secret(&mut scan);
        self.with_proxy_certificate(&mut scan);
        workloads.push(scan);

        let mut jobrunner = Workload::new(builder::JOBRUNNER, self.image("blackduck-jobrunner"), flavor.jobrunner_memory);
        jobrunner.replicas = flavor.jobrunner_replicas;
        jobrunner.ports = vec![3001];
        jobrunner.env = vec![value("HUB_MAX_MEMORY", flavor.jobrunner_heap)];
        jobrunner.mounts = vec![self.empty("dir-jobrunner", "/opt/blackduck/hub/jobrunner/security")];
        self.with_database_secret(&mut jobrunner);
        self.with_proxy_certificate(&mut jobrunner);
        workloads.push(jobrunner);

        let mut solr = Workload::new(builder::SOLR, self.image("blackduck-solr"), flavor.solr_memory);
        solr.ports = vec![8983];
        solr.mounts = vec![self.claim("dir-solr", "solr", "/opt/blackduck/hub/solr/cores.data")];
        solr.probe = Some(healthcheck(&["http://localhost:8983/solr/project/admin/ping?wt=json"]));
        workloads.push(solr);

        let mut documentation = Workload::new(
            builder::DOCUMENTATION,
            self.image("blackduck-documentation"),
            flavor::DOCUMENTATION_MEMORY,
        );
        documentation.ports = vec![8443];
        documentation.probe = Some(healthcheck(&["https://127.0.0.1:8443/hubdoc/health-checks/liveness"]));
        workloads.push(documentation);

        let mut webserver = Workload::new(builder::WEBSERVER, self.image("blackduck-nginx"), flavor.webserver_memory);
        webserver.ports = vec![8443];
        webserver.mounts = vec![self.empty("dir-webserver", "/opt/blackduck/hub/webserver/security")];
        webserver.probe = Some(healthcheck(&[
            "https://localhost:8443/health-checks/liveness",
            "/opt/blackduck/hub/webserver/security/root.crt",
        ]));
        if self.instance.spec.certificate.is_some() && self.instance.spec.certificate_key.is_some() {
            webserver.mounts.push(self.secret(
                "certificate",
                "webserver-certificate",
                SECRETS_DIR,
            ));
        }
        workloads.push(webserver);

        if self.instance.binary_analysis() {
            let mut scanner = Workload::new(
                builder::BINARY_SCANNER,
                self.image("bdba-worker"),
                flavor::BINARY_SCANNER_MEMORY,
            );
            scanner.cpu = Some("1");
            scanner.ports = vec![3001];
            workloads.push(scanner);

            let mut rabbitmq = Workload::new(builder::RABBITMQ, self.image("rabbitmq"), flavor::RABBITMQ_MEMORY);
            rabbitmq.ports = vec![5671];
            rabbitmq.mounts = vec![self.claim("dir-rabbitmq", "rabbitmq", "/var/lib/rabbitmq")];
            workloads.push(rabbitmq);

            let mut cache = Workload::new(
                builder::UPLOAD_CACHE,
                self.image("blackduck-upload-cache"),
                flavor::UPLOAD_CACHE_MEMORY,
            );
            cache.ports = vec![9443, 9444];
            cache.mounts = vec![
                self.claim(
                    "dir-uploadcache-data",
                    "uploadcache-data",
                    "/opt/blackduck/hub/blackduck-upload-cache/uploads",
                ),
                self.claim(
                    "dir-uploadcache-key",
                    "uploadcache-key",
                    "/opt/blackduck/hub/blackduck-upload-cache/keys",
                ),
            ];
            workloads.push(cache);
        }

        workloads.into_iter().map(|workload| self.deployment(workload)).collect()
    }

    fn services(&self, exposure: Exposure) -> Vec<Service> {
        let mut services = vec![
            self.cluster_service(builder::CFSSL, &[(8888, 8888)]),
            self.cluster_service(builder::LOGSTASH, &[(5044, 5044)]),
            self.cluster_service(builder::REGISTRATION, &[(8443, 8443)]),
            self.cluster_service(builder::ZOOKEEPER, &[(2181, 2181)]),
            self.cluster_service(builder::AUTHENTICATION, &[(8443, 8443)]),
            self.cluster_service(builder::WEBAPP, &[(8443, 8443)]),
            self.cluster_service(builder::SCAN, &[(8443, 8443)]),
            self.cluster_service(builder::SOLR, &[(8983, 8983)]),
            self.cluster_service(builder::DOCUMENTATION, &[(8443, 8443)]),
            self.cluster_service(builder::WEBSERVER, &[(WEBSERVER_PORT, 8443)]),
        ];

        if self.instance.binary_analysis() {
            services.push(self.cluster_service(builder::RABBITMQ, &[(5671, 5671)]));
            services.push(self.cluster_service(builder::UPLOAD_CACHE, &[(9443, 9443), (9444, 9444)]));
        }

        let exposed = match exposure {
            Exposure::NodePort => Some("NodePort"),
            Exposure::LoadBalancer => Some("LoadBalancer"),
            Exposure::Route | Exposure::None => None,
        };

        if let Some(type_) = exposed {
            services.push(self.service(
                self.name(builder::WEBSERVER_EXPOSED),
                builder::WEBSERVER_EXPOSED,
                builder::WEBSERVER,
                type_,
                &[(WEBSERVER_PORT, 8443)],
            ));
        }

        services
    }

    fn route(&self) -> Route {
        let name = format!("{}-{}", self.name, APP);
        let mut route = Route::new(
            &name,
            RouteSpec {
                to: RouteTargetReference {
                    kind: "Service".to_string(),
                    name: self.name(builder::WEBSERVER),
                    weight: None,
                },
                port: Some(RoutePort {
                    target_port: format!("port-{}", WEBSERVER_PORT),
                }),
                tls: Some(TlsConfig {
                    termination: "passthrough".to_string(),
                    insecure_edge_termination_policy: Some("None".to_string()),
                }),
                ..Default::default()
            },
        );

        route.metadata = self.metadata(&name, builder::ROUTE);
        route
    }
}

// -----------------------------------------------------------------------------
// Release implementation

impl ComponentBuilder for Release {
    fn version(&self) -> &'static str {
        self.version
    }

    fn claims(&self, instance: &Blackduck) -> Vec<PersistentVolumeClaim> {
        claims(instance)
    }

    fn components(&self, instance: &Blackduck, inputs: &Inputs<'_>) -> Result<ComponentList, Error> {
        let flavor = Flavor::parse(&instance.spec.size)?;
        let exposure = instance.exposure()?;
        let ctx = Context {
            instance,
            release: self,
            flavor,
            inputs,
            claims: claims(instance),
            name: instance.name_any(),
            namespace: instance.target_namespace(),
        };

        let (account, binding) = ctx.service_account();
        let mut deployments = ctx.workloads();
        let mut services = ctx.services(exposure);
        if !ctx.external_database() {
            deployments.push(ctx.postgres());
            services.push(ctx.cluster_service(builder::POSTGRES, &[(POSTGRES_PORT, POSTGRES_PORT)]));
        }

        Ok(ComponentList {
            service_accounts: vec![account],
            role_bindings: vec![binding],
            config_maps: ctx.config_maps(),
            secrets: ctx.secrets(),
            persistent_volume_claims: ctx.claims.to_owned(),
            services,
            stateful_sets: vec![],
            deployments,
            routes: match exposure {
                Exposure::Route => vec![ctx.route()],
                _ => vec![],
            },
        })
    }
}
