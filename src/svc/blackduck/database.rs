//! # Database module
//!
//! This module provide the bootstrap of the database of an instance. It
//! resolves the credentials, waits for the database to accept connections,
//! then either keeps an existing application database, initializes a new one
//! or clones the database of another instance through a one-shot job.

use std::{fmt, time::Duration};

use base64::{engine::general_purpose::URL_SAFE, Engine};
use k8s_openapi::api::{
    batch::v1::{Job, JobSpec},
    core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, Secret},
};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::svc::{
    blackduck::builder::{
        self,
        components::{ADMIN_PASSWORD_KEY, POSTGRES_PORT},
        release::POSTGRES_IMAGE,
    },
    crd::blackduck::{Blackduck, APP},
    k8s::{
        cluster::{self, Cluster},
        readiness::{self, Poller},
        resource,
        selector::{Selector, COMPONENT},
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const DATABASE: &str = "bds_hub";
pub const ADMIN_PASSWORD: &str = "ADMIN_PASSWORD";
pub const USER_PASSWORD: &str = "USER_PASSWORD";
pub const POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";
pub const CLONE_COMPONENT: &str = "clone-job";

const SYSTEM_SETTINGS: &[(&str, &str)] = &[
    ("autovacuum", "on"),
    ("autovacuum_max_workers", "20"),
    ("autovacuum_vacuum_cost_limit", "2000"),
    ("autovacuum_vacuum_cost_delay", "10ms"),
    ("checkpoint_completion_target", "0.8"),
    ("max_wal_size", "8GB"),
    ("checkpoint_timeout", "30min"),
    ("constraint_exclusion", "partition"),
    ("default_statistics_target", "100"),
    ("effective_cache_size", "256MB"),
    ("escape_string_warning", "off"),
    ("log_destination", "stderr"),
    ("log_directory", "pg_log"),
    ("log_filename", "postgresql_%a.log"),
    ("log_line_prefix", "%m %p "),
    ("log_rotation_age", "1440"),
    ("log_truncate_on_rotation", "on"),
    ("logging_collector", "on"),
    ("maintenance_work_mem", "32MB"),
    ("max_connections", "300"),
    ("max_locks_per_transaction", "256"),
    ("random_page_cost", "4.0"),
    ("shared_buffers", "1024MB"),
    ("standard_conforming_strings", "off"),
    ("temp_buffers", "16MB"),
    ("work_mem", "32MB"),
];

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not find secret '{0}/{1}' after {2} attempt(s)")]
    SecretNotFound(String, String, u32),
    #[error("key '{0}' is missing from secret '{1}/{2}'")]
    MissingKey(String, String, String),
    #[error("failed to decode '{0}' as base64, {1}")]
    Decode(String, base64::DecodeError),
    #[error("value of '{0}' is not valid utf-8, {1}")]
    Utf8(String, std::string::FromUtf8Error),
    #[error("{0}")]
    Cluster(cluster::Error),
    #[error("{0}")]
    Readiness(readiness::Error),
    #[error("could not find a running database pod in namespace '{0}'")]
    NoPod(String),
    #[error("the clone operation timed out")]
    CloneTimeout,
}

impl From<cluster::Error> for Error {
    fn from(err: cluster::Error) -> Self {
        Self::Cluster(err)
    }
}

impl From<readiness::Error> for Error {
    fn from(err: readiness::Error) -> Self {
        Self::Readiness(err)
    }
}

// -----------------------------------------------------------------------------
// Credentials structure

/// passwords of the database roles
#[derive(PartialEq, Eq, Clone, Default)]
pub struct Credentials {
    pub postgres: String,
    pub admin: String,
    pub user: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("postgres", &"<redacted>")
            .field("admin", &"<redacted>")
            .field("user", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(postgres: &str, admin: &str, user: &str) -> Self {
        Self {
            postgres: postgres.to_string(),
            admin: admin.to_string(),
            user: user.to_string(),
        }
    }
}

fn decode(field: &str, value: &str) -> Result<String, Error> {
    let bytes = URL_SAFE
        .decode(value.trim())
        .map_err(|err| Error::Decode(field.to_string(), err))?;

    String::from_utf8(bytes).map_err(|err| Error::Utf8(field.to_string(), err))
}

/// returns the value of the key, either from data or string data
fn secret_value(secret: &Secret, key: &str) -> Option<Result<String, Error>> {
    if let Some(value) = secret.data.as_ref().and_then(|data| data.get(key)) {
        return Some(
            String::from_utf8(value.0.to_owned()).map_err(|err| Error::Utf8(key.to_string(), err)),
        );
    }

    secret
        .string_data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| Ok(value.to_owned()))
}

fn required(secret: &Secret, key: &str) -> Result<String, Error> {
    secret_value(secret, key).unwrap_or_else(|| {
        Err(Error::MissingKey(
            key.to_string(),
            secret.namespace().unwrap_or_default(),
            secret.name_any(),
        ))
    })
}

/// resolve the credentials of the instance. Passwords declared on the custom
/// resource are base64 encoded, missing ones are read from the operator
/// secret which may not exist yet on first install
#[cfg_attr(feature = "trace", tracing::instrument(skip(cluster, poller, instance)))]
pub async fn credentials<C>(
    cluster: &C,
    poller: &Poller,
    instance: &Blackduck,
    namespace: &str,
    secret: &str,
    attempts: u32,
) -> Result<Credentials, Error>
where
    C: Cluster,
{
    let spec = &instance.spec;
    if let Some(external) = &spec.external_postgres {
        let admin = match &external.admin_password {
            Some(password) => decode("postgresAdminPassword", password)?,
            None => String::new(),
        };
        let user = match &external.user_password {
            Some(password) => decode("postgresUserPassword", password)?,
            None => String::new(),
        };

        return Ok(Credentials {
            postgres: String::new(),
            admin,
            user,
        });
    }

    let declared = |field: &str, value: &Option<String>| -> Result<Option<String>, Error> {
        value
            .as_deref()
            .filter(|value| !value.is_empty())
            .map(|value| decode(field, value))
            .transpose()
    };

    let postgres = declared("postgresPassword", &spec.postgres_password)?;
    let admin = declared("adminPassword", &spec.admin_password)?;
    let user = declared("userPassword", &spec.user_password)?;

    if let (Some(postgres), Some(admin), Some(user)) = (&postgres, &admin, &user) {
        return Ok(Credentials::new(postgres, admin, user));
    }

    let found = poller
        .attempts(attempts, move || async move {
            let found: Option<Secret> = cluster.get(namespace, secret).await?;
            if found.is_none() {
                info!(
                    namespace = namespace,
                    name = secret,
                    "Wait for the operator secret to be available"
                );
            }

            Ok(found)
        })
        .await?
        .ok_or_else(|| Error::SecretNotFound(namespace.into(), secret.into(), attempts))?;

    Ok(Credentials {
        postgres: match postgres {
            Some(password) => password,
            None => required(&found, POSTGRES_PASSWORD)?,
        },
        admin: match admin {
            Some(password) => password,
            None => required(&found, ADMIN_PASSWORD)?,
        },
        user: match user {
            Some(password) => password,
            None => required(&found, USER_PASSWORD)?,
        },
    })
}

/// escape a value to be embedded in a single quoted sql literal
fn literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// returns the statements initializing a new database, grouped by the
/// database they are executed on
pub fn initialization(credentials: &Credentials) -> Vec<(&'static str, Vec<String>)> {
    vec![
        (
            "postgres",
            vec![
                format!("ALTER USER blackduck WITH password '{}';", literal(&credentials.admin)),
                "GRANT blackduck TO postgres;".to_string(),
                "CREATE DATABASE bds_hub owner blackduck TEMPLATE template0 ENCODING SQL_ASCII;".to_string(),
                "CREATE DATABASE bds_hub_report owner blackduck TEMPLATE template0 ENCODING SQL_ASCII;".to_string(),
                "CREATE DATABASE bdio owner blackduck TEMPLATE template0 ENCODING SQL_ASCII;".to_string(),
                "ALTER USER blackduck WITH NOCREATEDB SUPERUSER NOREPLICATION BYPASSRLS;".to_string(),
                "CREATE USER blackduck_user WITH NOCREATEDB NOSUPERUSER NOREPLICATION NOBYPASSRLS;".to_string(),
                format!("ALTER USER blackduck_user WITH password '{}';", literal(&credentials.user)),
                "CREATE USER blackduck_reporter;".to_string(),
                "CREATE USER blackduck_replication REPLICATION CONNECTION LIMIT 5;".to_string(),
            ],
        ),
        (
            "bds_hub",
            vec![
                "CREATE EXTENSION pgcrypto;".to_string(),
                "CREATE SCHEMA st AUTHORIZATION blackduck;".to_string(),
                "GRANT USAGE ON SCHEMA st TO blackduck_user;".to_string(),
                "GRANT SELECT, INSERT, UPDATE, TRUNCATE, DELETE, REFERENCES ON ALL TABLES IN SCHEMA st TO blackduck_user;".to_string(),
                "GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA st to blackduck_user;".to_string(),
                "ALTER DEFAULT PRIVILEGES IN SCHEMA st GRANT SELECT, INSERT, UPDATE, TRUNCATE, DELETE, REFERENCES ON TABLES TO blackduck_user;".to_string(),
                "ALTER DEFAULT PRIVILEGES IN SCHEMA st GRANT ALL PRIVILEGES ON SEQUENCES TO blackduck_user;".to_string(),
                "ALTER DATABASE bds_hub SET standard_conforming_strings TO OFF;".to_string(),
            ],
        ),
        (
            "bds_hub_report",
            vec![
                "GRANT SELECT ON ALL TABLES IN SCHEMA public TO blackduck_reporter;".to_string(),
                "ALTER DEFAULT PRIVILEGES FOR ROLE blackduck IN SCHEMA public GRANT SELECT ON TABLES TO blackduck_reporter;".to_string(),
                "GRANT SELECT, INSERT, UPDATE, TRUNCATE, DELETE, REFERENCES ON ALL TABLES IN SCHEMA public TO blackduck_user;".to_string(),
                "GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA public to blackduck_user;".to_string(),
                "ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT SELECT, INSERT, UPDATE, TRUNCATE, DELETE, REFERENCES ON TABLES TO blackduck_user;".to_string(),
                "ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL PRIVILEGES ON SEQUENCES TO blackduck_user;".to_string(),
                "ALTER DATABASE bds_hub_report SET standard_conforming_strings TO OFF;".to_string(),
            ],
        ),
        (
            "bdio",
            vec![
                "GRANT ALL PRIVILEGES ON DATABASE bdio TO blackduck_user;".to_string(),
                "ALTER DATABASE bdio SET standard_conforming_strings TO ON;".to_string(),
            ],
        ),
        (
            "postgres",
            SYSTEM_SETTINGS
                .iter()
                .map(|(key, value)| format!("ALTER SYSTEM SET {} TO '{}';", key, value))
                .collect(),
        ),
    ]
}

/// returns the psql command running the statements on the database
pub fn psql(database: &str, statements: &[String]) -> Vec<String> {
    let mut command = vec![
        "psql".to_string(),
        "-U".to_string(),
        "postgres".to_string(),
        "-d".to_string(),
        database.to_string(),
        "-t".to_string(),
        "-A".to_string(),
    ];

    for statement in statements {
        command.push("-c".to_string());
        command.push(statement.to_owned());
    }

    command
}

// -----------------------------------------------------------------------------
// Outcome enumeration

#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Outcome {
    /// the application database already exists
    Existing,
    Initialized,
    /// the database has been cloned from the instance
    Cloned(String),
}

// -----------------------------------------------------------------------------
// Source structure

/// instance whose database is cloned
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Source {
    pub namespace: String,
    pub name: String,
}

impl Source {
    /// resolve the instance by name across namespaces, an unknown instance is
    /// expected to live in the namespace named after it
    pub async fn resolve<C>(cluster: &C, name: &str) -> Result<Self, Error>
    where
        C: Cluster,
    {
        let instances: Vec<Blackduck> = cluster.list_all(&Selector::default()).await?;
        let namespace = instances
            .iter()
            .find(|instance| instance.name_any() == name)
            .map(Blackduck::target_namespace)
            .unwrap_or_else(|| name.to_string());

        Ok(Self {
            namespace,
            name: name.to_string(),
        })
    }
}

// -----------------------------------------------------------------------------
// Database structure

/// database of an instance, reached through the running database pod
pub struct Database<'a, C> {
    cluster: &'a C,
    poller: &'a Poller,
    namespace: String,
    name: String,
    ready_timeout: Duration,
    clone_timeout: Duration,
}

impl<'a, C> Database<'a, C>
where
    C: Cluster,
{
    pub fn new(cluster: &'a C, poller: &'a Poller, namespace: &str, name: &str) -> Self {
        Self {
            cluster,
            poller,
            namespace: namespace.to_string(),
            name: name.to_string(),
            ready_timeout: Duration::from_secs(600),
            clone_timeout: Duration::from_secs(30 * 60),
        }
    }

    pub fn timeouts(mut self, ready: Duration, clone: Duration) -> Self {
        self.ready_timeout = ready;
        self.clone_timeout = clone;
        self
    }

    fn selector(&self) -> Selector {
        Selector::instance(APP, &self.name).equals(COMPONENT, builder::POSTGRES)
    }

    pub fn service(&self) -> String {
        builder::name(&self.name, builder::POSTGRES)
    }

    /// run the statements on the database in the running database pod
    pub async fn execute(&self, database: &str, statements: &[String]) -> Result<String, Error> {
        let pod = readiness::running_pod(self.cluster, &self.namespace, &self.selector())
            .await?
            .ok_or_else(|| Error::NoPod(self.namespace.to_owned()))?;

        Ok(self
            .cluster
            .exec(
                &self.namespace,
                &pod.name_any(),
                Some(builder::POSTGRES),
                psql(database, statements),
            )
            .await?)
    }

    /// wait for the service endpoint, the pods and a first successful query
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self), fields(namespace = %self.namespace, name = %self.name)))]
    pub async fn wait(&self) -> Result<(), Error> {
        let service = self.service();
        readiness::wait_for_service_endpoint(
            self.cluster,
            self.poller,
            &self.namespace,
            &service,
            self.ready_timeout,
        )
        .await?;

        readiness::wait_for_pods_running(
            self.cluster,
            self.poller,
            &self.namespace,
            &self.selector(),
            self.ready_timeout,
        )
        .await?;

        let statements = vec!["SELECT 1;".to_string()];
        let statements = &statements;
        let ready = self
            .poller
            .within(self.ready_timeout, move || async move {
                match self.execute("postgres", statements).await {
                    Ok(output) if output.lines().any(|line| line.trim() == "1") => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(Error::Readiness(err)) => Err(err),
                    Err(err) => {
                        debug!(
                            namespace = &self.namespace,
                            error = err.to_string(),
                            "Database is not ready yet"
                        );
                        Ok(None)
                    }
                }
            })
            .await?;

        ready.ok_or_else(|| {
            Error::Readiness(readiness::Error::Timeout(
                format!("database '{}'", service),
                self.namespace.to_owned(),
                self.ready_timeout,
            ))
        })
    }

    /// returns if the application database exists
    pub async fn exists(&self) -> Result<bool, Error> {
        let output = self
            .execute(
                "postgres",
                &[format!(
                    "SELECT datname FROM pg_catalog.pg_database WHERE datname='{}';",
                    DATABASE
                )],
            )
            .await?;

        Ok(output.lines().any(|line| line.trim() == DATABASE))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, credentials), fields(namespace = %self.namespace, name = %self.name)))]
    pub async fn initialize(&self, credentials: &Credentials) -> Result<(), Error> {
        for (database, statements) in initialization(credentials) {
            let output = self.execute(database, &statements).await?;
            if output.contains("ERROR") {
                warn!(
                    namespace = &self.namespace,
                    database = database,
                    "Database initialization reported errors, {}",
                    output.trim()
                );
            }
        }

        Ok(())
    }

    /// returns the job dumping the database of the source into the database
    /// of the instance
    pub fn clone_job(&self, source: &Source, password: &str) -> Job {
        let name = builder::name(&self.name, CLONE_COMPONENT);
        let command = format!(
            "pg_dumpall -h {}.{}.svc.cluster.local -p {} -U postgres | psql -h {}.{}.svc.cluster.local -p {} -U postgres",
            builder::name(&source.name, builder::POSTGRES),
            source.namespace,
            POSTGRES_PORT,
            self.service(),
            self.namespace,
            POSTGRES_PORT,
        );

        Job {
            metadata: resource::metadata(
                &self.namespace,
                &name,
                resource::labels(APP, &self.name, CLONE_COMPONENT),
            ),
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "clone".to_string(),
                            image: Some(POSTGRES_IMAGE.to_string()),
                            command: Some(vec!["/bin/bash".to_string(), "-c".to_string(), command]),
                            env: Some(vec![EnvVar {
                                name: "PGPASSWORD".to_string(),
                                value: Some(password.to_string()),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        restart_policy: Some("Never".to_string()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    /// clone the database of the source instance, the job is left in place
    /// once completed
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self), fields(namespace = %self.namespace, name = %self.name)))]
    pub async fn clone_from(&self, source: &Source) -> Result<(), Error> {
        let secret_name = builder::name(&source.name, "db-creds");
        let secret: Secret = self
            .cluster
            .get(&source.namespace, &secret_name)
            .await?
            .ok_or_else(|| Error::SecretNotFound(source.namespace.to_owned(), secret_name, 1))?;
        let password = required(&secret, ADMIN_PASSWORD_KEY)?;

        let job = self.clone_job(source, &password);
        let name = job.name_any();
        match self.cluster.create(&self.namespace, &job).await {
            Ok(_) => {}
            Err(cluster::Error::Kube(kube::Error::Api(res))) if res.code == 409 => {
                info!(namespace = &self.namespace, name = &name, "Clone job already exists, wait for it");
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            namespace = &self.namespace,
            name = &name,
            from = format!("{}/{}", source.namespace, source.name),
            "Wait for the clone job to complete"
        );

        match readiness::wait_for_job(
            self.cluster,
            self.poller,
            &self.namespace,
            &name,
            self.clone_timeout,
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(readiness::Error::Timeout(_, _, _)) => Err(Error::CloneTimeout),
            Err(err) => Err(err.into()),
        }
    }

    /// wait for the database, then keep, initialize or clone it
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, credentials), fields(namespace = %self.namespace, name = %self.name)))]
    pub async fn bootstrap(
        &self,
        credentials: &Credentials,
        prototype: Option<&str>,
    ) -> Result<Outcome, Error> {
        self.wait().await?;

        if self.exists().await? {
            debug!(namespace = &self.namespace, name = &self.name, "Database already exists");
            return Ok(Outcome::Existing);
        }

        match prototype {
            Some(prototype) => {
                let source = Source::resolve(self.cluster, prototype).await?;
                self.clone_from(&source).await?;
                Ok(Outcome::Cloned(source.name))
            }
            None => {
                self.initialize(credentials).await?;
                Ok(Outcome::Initialized)
            }
        }
    }
}
