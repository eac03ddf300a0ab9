//! # Secret module
//!
//! This module provides the generation of the operator secret holding the
//! default database passwords used by instances that do not carry their own

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use k8s_openapi::{api::core::v1, ByteString};

use crate::{
    cmd::Executor,
    svc::{
        blackduck::database::{ADMIN_PASSWORD, POSTGRES_PASSWORD, USER_PASSWORD},
        cfg::Configuration,
    },
};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize secret, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// Secret enum

#[derive(Subcommand, Clone, Debug)]
pub enum Secret {
    #[clap(name = "generate", aliases = &["g"], about = "Generate the secret holding default database passwords")]
    Generate {
        #[clap(short = 'n', long = "name", help = "Name of the secret, default to the configured one")]
        name: Option<String>,
        #[clap(short = 'N', long = "namespace", help = "Namespace of the secret, default to the operator one")]
        namespace: Option<String>,
        #[clap(long = "admin-password", help = "Password of the blackduck administrator")]
        admin: String,
        #[clap(long = "user-password", help = "Password of the blackduck user")]
        user: String,
        #[clap(long = "postgres-password", help = "Password of the postgres superuser")]
        postgres: String,
    },
}

#[async_trait]
impl Executor for Secret {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, config)))]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::Generate {
                name,
                namespace,
                admin,
                user,
                postgres,
            } => {
                let secret = build(
                    &config,
                    namespace.to_owned(),
                    name.to_owned(),
                    [admin.as_str(), user.as_str(), postgres.as_str()],
                );

                println!(
                    "{}",
                    serde_yaml::to_string(&secret).map_err(Error::Serialize)?
                );
                Ok(())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// build function

/// returns the operator secret, passwords are given in the order admin, user
/// and postgres
pub fn build(
    config: &Configuration,
    namespace: Option<String>,
    name: Option<String>,
    [admin, user, postgres]: [&str; 3],
) -> v1::Secret {
    let mut secret = v1::Secret::default();

    secret.metadata.name = Some(name.unwrap_or_else(|| config.operator.secret.to_owned()));
    secret.metadata.namespace =
        Some(namespace.unwrap_or_else(|| config.operator.namespace.to_owned()));
    secret.type_ = Some("Opaque".to_string());
    secret.data = Some(BTreeMap::from([
        (ADMIN_PASSWORD.to_string(), ByteString(admin.as_bytes().to_vec())),
        (USER_PASSWORD.to_string(), ByteString(user.as_bytes().to_vec())),
        (POSTGRES_PASSWORD.to_string(), ByteString(postgres.as_bytes().to_vec())),
    ]));

    secret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::cfg::{DEFAULT_NAMESPACE, DEFAULT_SECRET};

    #[test]
    fn defaults_come_from_the_configuration() {
        let config = Configuration::try_default().unwrap();
        let secret = build(&config, None, None, ["admin", "user", "postgres"]);

        assert_eq!(secret.metadata.name.as_deref(), Some(DEFAULT_SECRET));
        assert_eq!(secret.metadata.namespace.as_deref(), Some(DEFAULT_NAMESPACE));

        let data = secret.data.unwrap();
        assert_eq!(data[ADMIN_PASSWORD].0, b"admin".to_vec());
        assert_eq!(data[USER_PASSWORD].0, b"user".to_vec());
        assert_eq!(data[POSTGRES_PASSWORD].0, b"postgres".to_vec());
    }

    #[test]
    fn name_and_namespace_can_be_overridden() {
        let config = Configuration::try_default().unwrap();
        let secret = build(
            &config,
            Some("operator".into()),
            Some("passwords".into()),
            ["a", "b", "c"],
        );

        assert_eq!(secret.metadata.name.as_deref(), Some("passwords"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("operator"));
    }
}
