//! # Command module
//!
//! This module provide command line interface structures and helpers
use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::svc::{
    blackduck::{
        federator::{self, HttpNotifier},
        registration::{self, HttpProbe},
        Reconciler,
    },
    cfg::Configuration,
    controller::{self, Dispatcher},
    crd::blackduck::Blackduck,
    k8s::{client, cluster::KubeCluster},
    telemetry,
};

pub mod crd;
pub mod secret;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("failed to execute command, {0}")]
    Secret(secret::Error),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to create registration probe, {0}")]
    Probe(registration::Error),
    #[error("failed to create federator client, {0}")]
    Federator(federator::Error),
    #[error("failed to dispatch events of custom resource, {0}")]
    Controller(controller::Error),
    #[error("failed to serve telemetry, {0}")]
    Telemetry(telemetry::Error),
    #[error("failed to wait for the task to complete, {0}")]
    Join(tokio::task::JoinError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[clap(name = "custom-resource-definition", aliases = &["crd"], subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
    /// Interact with the secret holding default database credentials
    #[clap(name = "secret", subcommand)]
    Secret(secret::Secret),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| Error::Execution("custom-resource-definition".into(), Arc::new(err))),
            Self::Secret(secret) => secret
                .execute(config)
                .await
                .map_err(Error::Secret)
                .map_err(|err| Error::Execution("secret".into(), Arc::new(err))),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(kubeconfig: Option<PathBuf>, config: Arc<Configuration>) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Step 1: create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig).await.map_err(Error::Client)?;
    let cluster = Arc::new(KubeCluster::from(kube_client.to_owned()));
    let token = CancellationToken::new();

    // -------------------------------------------------------------------------
    // Step 2: create the reconciler and its dispatcher
    let probe = HttpProbe::new(config.reconciler.probe_timeout()).map_err(Error::Probe)?;
    let notifier = match &config.federator {
        Some(federator) => Some(HttpNotifier::new(federator).map_err(Error::Federator)?),
        None => None,
    };

    let reconciler = Reconciler::new(cluster, config.to_owned(), token.to_owned(), probe, notifier);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(reconciler),
        config.operator.threadiness,
        config.operator.max_retries,
    ));

    // -------------------------------------------------------------------------
    // Step 3: spawn the dispatcher and the telemetry server, both stop once the
    // token is cancelled
    let api: Api<Blackduck> = Api::all(kube_client);
    let controller = tokio::spawn({
        let token = token.to_owned();
        async move {
            let result = dispatcher.run(api, token.to_owned()).await;
            token.cancel();
            result
        }
    });

    let server = tokio::spawn({
        let token = token.to_owned();
        let listen = config.server.listen;
        async move {
            let result = telemetry::serve(listen, token.to_owned()).await;
            if let Err(err) = &result {
                error!(error = err.to_string(), "Could not serve telemetry");
                token.cancel();
            }
            result
        }
    });

    // -------------------------------------------------------------------------
    // Step 4: wait for termination signal or for a task to stop
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(Error::SigTerm)?;
            info!("Receive termination signal, stop reconciling custom resources");
        }
        _ = token.cancelled() => {}
    }

    token.cancel();
    controller
        .await
        .map_err(Error::Join)?
        .map_err(Error::Controller)?;
    server
        .await
        .map_err(Error::Join)?
        .map_err(Error::Telemetry)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_line_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn verbosity_is_counted() {
        let args = Args::parse_from(["blackduck-operator", "-vvv", "--check"]);

        assert_eq!(args.verbosity, 3);
        assert!(args.check);
        assert!(args.command.is_none());
    }

    #[test]
    fn crd_alias_selects_the_subcommand() {
        let args = Args::parse_from(["blackduck-operator", "crd", "view", "blackduck"]);

        assert!(matches!(args.command, Some(Command::CustomResourceDefinition(_))));
    }
}
