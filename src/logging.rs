//! # Logging module
//!
//! This module provides logging facilities and helpers. Events are written on
//! the standard output and, depending on enabled features and configuration,
//! forwarded to jaeger as spans and to sentry as breadcrumbs or issues.

use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt};

use crate::svc::cfg::Configuration;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
    #[cfg(feature = "trace")]
    #[error("failed to install jaeger pipeline, {0}")]
    Jaeger(opentelemetry::trace::TraceError),
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[cfg(feature = "trace")]
fn jaeger(
    config: &Configuration,
) -> Result<Option<opentelemetry::sdk::trace::Tracer>, Error> {
    let endpoint = match &config.jaeger.endpoint {
        Some(endpoint) => endpoint,
        None => return Ok(None),
    };

    let mut pipeline = opentelemetry_jaeger::new_collector_pipeline()
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_endpoint(endpoint);

    if let Some(user) = &config.jaeger.user {
        pipeline = pipeline.with_username(user);
    }

    if let Some(password) = &config.jaeger.password {
        pipeline = pipeline.with_password(password);
    }

    pipeline
        .with_reqwest()
        .install_batch(opentelemetry::runtime::Tokio)
        .map(Some)
        .map_err(Error::Jaeger)
}

pub fn initialize(config: &Configuration, verbosity: usize) -> Result<(), Error> {
    let registry = tracing_subscriber::registry()
        .with(LevelFilter::from_level(level(verbosity)))
        .with(
            fmt::layer()
                .with_thread_names(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true),
        );

    #[cfg(feature = "trace")]
    let registry = registry.with(
        jaeger(config)?.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)),
    );

    #[cfg(feature = "tracker")]
    let registry = registry.with(config.sentry.dsn.as_ref().map(|_| sentry_tracing::layer()));

    #[cfg(not(any(feature = "trace", feature = "tracker")))]
    let _ = config;

    tracing::subscriber::set_global_default(registry).map_err(Error::GlobalDefaultSubscriber)
}
