//! # Telemetry module
//!
//! This module provide the http server exposing the health and, with the
//! `metrics` feature, the prometheus measurements of the operator. The server
//! stops with the daemon through the cancellation token.

use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, time::Instant};

use hyper::{
    header::{self, HeaderValue},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
pub mod metrics;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_success",
            "number of successful request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'kubernetes_operator_server_request_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static SERVER_REQUEST_FAILURE: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_failure",
            "number of failed request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'kubernetes_operator_server_request_failure' to not be already registered")
});

#[cfg(feature = "metrics")]
static SERVER_REQUEST_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_duration",
            "duration of request handled by the server",
        ),
        &["method", "path", "status", "unit"]
    )
    .expect("metrics 'kubernetes_operator_server_request_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("{0}")]
    Metrics(metrics::Error),
    #[error("failed to serialize payload, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to serve on '{0}', {1}")]
    Serve(SocketAddr, hyper::Error),
}

// -----------------------------------------------------------------------------
// Server

/// listen on the address until the token is cancelled
#[cfg_attr(feature = "trace", tracing::instrument(skip(token)))]
pub async fn serve(addr: SocketAddr, token: CancellationToken) -> Result<(), Error> {
    let service = make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(router)) });
    let server = Server::try_bind(&addr)
        .map_err(|err| Error::Serve(addr, err))?
        .serve(service);

    info!(addr = addr.to_string(), "Begin to listen on address");
    server
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|err| Error::Serve(addr, err))?;

    info!(addr = addr.to_string(), "Stop to listen on address");
    Ok(())
}

fn observe(req: &Request<Body>, status: StatusCode, duration: u128) {
    let host = match req.uri().host() {
        Some(host) => host.to_string(),
        None => req
            .headers()
            .get(header::HOST)
            .map(|header| String::from_utf8_lossy(header.as_bytes()).to_string())
            .unwrap_or_else(|| String::from("<none>")),
    };

    debug!(
        method = req.method().as_str(),
        host = host,
        path = req.uri().path(),
        status = status.as_u16(),
        duration = duration,
        "Receive request"
    );

    #[cfg(feature = "metrics")]
    {
        let code = status.as_u16().to_string();
        let labels = [req.method().as_str(), req.uri().path(), code.as_str()];
        if status.is_server_error() {
            SERVER_REQUEST_FAILURE.with_label_values(&labels).inc();
        } else {
            SERVER_REQUEST_SUCCESS.with_label_values(&labels).inc();
        }

        SERVER_REQUEST_DURATION
            .with_label_values(&[labels[0], labels[1], labels[2], "us"])
            .inc_by(duration as f64);
    }
}

#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn router(req: Request<Body>) -> Result<Response<Body>, Error> {
    let begin = Instant::now();

    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => Ok(healthz()),
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics::handler().map_err(Error::Metrics),
        _ => Ok(not_found()),
    };

    let res = match result {
        Ok(res) => res,
        Err(err) => {
            warn!(path = req.uri().path(), error = err.to_string(), "Could not handle request");

            let map = BTreeMap::from([("error".to_string(), err.to_string())]);
            let mut res = Response::new(Body::from(
                serde_json::to_string_pretty(&map).map_err(Error::Serialize)?,
            ));

            res.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            res
        }
    };

    observe(&req, res.status(), Instant::now().duration_since(begin).as_micros());
    Ok(res)
}

pub fn healthz() -> Response<Body> {
    let mut res = Response::default();
    *res.status_mut() = StatusCode::NO_CONTENT;
    res
}

pub fn not_found() -> Response<Body> {
    let mut res = Response::default();
    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}
