//! # Metrics module
//!
//! This module provide the encoding of the measurements gathered by the
//! default prometheus registry

use hyper::{
    header::{self, HeaderValue, InvalidHeaderValue},
    Body, Response, StatusCode,
};
use prometheus::{gather, Encoder, TextEncoder};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize metrics, {0}")]
    Encode(prometheus::Error),
    #[error("failed to parse header value given by prometheus, {0}")]
    InvalidHeader(InvalidHeaderValue),
}

// -----------------------------------------------------------------------------
// Helper methods

/// returns the content type and the text encoding of every registered metric
pub fn encode() -> Result<(String, Vec<u8>), Error> {
    let encoder = TextEncoder::new();
    let mut buf = vec![];

    encoder.encode(&gather(), &mut buf).map_err(Error::Encode)?;
    Ok((encoder.format_type().to_string(), buf))
}

pub fn handler() -> Result<Response<Body>, Error> {
    let (content_type, buf) = encode()?;
    let mut res = Response::new(Body::from(buf));

    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type).map_err(Error::InvalidHeader)?,
    );
    *res.status_mut() = StatusCode::OK;

    Ok(res)
}
