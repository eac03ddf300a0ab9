//! # Kubernetes module
//!
//! This module provide kubernetes client, helpers to manipulate resources,
//! label selectors, the cluster seam used by the reconciler, the event
//! recorder and readiness helpers

pub mod client;
pub mod cluster;
pub mod readiness;
pub mod recorder;
pub mod resource;
pub mod selector;
