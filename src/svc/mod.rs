//! # Services module
//!
//! This module provide services to interact with kubernetes, reconcile black
//! duck instances and helpers to do so.
pub mod blackduck;
pub mod cfg;
pub mod component;
pub mod controller;
pub mod crd;
pub mod k8s;
pub mod telemetry;
