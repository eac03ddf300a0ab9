//! # Custom resource definition module
//!
//! This module provide custom resource definitions managed or consumed by the
//! operator and their structures.

pub mod blackduck;
pub mod route;
