//! # Selector module
//!
//! This module provide a label selector which is both used to scope list
//! requests against the kubernetes api and to partition a desired component
//! set in memory. It understands the equality based (`=`) and the set based
//! (`in`, `notin`) requirements. Values are compared with the case, as the
//! kubernetes api does.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
};

// -----------------------------------------------------------------------------
// Constants

pub const APP: &str = "app";
pub const NAME: &str = "name";
pub const COMPONENT: &str = "component";

// -----------------------------------------------------------------------------
// Requirement enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Requirement {
    Equals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
}

impl Requirement {
    /// returns if the given labels satisfy the requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::In(key, values) => labels.get(key).map(|v| values.contains(v)).unwrap_or(false),
            Self::NotIn(key, values) => labels.get(key).map(|v| !values.contains(v)).unwrap_or(true),
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");

        match self {
            Self::Equals(key, value) => write!(f, "{}={}", key, value),
            Self::In(key, values) => write!(f, "{} in ({})", key, join(values)),
            Self::NotIn(key, values) => write!(f, "{} notin ({})", key, join(values)),
        }
    }
}

// -----------------------------------------------------------------------------
// Selector structure

/// a conjunction of [`Requirement`], an empty selector matches everything
#[derive(PartialEq, Eq, Hash, Clone, Debug, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// returns the ownership scope of an instance, `app=<app>,name=<name>`
    pub fn instance(app: &str, name: &str) -> Self {
        Self::default().equals(APP, app).equals(NAME, name)
    }

    pub fn equals(mut self, key: &str, value: &str) -> Self {
        self.requirements
            .push(Requirement::Equals(key.to_string(), value.to_string()));
        self
    }

    pub fn within(mut self, key: &str, values: &[&str]) -> Self {
        self.requirements.push(Requirement::In(
            key.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    pub fn without(mut self, key: &str, values: &[&str]) -> Self {
        self.requirements.push(Requirement::NotIn(
            key.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    /// returns if all requirements are satisfied by the given labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(labels))
    }

    /// returns if the selector explicitly restricts the given key to the
    /// given value and only this one
    pub fn pins(&self, key: &str, value: &str) -> bool {
        self.requirements.iter().any(|req| match req {
            Requirement::Equals(k, v) => k == key && v == value,
            Requirement::In(k, values) => k == key && values.len() == 1 && values.contains(value),
            _ => false,
        })
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let requirements: Vec<_> = self.requirements.iter().map(ToString::to_string).collect();

        write!(f, "{}", requirements.join(","))
    }
}
