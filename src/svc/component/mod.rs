//! # Component module
//!
//! This module provide the component set of an instance, which is the list of
//! sub-resources that should exist for it, the semantic comparison of a live
//! object against its desired form and the diff/apply engine which converges
//! a scope of the cluster to a component set.

use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount},
    rbac::v1::RoleBinding,
};
use kube::ResourceExt;

use crate::svc::{
    crd::route::Route,
    k8s::{cluster::Object, selector::Selector},
};

pub mod apply;
pub mod compare;

// -----------------------------------------------------------------------------
// Retention enumeration

/// tells the engine which live objects it is allowed to delete
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Retention {
    /// unbound claims may be deleted, bound claims only when the scope pins
    /// the pvc component
    Default,
    /// claims are never deleted
    PreserveClaims,
}

// -----------------------------------------------------------------------------
// Component trait

pub trait Component: Object {
    /// returns if the live object must be updated to match the desired one,
    /// fields defaulted or owned by the api server are ignored
    fn changed(live: &Self, desired: &Self) -> bool;

    /// returns if the engine may delete the live object which is no longer
    /// desired in the given scope
    fn deletable(_live: &Self, _scope: &Selector, _retention: Retention) -> bool {
        true
    }
}

// -----------------------------------------------------------------------------
// ComponentList structure

/// desired sub-resources of an instance, ordered by kind as they are applied
#[derive(Clone, Debug, Default)]
pub struct ComponentList {
    pub service_accounts: Vec<ServiceAccount>,
    pub role_bindings: Vec<RoleBinding>,
    pub config_maps: Vec<ConfigMap>,
    pub secrets: Vec<Secret>,
    pub persistent_volume_claims: Vec<PersistentVolumeClaim>,
    pub services: Vec<Service>,
    pub stateful_sets: Vec<StatefulSet>,
    pub deployments: Vec<Deployment>,
    pub routes: Vec<Route>,
}

fn select<K: ResourceExt + Clone>(objects: &[K], selector: &Selector) -> Vec<K> {
    objects
        .iter()
        .filter(|obj| selector.matches(obj.labels()))
        .cloned()
        .collect()
}

impl ComponentList {
    /// returns the members whose labels match the selector
    pub fn select(&self, selector: &Selector) -> Self {
        Self {
            service_accounts: select(&self.service_accounts, selector),
            role_bindings: select(&self.role_bindings, selector),
            config_maps: select(&self.config_maps, selector),
            secrets: select(&self.secrets, selector),
            persistent_volume_claims: select(&self.persistent_volume_claims, selector),
            services: select(&self.services, selector),
            stateful_sets: select(&self.stateful_sets, selector),
            deployments: select(&self.deployments, selector),
            routes: select(&self.routes, selector),
        }
    }

    pub fn len(&self) -> usize {
        self.service_accounts.len()
            + self.role_bindings.len()
            + self.config_maps.len()
            + self.secrets.len()
            + self.persistent_volume_claims.len()
            + self.services.len()
            + self.stateful_sets.len()
            + self.deployments.len()
            + self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// returns `kind/name` of every member, in apply order
    pub fn names(&self) -> Vec<String> {
        fn names<K: Object>(objects: &[K]) -> impl Iterator<Item = String> + '_ {
            objects
                .iter()
                .map(|obj| format!("{}/{}", K::kind(&()), obj.name_any()))
        }

        names(&self.service_accounts)
            .chain(names(&self.role_bindings))
            .chain(names(&self.config_maps))
            .chain(names(&self.secrets))
            .chain(names(&self.persistent_volume_claims))
            .chain(names(&self.services))
            .chain(names(&self.stateful_sets))
            .chain(names(&self.deployments))
            .chain(names(&self.routes))
            .collect()
    }
}
