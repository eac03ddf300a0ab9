//! # Compare module
//!
//! This module provide the semantic comparators of components. The api server
//! fills defaults and status on every object, so a live object is considered
//! changed only when a field the operator declares differs.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, StatefulSet},
        core::v1::{
            ConfigMap, Container, EnvVar, PersistentVolumeClaim, PodTemplateSpec, Secret, Service,
            ServiceAccount, Volume, VolumeMount,
        },
        rbac::v1::RoleBinding,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::ResourceExt;
use serde::Serialize;

use crate::svc::{
    component::{Component, Retention},
    crd::route::Route,
    k8s::selector::{Selector, COMPONENT},
};

// -----------------------------------------------------------------------------
// Constants

pub const CLAIM_COMPONENT: &str = "pvc";

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the desired labels are not all present on the live object
fn labels_changed<K: ResourceExt>(live: &K, desired: &K) -> bool {
    desired
        .labels()
        .iter()
        .any(|(k, v)| live.labels().get(k) != Some(v))
}

/// compare both values through their json representation, which treats an
/// absent field and an empty one alike once serialized by k8s-openapi
fn differs<T: Serialize>(live: &T, desired: &T) -> bool {
    match (serde_json::to_value(live), serde_json::to_value(desired)) {
        (Ok(live), Ok(desired)) => live != desired,
        _ => true,
    }
}

fn env(container: &Container) -> BTreeMap<String, EnvVar> {
    container
        .env
        .iter()
        .flatten()
        .map(|var| (var.name.to_owned(), var.to_owned()))
        .collect()
}

fn volume_mounts(container: &Container) -> BTreeMap<String, VolumeMount> {
    container
        .volume_mounts
        .iter()
        .flatten()
        .map(|mount| (format!("{}:{}", mount.name, mount.mount_path), mount.to_owned()))
        .collect()
}

fn resources(container: &Container) -> (BTreeMap<String, Quantity>, BTreeMap<String, Quantity>) {
    let resources = container.resources.to_owned().unwrap_or_default();

    (
        resources.requests.unwrap_or_default(),
        resources.limits.unwrap_or_default(),
    )
}

fn container_changed(live: &Container, desired: &Container) -> bool {
    live.image != desired.image
        || live.command != desired.command
        || live.args != desired.args
        || resources(live) != resources(desired)
        || differs(&live.env_from, &desired.env_from)
        || differs(&env(live), &env(desired))
        || differs(&volume_mounts(live), &volume_mounts(desired))
}

fn volumes(template: &PodTemplateSpec) -> BTreeMap<String, Volume> {
    template
        .spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .map(|volume| (volume.name.to_owned(), volume.to_owned()))
        .collect()
}

fn containers(template: &PodTemplateSpec) -> BTreeMap<String, Container> {
    template
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter().chain(spec.init_containers.iter().flatten()))
        .map(|container| (container.name.to_owned(), container.to_owned()))
        .collect()
}

/// compare images, resources, environment, mounts and volumes of both pod
/// templates, environment and mounts are compared without taking care of
/// their order
pub fn pod_template_changed(live: &PodTemplateSpec, desired: &PodTemplateSpec) -> bool {
    let (live_containers, desired_containers) = (containers(live), containers(desired));

    if live_containers.len() != desired_containers.len() {
        return true;
    }

    let changed = desired_containers
        .iter()
        .any(|(name, desired)| match live_containers.get(name) {
            Some(live) => container_changed(live, desired),
            None => true,
        });

    changed || differs(&volumes(live), &volumes(desired))
}

// -----------------------------------------------------------------------------
// Component implementations

impl Component for ServiceAccount {
    fn changed(live: &Self, desired: &Self) -> bool {
        labels_changed(live, desired)
            || differs(&live.image_pull_secrets, &desired.image_pull_secrets)
    }
}

impl Component for RoleBinding {
    fn changed(live: &Self, desired: &Self) -> bool {
        labels_changed(live, desired)
            || differs(&live.role_ref, &desired.role_ref)
            || differs(&live.subjects, &desired.subjects)
    }
}

impl Component for ConfigMap {
    fn changed(live: &Self, desired: &Self) -> bool {
        labels_changed(live, desired)
            || live.data.to_owned().unwrap_or_default() != desired.data.to_owned().unwrap_or_default()
            || differs(&live.binary_data, &desired.binary_data)
    }
}

impl Component for Secret {
    fn changed(live: &Self, desired: &Self) -> bool {
        // the api server moves string data into data
        let data = |secret: &Secret| {
            let mut data: BTreeMap<String, Vec<u8>> = secret
                .data
                .iter()
                .flatten()
                .map(|(k, v)| (k.to_owned(), v.0.to_owned()))
                .collect();

            for (k, v) in secret.string_data.iter().flatten() {
                data.insert(k.to_owned(), v.as_bytes().to_vec());
            }

            data
        };

        labels_changed(live, desired)
            || data(live) != data(desired)
            || (desired.type_.is_some() && live.type_ != desired.type_)
    }
}

impl Component for PersistentVolumeClaim {
    fn changed(live: &Self, desired: &Self) -> bool {
        // only the requested size may be updated on a bound claim
        let requests = |claim: &PersistentVolumeClaim| {
            claim
                .spec
                .as_ref()
                .and_then(|spec| spec.resources.as_ref())
                .and_then(|resources| resources.requests.to_owned())
                .unwrap_or_default()
        };

        labels_changed(live, desired) || requests(live) != requests(desired)
    }

    fn deletable(live: &Self, scope: &Selector, retention: Retention) -> bool {
        if retention == Retention::PreserveClaims {
            return false;
        }

        let bound = live
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(|phase| phase == "Bound")
            .unwrap_or(false)
            || live
                .spec
                .as_ref()
                .and_then(|spec| spec.volume_name.as_ref())
                .is_some();

        !bound || scope.pins(COMPONENT, CLAIM_COMPONENT)
    }
}

impl Component for Service {
    fn changed(live: &Self, desired: &Self) -> bool {
        let ports = |service: &Service| -> Vec<_> {
            service
                .spec
                .iter()
                .flat_map(|spec| spec.ports.iter().flatten())
                .map(|port| (port.name.to_owned(), port.port, port.target_port.to_owned()))
                .collect()
        };

        let spec = |service: &Service| {
            service
                .spec
                .as_ref()
                .map(|spec| (spec.selector.to_owned().unwrap_or_default(), spec.type_.to_owned()))
                .unwrap_or_default()
        };

        let (live_selector, live_type) = spec(live);
        let (desired_selector, desired_type) = spec(desired);

        labels_changed(live, desired)
            || ports(live) != ports(desired)
            || live_selector != desired_selector
            || (desired_type.is_some() && live_type != desired_type)
    }
}

impl Component for Deployment {
    fn changed(live: &Self, desired: &Self) -> bool {
        let (live_spec, desired_spec) = (
            live.spec.to_owned().unwrap_or_default(),
            desired.spec.to_owned().unwrap_or_default(),
        );

        labels_changed(live, desired)
            || live_spec.replicas.unwrap_or(1) != desired_spec.replicas.unwrap_or(1)
            || pod_template_changed(&live_spec.template, &desired_spec.template)
    }
}

impl Component for StatefulSet {
    fn changed(live: &Self, desired: &Self) -> bool {
        let (live_spec, desired_spec) = (
            live.spec.to_owned().unwrap_or_default(),
            desired.spec.to_owned().unwrap_or_default(),
        );

        labels_changed(live, desired)
            || live_spec.replicas.unwrap_or(1) != desired_spec.replicas.unwrap_or(1)
            || pod_template_changed(&live_spec.template, &desired_spec.template)
    }
}

impl Component for Route {
    fn changed(live: &Self, desired: &Self) -> bool {
        // the router fills the host when none is declared
        let host_changed = desired.spec.host.is_some() && live.spec.host != desired.spec.host;

        labels_changed(live, desired)
            || host_changed
            || live.spec.path != desired.spec.path
            || live.spec.to != desired.spec.to
            || live.spec.port != desired.spec.port
            || live.spec.tls != desired.spec.tls
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::{
            apps::v1::DeploymentSpec,
            core::v1::{
                PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PodSpec,
                ResourceRequirements,
            },
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use super::*;
    use crate::svc::k8s::resource;

    fn deployment(image: &str, env: Vec<(&str, &str)>) -> Deployment {
        Deployment {
            metadata: resource::metadata("bd1", "webapp", resource::labels("blackduck", "bd1", "webapp")),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta::default()),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "webapp".into(),
                            image: Some(image.into()),
                            env: Some(
                                env.into_iter()
                                    .map(|(name, value)| EnvVar {
                                        name: name.into(),
                                        value: Some(value.into()),
                                        ..Default::default()
                                    })
                                    .collect(),
                            ),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn deployment_env_order_does_not_matter() {
        let live = deployment("webapp:1", vec![("A", "1"), ("B", "2")]);
        let desired = deployment("webapp:1", vec![("B", "2"), ("A", "1")]);

        assert!(!Deployment::changed(&live, &desired));
    }

    #[test]
    fn deployment_image_change_is_detected() {
        let live = deployment("webapp:1", vec![]);
        let desired = deployment("webapp:2", vec![]);

        assert!(Deployment::changed(&live, &desired));
    }

    #[test]
    fn deployment_ignores_server_side_status() {
        let desired = deployment("webapp:1", vec![("A", "1")]);
        let mut live = desired.clone();
        live.metadata.resource_version = Some("42".into());
        live.metadata.labels.as_mut().unwrap().insert("extra".into(), "x".into());
        live.status = Some(Default::default());

        assert!(!Deployment::changed(&live, &desired));
    }

    fn claim(size: &str, phase: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: resource::metadata("bd1", "blackduck-postgres", resource::labels("blackduck", "bd1", "pvc")),
            spec: Some(PersistentVolumeClaimSpec {
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size.into()))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: phase.map(|phase| PersistentVolumeClaimStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn claim_compares_requested_size_only() {
        let mut live = claim("150Gi", Some("Bound"));
        live.spec.as_mut().unwrap().storage_class_name = Some("standard".into());

        assert!(!PersistentVolumeClaim::changed(&live, &claim("150Gi", None)));
        assert!(PersistentVolumeClaim::changed(&live, &claim("200Gi", None)));
    }

    #[test]
    fn bound_claim_is_deletable_only_under_pinned_scope() {
        let bound = claim("2Gi", Some("Bound"));
        let pending = claim("2Gi", Some("Pending"));
        let instance = Selector::instance("blackduck", "bd1");
        let pinned = instance.clone().equals(COMPONENT, CLAIM_COMPONENT);

        assert!(!PersistentVolumeClaim::deletable(&bound, &instance, Retention::Default));
        assert!(PersistentVolumeClaim::deletable(&pending, &instance, Retention::Default));
        assert!(PersistentVolumeClaim::deletable(&bound, &pinned, Retention::Default));
        assert!(!PersistentVolumeClaim::deletable(&bound, &pinned, Retention::PreserveClaims));
        assert!(!PersistentVolumeClaim::deletable(&pending, &pinned, Retention::PreserveClaims));
    }

    #[test]
    fn secret_string_data_equals_data() {
        let mut desired = Secret {
            metadata: resource::metadata("bd1", "creds", resource::labels("blackduck", "bd1", "secret")),
            string_data: Some(BTreeMap::from([("KEY".to_string(), "value".to_string())])),
            ..Default::default()
        };

        let mut live = desired.clone();
        live.string_data = None;
        live.data = Some(BTreeMap::from([(
            "KEY".to_string(),
            k8s_openapi::ByteString(b"value".to_vec()),
        )]));
        live.type_ = Some("Opaque".into());

        assert!(!Secret::changed(&live, &desired));

        desired.string_data = Some(BTreeMap::from([("KEY".to_string(), "other".to_string())]));
        assert!(Secret::changed(&live, &desired));
    }
}
