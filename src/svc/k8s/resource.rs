//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{api::ObjectMeta, Resource, ResourceExt};
use serde::Serialize;

use crate::svc::k8s::selector::{APP, COMPONENT, NAME};

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource.
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// returns the stable queue key `namespace/name` of the resource
pub fn key<T>(obj: &T) -> String
where
    T: ResourceExt,
{
    let (namespace, name) = namespaced_name(obj);
    if namespace.is_empty() {
        return name;
    }

    format!("{}/{}", namespace, name)
}

/// returns differnce between the two given object serialize as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// returns the ownership labels `{app, name, component}`
pub fn labels(app: &str, name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP.to_string(), app.to_string()),
        (NAME.to_string(), name.to_string()),
        (COMPONENT.to_string(), component.to_string()),
    ])
}

/// returns object metadata of a namespaced resource carrying the given labels
pub fn metadata(namespace: &str, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// returns an object reference pointing to the given resource
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: Resource<DynamicType = ()> + ResourceExt,
{
    ObjectReference {
        api_version: Some(T::api_version(&()).to_string()),
        kind: Some(T::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        resource_version: obj.resource_version(),
        uid: obj.uid(),
        ..Default::default()
    }
}
