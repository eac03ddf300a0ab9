//! # Route custom resource
//!
//! This module provide a typed definition of the openshift route, which is
//! the platform specific way to expose the web server of an instance.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// RouteTargetReference structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RouteTargetReference {
    #[serde(rename = "kind")]
    pub kind: String,
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "weight", default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

// -----------------------------------------------------------------------------
// RoutePort structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RoutePort {
    #[serde(rename = "targetPort")]
    pub target_port: String,
}

// -----------------------------------------------------------------------------
// TlsConfig structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct TlsConfig {
    #[serde(rename = "termination")]
    pub termination: String,
    #[serde(
        rename = "insecureEdgeTerminationPolicy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub insecure_edge_termination_policy: Option<String>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
#[kube(group = "route.openshift.io")]
#[kube(version = "v1")]
#[kube(kind = "Route")]
#[kube(singular = "route")]
#[kube(plural = "routes")]
#[kube(status = "RouteStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct RouteSpec {
    #[serde(rename = "host", default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "to")]
    pub to: RouteTargetReference,
    #[serde(rename = "port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,
    #[serde(rename = "tls", default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(rename = "wildcardPolicy", default, skip_serializing_if = "Option::is_none")]
    pub wildcard_policy: Option<String>,
}

// -----------------------------------------------------------------------------
// RouteStatus structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RouteStatus {
    #[serde(rename = "ingress", default)]
    pub ingress: Vec<RouteIngress>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RouteIngress {
    #[serde(rename = "host", default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "routerName", default, skip_serializing_if = "Option::is_none")]
    pub router_name: Option<String>,
}

impl Route {
    /// returns the host admitted by a router, or the declared one
    pub fn host(&self) -> Option<String> {
        self.status
            .as_ref()
            .and_then(|status| status.ingress.iter().find_map(|ingress| ingress.host.to_owned()))
            .or_else(|| self.spec.host.to_owned())
    }
}
