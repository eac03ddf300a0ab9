//! # Event module
//!
//! This module provide the construction of core/v1 events about the
//! instances handled by the operator

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::core::v1::{Event, EventSource},
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
use kube::{api::ObjectMeta, Resource, ResourceExt};

use crate::svc::k8s::{recorder::Level, resource};

// -----------------------------------------------------------------------------
// constants

pub const COMPONENT: &str = "blackduck-operator";

// -----------------------------------------------------------------------------
// Helper functions

/// returns the event name, the object name suffixed by the hexadecimal
/// timestamp as the kubelet does
pub fn name<T>(obj: &T, at: &DateTime<Utc>) -> String
where
    T: ResourceExt,
{
    format!(
        "{}.{:x}",
        obj.name_any(),
        at.timestamp_nanos_opt().unwrap_or_else(|| at.timestamp_micros())
    )
}

/// create a new event about the object, emitted by this process
pub fn new<T, U>(obj: &T, kind: &Level, action: &U, message: &str) -> Event
where
    T: Resource<DynamicType = ()> + ResourceExt,
    U: ToString + Debug,
{
    let now = Utc::now();
    let source = source();

    Event {
        metadata: ObjectMeta {
            namespace: obj.namespace(),
            name: Some(name(obj, &now)),
            ..Default::default()
        },
        type_: Some(kind.to_string()),
        action: Some(action.to_string()),
        reason: Some(action.to_string()),
        message: Some(message.to_string()),
        count: Some(1),
        involved_object: resource::object_reference(obj),
        event_time: Some(MicroTime(now)),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        reporting_component: Some(COMPONENT.to_string()),
        reporting_instance: source.host.to_owned(),
        source: Some(source),
        ..Default::default()
    }
}

/// returns the source of this operator, the host is the pod name when
/// running in the cluster
pub fn source() -> EventSource {
    EventSource {
        component: Some(COMPONENT.to_string()),
        host: hostname::get()
            .ok()
            .map(|host| host.to_string_lossy().to_string()),
    }
}
