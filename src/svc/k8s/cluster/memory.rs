//! # Memory module
//!
//! In-memory [`Cluster`] used by tests. Objects are stored as json values
//! indexed by kind, namespace and name, every mutation is appended to a
//! journal which tests use to assert ordering and idempotence.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{core::ErrorResponse, ResourceExt};
use serde_json::{json, Value};

use crate::svc::k8s::{
    cluster::{Cluster, Error, Object},
    selector::Selector,
};

// -----------------------------------------------------------------------------
// Verb enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum Verb {
    Create,
    Apply,
    Delete,
    PatchStatus,
    CreateNamespace,
    Exec,
}

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Operation {
    pub verb: Verb,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

type Key = (String, String, String);
type ExecHandler = Box<dyn Fn(&str, &[String]) -> Result<String, String> + Send + Sync>;

// -----------------------------------------------------------------------------
// MemoryCluster structure

pub struct MemoryCluster {
    objects: Mutex<BTreeMap<Key, Value>>,
    namespaces: Mutex<BTreeSet<String>>,
    crds: Mutex<BTreeMap<String, CustomResourceDefinition>>,
    journal: Mutex<Vec<Operation>>,
    commands: Mutex<Vec<(String, Vec<String>)>>,
    failures: Mutex<BTreeSet<(Verb, String)>>,
    exec: Mutex<ExecHandler>,
    complete_jobs: Mutex<bool>,
    version: Mutex<u64>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self {
            objects: Mutex::default(),
            namespaces: Mutex::default(),
            crds: Mutex::default(),
            journal: Mutex::default(),
            commands: Mutex::default(),
            failures: Mutex::default(),
            exec: Mutex::new(Box::new(|_, _| Ok(String::new()))),
            complete_jobs: Mutex::new(false),
            version: Mutex::new(0),
        }
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn kind<K: Object>() -> String {
    K::kind(&()).to_string()
}

impl MemoryCluster {
    /// store the object without recording it in the journal
    pub fn seed<K: Object>(&self, obj: K) {
        let namespace = obj.namespace().unwrap_or_default();
        let value = serde_json::to_value(&obj).expect("object to be serializable");

        self.namespaces.lock().unwrap().insert(namespace.to_owned());
        self.objects
            .lock()
            .unwrap()
            .insert((kind::<K>(), namespace, obj.name_any()), value);
    }

    pub fn seed_crd(&self, name: &str, deleting: bool) {
        let crd = CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                deletion_timestamp: deleting.then(|| {
                    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now())
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        self.crds.lock().unwrap().insert(name.to_string(), crd);
    }

    pub fn on_exec<F>(&self, f: F)
    where
        F: Fn(&str, &[String]) -> Result<String, String> + Send + Sync + 'static,
    {
        *self.exec.lock().unwrap() = Box::new(f);
    }

    /// mark jobs as succeeded as soon as they are created
    pub fn complete_jobs(&self) {
        *self.complete_jobs.lock().unwrap() = true;
    }

    /// make every request with the verb on the object with the name fail
    pub fn fail(&self, verb: Verb, name: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert((verb, name.to_string()));
    }

    pub fn object<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(kind::<K>(), namespace.to_string(), name.to_string()))
            .map(|value| serde_json::from_value(value.to_owned()).expect("object to deserialize"))
    }

    pub fn objects<K: Object>(&self, namespace: &str) -> Vec<K> {
        let kind = kind::<K>();

        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, ns, _), _)| k == &kind && ns == namespace)
            .map(|(_, value)| {
                serde_json::from_value(value.to_owned()).expect("object to deserialize")
            })
            .collect()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.lock().unwrap().contains(name)
    }

    pub fn journal(&self) -> Vec<Operation> {
        self.journal.lock().unwrap().to_owned()
    }

    /// returns mutations recorded in the journal, exec excluded
    pub fn mutations(&self) -> Vec<Operation> {
        self.journal()
            .into_iter()
            .filter(|op| op.verb != Verb::Exec)
            .collect()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().unwrap().clear();
    }

    pub fn commands(&self) -> Vec<(String, Vec<String>)> {
        self.commands.lock().unwrap().to_owned()
    }

    fn record(&self, verb: Verb, kind: String, namespace: &str, name: &str) -> Result<(), Error> {
        self.journal.lock().unwrap().push(Operation {
            verb,
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });

        if self
            .failures
            .lock()
            .unwrap()
            .contains(&(verb, name.to_string()))
        {
            return Err(api_error(
                500,
                "InternalError",
                format!("injected failure on '{}'", name),
            ));
        }

        Ok(())
    }

    fn next_version(&self) -> String {
        let mut version = self.version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    fn decode<K: Object>(value: &Value) -> Result<K, Error> {
        Ok(serde_json::from_value(value.to_owned())?)
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn list<K: Object>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<K>, Error> {
        let objects: Vec<K> = self.objects::<K>(namespace);

        Ok(objects
            .into_iter()
            .filter(|obj| selector.matches(obj.labels()))
            .collect())
    }

    async fn list_all<K: Object>(&self, selector: &Selector) -> Result<Vec<K>, Error> {
        let kind = kind::<K>();
        let values: Vec<Value> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, _, _), _)| k == &kind)
            .map(|(_, value)| value.to_owned())
            .collect();

        let mut objects = vec![];
        for value in &values {
            let obj: K = Self::decode(value)?;
            if selector.matches(obj.labels()) {
                objects.push(obj);
            }
        }

        Ok(objects)
    }

    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        Ok(self.object(namespace, name))
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error> {
        let kind = kind::<K>();
        let name = obj.name_any();
        self.record(Verb::Create, kind.to_owned(), namespace, &name)?;

        let key = (kind.to_owned(), namespace.to_string(), name.to_owned());
        if self.objects.lock().unwrap().contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} '{}' already exists", kind, name),
            ));
        }

        let mut value = serde_json::to_value(obj)?;
        value["metadata"]["namespace"] = json!(namespace);
        value["metadata"]["uid"] = json!(format!("uid-{}", name));
        value["metadata"]["resourceVersion"] = json!(self.next_version());
        if kind == "Job" && *self.complete_jobs.lock().unwrap() {
            value["status"] = json!({ "succeeded": 1 });
        }

        self.objects.lock().unwrap().insert(key, value.to_owned());
        Self::decode(&value)
    }

    async fn apply<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error> {
        let kind = kind::<K>();
        let name = obj.name_any();
        self.record(Verb::Apply, kind.to_owned(), namespace, &name)?;

        let key = (kind, namespace.to_string(), name);
        let mut objects = self.objects.lock().unwrap();
        let mut value = serde_json::to_value(obj)?;
        value["metadata"]["namespace"] = json!(namespace);
        if let Some(live) = objects.get(&key) {
            if value.get("status").map(Value::is_null).unwrap_or(true) {
                if let Some(status) = live.get("status") {
                    value["status"] = status.to_owned();
                }
            }
        }

        objects.insert(key, value.to_owned());
        Self::decode(&value)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let kind = kind::<K>();
        self.record(Verb::Delete, kind.to_owned(), namespace, name)?;

        match self.objects.lock().unwrap().remove(&(
            kind.to_owned(),
            namespace.to_string(),
            name.to_string(),
        )) {
            Some(_) => Ok(()),
            None => Err(api_error(
                404,
                "NotFound",
                format!("{} '{}' not found", kind, name),
            )),
        }
    }

    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<K, Error> {
        let kind = kind::<K>();
        self.record(Verb::PatchStatus, kind.to_owned(), namespace, name)?;

        let mut objects = self.objects.lock().unwrap();
        let value = objects
            .get_mut(&(kind.to_owned(), namespace.to_string(), name.to_string()))
            .ok_or_else(|| api_error(404, "NotFound", format!("{} '{}' not found", kind, name)))?;

        json_patch::patch(value, &patch)
            .map_err(|err| api_error(422, "Invalid", err.to_string()))?;

        Self::decode(value)
    }

    async fn ensure_namespace(&self, name: &str) -> Result<bool, Error> {
        if self.has_namespace(name) {
            return Ok(false);
        }

        self.record(Verb::CreateNamespace, "Namespace".to_string(), "", name)?;
        self.namespaces.lock().unwrap().insert(name.to_string());
        Ok(true)
    }

    async fn custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<Option<CustomResourceDefinition>, Error> {
        Ok(self.crds.lock().unwrap().get(name).cloned())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        _container: Option<&str>,
        command: Vec<String>,
    ) -> Result<String, Error> {
        self.record(Verb::Exec, "Pod".to_string(), namespace, pod)?;
        self.commands
            .lock()
            .unwrap()
            .push((pod.to_string(), command.to_owned()));

        let handler = self.exec.lock().unwrap();
        (handler)(pod, &command).map_err(|err| Error::Exec(namespace.into(), pod.into(), err))
    }
}
