//! # Cluster module
//!
//! This module provide the seam between the operator logic and the
//! kubernetes api. Every request made by the reconciler, the diff/apply engine
//! and the readiness helpers goes through the [`Cluster`] trait, which allows
//! to run them against an in-memory cluster in tests.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Namespace, Pod},
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    NamespaceResourceScope,
};
use kube::{
    api::{AttachParams, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::svc::k8s::selector::Selector;

#[cfg(test)]
pub mod memory;

// -----------------------------------------------------------------------------
// Constants

pub const FIELD_MANAGER: &str = "blackduck-operator";

// -----------------------------------------------------------------------------
// Object trait

/// group the bounds needed to manipulate a namespaced kubernetes object
/// through the [`Cluster`] trait
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Serialize
    + DeserializeOwned
    + Clone
    + Debug
    + Send
    + Sync
    + 'static
{
}

/// Blanket implementation of [`Object`]
impl<T> Object for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug
        + Send
        + Sync
        + 'static
{
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
    #[error("failed to execute command in pod '{0}/{1}', {2}")]
    Exec(String, String, String),
    #[error("failed to read output of command in pod '{0}/{1}', {2}")]
    Output(String, String, std::io::Error),
    #[error("failed to serialize or deserialize object, {0}")]
    Serde(serde_json::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Kube(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde(err)
    }
}

impl Error {
    /// returns if the error is the kubernetes 'not found' answer
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(res)) if res.code == 404)
    }
}

// -----------------------------------------------------------------------------
// Cluster trait

#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// returns objects of the namespace which match the selector
    async fn list<K: Object>(&self, namespace: &str, selector: &Selector)
        -> Result<Vec<K>, Error>;

    /// returns objects of all namespaces which match the selector
    async fn list_all<K: Object>(&self, selector: &Selector) -> Result<Vec<K>, Error>;

    /// returns the object, if any
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>;

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error>;

    /// server side apply of the object, the operator takes the ownership of
    /// conflicting fields
    async fn apply<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error>;

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// make a json patch request on the status sub-resource of the object
    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<K, Error>;

    /// create the namespace if it does not exist yet, returns whether it has
    /// been created
    async fn ensure_namespace(&self, name: &str) -> Result<bool, Error>;

    async fn custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<Option<CustomResourceDefinition>, Error>;

    /// execute the command in the container of the pod and returns the
    /// combined standard output and error
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<String, Error>;
}

// -----------------------------------------------------------------------------
// KubeCluster structure

/// [`Cluster`] implementation backed by a kubernetes client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl From<Client> for KubeCluster {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn list<K: Object>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<K>, Error> {
        let params = ListParams::default().labels(&selector.to_string());

        trace!(
            kind = K::kind(&()).as_ref(),
            namespace = namespace,
            selector = selector.to_string(),
            "List objects"
        );

        Ok(Api::<K>::namespaced(self.client.to_owned(), namespace)
            .list(&params)
            .await?
            .items)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn list_all<K: Object>(&self, selector: &Selector) -> Result<Vec<K>, Error> {
        let params = ListParams::default().labels(&selector.to_string());

        Ok(Api::<K>::all(self.client.to_owned())
            .list(&params)
            .await?
            .items)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        Ok(Api::<K>::namespaced(self.client.to_owned(), namespace)
            .get_opt(name)
            .await?)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, obj)))]
    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error> {
        debug!(
            kind = K::kind(&()).as_ref(),
            namespace = namespace,
            name = obj.name_any(),
            "Create object"
        );

        Ok(Api::<K>::namespaced(self.client.to_owned(), namespace)
            .create(&post_params(), obj)
            .await?)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, obj)))]
    async fn apply<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error> {
        let name = obj.name_any();
        let params = patch_params();

        debug!(
            kind = K::kind(&()).as_ref(),
            namespace = namespace,
            name = &name,
            "Apply object"
        );

        Ok(Api::<K>::namespaced(self.client.to_owned(), namespace)
            .patch(&name, &params, &Patch::Apply(obj))
            .await?)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), Error> {
        debug!(
            kind = K::kind(&()).as_ref(),
            namespace = namespace,
            name = name,
            "Delete object"
        );

        Api::<K>::namespaced(self.client.to_owned(), namespace)
            .delete(name, &DeleteParams::background())
            .await?;

        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, patch)))]
    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<K, Error> {
        Ok(Api::<K>::namespaced(self.client.to_owned(), namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Json::<K>(patch))
            .await?)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn ensure_namespace(&self, name: &str) -> Result<bool, Error> {
        let api = Api::<Namespace>::all(self.client.to_owned());
        if api.get_opt(name).await?.is_some() {
            return Ok(false);
        }

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        match api.create(&post_params(), &namespace).await {
            Ok(_) => Ok(true),
            // someone else created it in the meantime
            Err(kube::Error::Api(res)) if res.code == 409 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<Option<CustomResourceDefinition>, Error> {
        Ok(Api::<CustomResourceDefinition>::all(self.client.to_owned())
            .get_opt(name)
            .await?)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, command)))]
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<String, Error> {
        let mut params = AttachParams::default().stdin(false).stdout(true).stderr(true);
        if let Some(container) = container {
            params = params.container(container);
        }

        let mut process = Api::<Pod>::namespaced(self.client.to_owned(), namespace)
            .exec(pod, command, &params)
            .await?;

        let (stdout, stderr) = (process.stdout(), process.stderr());
        let (stdout, stderr) = tokio::join!(read_to_string(stdout), read_to_string(stderr));
        let output = stdout.map_err(|err| Error::Output(namespace.into(), pod.into(), err))?
            + &stderr.map_err(|err| Error::Output(namespace.into(), pod.into(), err))?;

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };

        process
            .join()
            .await
            .map_err(|err| Error::Exec(namespace.into(), pod.into(), err.to_string()))?;

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                return Err(Error::Exec(
                    namespace.into(),
                    pod.into(),
                    format!("{}: {}", status.message.unwrap_or_default(), output.trim()),
                ));
            }
        }

        Ok(output)
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns creation parameters under the operator field manager, so that
/// later server side applies own and prune the fields set at creation
fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn patch_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

async fn read_to_string<R>(reader: Option<R>) -> Result<String, std::io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut buf).await?;
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_apply_share_the_field_manager() {
        let (post, patch) = (post_params(), patch_params());

        assert_eq!(post.field_manager.as_deref(), Some(FIELD_MANAGER));
        assert!(!post.dry_run);
        assert_eq!(patch.field_manager.as_deref(), post.field_manager.as_deref());
        assert!(patch.force);
    }

    #[test]
    fn not_found_is_detected() {
        let err = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "configmaps \"a\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        }));

        assert!(err.is_not_found());
        assert!(!Error::Exec("bd1".into(), "pod".into(), "boom".into()).is_not_found());
    }
}
