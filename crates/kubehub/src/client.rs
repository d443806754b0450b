//! Typed access to the managed collection.

use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    runtime::watcher,
    Client,
};
use rekon_core::ObjectKey;
use serde_json::Value as Json;
use tracing::debug;

use crate::{dynamic_api, find_api_resource, key_of, parse_gvk_key};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error(transparent)]
    Kube(kube::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 => ClientError::Conflict(resp.message.clone()),
            _ => ClientError::Kube(e),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Invalid(e.to_string())
    }
}

/// CRUD + list/watch against the authoritative store.
///
/// Patches are JSON merge patches.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, ClientError>;
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> Result<(), ClientError>;
    async fn delete_collection(
        &self,
        namespace: Option<&str>,
        params: &DeleteParams,
        list: &ListParams,
    ) -> Result<(), ClientError>;
    async fn list(&self, namespace: Option<&str>, params: &ListParams) -> Result<Vec<DynamicObject>, ClientError>;
    fn watch(
        &self,
        namespace: Option<&str>,
        config: watcher::Config,
    ) -> BoxStream<'static, Result<watcher::Event<DynamicObject>, watcher::Error>>;
    async fn patch(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, ClientError>;
    async fn patch_status(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, ClientError>;
}

/// [`ResourceClient`] over the dynamic kube API for a single kind.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl KubeClient {
    pub fn new(client: Client, resource: ApiResource, namespaced: bool) -> Self {
        Self { client, resource, namespaced }
    }

    /// Resolve `gvk_key` (`v1/ConfigMap`, `group/v1/Kind`) via discovery.
    pub async fn for_gvk(client: Client, gvk_key: &str) -> anyhow::Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (resource, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        Ok(Self::new(client, resource, namespaced))
    }

    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespaced
    }

    pub fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        dynamic_api(self.client.clone(), &self.resource, self.namespaced, namespace)
    }

    fn target(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String), ClientError> {
        let key = key_of(obj).map_err(|e| ClientError::Invalid(e.to_string()))?;
        Ok((self.api(key.namespace()), key.name))
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, ClientError> {
        Ok(self.api(key.namespace()).get(&key.name).await?)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let api = self.api(obj.metadata.namespace.as_deref());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let (api, name) = self.target(obj)?;
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let (api, name) = self.target(obj)?;
        let body = serde_json::to_vec(obj)?;
        Ok(api.replace_status(&name, &PostParams::default(), body).await?)
    }

    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> Result<(), ClientError> {
        self.api(key.namespace()).delete(&key.name, params).await?;
        debug!(key = %key, "delete issued");
        Ok(())
    }

    async fn delete_collection(
        &self,
        namespace: Option<&str>,
        params: &DeleteParams,
        list: &ListParams,
    ) -> Result<(), ClientError> {
        self.api(namespace).delete_collection(params, list).await?;
        Ok(())
    }

    async fn list(&self, namespace: Option<&str>, params: &ListParams) -> Result<Vec<DynamicObject>, ClientError> {
        Ok(self.api(namespace).list(params).await?.items)
    }

    fn watch(
        &self,
        namespace: Option<&str>,
        config: watcher::Config,
    ) -> BoxStream<'static, Result<watcher::Event<DynamicObject>, watcher::Error>> {
        watcher::watcher(self.api(namespace), config).boxed()
    }

    async fn patch(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, ClientError> {
        let api = self.api(key.namespace());
        Ok(api.patch(&key.name, &PatchParams::default(), &Patch::Merge(patch)).await?)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, ClientError> {
        let api = self.api(key.namespace());
        Ok(api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch)).await?)
    }
}
