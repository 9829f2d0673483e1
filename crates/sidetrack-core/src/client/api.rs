//! [`ClusterClient`] backed by a real Kubernetes API server.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::ErrorResponse;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::resources::{ClusterObject, Gateway, ResourceKind, VirtualService};

use super::{ClientError, ClusterClient};

/// Typed access to the cluster through a shared [`kube::Client`].
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    /// Wrap an established client.
    #[must_use]
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_as<K>(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<K, ClientError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(|err| classify(err, kind, namespace, name))
    }

    async fn list_as<K>(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<K>, ClientError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        self.api::<K>(namespace)
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|err| classify(err, kind, namespace, ""))
    }

    async fn create_as<K>(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        object: &K,
    ) -> Result<(), ClientError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        self.api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
            .map(|_| ())
            .map_err(|err| classify(err, kind, namespace, name))
    }

    async fn update_as<K>(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        object: &K,
    ) -> Result<(), ClientError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        self.api::<K>(namespace)
            .replace(name, &PostParams::default(), object)
            .await
            .map(|_| ())
            .map_err(|err| classify(err, kind, namespace, name))
    }

    async fn delete_as<K>(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| classify(err, kind, namespace, name))
    }

    fn addressed(object: &ClusterObject) -> Result<(&str, &str), ClientError> {
        let namespace = object.namespace();
        if namespace.is_empty() {
            return Err(ClientError::MissingNamespace {
                kind: object.kind(),
                name: object.name().to_string(),
            });
        }
        Ok((namespace, object.name()))
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<ClusterObject, ClientError> {
        match kind {
            ResourceKind::Deployment => self
                .get_as::<Deployment>(kind, namespace, name)
                .await
                .map(ClusterObject::from),
            ResourceKind::VirtualService => self
                .get_as::<VirtualService>(kind, namespace, name)
                .await
                .map(ClusterObject::from),
            ResourceKind::Gateway => self
                .get_as::<Gateway>(kind, namespace, name)
                .await
                .map(ClusterObject::from),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<ClusterObject>, ClientError> {
        match kind {
            ResourceKind::Deployment => Ok(self
                .list_as::<Deployment>(kind, namespace)
                .await?
                .into_iter()
                .map(ClusterObject::from)
                .collect()),
            ResourceKind::VirtualService => Ok(self
                .list_as::<VirtualService>(kind, namespace)
                .await?
                .into_iter()
                .map(ClusterObject::from)
                .collect()),
            ResourceKind::Gateway => Ok(self
                .list_as::<Gateway>(kind, namespace)
                .await?
                .into_iter()
                .map(ClusterObject::from)
                .collect()),
        }
    }

    async fn create(&self, object: &ClusterObject) -> Result<(), ClientError> {
        let (namespace, name) = Self::addressed(object)?;
        match object {
            ClusterObject::Deployment(d) => {
                self.create_as(object.kind(), namespace, name, d).await
            }
            ClusterObject::VirtualService(vs) => {
                self.create_as(object.kind(), namespace, name, vs).await
            }
            ClusterObject::Gateway(gw) => {
                self.create_as(object.kind(), namespace, name, gw).await
            }
        }
    }

    async fn update(&self, object: &ClusterObject) -> Result<(), ClientError> {
        let (namespace, name) = Self::addressed(object)?;
        match object {
            ClusterObject::Deployment(d) => {
                self.update_as(object.kind(), namespace, name, d).await
            }
            ClusterObject::VirtualService(vs) => {
                self.update_as(object.kind(), namespace, name, vs).await
            }
            ClusterObject::Gateway(gw) => {
                self.update_as(object.kind(), namespace, name, gw).await
            }
        }
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        match kind {
            ResourceKind::Deployment => {
                self.delete_as::<Deployment>(kind, namespace, name).await
            }
            ResourceKind::VirtualService => {
                self.delete_as::<VirtualService>(kind, namespace, name).await
            }
            ResourceKind::Gateway => self.delete_as::<Gateway>(kind, namespace, name).await,
        }
    }
}

fn classify(err: kube::Error, kind: ResourceKind, namespace: &str, name: &str) -> ClientError {
    match &err {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => ClientError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ErrorResponse { code: 409, reason, .. }) if reason == "AlreadyExists" => {
            ClientError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ErrorResponse { code: 409, .. }) => ClientError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        _ => ClientError::Api(err),
    }
}
