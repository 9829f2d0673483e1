//! Cluster access seam.
//!
//! Everything the engine does against the cluster goes through
//! [`ClusterClient`]: typed get/list/create/update/delete with
//! distinguishable not-found, already-exists, and conflict outcomes.
//! [`KubeClient`] talks to a real API server; [`MemoryClient`] backs the
//! test suite with the same semantics, including optimistic-concurrency
//! resource versions.

use async_trait::async_trait;
use thiserror::Error;

use crate::resources::{ClusterObject, ResourceKind};

mod api;
mod memory;

pub use api::KubeClient;
pub use memory::MemoryClient;

/// Errors surfaced by cluster calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The object does not exist. Locators treat this as a negative
    /// answer; revertors as already-reverted.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind.
        kind: ResourceKind,
        /// Namespace looked in.
        namespace: String,
        /// Name looked for.
        name: String,
    },

    /// A create hit an existing object; mutators treat this as success.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: ResourceKind,
        /// Namespace written to.
        namespace: String,
        /// Conflicting name.
        name: String,
    },

    /// An update lost an optimistic-concurrency race; retried by the next
    /// reconcile.
    #[error("write conflict on {kind} {namespace}/{name}")]
    Conflict {
        /// Resource kind.
        kind: ResourceKind,
        /// Namespace written to.
        namespace: String,
        /// Contended name.
        name: String,
    },

    /// The object cannot be written without a namespace.
    #[error("{kind} object {name:?} has no namespace")]
    MissingNamespace {
        /// Resource kind.
        kind: ResourceKind,
        /// Name of the unaddressable object.
        name: String,
    },

    /// Any other API failure.
    #[error("cluster api error: {0}")]
    Api(#[source] kube::Error),
}

impl ClientError {
    /// Whether this is the not-found outcome.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is the already-exists outcome.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether this is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Typed cluster reads and writes.
///
/// Every call may block on network I/O and is a failure boundary: callers
/// record the outcome and let the surrounding controller loop retry.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch one object.
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<ClusterObject, ClientError>;

    /// List every object of `kind` in `namespace`.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<ClusterObject>, ClientError>;

    /// Create a new object.
    async fn create(&self, object: &ClusterObject) -> Result<(), ClientError>;

    /// Replace an existing object; the object's resource version guards
    /// against concurrent writers.
    async fn update(&self, object: &ClusterObject) -> Result<(), ClientError>;

    /// Delete one object.
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;
}
