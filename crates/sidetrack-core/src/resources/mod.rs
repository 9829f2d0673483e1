//! Typed view of the cluster resources the engine reads and writes.
//!
//! The workload kind comes straight from `k8s-openapi`; the Istio kinds
//! are declared in [`istio`] since no first-party crate publishes them.
//! [`ClusterObject`] wraps all of them behind uniform metadata access so
//! the client seam and the back-reference bookkeeping do not need to care
//! which kind they are holding.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod istio;

pub use istio::{
    Destination, Gateway, GatewaySpec, HeaderOperations, Headers, HttpMatchRequest, HttpRedirect,
    HttpRoute, HttpRouteDestination, Port, Server, StringMatch, VirtualService,
    VirtualServiceSpec,
};

/// The resource kinds the engine manipulates.
///
/// Serialized with the Kubernetes `kind` spelling so status ledger entries
/// read naturally in `kubectl` output.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum ResourceKind {
    /// A `apps/v1` Deployment workload.
    Deployment,
    /// An Istio `networking.istio.io` VirtualService.
    VirtualService,
    /// An Istio `networking.istio.io` Gateway.
    Gateway,
}

impl ResourceKind {
    /// The Kubernetes `kind` string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::VirtualService => "VirtualService",
            Self::Gateway => "Gateway",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed cluster object, tagged by kind.
#[derive(Clone, Debug)]
pub enum ClusterObject {
    /// A workload.
    Deployment(Deployment),
    /// A mesh route object.
    VirtualService(VirtualService),
    /// A mesh ingress.
    Gateway(Gateway),
}

impl ClusterObject {
    /// The kind tag of the wrapped object.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Deployment(_) => ResourceKind::Deployment,
            Self::VirtualService(_) => ResourceKind::VirtualService,
            Self::Gateway(_) => ResourceKind::Gateway,
        }
    }

    /// Shared object metadata.
    #[must_use]
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(d) => &d.metadata,
            Self::VirtualService(vs) => &vs.metadata,
            Self::Gateway(gw) => &gw.metadata,
        }
    }

    /// Mutable object metadata.
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(d) => &mut d.metadata,
            Self::VirtualService(vs) => &mut vs.metadata,
            Self::Gateway(gw) => &mut gw.metadata,
        }
    }

    /// Object name; empty when the metadata carries none.
    #[must_use]
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Object namespace; empty when the metadata carries none.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Object labels, or an empty map when none are set.
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }

    /// Mutable label map, created on first use.
    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.metadata_mut().labels.get_or_insert_with(BTreeMap::new)
    }

    /// Mutable annotation map, created on first use.
    pub fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.metadata_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
    }

    /// Borrow the wrapped workload, if this is one.
    #[must_use]
    pub fn as_deployment(&self) -> Option<&Deployment> {
        match self {
            Self::Deployment(d) => Some(d),
            _ => None,
        }
    }

    /// Unwrap into a workload, if this is one.
    #[must_use]
    pub fn into_deployment(self) -> Option<Deployment> {
        match self {
            Self::Deployment(d) => Some(d),
            _ => None,
        }
    }

    /// Unwrap into a mesh route object, if this is one.
    #[must_use]
    pub fn into_virtual_service(self) -> Option<VirtualService> {
        match self {
            Self::VirtualService(vs) => Some(vs),
            _ => None,
        }
    }

    /// Unwrap into a mesh ingress, if this is one.
    #[must_use]
    pub fn into_gateway(self) -> Option<Gateway> {
        match self {
            Self::Gateway(gw) => Some(gw),
            _ => None,
        }
    }
}

impl From<Deployment> for ClusterObject {
    fn from(value: Deployment) -> Self {
        Self::Deployment(value)
    }
}

impl From<VirtualService> for ClusterObject {
    fn from(value: VirtualService) -> Self {
        Self::VirtualService(value)
    }
}

impl From<Gateway> for ClusterObject {
    fn from(value: Gateway) -> Self {
        Self::Gateway(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_matches_kubernetes_spelling() {
        assert_eq!(ResourceKind::Deployment.to_string(), "Deployment");
        assert_eq!(ResourceKind::VirtualService.to_string(), "VirtualService");
        assert_eq!(ResourceKind::Gateway.to_string(), "Gateway");
    }

    #[test]
    fn labels_mut_creates_the_map() {
        let mut obj = ClusterObject::from(Deployment::default());
        assert!(obj.labels().is_empty());
        obj.labels_mut().insert("app".into(), "ratings".into());
        assert_eq!(obj.labels().get("app").map(String::as_str), Some("ratings"));
    }

    #[test]
    fn typed_unwrap_is_kind_checked() {
        let obj = ClusterObject::from(Deployment::default());
        assert_eq!(obj.kind(), ResourceKind::Deployment);
        assert!(obj.clone().into_virtual_service().is_none());
        assert!(obj.into_deployment().is_some());
    }
}
