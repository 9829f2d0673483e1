//! The `Session` custom resource.
//!
//! Presence of a `Session` means "apply"; deletion means "revert". The
//! status subresource carries the per-ref resource ledger, which doubles
//! as the revert plan: the driver rehydrates [`Ref`]s from it on every
//! reconcile.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{KindName, Ref, ResourceStatus, Route, Strategy};

/// Spec of a [`Session`]: a route matcher plus the targets to fork.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sidetrack.dev",
    version = "v1alpha1",
    kind = "Session",
    namespaced,
    status = "SessionStatus",
    shortname = "st"
)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    /// Route matcher scoping the session's alternate path; defaults to a
    /// header carrying the session name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    /// Targets to fork.
    #[serde(default)]
    pub refs: Vec<RefSpec>,
}

impl SessionSpec {
    /// The effective route matcher for a session named `session`.
    #[must_use]
    pub fn route_for(&self, session: &str) -> Route {
        self.route
            .clone()
            .unwrap_or_else(|| Route::for_session(session))
    }
}

/// One declared fork target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefSpec {
    /// Kind-qualified target name.
    #[serde(flatten)]
    pub name: KindName,
    /// Fork strategy.
    #[serde(default)]
    pub strategy: Strategy,
    /// Opaque parameters forwarded to the template engine.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

/// Observed state of a [`Session`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Whether every recorded mutation landed.
    #[serde(default)]
    pub ready: bool,
    /// Session hosts published on mesh gateways.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    /// Per-ref resource ledgers; the revert source of truth.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<RefLedger>,
}

/// The recorded ledger of one ref.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefLedger {
    /// The ref's target name, matching [`RefSpec`]'s.
    pub name: String,
    /// Strategy the mutations were applied under. Revert selects its
    /// semantics from this, so it must survive the ref being dropped from
    /// the spec.
    #[serde(default)]
    pub strategy: Strategy,
    /// Every mutation recorded against the cluster for this ref.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

impl Session {
    /// Rehydrate runtime refs from the spec plus the recorded ledger.
    ///
    /// Refs that only exist in the status (removed from the spec but not
    /// yet reverted) are kept so their mutations still drain.
    #[must_use]
    pub fn build_refs(&self) -> Vec<Ref> {
        let ledger = |name: &str| -> Vec<ResourceStatus> {
            self.status
                .as_ref()
                .map(|status| {
                    status
                        .refs
                        .iter()
                        .filter(|l| l.name == name)
                        .flat_map(|l| l.resources.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut refs: Vec<Ref> = self
            .spec
            .refs
            .iter()
            .map(|spec| {
                Ref::with_statuses(
                    spec.name.clone(),
                    spec.strategy,
                    spec.args.clone(),
                    ledger(&spec.name.name),
                )
            })
            .collect();

        if let Some(status) = &self.status {
            for stale in &status.refs {
                if !refs.iter().any(|r| r.kind_name.name == stale.name) {
                    refs.push(Ref::with_statuses(
                        KindName::named(stale.name.clone()),
                        stale.strategy,
                        BTreeMap::new(),
                        stale.resources.clone(),
                    ));
                }
            }
        }

        refs
    }
}

/// Summarize runtime refs back into a status, preserving the ledger.
#[must_use]
pub fn status_from_refs(refs: &[Ref]) -> SessionStatus {
    let ledgers: Vec<RefLedger> = refs
        .iter()
        .filter(|r| !r.statuses().is_empty())
        .map(|r| RefLedger {
            name: r.kind_name.name.clone(),
            strategy: r.strategy,
            resources: r.statuses().to_vec(),
        })
        .collect();

    let mut hosts: Vec<String> = Vec::new();
    for r in refs {
        for status in r.statuses() {
            if let Some(added) = status.props.get("hosts") {
                for host in added.split(',').filter(|h| !h.is_empty()) {
                    if !hosts.iter().any(|existing| existing == host) {
                        hosts.push(host.to_string());
                    }
                }
            }
        }
    }

    let ready = refs
        .iter()
        .all(|r| r.statuses().iter().all(|s| s.success));

    SessionStatus {
        ready,
        hosts,
        refs: ledgers,
    }
}
