//! Value types describing what a session forks and what was done to the
//! cluster on its behalf.
//!
//! A [`Ref`] names one target to fork. Locators resolve it to concrete
//! [`LocatedResource`]s; mutators and revertors record every cluster write
//! as a [`ResourceStatus`] on the ref. The status list is the revert
//! ledger: it is the only input the revert path consults, never live
//! cluster state.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resources::ResourceKind;

mod session;

pub use session::{status_from_refs, RefLedger, RefSpec, Session, SessionSpec, SessionStatus};

/// Header injected when a session does not name its own route matcher.
pub const DEFAULT_ROUTE_HEADER: &str = "x-sidetrack-route";

/// Pod-template label the mesh keys workload subsets on.
pub const VERSION_LABEL: &str = "version";

/// Pod-template label naming the service a workload backs.
pub const APP_LABEL: &str = "app";

/// How a ref's forked variant comes into existence.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Clone the located workload into a session-suffixed variant.
    #[default]
    Clone,
    /// Route to a variant that is already running; no workload is created.
    Existing,
}

/// A kind-qualified target name.
///
/// The kind is optional: an unqualified name matches any workload kind a
/// registered locator supports, and the first locator to claim it wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KindName {
    /// Concrete kind the name is pinned to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Target object name.
    pub name: String,
}

impl KindName {
    /// An unqualified name, matching any supported kind.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            kind: None,
            name: name.into(),
        }
    }

    /// A name pinned to one kind.
    #[must_use]
    pub fn qualified(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            name: name.into(),
        }
    }

    /// Whether a locator for `kind` may claim this name.
    #[must_use]
    pub fn supports_kind(&self, kind: ResourceKind) -> bool {
        self.kind
            .as_deref()
            .map_or(true, |k| k.eq_ignore_ascii_case(kind.as_str()))
    }
}

impl fmt::Display for KindName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "{kind}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// The route matcher scoping a session's alternate path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Route {
    /// Matcher type; [`Route::HEADER_TYPE`] is the only type the mesh
    /// mutators act on.
    #[serde(rename = "type")]
    pub kind: String,
    /// Matcher name, e.g. the header name.
    pub name: String,
    /// Matcher value.
    pub value: String,
}

impl Route {
    /// The header matcher type.
    pub const HEADER_TYPE: &'static str = "header";

    /// A header route matcher.
    #[must_use]
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: Self::HEADER_TYPE.to_string(),
            name: name.into(),
            value: value.into(),
        }
    }

    /// The default matcher for a session without an explicit one:
    /// `x-sidetrack-route: <session>`.
    #[must_use]
    pub fn for_session(session: &str) -> Self {
        Self::header(DEFAULT_ROUTE_HEADER, session)
    }

    /// Whether this matcher is header-typed.
    #[must_use]
    pub fn is_header(&self) -> bool {
        self.kind == Self::HEADER_TYPE
    }
}

/// A service hostname as it appears in mesh route destinations.
///
/// Matches the short name, the namespaced form, and the fully qualified
/// cluster-local form.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostName {
    /// Short service name.
    pub name: String,
    /// Namespace the service lives in, when known.
    pub namespace: Option<String>,
}

impl HostName {
    /// A hostname scoped to a namespace.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Whether `host` refers to this service, in short or qualified form.
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        if host == self.name {
            return true;
        }
        match &self.namespace {
            Some(ns) => {
                host == format!("{}.{ns}", self.name)
                    || host == format!("{}.{ns}.svc.cluster.local", self.name)
            }
            None => false,
        }
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{ns}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Immutable snapshot of a concrete resource a locator resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocatedResource {
    /// Resolved kind.
    pub kind: ResourceKind,
    /// Object name.
    pub name: String,
    /// Labels captured at locate time; for workloads these are the
    /// pod-template labels, for gateways the engine's own snapshot.
    pub labels: BTreeMap<String, String>,
}

impl LocatedResource {
    /// A located resource with its label snapshot.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            kind,
            name: name.into(),
            labels,
        }
    }
}

/// What a mutator did to one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StatusAction {
    /// The resource was only read; recorded for failed lookups.
    Located,
    /// The engine created the resource and owns it exclusively; revert
    /// deletes it.
    Created,
    /// The engine edited a shared resource in place; revert restores
    /// precisely the fields it added.
    Modified,
}

/// One ledger entry: a mutation (or failed attempt) against one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
    /// What was done.
    pub action: StatusAction,
    /// Whether the write landed; failed entries are retried next
    /// reconcile.
    pub success: bool,
    /// Extra bookkeeping, e.g. the hosts a gateway mutation added.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, String>,
    /// Failure detail for `success = false` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResourceStatus {
    /// A successful mutation record.
    #[must_use]
    pub fn success(kind: ResourceKind, name: impl Into<String>, action: StatusAction) -> Self {
        Self {
            kind,
            name: name.into(),
            action,
            success: true,
            props: BTreeMap::new(),
            message: None,
        }
    }

    /// A failed mutation record carrying its error message.
    #[must_use]
    pub fn failure(
        kind: ResourceKind,
        name: impl Into<String>,
        action: StatusAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            action,
            success: false,
            props: BTreeMap::new(),
            message: Some(message.into()),
        }
    }

    /// Attach a bookkeeping prop.
    #[must_use]
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }
}

/// One target to fork inside a session.
#[derive(Clone, Debug)]
pub struct Ref {
    /// What to fork.
    pub kind_name: KindName,
    /// How to fork it.
    pub strategy: Strategy,
    /// Opaque parameters forwarded to the template engine.
    pub args: BTreeMap<String, String>,
    targets: Vec<LocatedResource>,
    statuses: Vec<ResourceStatus>,
}

impl Ref {
    /// A fresh ref with an empty ledger.
    #[must_use]
    pub fn new(kind_name: KindName, strategy: Strategy, args: BTreeMap<String, String>) -> Self {
        Self {
            kind_name,
            strategy,
            args,
            targets: Vec::new(),
            statuses: Vec::new(),
        }
    }

    /// A ref rehydrated from a previously recorded ledger.
    #[must_use]
    pub fn with_statuses(
        kind_name: KindName,
        strategy: Strategy,
        args: BTreeMap<String, String>,
        statuses: Vec<ResourceStatus>,
    ) -> Self {
        Self {
            kind_name,
            strategy,
            args,
            targets: Vec::new(),
            statuses,
        }
    }

    /// Record a located target.
    pub fn add_target(&mut self, target: LocatedResource) {
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
    }

    /// All located targets.
    #[must_use]
    pub fn targets(&self) -> &[LocatedResource] {
        &self.targets
    }

    /// Located targets passing a predicate.
    pub fn targets_matching(
        &self,
        predicate: impl Fn(&LocatedResource) -> bool,
    ) -> Vec<&LocatedResource> {
        self.targets.iter().filter(|t| predicate(t)).collect()
    }

    /// Located targets of one kind.
    #[must_use]
    pub fn targets_of_kind(&self, kind: ResourceKind) -> Vec<&LocatedResource> {
        self.targets_matching(|t| t.kind == kind)
    }

    /// The first located workload target.
    #[must_use]
    pub fn workload_target(&self) -> Option<&LocatedResource> {
        self.targets.iter().find(|t| t.kind == ResourceKind::Deployment)
    }

    /// Whether any locator resolved this ref.
    #[must_use]
    pub fn located(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Record a ledger entry, replacing any previous entry for the same
    /// kind and name.
    pub fn add_status(&mut self, status: ResourceStatus) {
        self.statuses
            .retain(|s| !(s.kind == status.kind && s.name == status.name));
        self.statuses.push(status);
    }

    /// Drop the ledger entry for one resource; revertors call this once a
    /// mutation has been undone.
    pub fn remove_status(&mut self, kind: ResourceKind, name: &str) {
        self.statuses.retain(|s| !(s.kind == kind && s.name == name));
    }

    /// Drop failed entries of one kind. Mutators call this at entry so a
    /// stale failure does not outlive a successful retry; successful
    /// entries are only ever removed by revertors.
    pub fn clear_failures(&mut self, kind: ResourceKind) {
        self.statuses.retain(|s| s.kind != kind || s.success);
    }

    /// The full ledger.
    #[must_use]
    pub fn statuses(&self) -> &[ResourceStatus] {
        &self.statuses
    }

    /// Ledger entries of one kind, cloned so revertors can edit the ledger
    /// while walking them.
    #[must_use]
    pub fn statuses_of_kind(&self, kind: ResourceKind) -> Vec<ResourceStatus> {
        self.statuses
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }

    /// Whether the ledger has drained; a ref is only cleared once every
    /// recorded mutation has been reverted.
    #[must_use]
    pub fn cleared(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Service hostnames the located workload targets answer to, derived
    /// from the pod-template `app` label with the workload name as
    /// fallback.
    #[must_use]
    pub fn hostnames(&self, namespace: &str) -> Vec<HostName> {
        let mut hosts: Vec<HostName> = Vec::new();
        for target in self.targets_of_kind(ResourceKind::Deployment) {
            let name = target
                .labels
                .get(APP_LABEL)
                .cloned()
                .unwrap_or_else(|| target.name.clone());
            let host = HostName::new(name, namespace);
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }

    /// The `version` label of the located workload, when present.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.workload_target()
            .and_then(|t| t.labels.get(VERSION_LABEL))
            .map(String::as_str)
    }

    /// The subset and name suffix derived for this session's fork:
    /// `<version>-<session>`, or just `<session>` when the workload
    /// carries no version label.
    #[must_use]
    pub fn new_version(&self, session: &str) -> String {
        match self.version() {
            Some(version) if !version.is_empty() => format!("{version}-{session}"),
            _ => session.to_string(),
        }
    }

    /// The subset the mesh mutators route the session's traffic to. A
    /// cloned fork routes to [`Ref::new_version`]; an existing variant
    /// routes to the subset it already runs as.
    #[must_use]
    pub fn route_version(&self, session: &str) -> String {
        match self.strategy {
            Strategy::Existing => self.version().unwrap_or_default().to_string(),
            Strategy::Clone => self.new_version(session),
        }
    }
}
