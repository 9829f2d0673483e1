//! The Locator/Mutator/Revertor seam.
//!
//! Each resource kind the engine can touch registers a [`Manipulator`]:
//! `locate` consults the cluster to resolve a ref (or to enrich it with
//! auxiliary targets), `mutate` applies the session's intent, `revert`
//! undoes exactly what the ref's ledger records. The registry order is
//! significant: locators run before any mutator, mutators run in
//! registration order (gateway before mesh routes, so routes can consume
//! gateway-published hosts), and revertors run in reverse.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::client::ClientError;
use crate::model::Ref;
use crate::resources::ResourceKind;
use crate::session::SessionContext;
use crate::template::{TemplateEngine, TemplateError};

pub mod deployment;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod gateway;
pub mod virtualservice;

pub use deployment::DeploymentManipulator;
pub use gateway::GatewayManipulator;
pub use virtualservice::VirtualServiceManipulator;

/// A single per-resource failure, wrapped with enough context to read in a
/// session's event stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManipulateError {
    /// No HTTP rule routes the target host, so there is nothing to fork
    /// the traffic off of. Retried once the user adds a matching rule.
    #[error("route not found for host {host}")]
    RouteNotFound {
        /// The host no rule targets.
        host: String,
    },

    /// A cluster call failed.
    #[error("failed to {verb} {kind} {name}: {source}")]
    Resource {
        /// What was being attempted.
        verb: &'static str,
        /// Resource kind.
        kind: ResourceKind,
        /// Resource name.
        name: String,
        /// Underlying client failure.
        #[source]
        source: ClientError,
    },

    /// The template engine refused to render a fork; no partial object is
    /// created.
    #[error("failed to render fork of {name}: {source}")]
    Template {
        /// Workload being forked.
        name: String,
        /// Underlying engine failure.
        #[source]
        source: TemplateError,
    },
}

/// Combined per-resource failures from one pass over a ref.
///
/// Mutators and revertors keep going when one resource fails so a single
/// broken object does not strand the rest; everything that went wrong is
/// collected here and surfaced at once.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<ManipulateError>,
}

impl AggregateError {
    /// Record one failure.
    pub fn push(&mut self, error: ManipulateError) {
        self.errors.push(error);
    }

    /// Fold another aggregate into this one.
    pub fn merge(&mut self, other: AggregateError) {
        self.errors.extend(other.errors);
    }

    /// The collected failures.
    #[must_use]
    pub fn errors(&self) -> &[ManipulateError] {
        &self.errors
    }

    /// Whether anything failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok` when nothing failed, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource failure(s): ", self.errors.len())?;
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl From<ManipulateError> for AggregateError {
    fn from(error: ManipulateError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

/// The three phases of handling one resource kind within a reconcile.
#[async_trait]
pub trait Manipulator: Send + Sync {
    /// The cluster kind this manipulator reads and writes.
    fn kind(&self) -> ResourceKind;

    /// Whether a successful `locate` claims the ref as this kind. A ref
    /// resolves to exactly one claiming kind per reconcile; auxiliary
    /// manipulators (mesh routes, gateways) only enrich targets.
    fn resolves_ref(&self) -> bool {
        false
    }

    /// Consult the cluster to decide whether `target` involves this kind;
    /// on a match, append located resources to the ref.
    async fn locate(&self, ctx: &SessionContext, target: &mut Ref) -> bool;

    /// Apply the session's intent for this kind, recording every cluster
    /// write on the ref's ledger before returning.
    async fn mutate(&self, ctx: &SessionContext, target: &mut Ref) -> Result<(), AggregateError>;

    /// Undo what the ref's ledger records for this kind, removing each
    /// entry as its mutation is confirmed gone.
    async fn revert(&self, ctx: &SessionContext, target: &mut Ref) -> Result<(), AggregateError>;
}

/// Ordered set of registered manipulators.
pub struct ManipulatorSet {
    items: Vec<Box<dyn Manipulator>>,
}

impl ManipulatorSet {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// The standard registry: workload first, then gateway, then mesh
    /// routes, so route mutation can consume both the clone's subset and
    /// the gateway-published hosts.
    #[must_use]
    pub fn with_defaults(engine: Arc<dyn TemplateEngine>) -> Self {
        let mut set = Self::new();
        set.register(Box::new(DeploymentManipulator::new(engine)));
        set.register(Box::new(GatewayManipulator));
        set.register(Box::new(VirtualServiceManipulator));
        set
    }

    /// Append a manipulator; order of registration is execution order.
    pub fn register(&mut self, manipulator: Box<dyn Manipulator>) {
        self.items.push(manipulator);
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Manipulator> {
        self.items.iter().map(AsRef::as_ref)
    }

    /// Iterate in reverse registration order; the revert path.
    pub fn iter_reversed(&self) -> impl Iterator<Item = &dyn Manipulator> {
        self.items.iter().rev().map(AsRef::as_ref)
    }

    /// Number of registered manipulators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for ManipulatorSet {
    fn default() -> Self {
        Self::new()
    }
}
