//! Per-session reconciliation driver.
//!
//! One [`Orchestrator::apply`] or [`Orchestrator::revert`] call is one
//! reconcile: locators first, then mutators in registry order (or
//! revertors in reverse). The driver never sleeps or retries; it records
//! per-resource outcomes on the refs and returns an aggregate error so the
//! surrounding controller loop re-invokes it until the ledger converges.

use std::sync::Arc;

use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::manipulate::{AggregateError, ManipulatorSet};
use crate::model::{Ref, Route};
use crate::template::TemplateEngine;

#[cfg(test)]
mod tests;

/// Per-reconciliation environment handed to every manipulator.
pub struct SessionContext {
    /// Cluster access.
    pub client: Arc<dyn ClusterClient>,
    /// Namespace the session operates in.
    pub namespace: String,
    /// Session name; the suffix of every derived name and subset.
    pub name: String,
    /// Route matcher scoping the session's alternate path.
    pub route: Route,
}

impl SessionContext {
    /// Assemble a reconcile context.
    #[must_use]
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        route: Route,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
            route,
        }
    }
}

/// Composes registered manipulators into the apply/revert pipeline.
pub struct Orchestrator {
    manipulators: ManipulatorSet,
}

impl Orchestrator {
    /// An orchestrator over an explicit registry.
    #[must_use]
    pub fn new(manipulators: ManipulatorSet) -> Self {
        Self { manipulators }
    }

    /// An orchestrator over the standard registry, rendering forks with
    /// `engine`.
    #[must_use]
    pub fn with_defaults(engine: Arc<dyn TemplateEngine>) -> Self {
        Self::new(ManipulatorSet::with_defaults(engine))
    }

    /// Drive the cluster toward the session's intent.
    ///
    /// All locators run before any mutator so mutators can depend on one
    /// another's targets. A ref resolves to the first claiming kind whose
    /// locator accepts it; a ref no locator claims is skipped entirely and
    /// reports no resources. Per-resource failures are aggregated, not
    /// short-circuited: every ref still gets its full pass.
    pub async fn apply(
        &self,
        ctx: &SessionContext,
        refs: &mut [Ref],
    ) -> Result<(), AggregateError> {
        for target in refs.iter_mut() {
            let mut resolved = false;
            for manipulator in self.manipulators.iter() {
                if resolved && manipulator.resolves_ref() {
                    continue;
                }
                if manipulator.locate(ctx, target).await && manipulator.resolves_ref() {
                    resolved = true;
                }
            }
            if !resolved {
                info!(session = %ctx.name, target = %target.kind_name,
                    "no registered kind claims the ref");
            }
        }

        let mut failures = AggregateError::default();
        for target in refs.iter_mut() {
            if !target.located() {
                continue;
            }
            for manipulator in self.manipulators.iter() {
                if let Err(err) = manipulator.mutate(ctx, target).await {
                    failures.merge(err);
                }
            }
        }
        failures.into_result()
    }

    /// Undo everything the refs' ledgers record, in reverse registry
    /// order. A ref is cleared only once every entry has drained; entries
    /// whose undo fails stay behind for the next reconcile.
    pub async fn revert(
        &self,
        ctx: &SessionContext,
        refs: &mut [Ref],
    ) -> Result<(), AggregateError> {
        let mut failures = AggregateError::default();
        for target in refs.iter_mut() {
            if target.cleared() {
                debug!(session = %ctx.name, target = %target.kind_name, "nothing to revert");
                continue;
            }
            for manipulator in self.manipulators.iter_reversed() {
                if let Err(err) = manipulator.revert(ctx, target).await {
                    failures.merge(err);
                }
            }
        }
        failures.into_result()
    }
}
