//! The `Session` controller loop.
//!
//! Wraps the core [`Orchestrator`] in a `kube` controller with a
//! finalizer: presence of a `Session` applies it, deletion reverts it, and
//! the object only disappears once its ledger has drained. Retries live
//! here, not in the engine: any reconcile error requeues after a short
//! delay, and settled sessions resync periodically to repair drift.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event};
use kube::runtime::watcher;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use sidetrack_core::model::{status_from_refs, Ref, Session};
use sidetrack_core::{AggregateError, ClusterClient, Orchestrator, SessionContext};

use crate::config::OperatorConfig;

/// Finalizer blocking session removal until revert completes.
pub const FINALIZER: &str = "sidetrack.dev/teardown";

/// Shared state handed to every reconcile.
pub struct Context {
    /// Raw client for `Session` api access and status patches.
    pub client: kube::Client,
    /// The engine's view of the cluster.
    pub cluster: Arc<dyn ClusterClient>,
    /// The session reconciliation engine.
    pub orchestrator: Orchestrator,
    /// Loop tunables.
    pub config: OperatorConfig,
}

/// Reconcile failures surfaced to the controller loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Applying the session left failed resources behind.
    #[error("failed to apply session {name}: {source}")]
    Apply {
        /// Session name.
        name: String,
        /// Per-resource failures.
        #[source]
        source: AggregateError,
    },

    /// Reverting the session left failed resources behind.
    #[error("failed to revert session {name}: {source}")]
    Revert {
        /// Session name.
        name: String,
        /// Per-resource failures.
        #[source]
        source: AggregateError,
    },

    /// Revert reported success but the ledger has not drained yet.
    #[error("session {0} still has recorded mutations to revert")]
    RevertIncomplete(String),

    /// The status subresource could not be written.
    #[error("failed to publish session status: {0}")]
    Status(#[source] kube::Error),

    /// The session object carries no namespace.
    #[error("session {0} has no namespace")]
    MissingNamespace(String),

    /// Finalizer add/remove bookkeeping failed.
    #[error("finalizer bookkeeping failed: {0}")]
    Finalizer(String),
}

/// Watch sessions until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let sessions: Api<Session> = match &ctx.config.namespace {
        Some(namespace) => Api::namespaced(ctx.client.clone(), namespace),
        None => Api::all(ctx.client.clone()),
    };

    Controller::new(sessions, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|outcome| async move {
            match outcome {
                Ok((session, _)) => debug!(session = %session.name, "reconciled"),
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
        })
        .await;
}

async fn reconcile(session: Arc<Session>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(name.clone()))?;
    let sessions: Api<Session> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&sessions, FINALIZER, session, |event| async {
        match event {
            Event::Apply(session) => apply(&session, &ctx).await,
            Event::Cleanup(session) => cleanup(&session, &ctx).await,
        }
    })
    .await
    .map_err(|err| match err {
        FinalizerError::ApplyFailed(err) | FinalizerError::CleanupFailed(err) => err,
        other => Error::Finalizer(other.to_string()),
    })
}

async fn apply(session: &Session, ctx: &Context) -> Result<Action, Error> {
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(name.clone()))?;
    info!(session = %name, namespace = %namespace, "applying session");

    let session_ctx = SessionContext::new(
        Arc::clone(&ctx.cluster),
        namespace.clone(),
        name.clone(),
        session.spec.route_for(&name),
    );
    let mut refs = session.build_refs();
    let outcome = ctx.orchestrator.apply(&session_ctx, &mut refs).await;

    // The ledger is published even when resources failed; it is both the
    // user-visible status and the next reconcile's revert source.
    publish_status(ctx, &namespace, &name, &refs).await?;

    match outcome {
        Ok(()) => Ok(Action::requeue(Duration::from_secs(
            ctx.config.resync_seconds,
        ))),
        Err(source) => Err(Error::Apply { name, source }),
    }
}

async fn cleanup(session: &Session, ctx: &Context) -> Result<Action, Error> {
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(name.clone()))?;
    info!(session = %name, namespace = %namespace, "reverting session");

    let session_ctx = SessionContext::new(
        Arc::clone(&ctx.cluster),
        namespace.clone(),
        name.clone(),
        session.spec.route_for(&name),
    );
    let mut refs = session.build_refs();
    let outcome = ctx.orchestrator.revert(&session_ctx, &mut refs).await;

    publish_status(ctx, &namespace, &name, &refs).await?;

    match outcome {
        Ok(()) if refs.iter().all(Ref::cleared) => Ok(Action::await_change()),
        Ok(()) => Err(Error::RevertIncomplete(name)),
        Err(source) => Err(Error::Revert { name, source }),
    }
}

async fn publish_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    refs: &[Ref],
) -> Result<(), Error> {
    let status = status_from_refs(refs);
    let sessions: Api<Session> = Api::namespaced(ctx.client.clone(), namespace);
    sessions
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await
        .map(|_| ())
        .map_err(Error::Status)
}

fn error_policy(session: Arc<Session>, err: &Error, ctx: Arc<Context>) -> Action {
    warn!(session = %session.name_any(), error = %err, "reconcile failed, requeuing");
    Action::requeue(Duration::from_secs(ctx.config.error_requeue_seconds))
}
