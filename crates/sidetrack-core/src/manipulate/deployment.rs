//! Workload (Deployment) manipulation: locate the fork target, clone it
//! under the session's derived version, delete the clone on revert.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::model::{LocatedResource, Ref, ResourceStatus, StatusAction, Strategy};
use crate::reference;
use crate::resources::{ClusterObject, ResourceKind};
use crate::session::SessionContext;
use crate::template::TemplateEngine;

use super::{AggregateError, ManipulateError, Manipulator};

/// Clones located workloads through the template engine.
pub struct DeploymentManipulator {
    engine: Arc<dyn TemplateEngine>,
}

impl DeploymentManipulator {
    /// A workload manipulator rendering forks with `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn TemplateEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Manipulator for DeploymentManipulator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Deployment
    }

    fn resolves_ref(&self) -> bool {
        true
    }

    async fn locate(&self, ctx: &SessionContext, target: &mut Ref) -> bool {
        if !target.kind_name.supports_kind(ResourceKind::Deployment) {
            return false;
        }
        match ctx
            .client
            .get(ResourceKind::Deployment, &ctx.namespace, &target.kind_name.name)
            .await
        {
            Ok(object) => {
                let labels = object
                    .as_deployment()
                    .and_then(|d| d.spec.as_ref())
                    .and_then(|spec| spec.template.metadata.as_ref())
                    .and_then(|meta| meta.labels.clone())
                    .unwrap_or_default();
                debug!(session = %ctx.name, name = %object.name(), "located deployment");
                target.add_target(LocatedResource::new(
                    ResourceKind::Deployment,
                    object.name(),
                    labels,
                ));
                true
            }
            // Not a deployment; another kind may still claim the ref.
            Err(err) if err.is_not_found() => false,
            Err(err) => {
                warn!(session = %ctx.name, name = %target.kind_name.name, error = %err,
                    "could not get deployment");
                false
            }
        }
    }

    async fn mutate(&self, ctx: &SessionContext, target: &mut Ref) -> Result<(), AggregateError> {
        target.clear_failures(ResourceKind::Deployment);
        let Some(workload) = target.workload_target().cloned() else {
            return Ok(());
        };
        if target.strategy == Strategy::Existing {
            return Ok(());
        }

        let object = match ctx
            .client
            .get(ResourceKind::Deployment, &ctx.namespace, &workload.name)
            .await
        {
            Ok(object) => object,
            // Vanished since locate; the next reconcile re-locates.
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => {
                return Err(ManipulateError::Resource {
                    verb: "get",
                    kind: ResourceKind::Deployment,
                    name: workload.name.clone(),
                    source: err,
                }
                .into())
            }
        };
        let Some(original) = object.into_deployment() else {
            return Ok(());
        };

        let new_version = target.new_version(&ctx.name);
        let derived_name = format!("{}-{}", workload.name, ctx.name);

        let mut clone = match self.render_clone(target, &original, &new_version) {
            Ok(clone) => clone,
            Err(err) => {
                // No partial object exists; record the failed create so the
                // ledger shows why the fork is missing.
                target.add_status(ResourceStatus::failure(
                    ResourceKind::Deployment,
                    &derived_name,
                    StatusAction::Created,
                    err.to_string(),
                ));
                return Err(err.into());
            }
        };
        clone.metadata.namespace = Some(ctx.namespace.clone());
        reference::add(&mut clone.metadata, &ctx.namespace, &ctx.name);
        let clone_name = clone
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| derived_name.clone());

        if ctx
            .client
            .get(ResourceKind::Deployment, &ctx.namespace, &clone_name)
            .await
            .is_ok()
        {
            target.add_status(ResourceStatus::success(
                ResourceKind::Deployment,
                &clone_name,
                StatusAction::Created,
            ));
            return Ok(());
        }

        match ctx.client.create(&ClusterObject::from(clone)).await {
            Ok(()) => {
                info!(session = %ctx.name, name = %clone_name, "cloned deployment");
                target.add_status(ResourceStatus::success(
                    ResourceKind::Deployment,
                    &clone_name,
                    StatusAction::Created,
                ));
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                target.add_status(ResourceStatus::success(
                    ResourceKind::Deployment,
                    &clone_name,
                    StatusAction::Created,
                ));
                Ok(())
            }
            Err(err) => {
                warn!(session = %ctx.name, name = %clone_name, error = %err,
                    "failed to create cloned deployment");
                target.add_status(ResourceStatus::failure(
                    ResourceKind::Deployment,
                    &clone_name,
                    StatusAction::Created,
                    err.to_string(),
                ));
                Err(ManipulateError::Resource {
                    verb: "create",
                    kind: ResourceKind::Deployment,
                    name: clone_name,
                    source: err,
                }
                .into())
            }
        }
    }

    async fn revert(&self, ctx: &SessionContext, target: &mut Ref) -> Result<(), AggregateError> {
        let mut failures = AggregateError::default();
        for status in target.statuses_of_kind(ResourceKind::Deployment) {
            let object = match ctx
                .client
                .get(ResourceKind::Deployment, &ctx.namespace, &status.name)
                .await
            {
                Ok(object) => object,
                Err(err) if err.is_not_found() => {
                    // Already gone, nothing to clean.
                    target.remove_status(ResourceKind::Deployment, &status.name);
                    continue;
                }
                Err(err) => {
                    target.add_status(ResourceStatus::failure(
                        ResourceKind::Deployment,
                        &status.name,
                        status.action,
                        err.to_string(),
                    ));
                    failures.push(ManipulateError::Resource {
                        verb: "get",
                        kind: ResourceKind::Deployment,
                        name: status.name.clone(),
                        source: err,
                    });
                    continue;
                }
            };

            // Detach the back-reference before the delete so concurrent
            // observers see the object released first.
            let mut object = object;
            reference::remove(object.metadata_mut());
            if let Err(err) = ctx.client.update(&object).await {
                if !err.is_not_found() {
                    target.add_status(ResourceStatus::failure(
                        ResourceKind::Deployment,
                        &status.name,
                        status.action,
                        err.to_string(),
                    ));
                    failures.push(ManipulateError::Resource {
                        verb: "update",
                        kind: ResourceKind::Deployment,
                        name: status.name.clone(),
                        source: err,
                    });
                    continue;
                }
            }

            match ctx
                .client
                .delete(ResourceKind::Deployment, &ctx.namespace, &status.name)
                .await
            {
                Ok(()) => {
                    info!(session = %ctx.name, name = %status.name, "deleted cloned deployment");
                    target.remove_status(ResourceKind::Deployment, &status.name);
                }
                Err(err) if err.is_not_found() => {
                    target.remove_status(ResourceKind::Deployment, &status.name);
                }
                Err(err) => {
                    warn!(session = %ctx.name, name = %status.name, error = %err,
                        "failed to delete cloned deployment");
                    target.add_status(ResourceStatus::failure(
                        ResourceKind::Deployment,
                        &status.name,
                        status.action,
                        err.to_string(),
                    ));
                    failures.push(ManipulateError::Resource {
                        verb: "delete",
                        kind: ResourceKind::Deployment,
                        name: status.name.clone(),
                        source: err,
                    });
                }
            }
        }
        failures.into_result()
    }
}

impl DeploymentManipulator {
    fn render_clone(
        &self,
        target: &Ref,
        original: &k8s_openapi::api::apps::v1::Deployment,
        new_version: &str,
    ) -> Result<k8s_openapi::api::apps::v1::Deployment, ManipulateError> {
        let name = original.metadata.name.clone().unwrap_or_default();
        let wrap = |source| ManipulateError::Template {
            name: name.clone(),
            source,
        };

        let bytes = serde_json::to_vec(original).map_err(|err| wrap(err.into()))?;
        let rendered = self
            .engine
            .run(target.strategy, &bytes, new_version, &target.args)
            .map_err(wrap)?;
        serde_json::from_slice(&rendered).map_err(|err| wrap(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::client::{ClusterClient, MemoryClient};
    use crate::manipulate::fixtures::{context, locate_workload_ref, workload, NS};
    use crate::model::{KindName, Strategy};
    use crate::template::JsonEngine;

    use super::*;

    fn manipulator() -> DeploymentManipulator {
        DeploymentManipulator::new(Arc::new(JsonEngine))
    }

    #[tokio::test]
    async fn locate_misses_an_absent_workload() {
        let client = Arc::new(MemoryClient::new());
        let ctx = context(client, "demo");
        let mut target = Ref::new(KindName::named("nope"), Strategy::Clone, BTreeMap::new());
        assert!(!manipulator().locate(&ctx, &mut target).await);
        assert!(target.targets().is_empty());
    }

    #[tokio::test]
    async fn locate_captures_pod_template_labels() {
        let client = Arc::new(MemoryClient::new());
        client.seed(workload("ratings", "v1")).await;
        let ctx = context(client, "demo");
        let mut target = Ref::new(KindName::named("ratings"), Strategy::Clone, BTreeMap::new());

        assert!(manipulator().locate(&ctx, &mut target).await);
        assert_eq!(target.version(), Some("v1"));
        assert_eq!(target.hostnames(NS).len(), 1);
    }

    #[tokio::test]
    async fn mutate_clones_under_the_session_name() {
        let client = Arc::new(MemoryClient::new());
        client.seed(workload("ratings", "v1")).await;
        let ctx = context(Arc::clone(&client), "demo");
        let mut target = locate_workload_ref(&manipulator(), &ctx, "ratings").await;

        manipulator().mutate(&ctx, &mut target).await.unwrap();

        let clone = client
            .get(ResourceKind::Deployment, NS, "ratings-demo")
            .await
            .unwrap();
        let clone = clone.as_deployment().cloned().unwrap();
        let labels = clone
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .labels
            .unwrap();
        assert_eq!(labels.get("version").map(String::as_str), Some("v1-demo"));
        assert_eq!(
            reference::get(&clone.metadata),
            Some((NS.to_string(), "demo".to_string()))
        );

        assert_eq!(target.statuses().len(), 1);
        let status = &target.statuses()[0];
        assert_eq!(status.name, "ratings-demo");
        assert_eq!(status.action, StatusAction::Created);
        assert!(status.success);
    }

    #[tokio::test]
    async fn mutate_twice_is_idempotent() {
        let client = Arc::new(MemoryClient::new());
        client.seed(workload("ratings", "v1")).await;
        let ctx = context(Arc::clone(&client), "demo");
        let mut target = locate_workload_ref(&manipulator(), &ctx, "ratings").await;

        manipulator().mutate(&ctx, &mut target).await.unwrap();
        let first = client.snapshot().await.len();
        manipulator().mutate(&ctx, &mut target).await.unwrap();

        assert_eq!(client.snapshot().await.len(), first);
        assert_eq!(target.statuses().len(), 1);
    }

    #[tokio::test]
    async fn existing_strategy_creates_nothing() {
        let client = Arc::new(MemoryClient::new());
        client.seed(workload("ratings-v2", "v2")).await;
        let ctx = context(Arc::clone(&client), "demo");
        let mut target = Ref::new(
            KindName::named("ratings-v2"),
            Strategy::Existing,
            BTreeMap::new(),
        );
        assert!(manipulator().locate(&ctx, &mut target).await);

        manipulator().mutate(&ctx, &mut target).await.unwrap();

        assert!(target.statuses().is_empty());
        assert_eq!(client.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn revert_deletes_the_clone_and_clears_the_ledger() {
        let client = Arc::new(MemoryClient::new());
        client.seed(workload("ratings", "v1")).await;
        let ctx = context(Arc::clone(&client), "demo");
        let mut target = locate_workload_ref(&manipulator(), &ctx, "ratings").await;
        manipulator().mutate(&ctx, &mut target).await.unwrap();

        manipulator().revert(&ctx, &mut target).await.unwrap();

        assert!(target.cleared());
        let err = client
            .get(ResourceKind::Deployment, NS, "ratings-demo")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn revert_of_a_vanished_clone_still_clears_the_ledger() {
        let client = Arc::new(MemoryClient::new());
        let ctx = context(client, "demo");
        let mut target = Ref::with_statuses(
            KindName::named("ratings"),
            Strategy::Clone,
            BTreeMap::new(),
            vec![ResourceStatus::success(
                ResourceKind::Deployment,
                "ratings-demo",
                StatusAction::Created,
            )],
        );

        manipulator().revert(&ctx, &mut target).await.unwrap();
        assert!(target.cleared());
    }
}
