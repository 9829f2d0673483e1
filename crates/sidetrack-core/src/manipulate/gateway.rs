//! Gateway manipulation: admit a `<session>.<host>` variant for every
//! host a connected gateway exposes.
//!
//! Bookkeeping is additive-only. The `ike.hosts` annotation records the
//! exact set of hosts this engine has added across all sessions, with
//! set-union semantics so concurrent sessions compose; revert removes
//! precisely the hosts carrying this session's name prefix and deletes the
//! annotation key once the set drains.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::model::{LocatedResource, Ref, ResourceStatus, StatusAction};
use crate::reference;
use crate::resources::{ClusterObject, Gateway, ResourceKind, VirtualService};
use crate::session::SessionContext;

use super::virtualservice::routes_to;
use super::{AggregateError, ManipulateError, Manipulator};

/// Annotation tracking the hosts this engine has added to a gateway,
/// comma-separated. An empty string reads as the empty set.
pub const HOSTS_ANNOTATION: &str = "ike.hosts";

/// Exposes session hosts on mesh ingress gateways.
pub struct GatewayManipulator;

#[async_trait]
impl Manipulator for GatewayManipulator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Gateway
    }

    async fn locate(&self, ctx: &SessionContext, target: &mut Ref) -> bool {
        let hostnames = target.hostnames(&ctx.namespace);
        if hostnames.is_empty() {
            return false;
        }
        let version = target.version().unwrap_or_default().to_string();

        let services = match ctx
            .client
            .list(ResourceKind::VirtualService, &ctx.namespace)
            .await
        {
            Ok(objects) => objects
                .into_iter()
                .filter_map(ClusterObject::into_virtual_service)
                .collect::<Vec<VirtualService>>(),
            Err(err) => {
                warn!(session = %ctx.name, error = %err, "could not list virtual services");
                return false;
            }
        };

        let mut names: Vec<String> = Vec::new();
        for vs in &services {
            if vs.spec.gateways.is_empty() {
                continue;
            }
            if hostnames.iter().any(|host| routes_to(vs, host, &version)) {
                for gateway in &vs.spec.gateways {
                    if !names.contains(gateway) {
                        names.push(gateway.clone());
                    }
                }
            }
        }

        let mut found = false;
        for name in names {
            match ctx.client.get(ResourceKind::Gateway, &ctx.namespace, &name).await {
                Ok(object) => {
                    let Some(gateway) = object.into_gateway() else {
                        continue;
                    };
                    // Snapshot the base (non-session) hosts so the route
                    // mutator can derive `<session>.<host>` entries in this
                    // same reconcile.
                    let base = base_hosts(&gateway);
                    debug!(session = %ctx.name, name = %name, "located gateway");
                    target.add_target(LocatedResource::new(
                        ResourceKind::Gateway,
                        &name,
                        BTreeMap::from([(HOSTS_ANNOTATION.to_string(), base.join(","))]),
                    ));
                    found = true;
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    warn!(session = %ctx.name, name = %name, error = %err, "could not get gateway");
                }
            }
        }
        found
    }

    async fn mutate(&self, ctx: &SessionContext, target: &mut Ref) -> Result<(), AggregateError> {
        target.clear_failures(ResourceKind::Gateway);
        let gateways: Vec<String> = target
            .targets_of_kind(ResourceKind::Gateway)
            .iter()
            .map(|t| t.name.clone())
            .collect();

        let mut failures = AggregateError::default();
        for name in gateways {
            let object = match ctx.client.get(ResourceKind::Gateway, &ctx.namespace, &name).await {
                Ok(object) => object,
                Err(err) => {
                    target.add_status(ResourceStatus::failure(
                        ResourceKind::Gateway,
                        &name,
                        StatusAction::Located,
                        err.to_string(),
                    ));
                    failures.push(ManipulateError::Resource {
                        verb: "get",
                        kind: ResourceKind::Gateway,
                        name: name.clone(),
                        source: err,
                    });
                    continue;
                }
            };
            let Some(gateway) = object.into_gateway() else {
                continue;
            };

            let (mut exposed, added) = expose_session_hosts(&ctx.name, gateway);
            reference::add(&mut exposed.metadata, &ctx.namespace, &ctx.name);
            match ctx.client.update(&ClusterObject::from(exposed)).await {
                Ok(()) => {
                    info!(session = %ctx.name, name = %name, hosts = %added.join(","),
                        "exposed session hosts on gateway");
                    target.add_status(
                        ResourceStatus::success(
                            ResourceKind::Gateway,
                            &name,
                            StatusAction::Modified,
                        )
                        .with_prop("hosts", added.join(",")),
                    );
                }
                Err(err) => {
                    warn!(session = %ctx.name, name = %name, error = %err, "failed to update gateway");
                    target.add_status(ResourceStatus::failure(
                        ResourceKind::Gateway,
                        &name,
                        StatusAction::Modified,
                        err.to_string(),
                    ));
                    failures.push(ManipulateError::Resource {
                        verb: "update",
                        kind: ResourceKind::Gateway,
                        name,
                        source: err,
                    });
                }
            }
        }
        failures.into_result()
    }

    async fn revert(&self, ctx: &SessionContext, target: &mut Ref) -> Result<(), AggregateError> {
        let mut failures = AggregateError::default();
        for status in target.statuses_of_kind(ResourceKind::Gateway) {
            let object = match ctx
                .client
                .get(ResourceKind::Gateway, &ctx.namespace, &status.name)
                .await
            {
                Ok(object) => object,
                Err(err) if err.is_not_found() => {
                    // Already gone, nothing to clean.
                    target.remove_status(ResourceKind::Gateway, &status.name);
                    continue;
                }
                Err(err) => {
                    target.add_status(ResourceStatus::failure(
                        ResourceKind::Gateway,
                        &status.name,
                        status.action,
                        err.to_string(),
                    ));
                    failures.push(ManipulateError::Resource {
                        verb: "get",
                        kind: ResourceKind::Gateway,
                        name: status.name.clone(),
                        source: err,
                    });
                    continue;
                }
            };
            let Some(gateway) = object.into_gateway() else {
                target.remove_status(ResourceKind::Gateway, &status.name);
                continue;
            };

            let mut restored = strip_session_hosts(&ctx.name, gateway);
            reference::remove(&mut restored.metadata);
            match ctx.client.update(&ClusterObject::from(restored)).await {
                Ok(()) => {
                    info!(session = %ctx.name, name = %status.name, "removed session hosts from gateway");
                    target.remove_status(ResourceKind::Gateway, &status.name);
                }
                Err(err) => {
                    warn!(session = %ctx.name, name = %status.name, error = %err,
                        "failed to restore gateway");
                    target.add_status(ResourceStatus::failure(
                        ResourceKind::Gateway,
                        &status.name,
                        status.action,
                        err.to_string(),
                    ));
                    failures.push(ManipulateError::Resource {
                        verb: "update",
                        kind: ResourceKind::Gateway,
                        name: status.name.clone(),
                        source: err,
                    });
                }
            }
        }
        failures.into_result()
    }
}

/// Hosts the engine has recorded on a gateway, with the empty annotation
/// reading as the empty set.
fn annotation_hosts(meta: &ObjectMeta) -> Vec<String> {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(HOSTS_ANNOTATION))
        .map(|value| {
            value
                .split(',')
                .filter(|host| !host.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The hosts a gateway exposes on its own, excluding session-derived ones
/// the engine has recorded.
fn base_hosts(gateway: &Gateway) -> Vec<String> {
    let session_hosts = annotation_hosts(&gateway.metadata);
    let mut base: Vec<String> = Vec::new();
    for server in &gateway.spec.servers {
        for host in &server.hosts {
            if !session_hosts.contains(host) && !base.contains(host) {
                base.push(host.clone());
            }
        }
    }
    base
}

/// Add `<session>.<host>` for every configured host, returning the mutated
/// gateway and the session hosts now in effect. Re-running for the same
/// session changes nothing but still reports its hosts, and previously
/// recorded hosts that drifted off a server are repaired.
fn expose_session_hosts(session: &str, mut gateway: Gateway) -> (Gateway, Vec<String>) {
    let mut existing = annotation_hosts(&gateway.metadata);
    let mut added: Vec<String> = Vec::new();

    for server in &mut gateway.spec.servers {
        let mut hosts = server.hosts.clone();
        for host in &server.hosts {
            let session_host = format!("{session}.{host}");
            if !existing.contains(host) && !existing.contains(&session_host) {
                existing.push(session_host.clone());
                hosts.push(session_host.clone());
            }
            if existing.contains(&session_host) && !added.contains(&session_host) {
                added.push(session_host);
            }
        }
        for known in &existing {
            let base = known
                .split_once('.')
                .map(|(_, rest)| rest.to_string())
                .unwrap_or_default();
            if !hosts.contains(known) && hosts.contains(&base) {
                hosts.push(known.clone());
            }
        }
        server.hosts = hosts;
    }

    gateway
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(HOSTS_ANNOTATION.to_string(), existing.join(","));
    (gateway, added)
}

/// Remove exactly the hosts this session added: recorded in the
/// annotation and carrying the `<session>.` prefix.
fn strip_session_hosts(session: &str, mut gateway: Gateway) -> Gateway {
    let mut existing = annotation_hosts(&gateway.metadata);
    let prefix = format!("{session}.");
    let mut removed: Vec<String> = Vec::new();

    for server in &mut gateway.spec.servers {
        let mut kept: Vec<String> = Vec::new();
        for host in server.hosts.clone() {
            if existing.contains(&host) && host.starts_with(&prefix) {
                removed.push(host);
            } else {
                kept.push(host);
            }
        }
        server.hosts = kept;
    }

    existing.retain(|host| !removed.contains(host));
    if let Some(annotations) = gateway.metadata.annotations.as_mut() {
        if existing.is_empty() {
            annotations.remove(HOSTS_ANNOTATION);
        } else {
            annotations.insert(HOSTS_ANNOTATION.to_string(), existing.join(","));
        }
        if annotations.is_empty() {
            gateway.metadata.annotations = None;
        }
    }
    gateway
}
