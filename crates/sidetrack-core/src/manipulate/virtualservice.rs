//! Mesh route (VirtualService) manipulation.
//!
//! Two passes per located hostname:
//!
//! 1. **Gateway-connected routes** get a sibling object: the external host
//!    changes (`<session>.<host>`), so a new route object bound to the
//!    session hosts is created, its surviving rules rewritten to the
//!    session subset and every rule stamping the route header onto
//!    requests unconditionally.
//! 2. **Plain routes** are extended in place: a header-matched copy of
//!    each matching rule is prepended ahead of the general rule, routing
//!    matched traffic to the session subset.
//!
//! Revert is ledger-driven: `Created` entries delete the sibling object,
//! `Modified` entries drop the injected rules from the shared one.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::model::{HostName, Ref, ResourceStatus, Route, StatusAction, Strategy};
use crate::reference;
use crate::resources::{
    ClusterObject, Destination, HeaderOperations, Headers, HttpMatchRequest, HttpRoute,
    HttpRouteDestination, ResourceKind, StringMatch, VirtualService, VirtualServiceSpec,
};
use crate::session::SessionContext;

use super::gateway::HOSTS_ANNOTATION;
use super::{AggregateError, ManipulateError, Manipulator};

/// Label marking a derived route object as session-owned. Other sessions
/// must not mutate or clone from objects carrying it.
pub const MUTATED_LABEL: &str = "ike.mutated";

/// Value of [`MUTATED_LABEL`] on objects this engine wrote.
pub const MUTATED_LABEL_VALUE: &str = "true";

/// Creates and edits mesh routes so the session's traffic reaches the
/// fork.
pub struct VirtualServiceManipulator;

#[async_trait]
impl Manipulator for VirtualServiceManipulator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::VirtualService
    }

    async fn locate(&self, _ctx: &SessionContext, _target: &mut Ref) -> bool {
        // Route objects never resolve a ref; they follow located workloads.
        false
    }

    async fn mutate(&self, ctx: &SessionContext, target: &mut Ref) -> Result<(), AggregateError> {
        target.clear_failures(ResourceKind::VirtualService);
        let hostnames = target.hostnames(&ctx.namespace);
        if hostnames.is_empty() {
            return Ok(());
        }
        let version = target.version().unwrap_or_default().to_string();
        let subset = target.route_version(&ctx.name);

        let services = match self.list_services(ctx).await {
            Ok(services) => services,
            Err(err) => {
                target.add_status(ResourceStatus::failure(
                    ResourceKind::VirtualService,
                    &ctx.namespace,
                    StatusAction::Located,
                    err.to_string(),
                ));
                return Err(err.into());
            }
        };

        let mut failures = AggregateError::default();
        for host in &hostnames {
            let mut touched = false;

            for vs in &services {
                if vs.spec.gateways.is_empty() || is_mutated(vs) {
                    continue;
                }
                let session_hosts = session_hosts_for(ctx, target, &vs.spec.gateways);
                if session_hosts.is_empty() {
                    continue;
                }
                debug!(session = %ctx.name, name = %name_of(vs), "found gateway-connected virtual service");
                let derived = derive_connected(ctx, vs, host, &version, &subset, session_hosts);
                let derived_name = name_of(&derived).to_string();
                match ctx.client.create(&ClusterObject::from(derived)).await {
                    Ok(()) => {
                        info!(session = %ctx.name, name = %derived_name, "created session virtual service");
                        target.add_status(ResourceStatus::success(
                            ResourceKind::VirtualService,
                            &derived_name,
                            StatusAction::Created,
                        ));
                        touched = true;
                    }
                    Err(err) if err.is_already_exists() => {
                        target.add_status(ResourceStatus::success(
                            ResourceKind::VirtualService,
                            &derived_name,
                            StatusAction::Created,
                        ));
                        touched = true;
                    }
                    Err(err) => {
                        target.add_status(ResourceStatus::failure(
                            ResourceKind::VirtualService,
                            &derived_name,
                            StatusAction::Created,
                            err.to_string(),
                        ));
                        failures.push(ManipulateError::Resource {
                            verb: "create",
                            kind: ResourceKind::VirtualService,
                            name: derived_name,
                            source: err,
                        });
                    }
                }
            }

            for vs in &services {
                if !routes_to(vs, host, &version) {
                    continue;
                }
                if already_mutated(vs, host, &subset, target.strategy, &ctx.route) {
                    touched = true;
                    continue;
                }
                debug!(session = %ctx.name, name = %name_of(vs), "found virtual service");
                let vs_name = name_of(vs).to_string();
                match extend_in_place(vs, host, &version, &subset, &ctx.route) {
                    Ok(mut updated) => {
                        reference::add(&mut updated.metadata, &ctx.namespace, &ctx.name);
                        match ctx.client.update(&ClusterObject::from(updated)).await {
                            Ok(()) => {
                                info!(session = %ctx.name, name = %vs_name, "extended virtual service");
                                target.add_status(ResourceStatus::success(
                                    ResourceKind::VirtualService,
                                    &vs_name,
                                    StatusAction::Modified,
                                ));
                                touched = true;
                            }
                            Err(err) => {
                                target.add_status(ResourceStatus::failure(
                                    ResourceKind::VirtualService,
                                    &vs_name,
                                    StatusAction::Modified,
                                    err.to_string(),
                                ));
                                failures.push(ManipulateError::Resource {
                                    verb: "update",
                                    kind: ResourceKind::VirtualService,
                                    name: vs_name,
                                    source: err,
                                });
                            }
                        }
                    }
                    Err(err) => {
                        target.add_status(ResourceStatus::failure(
                            ResourceKind::VirtualService,
                            &vs_name,
                            StatusAction::Modified,
                            err.to_string(),
                        ));
                        failures.push(err);
                    }
                }
            }

            if !touched {
                // No rule anywhere routes this host; record the miss so the
                // ledger explains the broken session and retry later.
                target.add_status(ResourceStatus::failure(
                    ResourceKind::VirtualService,
                    &host.name,
                    StatusAction::Modified,
                    "route not found",
                ));
                failures.push(ManipulateError::RouteNotFound {
                    host: host.to_string(),
                });
            }
        }
        failures.into_result()
    }

    async fn revert(&self, ctx: &SessionContext, target: &mut Ref) -> Result<(), AggregateError> {
        let mut failures = AggregateError::default();
        let subset = target.route_version(&ctx.name);

        for status in target.statuses_of_kind(ResourceKind::VirtualService) {
            let object = match ctx
                .client
                .get(ResourceKind::VirtualService, &ctx.namespace, &status.name)
                .await
            {
                Ok(object) => object,
                Err(err) if err.is_not_found() => {
                    // Already gone, nothing to clean.
                    target.remove_status(ResourceKind::VirtualService, &status.name);
                    continue;
                }
                Err(err) => {
                    target.add_status(ResourceStatus::failure(
                        ResourceKind::VirtualService,
                        &status.name,
                        status.action,
                        err.to_string(),
                    ));
                    failures.push(ManipulateError::Resource {
                        verb: "get",
                        kind: ResourceKind::VirtualService,
                        name: status.name.clone(),
                        source: err,
                    });
                    continue;
                }
            };
            let Some(mut vs) = object.into_virtual_service() else {
                target.remove_status(ResourceKind::VirtualService, &status.name);
                continue;
            };

            match status.action {
                StatusAction::Modified => {
                    vs.spec.http = drop_session_rules(
                        std::mem::take(&mut vs.spec.http),
                        &subset,
                        target.strategy,
                        &ctx.route,
                    );
                    reference::remove(&mut vs.metadata);
                    match ctx.client.update(&ClusterObject::from(vs)).await {
                        Ok(()) => {
                            info!(session = %ctx.name, name = %status.name, "restored virtual service");
                            target.remove_status(ResourceKind::VirtualService, &status.name);
                        }
                        Err(err) => {
                            warn!(session = %ctx.name, name = %status.name, error = %err,
                                "failed to restore virtual service");
                            target.add_status(ResourceStatus::failure(
                                ResourceKind::VirtualService,
                                &status.name,
                                status.action,
                                err.to_string(),
                            ));
                            failures.push(ManipulateError::Resource {
                                verb: "update",
                                kind: ResourceKind::VirtualService,
                                name: status.name.clone(),
                                source: err,
                            });
                        }
                    }
                }
                StatusAction::Created => {
                    // Detach the back-reference before the delete so
                    // concurrent observers see the object released first.
                    reference::remove(&mut vs.metadata);
                    if let Err(err) = ctx.client.update(&ClusterObject::from(vs)).await {
                        if !err.is_not_found() {
                            target.add_status(ResourceStatus::failure(
                                ResourceKind::VirtualService,
                                &status.name,
                                status.action,
                                err.to_string(),
                            ));
                            failures.push(ManipulateError::Resource {
                                verb: "update",
                                kind: ResourceKind::VirtualService,
                                name: status.name.clone(),
                                source: err,
                            });
                            continue;
                        }
                    }
                    match ctx
                        .client
                        .delete(ResourceKind::VirtualService, &ctx.namespace, &status.name)
                        .await
                    {
                        Ok(()) => {
                            info!(session = %ctx.name, name = %status.name, "deleted session virtual service");
                            target.remove_status(ResourceKind::VirtualService, &status.name);
                        }
                        Err(err) if err.is_not_found() => {
                            target.remove_status(ResourceKind::VirtualService, &status.name);
                        }
                        Err(err) => {
                            target.add_status(ResourceStatus::failure(
                                ResourceKind::VirtualService,
                                &status.name,
                                status.action,
                                err.to_string(),
                            ));
                            failures.push(ManipulateError::Resource {
                                verb: "delete",
                                kind: ResourceKind::VirtualService,
                                name: status.name.clone(),
                                source: err,
                            });
                        }
                    }
                }
                StatusAction::Located => {
                    // A stale lookup-failure marker; nothing was written.
                    target.remove_status(ResourceKind::VirtualService, &status.name);
                }
            }
        }
        failures.into_result()
    }
}

impl VirtualServiceManipulator {
    async fn list_services(
        &self,
        ctx: &SessionContext,
    ) -> Result<Vec<VirtualService>, ManipulateError> {
        let objects = ctx
            .client
            .list(ResourceKind::VirtualService, &ctx.namespace)
            .await
            .map_err(|err| ManipulateError::Resource {
                verb: "list",
                kind: ResourceKind::VirtualService,
                name: ctx.namespace.clone(),
                source: err,
            })?;
        Ok(objects
            .into_iter()
            .filter_map(ClusterObject::into_virtual_service)
            .collect())
    }
}

fn name_of(vs: &VirtualService) -> &str {
    vs.metadata.name.as_deref().unwrap_or_default()
}

fn is_mutated(vs: &VirtualService) -> bool {
    vs.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MUTATED_LABEL))
        .map(String::as_str)
        == Some(MUTATED_LABEL_VALUE)
}

/// Whether any rule routes `host` on the current version (or on every
/// version, which an unset subset means).
pub(crate) fn routes_to(vs: &VirtualService, host: &HostName, version: &str) -> bool {
    vs.spec.http.iter().any(|rule| {
        rule.route.iter().any(|dest| {
            host.matches(&dest.destination.host)
                && (dest.destination.subset_or_default().is_empty()
                    || dest.destination.subset_or_default() == version)
        })
    })
}

/// Whether the session's injected rule is already in place. An existing-
/// variant session shares its subset with production, so a rule only
/// counts as the session's when it also carries the header match;
/// otherwise a pre-existing production rule routing the same subset would
/// suppress injection entirely.
fn already_mutated(
    vs: &VirtualService,
    host: &HostName,
    subset: &str,
    strategy: Strategy,
    route: &Route,
) -> bool {
    vs.spec.http.iter().any(|rule| {
        let targets_subset = rule.route.iter().any(|dest| {
            host.matches(&dest.destination.host) && dest.destination.subset_or_default() == subset
        });
        targets_subset && claimed_by_session(rule, strategy, route)
    })
}

/// Clone every rule with a destination matching `host` on `version`.
fn find_rules(spec: &VirtualServiceSpec, host: &HostName, version: &str) -> Vec<HttpRoute> {
    spec.http
        .iter()
        .filter(|rule| {
            rule.route.iter().any(|dest| {
                host.matches(&dest.destination.host)
                    && (dest.destination.subset_or_default().is_empty()
                        || dest.destination.subset_or_default() == version)
            })
        })
        .cloned()
        .collect()
}

/// Reduce a rule to the session's alternate path: drop destinations not
/// matching the target, rewrite survivors to the session subset, clear
/// weights, mirroring, and redirects.
fn simplify(mut rule: HttpRoute, host: &HostName, version: &str, subset: &str) -> HttpRoute {
    rule.route = std::mem::take(&mut rule.route)
        .into_iter()
        .filter(|dest| {
            host.matches(&dest.destination.host)
                && (dest.destination.subset_or_default() == version
                    || dest.destination.subset_or_default().is_empty())
        })
        .map(|dest| HttpRouteDestination {
            destination: Destination {
                host: dest.destination.host,
                subset: Some(subset.to_string()),
            },
            weight: None,
        })
        .collect();
    rule.mirror = None;
    rule.redirect = None;
    rule
}

/// Add an exact-match condition for the session's route header. Applies to
/// every existing match block so the rule stays as narrow as it was; a
/// rule without conditions gains one.
fn add_header_match(mut rule: HttpRoute, route: &Route) -> HttpRoute {
    if !route.is_header() {
        return rule;
    }
    if rule.matches.is_empty() {
        rule.matches.push(HttpMatchRequest::default());
    }
    for matcher in &mut rule.matches {
        matcher
            .headers
            .insert(route.name.clone(), StringMatch::exact(route.value.clone()));
    }
    rule
}

/// Stamp the route header onto requests leaving through this rule, so any
/// traffic arriving on the session host carries the matcher downstream.
fn add_header_request(rule: &mut HttpRoute, route: &Route) {
    let headers = rule.headers.get_or_insert_with(Headers::default);
    let request = headers.request.get_or_insert_with(HeaderOperations::default);
    request.add.insert(route.name.clone(), route.value.clone());
}

/// Session hosts derived from the located gateway targets of the gateways
/// `vs` is attached to.
fn session_hosts_for(ctx: &SessionContext, target: &Ref, gateways: &[String]) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for gateway in gateways {
        for located in
            target.targets_matching(|t| t.kind == ResourceKind::Gateway && &t.name == gateway)
        {
            let base_hosts = located
                .labels
                .get(HOSTS_ANNOTATION)
                .map(String::as_str)
                .unwrap_or_default();
            for base in base_hosts.split(',').filter(|h| !h.is_empty()) {
                let session_host = format!("{}.{base}", ctx.name);
                if !hosts.contains(&session_host) {
                    hosts.push(session_host);
                }
            }
        }
    }
    hosts
}

/// Build the sibling route object for a gateway-connected source.
fn derive_connected(
    ctx: &SessionContext,
    source: &VirtualService,
    host: &HostName,
    version: &str,
    subset: &str,
    session_hosts: Vec<String>,
) -> VirtualService {
    let mut derived = source.clone();
    derived.metadata.name = Some(format!("{}-{}", name_of(source), ctx.name));
    derived.metadata.resource_version = None;
    derived.metadata.uid = None;
    derived
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(MUTATED_LABEL.to_string(), MUTATED_LABEL_VALUE.to_string());
    reference::add(&mut derived.metadata, &ctx.namespace, &ctx.name);
    derived.spec.hosts = session_hosts;

    for rule in find_rules(&source.spec, host, version) {
        let simplified = simplify(rule, host, version, subset);
        derived.spec.http.insert(0, simplified);
    }
    for rule in &mut derived.spec.http {
        add_header_request(rule, &ctx.route);
    }
    derived
}

/// Prepend a header-matched copy of every matching rule.
fn extend_in_place(
    source: &VirtualService,
    host: &HostName,
    version: &str,
    subset: &str,
    route: &Route,
) -> Result<VirtualService, ManipulateError> {
    let rules = find_rules(&source.spec, host, version);
    if rules.is_empty() {
        return Err(ManipulateError::RouteNotFound {
            host: host.to_string(),
        });
    }
    let mut updated = source.clone();
    for rule in rules {
        let new_rule = add_header_match(simplify(rule, host, version, subset), route);
        updated.spec.http.insert(0, new_rule);
    }
    Ok(updated)
}

/// Rebuild the rule list without the session's injected rules. A rule is
/// the session's when a destination subset carries the session subset; for
/// an existing-variant session the subset is shared with production, so
/// the injected header match disambiguates.
fn drop_session_rules(
    rules: Vec<HttpRoute>,
    subset: &str,
    strategy: Strategy,
    route: &Route,
) -> Vec<HttpRoute> {
    rules
        .into_iter()
        .filter(|rule| !is_session_rule(rule, subset, strategy, route))
        .collect()
}

fn is_session_rule(rule: &HttpRoute, subset: &str, strategy: Strategy, route: &Route) -> bool {
    let targets_subset = rule
        .route
        .iter()
        .any(|dest| dest.destination.subset_or_default().contains(subset));
    targets_subset && claimed_by_session(rule, strategy, route)
}

/// Whether a subset-matching rule belongs to this session. A cloned fork's
/// subset is unique to the session; an existing variant's subset is shared
/// with production, so only the injected header match distinguishes it.
fn claimed_by_session(rule: &HttpRoute, strategy: Strategy, route: &Route) -> bool {
    match strategy {
        Strategy::Existing => has_header_match(rule, route),
        Strategy::Clone => true,
    }
}

fn has_header_match(rule: &HttpRoute, route: &Route) -> bool {
    rule.matches.iter().any(|matcher| {
        matcher
            .headers
            .get(&route.name)
            .is_some_and(|m| m.exact.as_deref() == Some(route.value.as_str()))
    })
}
