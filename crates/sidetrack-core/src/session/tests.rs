//! End-to-end driver scenarios against the in-memory cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::client::{ClusterClient, MemoryClient};
use crate::manipulate::fixtures::{context, gateway_route, ingress, plain_route, workload, NS};
use crate::manipulate::gateway::HOSTS_ANNOTATION;
use crate::manipulate::virtualservice::{MUTATED_LABEL, MUTATED_LABEL_VALUE};
use crate::model::{KindName, Ref, ResourceStatus, StatusAction, Strategy};
use crate::reference;
use crate::resources::{ClusterObject, ResourceKind, VirtualService};
use crate::template::JsonEngine;

use super::Orchestrator;

fn orchestrator() -> Orchestrator {
    Orchestrator::with_defaults(Arc::new(JsonEngine))
}

fn clone_ref(name: &str) -> Ref {
    Ref::new(KindName::named(name), Strategy::Clone, BTreeMap::new())
}

fn to_value(object: &ClusterObject) -> Value {
    match object {
        ClusterObject::Deployment(d) => serde_json::to_value(d).unwrap(),
        ClusterObject::VirtualService(vs) => serde_json::to_value(vs).unwrap(),
        ClusterObject::Gateway(gw) => serde_json::to_value(gw).unwrap(),
    }
}

/// Whole-cluster state with resource versions stripped, for byte-equality
/// comparisons across a mutate/revert pair.
async fn stable_snapshot(client: &MemoryClient) -> Vec<Value> {
    client
        .snapshot()
        .await
        .iter()
        .map(|object| {
            let mut value = to_value(object);
            if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.remove("resourceVersion");
            }
            value
        })
        .collect()
}

/// Whole-cluster state including resource versions; equality means zero
/// writes happened in between.
async fn exact_snapshot(client: &MemoryClient) -> Vec<Value> {
    client.snapshot().await.iter().map(to_value).collect()
}

async fn fetch_vs(client: &MemoryClient, name: &str) -> VirtualService {
    client
        .get(ResourceKind::VirtualService, NS, name)
        .await
        .unwrap()
        .into_virtual_service()
        .unwrap()
}

fn ledger(target: &Ref) -> Vec<(ResourceKind, String, StatusAction, bool)> {
    target
        .statuses()
        .iter()
        .map(|s| (s.kind, s.name.clone(), s.action, s.success))
        .collect()
}

#[tokio::test]
async fn create_on_a_clean_cluster() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    client.seed(plain_route("ratings-vs", "ratings", Some("v1"))).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![clone_ref("ratings")];

    orchestrator().apply(&ctx, &mut refs).await.unwrap();

    let clone = client
        .get(ResourceKind::Deployment, NS, "ratings-demo")
        .await
        .unwrap();
    assert_eq!(
        reference::get(clone.metadata()),
        Some((NS.to_string(), "demo".to_string()))
    );

    let vs = fetch_vs(&client, "ratings-vs").await;
    let injected = &vs.spec.http[0];
    assert_eq!(injected.route[0].destination.subset.as_deref(), Some("v1-demo"));
    assert_eq!(
        injected.matches[0]
            .headers
            .get("x-test")
            .and_then(|m| m.exact.as_deref()),
        Some("smoke")
    );

    assert_eq!(
        ledger(&refs[0]),
        vec![
            (
                ResourceKind::Deployment,
                "ratings-demo".to_string(),
                StatusAction::Created,
                true
            ),
            (
                ResourceKind::VirtualService,
                "ratings-vs".to_string(),
                StatusAction::Modified,
                true
            ),
        ]
    );
}

#[tokio::test]
async fn reapplying_performs_zero_writes() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    client.seed(plain_route("ratings-vs", "ratings", Some("v1"))).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![clone_ref("ratings")];
    orchestrator().apply(&ctx, &mut refs).await.unwrap();

    let settled = exact_snapshot(&client).await;
    let settled_ledger = ledger(&refs[0]);

    orchestrator().apply(&ctx, &mut refs).await.unwrap();

    assert_eq!(exact_snapshot(&client).await, settled);
    assert_eq!(ledger(&refs[0]), settled_ledger);
}

#[tokio::test]
async fn delete_restores_the_pre_session_cluster() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    client.seed(plain_route("ratings-vs", "ratings", Some("v1"))).await;
    let pristine = stable_snapshot(&client).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![clone_ref("ratings")];
    orchestrator().apply(&ctx, &mut refs).await.unwrap();

    orchestrator().revert(&ctx, &mut refs).await.unwrap();

    assert_eq!(stable_snapshot(&client).await, pristine);
    assert!(refs[0].cleared());
}

#[tokio::test]
async fn gateway_exposure_publishes_a_session_host() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    client
        .seed(gateway_route("ratings-vs", "ratings", Some("v1"), &["g1"]))
        .await;
    client.seed(ingress("g1", &["bookinfo.example.com"])).await;
    let pristine = stable_snapshot(&client).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![clone_ref("ratings")];

    orchestrator().apply(&ctx, &mut refs).await.unwrap();

    let gateway = client
        .get(ResourceKind::Gateway, NS, "g1")
        .await
        .unwrap()
        .into_gateway()
        .unwrap();
    assert_eq!(
        gateway.spec.servers[0].hosts,
        vec!["bookinfo.example.com", "demo.bookinfo.example.com"]
    );
    assert_eq!(
        gateway
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .get(HOSTS_ANNOTATION),
        Some(&"demo.bookinfo.example.com".to_string())
    );

    let derived = fetch_vs(&client, "ratings-vs-demo").await;
    assert_eq!(derived.spec.hosts, vec!["demo.bookinfo.example.com"]);
    assert_eq!(
        derived
            .metadata
            .labels
            .as_ref()
            .unwrap()
            .get(MUTATED_LABEL)
            .map(String::as_str),
        Some(MUTATED_LABEL_VALUE)
    );
    assert_eq!(
        reference::get(&derived.metadata),
        Some((NS.to_string(), "demo".to_string()))
    );
    let first = &derived.spec.http[0];
    assert_eq!(first.route[0].destination.subset.as_deref(), Some("v1-demo"));
    // Every rule on the session host stamps the route header onto the
    // request; the injected fast path has no match condition at all.
    assert!(first.matches.is_empty());
    for rule in &derived.spec.http {
        let add = &rule.headers.as_ref().unwrap().request.as_ref().unwrap().add;
        assert_eq!(add.get("x-test").map(String::as_str), Some("smoke"));
    }

    // The production object also gains the header-scoped path so tagged
    // internal traffic reaches the fork.
    let original = fetch_vs(&client, "ratings-vs").await;
    assert_eq!(
        original.spec.http[0].route[0].destination.subset.as_deref(),
        Some("v1-demo")
    );

    orchestrator().revert(&ctx, &mut refs).await.unwrap();
    assert_eq!(stable_snapshot(&client).await, pristine);
    assert!(refs[0].cleared());
}

#[tokio::test]
async fn missing_target_reports_no_resources() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    let pristine = exact_snapshot(&client).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![clone_ref("nope")];

    orchestrator().apply(&ctx, &mut refs).await.unwrap();

    assert_eq!(exact_snapshot(&client).await, pristine);
    assert!(refs[0].statuses().is_empty());

    // Deletion has no revert work to do.
    orchestrator().revert(&ctx, &mut refs).await.unwrap();
    assert!(refs[0].cleared());
}

#[tokio::test]
async fn route_not_found_heals_on_a_later_reconcile() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![clone_ref("ratings")];

    let err = orchestrator().apply(&ctx, &mut refs).await.unwrap_err();
    assert!(err.to_string().contains("route not found"));
    let failed: Vec<&ResourceStatus> = refs[0]
        .statuses()
        .iter()
        .filter(|s| !s.success)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, ResourceKind::VirtualService);
    assert_eq!(failed[0].action, StatusAction::Modified);

    // The user adds a matching rule; the next reconcile succeeds and the
    // ledger flips to success.
    client.seed(plain_route("ratings-vs", "ratings", Some("v1"))).await;
    let mut refs = vec![Ref::with_statuses(
        KindName::named("ratings"),
        Strategy::Clone,
        BTreeMap::new(),
        refs[0].statuses().to_vec(),
    )];
    orchestrator().apply(&ctx, &mut refs).await.unwrap();
    assert!(refs[0].statuses().iter().all(|s| s.success));
}

#[tokio::test]
async fn two_sessions_fork_the_same_workload_independently() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    client.seed(plain_route("ratings-vs", "ratings", Some("v1"))).await;
    let ctx1 = context(Arc::clone(&client), "s1");
    let ctx2 = context(Arc::clone(&client), "s2");
    let mut refs1 = vec![clone_ref("ratings")];
    let mut refs2 = vec![clone_ref("ratings")];

    orchestrator().apply(&ctx1, &mut refs1).await.unwrap();
    orchestrator().apply(&ctx2, &mut refs2).await.unwrap();

    assert!(client.get(ResourceKind::Deployment, NS, "ratings-s1").await.is_ok());
    assert!(client.get(ResourceKind::Deployment, NS, "ratings-s2").await.is_ok());
    let vs = fetch_vs(&client, "ratings-vs").await;
    assert_eq!(vs.spec.http.len(), 3);

    orchestrator().revert(&ctx1, &mut refs1).await.unwrap();

    // The second session's fork and route survive the first one's revert.
    assert!(client.get(ResourceKind::Deployment, NS, "ratings-s1").await.is_err());
    assert!(client.get(ResourceKind::Deployment, NS, "ratings-s2").await.is_ok());
    let vs = fetch_vs(&client, "ratings-vs").await;
    assert_eq!(vs.spec.http.len(), 2);
    assert!(vs.spec.http.iter().any(|rule| {
        rule.route
            .iter()
            .any(|d| d.destination.subset.as_deref() == Some("v1-s2"))
    }));
}

#[tokio::test]
async fn gateway_mutation_commutes_across_sessions() {
    async fn final_host_set(first: &str, second: &str) -> Vec<String> {
        let client = Arc::new(MemoryClient::new());
        client.seed(workload("ratings", "v1")).await;
        client
            .seed(gateway_route("ratings-vs", "ratings", Some("v1"), &["g1"]))
            .await;
        client.seed(ingress("g1", &["bookinfo.example.com"])).await;

        for session in [first, second] {
            let ctx = context(Arc::clone(&client), session);
            let mut refs = vec![clone_ref("ratings")];
            orchestrator().apply(&ctx, &mut refs).await.unwrap();
        }

        let gateway = client
            .get(ResourceKind::Gateway, NS, "g1")
            .await
            .unwrap()
            .into_gateway()
            .unwrap();
        let mut hosts = gateway.spec.servers[0].hosts.clone();
        hosts.sort();
        hosts
    }

    assert_eq!(
        final_host_set("s1", "s2").await,
        final_host_set("s2", "s1").await
    );
}

#[tokio::test]
async fn revert_works_from_the_rehydrated_ledger_alone() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    client.seed(plain_route("ratings-vs", "ratings", Some("v1"))).await;
    let pristine = stable_snapshot(&client).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![clone_ref("ratings")];
    orchestrator().apply(&ctx, &mut refs).await.unwrap();

    // The deletion path sees only what the session status recorded: no
    // located targets, just the ledger.
    let mut rehydrated = vec![Ref::with_statuses(
        KindName::named("ratings"),
        Strategy::Clone,
        BTreeMap::new(),
        refs[0].statuses().to_vec(),
    )];
    orchestrator().revert(&ctx, &mut rehydrated).await.unwrap();

    assert_eq!(stable_snapshot(&client).await, pristine);
    assert!(rehydrated[0].cleared());
}

#[tokio::test]
async fn existing_strategy_reverts_from_the_rehydrated_ledger_alone() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings-v2", "v2")).await;
    client.seed(plain_route("ratings-vs", "ratings", None)).await;
    let pristine = stable_snapshot(&client).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![Ref::new(
        KindName::named("ratings-v2"),
        Strategy::Existing,
        BTreeMap::new(),
    )];
    orchestrator().apply(&ctx, &mut refs).await.unwrap();

    // Teardown of a ref that was dropped from the spec sees only the
    // recorded ledger; the strategy it carries decides that the in-place
    // rule is found by its header match, not by a session-unique subset.
    let mut rehydrated = vec![Ref::with_statuses(
        KindName::named("ratings-v2"),
        Strategy::Existing,
        BTreeMap::new(),
        refs[0].statuses().to_vec(),
    )];
    orchestrator().revert(&ctx, &mut rehydrated).await.unwrap();

    assert_eq!(stable_snapshot(&client).await, pristine);
    assert!(rehydrated[0].cleared());
}

#[tokio::test]
async fn revert_with_an_empty_ledger_is_a_no_op() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    let pristine = exact_snapshot(&client).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![clone_ref("ratings")];

    orchestrator().revert(&ctx, &mut refs).await.unwrap();

    assert_eq!(exact_snapshot(&client).await, pristine);
}

#[tokio::test]
async fn existing_strategy_sessions_apply_and_revert() {
    let client = Arc::new(MemoryClient::new());
    client.seed(workload("ratings", "v1")).await;
    client.seed(workload("ratings-v2", "v2")).await;
    client.seed(plain_route("ratings-vs", "ratings", None)).await;
    let pristine = stable_snapshot(&client).await;
    let ctx = context(Arc::clone(&client), "demo");
    let mut refs = vec![Ref::new(
        KindName::named("ratings-v2"),
        Strategy::Existing,
        BTreeMap::new(),
    )];

    orchestrator().apply(&ctx, &mut refs).await.unwrap();

    // No clone is produced; the header path routes to the running subset.
    assert!(client.get(ResourceKind::Deployment, NS, "ratings-v2-demo").await.is_err());
    let vs = fetch_vs(&client, "ratings-vs").await;
    assert_eq!(vs.spec.http[0].route[0].destination.subset.as_deref(), Some("v2"));

    orchestrator().revert(&ctx, &mut refs).await.unwrap();
    assert_eq!(stable_snapshot(&client).await, pristine);
}
