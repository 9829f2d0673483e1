//! Shared builders for manipulator and driver tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::client::MemoryClient;
use crate::model::{KindName, Ref, Route, Strategy, VERSION_LABEL};
use crate::resources::{
    Destination, Gateway, GatewaySpec, HttpRoute, HttpRouteDestination, Port, Server,
    VirtualService, VirtualServiceSpec,
};
use crate::session::SessionContext;

use super::deployment::DeploymentManipulator;
use super::Manipulator;

pub(crate) const NS: &str = "test";

pub(crate) fn context(client: Arc<MemoryClient>, session: &str) -> SessionContext {
    SessionContext::new(client, NS, session, Route::header("x-test", "smoke"))
}

pub(crate) fn workload(name: &str, version: &str) -> Deployment {
    let labels = BTreeMap::from([
        ("app".to_string(), service_of(name).to_string()),
        (VERSION_LABEL.to_string(), version.to_string()),
    ]);
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(format!("registry.local/{name}:{version}")),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// The service a variant deployment backs: `ratings-v2` serves `ratings`.
fn service_of(name: &str) -> &str {
    name.split_once("-v").map_or(name, |(service, _)| service)
}

pub(crate) fn route_rule(host: &str, subset: Option<&str>) -> HttpRoute {
    HttpRoute {
        route: vec![HttpRouteDestination {
            destination: Destination {
                host: host.to_string(),
                subset: subset.map(str::to_string),
            },
            weight: None,
        }],
        ..HttpRoute::default()
    }
}

pub(crate) fn plain_route(name: &str, host: &str, subset: Option<&str>) -> VirtualService {
    let mut vs = VirtualService::new(
        name,
        VirtualServiceSpec {
            hosts: vec![host.to_string()],
            gateways: vec![],
            http: vec![route_rule(host, subset)],
        },
    );
    vs.metadata.namespace = Some(NS.to_string());
    vs
}

pub(crate) fn gateway_route(
    name: &str,
    host: &str,
    subset: Option<&str>,
    gateways: &[&str],
) -> VirtualService {
    let mut vs = plain_route(name, host, subset);
    vs.spec.gateways = gateways.iter().map(|g| (*g).to_string()).collect();
    vs
}

pub(crate) fn ingress(name: &str, hosts: &[&str]) -> Gateway {
    let mut gw = Gateway::new(
        name,
        GatewaySpec {
            selector: BTreeMap::from([("istio".to_string(), "ingressgateway".to_string())]),
            servers: vec![Server {
                port: Some(Port {
                    number: 80,
                    name: Some("http".to_string()),
                    protocol: Some("HTTP".to_string()),
                }),
                hosts: hosts.iter().map(|h| (*h).to_string()).collect(),
            }],
        },
    );
    gw.metadata.namespace = Some(NS.to_string());
    gw
}

pub(crate) async fn locate_workload_ref(
    manipulator: &DeploymentManipulator,
    ctx: &SessionContext,
    name: &str,
) -> Ref {
    let mut target = Ref::new(KindName::named(name), Strategy::Clone, BTreeMap::new());
    assert!(
        manipulator.locate(ctx, &mut target).await,
        "workload {name} should locate"
    );
    target
}
