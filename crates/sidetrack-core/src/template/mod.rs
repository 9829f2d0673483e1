//! Workload fork rendering.
//!
//! The engine contract is a pure function over canonical JSON bytes:
//! `(strategy, original, new-version, args) -> mutated`. The core never
//! inspects the transformation; it serializes the located workload, hands
//! the bytes over, and deserializes whatever comes back. Richer template
//! languages plug in behind [`TemplateEngine`].

use std::collections::BTreeMap;

use thiserror::Error;

use crate::model::{Strategy, VERSION_LABEL};

/// Errors from rendering a fork.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TemplateError {
    /// The payload did not round-trip the workload's canonical
    /// serialization.
    #[error("workload payload is not valid: {0}")]
    Payload(#[from] serde_json::Error),

    /// The payload carries no object name to derive the clone name from.
    #[error("workload payload has no object name")]
    MissingName,

    /// The strategy produces no rendered workload.
    #[error("strategy {0:?} does not render a workload")]
    UnsupportedStrategy(Strategy),
}

/// Renders a serialized workload into its forked variant.
pub trait TemplateEngine: Send + Sync {
    /// Transform `original` into the fork for `new_version`, honoring the
    /// ref's opaque `args`.
    fn run(
        &self,
        strategy: Strategy,
        original: &[u8],
        new_version: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, TemplateError>;
}

/// The built-in clone renderer.
///
/// Renames the workload to `<name>-<session>`, restamps the `version`
/// label on the object, the selector, and the pod template, scrubs
/// server-populated metadata so the result is creatable, and honors an
/// `image` arg as a container image override. The session suffix is
/// recovered by stripping the workload's current version from
/// `new_version`, keeping the engine inside the four-argument contract.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonEngine;

impl TemplateEngine for JsonEngine {
    fn run(
        &self,
        strategy: Strategy,
        original: &[u8],
        new_version: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, TemplateError> {
        if strategy != Strategy::Clone {
            return Err(TemplateError::UnsupportedStrategy(strategy));
        }

        let mut workload: k8s_openapi::api::apps::v1::Deployment =
            serde_json::from_slice(original)?;

        let name = workload
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or(TemplateError::MissingName)?;

        let version = workload
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|meta| meta.labels.as_ref())
            .and_then(|labels| labels.get(VERSION_LABEL))
            .cloned()
            .unwrap_or_default();
        let suffix = new_version
            .strip_prefix(&format!("{version}-"))
            .filter(|_| !version.is_empty())
            .unwrap_or(new_version);

        workload.metadata.name = Some(format!("{name}-{suffix}"));
        workload.metadata.resource_version = None;
        workload.metadata.uid = None;
        workload.metadata.creation_timestamp = None;
        workload.metadata.generation = None;
        workload.metadata.managed_fields = None;
        workload.status = None;

        workload
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(VERSION_LABEL.to_string(), new_version.to_string());

        if let Some(spec) = workload.spec.as_mut() {
            spec.selector
                .match_labels
                .get_or_insert_with(BTreeMap::new)
                .insert(VERSION_LABEL.to_string(), new_version.to_string());

            let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
            template_meta
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert(VERSION_LABEL.to_string(), new_version.to_string());

            if let Some(image) = args.get("image") {
                if let Some(pod) = spec.template.spec.as_mut() {
                    for container in &mut pod.containers {
                        container.image = Some(image.clone());
                    }
                }
            }
        }

        Ok(serde_json::to_vec(&workload)?)
    }
}
