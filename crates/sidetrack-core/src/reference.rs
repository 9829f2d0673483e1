//! Ownership back-references.
//!
//! Every object the engine writes carries an annotation linking it back to
//! the owning session. Native owner references cannot cross namespaces, so
//! the link is annotation-based and the engine handles teardown itself
//! instead of leaning on cascading garbage collection. On revert the
//! reference is removed before an owned object is deleted, so concurrent
//! observers see the detach first.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Annotation key linking an object to its owning session.
pub const SESSION_ANNOTATION: &str = "ike.session";

/// Stamp the back-reference for session `namespace`/`name`.
pub fn add(meta: &mut ObjectMeta, namespace: &str, name: &str) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(SESSION_ANNOTATION.to_string(), format!("{namespace}/{name}"));
}

/// Remove the back-reference, if present.
pub fn remove(meta: &mut ObjectMeta) {
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(SESSION_ANNOTATION);
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }
}

/// The session an object points back to, as `(namespace, name)`.
#[must_use]
pub fn get(meta: &ObjectMeta) -> Option<(String, String)> {
    let value = meta.annotations.as_ref()?.get(SESSION_ANNOTATION)?;
    let (namespace, name) = value.split_once('/')?;
    Some((namespace.to_string(), name.to_string()))
}
