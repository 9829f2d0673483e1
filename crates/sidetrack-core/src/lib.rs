//! # sidetrack-core
//!
//! Session reconciliation engine for carving ephemeral side tracks through
//! an Istio service mesh.
//!
//! A [`model::Session`] declares a set of workload refs, a fork strategy,
//! and a route matcher. The engine drives the cluster to match: located
//! workloads are cloned under a session-suffixed version, mesh routes gain
//! a header-scoped alternate path to the clone, and gateways admit a
//! `<session>.<host>` variant for every exposed host. Deleting the session
//! unwinds every mutation, using the per-resource status ledger recorded on
//! the session as the single source of revert truth.
//!
//! ## Architecture
//!
//! - [`model`] — value types: refs, routes, hostnames, the status ledger.
//! - [`resources`] — typed view of the cluster kinds the engine touches.
//! - [`client`] — the cluster access seam, with a real Kubernetes
//!   implementation and an in-memory one for tests.
//! - [`template`] — the pure `(strategy, bytes, version, args) -> bytes`
//!   contract that turns a workload into its forked variant.
//! - [`manipulate`] — per-kind Locator/Mutator/Revertor triples and the
//!   ordered registry that composes them.
//! - [`session`] — the per-reconcile driver; the surrounding controller
//!   loop owns retries and re-invocation.
//!
//! The engine performs no retries, sleeps, or cross-reconcile ordering of
//! its own: idempotent mutators plus the ledger carry correctness across
//! repeated reconciles.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod manipulate;
pub mod model;
pub mod reference;
pub mod resources;
pub mod session;
pub mod template;

pub use client::{ClientError, ClusterClient, KubeClient, MemoryClient};
pub use manipulate::{AggregateError, ManipulateError, Manipulator, ManipulatorSet};
pub use model::{Ref, Route, Session, SessionSpec, SessionStatus, Strategy};
pub use session::{Orchestrator, SessionContext};
pub use template::{JsonEngine, TemplateEngine};
