//! Trellis - runtime scaffolding for Kubernetes operators
//!
//! Trellis provides the reconciliation and admission-control core of an
//! operator: a developer defines typed resource structs, implements the
//! [`controller::ResourceController`] trait (and optionally
//! [`webhook::ValidatingWebhook`] / [`webhook::MutatingWebhook`]), registers
//! everything against a cluster transport, and drives the returned futures
//! from a `tokio` main.
//!
//! The cluster API itself is an external collaborator: Trellis talks to it
//! through the [`client::ClusterClient`] and [`leader::LeaseClient`] traits,
//! which keeps the runtime testable against in-memory fakes.
//!
//! # Modules
//!
//! - [`resource`] - resource metadata model, identities, and watch events
//! - [`client`] - cluster transport traits and error classification
//! - [`watch`] - resilient watch streams (reconnect, 410-Gone relist)
//! - [`queue`] - per-identity single-flight work queue with delayed requeue
//! - [`controller`] - controller trait, reconcile actions, and the runtime
//! - [`leader`] - lease-based leader election
//! - [`finalizer`] - ordered finalizer registration and cleanup
//! - [`webhook`] - admission webhook pipeline and HTTP surface
//! - [`retry`] - backoff utilities shared by the watch and runtime paths
//! - [`error`] - error types for the runtime

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod error;
pub mod finalizer;
pub mod leader;
pub mod queue;
pub mod resource;
pub mod retry;
pub mod watch;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
