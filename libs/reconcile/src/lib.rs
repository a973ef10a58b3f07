//! Reconciliation of rendered manifests against a live cluster.
//!
//! This library turns "previous manifest" + "desired manifest" + live state
//! into ordered cluster mutations. Key pieces:
//!
//! - [`ClusterClient`]: the cluster API seam, with [`FakeCluster`] as an
//!   in-memory implementation.
//! - [`Plan`]: creates and updates in kind-priority order, then deletes in
//!   reverse order. See [`order`].
//! - [`three_way_merge`]: patches that set desired fields, drop fields
//!   removed from the manifest, and leave everything else alone.
//! - [`Applier`] and [`Waiter`]: sequential apply and bounded waits.
//!
//! # Invariants
//!
//! - Mutations execute one at a time, in plan order.
//! - Planning is deterministic given the same inputs.
//! - Objects are matched by group, kind, namespace and name; API version is
//!   not part of the identity.
//! - Live fields never mentioned by any applied manifest are not modified.

mod apply;
mod cluster;
mod error;
mod fake;
mod merge;
pub mod order;
mod plan;
mod wait;

pub use apply::{ApplyReport, Applier, Owner};
pub use cluster::{ClusterClient, Resource, ResourceState};
pub use error::{ClusterError, ReconcileError};
pub use fake::{ClusterEvent, FakeCluster, Operation};
pub use merge::{apply_merge_patch, is_empty_patch, three_way_merge};
pub use plan::{Change, ChangeAction, Plan, PlanSummary};
pub use wait::{Waiter, DEFAULT_POLL_INTERVAL};
