//! # keel-release
//!
//! Release records and their persistence for the keel package manager.
//!
//! ## Concepts
//!
//! - A **release** is a named instantiation of a chart in a namespace.
//! - Every deployment attempt produces a new **revision**: an immutable
//!   snapshot of the chart reference, merged configuration, rendered
//!   manifest and hooks, plus mutable status information.
//! - A **manifest set** is the typed, ordered view of a rendered manifest,
//!   with lifecycle hooks split out of the regular resources.
//!
//! ## Invariants
//!
//! - `(name, namespace, revision)` is unique.
//! - Revisions of a release are created strictly in sequence: a store only
//!   accepts revision `max + 1` (or `1` for a new release).
//! - At most one revision per release is `deployed`; superseding happens in
//!   the same logical commit as the new deployment.
//!
//! ## Storage
//!
//! [`ReleaseStore`] is the pluggable persistence seam. Three backends ship
//! with the crate:
//!
//! - [`MemoryStore`]: process-local, used for tests and dry runs
//! - [`KvStore`]: encoded records over any [`KvBackend`]
//! - [`SqliteStore`]: relational, indexed by status

mod error;
mod hook;
mod kind;
mod manifest;
mod release;
pub mod storage;

pub use error::{ManifestError, StoreError, StoreResult};
pub use hook::{Hook, HookDeletePolicy, HookExecution, HookPhase, HookRunPhase};
pub use kind::ResourceKind;
pub use manifest::{
    annotations, ManifestEntry, ManifestSet, RenderedTemplate, ResourceIdentity, ResourceKey,
};
pub use release::{ChartRef, Release, ReleaseInfo, ReleaseStatus};
pub use storage::{DirectoryKv, KvBackend, KvStore, MemoryKv, MemoryStore, ReleaseStore, SqliteStore};
