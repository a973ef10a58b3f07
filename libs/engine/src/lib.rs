//! # keel-engine
//!
//! The release orchestration engine: install, upgrade, rollback and
//! uninstall as auditable, recoverable operations.
//!
//! ## Architecture
//!
//! ```text
//!   caller ──► action::{install, upgrade, rollback, uninstall}
//!                 │
//!                 ├─► Renderer            chart + values ──► manifests
//!                 ├─► ReleaseStore        revision history (keel-release)
//!                 ├─► HookScheduler       ordered lifecycle hooks
//!                 └─► Plan / Applier      diff + ordered apply (keel-reconcile)
//!                         │
//!                         ▼
//!                   ClusterClient
//! ```
//!
//! Actions take an explicit [`Configuration`]; nothing is read from process
//! state. Each action is one sequential task: it suspends only on store and
//! cluster I/O and on bounded waits, never spawning background work.
//!
//! ## Concurrency
//!
//! Operations on different releases may run in parallel. For a single
//! release, the store's `create` is the only guard: a second operation
//! either sees a pending revision and fails with
//! [`ConflictReason::InProgress`], or loses the revision race and fails with
//! [`ConflictReason::RevisionRace`]. This is an optimistic check, not a lock.
//!
//! ## Limitations
//!
//! A timed out or cancelled wait does not stop work already submitted to
//! the cluster; hook jobs may keep running after the operation failed.

pub mod action;
mod config;
mod digest;
mod error;
mod hooks;
mod render;
mod values;

pub use action::{
    history, install, list, rollback, status, uninstall, upgrade, ActionOptions, Configuration,
    ReleaseOutcome, UninstallOutcome,
};
pub use config::EngineSettings;
pub use digest::content_digest;
pub use error::{ConflictReason, EngineError};
pub use hooks::{HookError, HookScheduler};
pub use render::{
    Capabilities, Chart, ChartMetadata, ChartTemplate, PlaceholderRenderer, RenderContext,
    RenderError, RenderOutput, Renderer,
};
pub use values::merge_values;
