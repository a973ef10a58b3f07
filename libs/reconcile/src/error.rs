//! Cluster and reconciliation errors.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`ClusterClient`](crate::ClusterClient).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The object does not exist.
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// The object already exists.
    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    /// The document is not a valid object for this cluster.
    #[error("invalid resource: {message}")]
    Invalid { message: String },

    /// An update tried to change a field that cannot change after creation.
    #[error("{resource}: field '{field}' is immutable")]
    Immutable { resource: String, field: String },

    /// The cluster refused the mutation.
    #[error("{resource} rejected: {message}")]
    Rejected { resource: String, message: String },

    /// The cluster could not be reached.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

impl ClusterError {
    /// Returns true if the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Errors from applying a plan or waiting on cluster state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// A cluster mutation or read failed.
    #[error("failed to apply {resource}: {source}")]
    Apply {
        resource: String,
        #[source]
        source: ClusterError,
    },

    /// The object exists but belongs to another release, or to none.
    #[error("{resource} exists and is not owned by release {release} (owner: {owner})")]
    Ownership {
        resource: String,
        release: String,
        owner: String,
    },

    /// The cluster reported the object as failed.
    #[error("{resource} failed: {reason}")]
    Failed { resource: String, reason: String },

    /// The wait deadline passed.
    #[error("timed out after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// The wait was cancelled by the caller.
    #[error("cancelled while waiting for {resource}")]
    Cancelled { resource: String },
}

impl ReconcileError {
    /// Label of the resource the error concerns.
    pub fn resource(&self) -> &str {
        match self {
            Self::Apply { resource, .. }
            | Self::Ownership { resource, .. }
            | Self::Failed { resource, .. }
            | Self::Timeout { resource, .. }
            | Self::Cancelled { resource } => resource,
        }
    }
}
