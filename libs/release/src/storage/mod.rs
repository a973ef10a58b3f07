//! Release storage.
//!
//! The store is the only state shared between concurrent operations. Its
//! `create` call is the sole concurrency control: it accepts a revision only
//! if it is exactly one past the highest stored revision for the release and
//! fails with [`StoreError::Conflict`] otherwise. There is no server-side
//! counter; callers recompute the next revision and decide whether to retry.

mod codec;
mod kv;
mod memory;
mod sqlite;

pub use codec::{decode, encode, DEFAULT_RECORD_LIMIT};
pub use kv::{DirectoryKv, KvBackend, KvStore, MemoryKv};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::cmp::Reverse;

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::release::{Release, ReleaseStatus};

/// Versioned persistence of release records.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Store a new revision.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the revision exists or is not
    /// `1 + max(existing revisions)`.
    async fn create(&self, release: &Release) -> StoreResult<()>;

    /// Replace an existing revision in place.
    ///
    /// Only status information and hook run records may change; chart,
    /// config and manifest are fixed at creation.
    async fn update(&self, release: &Release) -> StoreResult<()>;

    /// Replace several revisions as one logical commit.
    ///
    /// Backends with transactions apply all or nothing. Others apply in
    /// slice order, so callers list the superseded revision first.
    async fn update_all(&self, releases: &[Release]) -> StoreResult<()> {
        for release in releases {
            self.update(release).await?;
        }
        Ok(())
    }

    /// Fetch a single revision.
    async fn get(&self, name: &str, namespace: &str, revision: u32) -> StoreResult<Release>;

    /// All revisions of a release, ascending by revision.
    async fn history(&self, name: &str, namespace: &str) -> StoreResult<Vec<Release>>;

    /// The deployed revision, if any.
    async fn deployed(&self, name: &str, namespace: &str) -> StoreResult<Option<Release>> {
        let history = self.history(name, namespace).await?;
        Ok(pick_deployed(history))
    }

    /// The highest revision, if any.
    async fn latest(&self, name: &str, namespace: &str) -> StoreResult<Option<Release>> {
        Ok(self.history(name, namespace).await?.pop())
    }

    /// Remove a revision, returning it.
    async fn delete(&self, name: &str, namespace: &str, revision: u32) -> StoreResult<Release>;

    /// Latest revision of every release, optionally within one namespace.
    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<Release>>;
}

/// Check that `release` is the next revision after `latest`.
pub(crate) fn check_next_revision(release: &Release, latest: Option<u32>) -> StoreResult<()> {
    let expected = latest.map_or(1, |r| r + 1);
    if release.revision != expected {
        return Err(StoreError::Conflict {
            name: release.name.clone(),
            namespace: release.namespace.clone(),
            revision: release.revision,
            latest,
        });
    }
    Ok(())
}

/// Check that an update leaves creation-time fields untouched.
pub(crate) fn check_update(existing: &Release, updated: &Release) -> StoreResult<()> {
    let field = if existing.chart != updated.chart {
        Some("chart")
    } else if existing.config != updated.config {
        Some("config")
    } else if existing.manifest != updated.manifest {
        Some("manifest")
    } else {
        None
    };

    match field {
        Some(field) => Err(StoreError::ImmutableField {
            name: updated.name.clone(),
            namespace: updated.namespace.clone(),
            revision: updated.revision,
            field,
        }),
        None => Ok(()),
    }
}

/// Pick the deployed revision out of an ascending history.
///
/// More than one deployed revision violates the store invariant; the newest
/// wins and the anomaly is logged.
pub(crate) fn pick_deployed(history: Vec<Release>) -> Option<Release> {
    let mut deployed: Vec<Release> = history
        .into_iter()
        .filter(|r| r.status() == ReleaseStatus::Deployed)
        .collect();

    if deployed.len() > 1 {
        tracing::warn!(
            release = %deployed[0].name,
            namespace = %deployed[0].namespace,
            count = deployed.len(),
            "Multiple deployed revisions found, using the newest"
        );
    }
    deployed.pop()
}

/// Keep only the highest revision of each release.
pub(crate) fn latest_per_release(mut releases: Vec<Release>) -> Vec<Release> {
    releases.sort_by(|a, b| {
        (&a.namespace, &a.name, Reverse(a.revision)).cmp(&(
            &b.namespace,
            &b.name,
            Reverse(b.revision),
        ))
    });
    releases.dedup_by(|a, b| a.namespace == b.namespace && a.name == b.name);
    releases
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;

    use crate::release::{ChartRef, Release, ReleaseInfo, ReleaseStatus};

    pub fn release(name: &str, revision: u32, status: ReleaseStatus) -> Release {
        let now = Utc::now();
        Release {
            name: name.to_string(),
            namespace: "default".to_string(),
            revision,
            chart: ChartRef {
                name: "demo".to_string(),
                version: "1.0.0".to_string(),
                digest: "sha256:00".to_string(),
            },
            config: serde_json::json!({ "replicas": revision }),
            manifest: format!("---\n# Source: demo/cm.yaml\nrevision: {revision}\n"),
            hooks: Vec::new(),
            info: ReleaseInfo {
                status,
                description: String::new(),
                first_deployed_at: now,
                last_deployed_at: now,
                deleted_at: None,
                notes: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::release;
    use super::*;

    #[test]
    fn test_check_next_revision() {
        assert!(check_next_revision(&release("a", 1, ReleaseStatus::Deployed), None).is_ok());
        assert!(check_next_revision(&release("a", 3, ReleaseStatus::Deployed), Some(2)).is_ok());

        let err = check_next_revision(&release("a", 2, ReleaseStatus::Deployed), Some(2))
            .unwrap_err();
        assert!(err.is_conflict());
        let err = check_next_revision(&release("a", 5, ReleaseStatus::Deployed), Some(2))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_check_update_rejects_manifest_change() {
        let existing = release("a", 1, ReleaseStatus::PendingInstall);
        let mut updated = existing.clone();
        updated.transition(ReleaseStatus::Deployed, "Install complete");
        assert!(check_update(&existing, &updated).is_ok());

        updated.manifest.push_str("extra: true\n");
        let err = check_update(&existing, &updated).unwrap_err();
        assert!(matches!(
            err,
            StoreError::ImmutableField {
                field: "manifest",
                ..
            }
        ));
    }

    #[test]
    fn test_latest_per_release() {
        let releases = vec![
            release("b", 1, ReleaseStatus::Deployed),
            release("a", 2, ReleaseStatus::Deployed),
            release("a", 1, ReleaseStatus::Superseded),
        ];
        let latest = latest_per_release(releases);
        assert_eq!(latest.len(), 2);
        assert_eq!((latest[0].name.as_str(), latest[0].revision), ("a", 2));
        assert_eq!((latest[1].name.as_str(), latest[1].revision), ("b", 1));
    }
}
