//! In-memory release store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{check_next_revision, check_update, latest_per_release, ReleaseStore};
use crate::error::{StoreError, StoreResult};
use crate::release::Release;

type ReleaseKey = (String, String);

/// Process-local store. All operations are atomic under a single lock.
#[derive(Default)]
pub struct MemoryStore {
    releases: RwLock<BTreeMap<ReleaseKey, BTreeMap<u32, Release>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(name: &str, namespace: &str) -> ReleaseKey {
    (namespace.to_string(), name.to_string())
}

fn not_found(name: &str, namespace: &str, revision: u32) -> StoreError {
    StoreError::NotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
        revision,
    }
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn create(&self, release: &Release) -> StoreResult<()> {
        let mut releases = self.releases.write().await;
        let revisions = releases
            .entry(key(&release.name, &release.namespace))
            .or_default();

        let latest = revisions.keys().next_back().copied();
        check_next_revision(release, latest)?;
        revisions.insert(release.revision, release.clone());

        debug!(release = %release.label(), status = %release.status(), "Created release record");
        Ok(())
    }

    async fn update(&self, release: &Release) -> StoreResult<()> {
        self.update_all(std::slice::from_ref(release)).await
    }

    async fn update_all(&self, updates: &[Release]) -> StoreResult<()> {
        let mut releases = self.releases.write().await;

        // Validate everything before touching anything.
        for release in updates {
            let existing = releases
                .get(&key(&release.name, &release.namespace))
                .and_then(|revisions| revisions.get(&release.revision))
                .ok_or_else(|| not_found(&release.name, &release.namespace, release.revision))?;
            check_update(existing, release)?;
        }

        for release in updates {
            if let Some(revisions) = releases.get_mut(&key(&release.name, &release.namespace)) {
                revisions.insert(release.revision, release.clone());
            }
            debug!(release = %release.label(), status = %release.status(), "Updated release record");
        }
        Ok(())
    }

    async fn get(&self, name: &str, namespace: &str, revision: u32) -> StoreResult<Release> {
        self.releases
            .read()
            .await
            .get(&key(name, namespace))
            .and_then(|revisions| revisions.get(&revision))
            .cloned()
            .ok_or_else(|| not_found(name, namespace, revision))
    }

    async fn history(&self, name: &str, namespace: &str) -> StoreResult<Vec<Release>> {
        Ok(self
            .releases
            .read()
            .await
            .get(&key(name, namespace))
            .map(|revisions| revisions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, name: &str, namespace: &str, revision: u32) -> StoreResult<Release> {
        let mut releases = self.releases.write().await;
        let k = key(name, namespace);

        let revisions = releases
            .get_mut(&k)
            .ok_or_else(|| not_found(name, namespace, revision))?;
        let removed = revisions
            .remove(&revision)
            .ok_or_else(|| not_found(name, namespace, revision))?;
        if revisions.is_empty() {
            releases.remove(&k);
        }

        debug!(release = %removed.label(), "Deleted release record");
        Ok(removed)
    }

    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<Release>> {
        let releases = self.releases.read().await;
        let all = releases
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|wanted| wanted == ns))
            .flat_map(|(_, revisions)| revisions.values().cloned())
            .collect();
        Ok(latest_per_release(all))
    }
}
