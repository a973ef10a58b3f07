use keel_release::Release;
use tracing::instrument;

use super::Configuration;
use crate::error::EngineError;

/// Every stored revision of a release, ascending. Empty if unknown.
#[instrument(skip(cfg))]
pub async fn history(
    cfg: &Configuration,
    name: &str,
    namespace: &str,
) -> Result<Vec<Release>, EngineError> {
    cfg.store
        .history(name, namespace)
        .await
        .map_err(|e| EngineError::storage(&format!("{namespace}/{name}"), e))
}

/// The latest revision of a release, or `revision` when given.
#[instrument(skip(cfg))]
pub async fn status(
    cfg: &Configuration,
    name: &str,
    namespace: &str,
    revision: Option<u32>,
) -> Result<Release, EngineError> {
    let label = format!("{namespace}/{name}");
    let not_found = || EngineError::NotFound {
        release: label.clone(),
        revision,
    };

    match revision {
        Some(revision) => match cfg.store.get(name, namespace, revision).await {
            Ok(release) => Ok(release),
            Err(e) if e.is_not_found() => Err(not_found()),
            Err(e) => Err(EngineError::storage(&label, e)),
        },
        None => cfg
            .store
            .latest(name, namespace)
            .await
            .map_err(|e| EngineError::storage(&label, e))?
            .ok_or_else(not_found),
    }
}

/// The latest revision of every release, optionally within one namespace.
#[instrument(skip(cfg))]
pub async fn list(cfg: &Configuration, namespace: Option<&str>) -> Result<Vec<Release>, EngineError> {
    cfg.store
        .list(namespace)
        .await
        .map_err(|e| EngineError::storage(namespace.unwrap_or("*"), e))
}
