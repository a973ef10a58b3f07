//! SQLite-backed release store.
//!
//! One row per revision, keyed by `(namespace, name, revision)`. Status and
//! chart columns are duplicated out of the JSON body for querying.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use super::{check_next_revision, check_update, pick_deployed, ReleaseStore};
use crate::error::{StoreError, StoreResult};
use crate::release::{Release, ReleaseStatus};

/// Relational release store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS releases (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                revision INTEGER NOT NULL,
                status TEXT NOT NULL,
                chart_name TEXT NOT NULL,
                chart_version TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (namespace, name, revision)
            );

            CREATE INDEX IF NOT EXISTS idx_releases_status ON releases(namespace, name, status);
            "#,
        )?;

        debug!("Release store schema initialized");
        Ok(())
    }
}

fn not_found(name: &str, namespace: &str, revision: u32) -> StoreError {
    StoreError::NotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
        revision,
    }
}

fn parse_body(body: String) -> StoreResult<Release> {
    Ok(serde_json::from_str(&body)?)
}

fn max_revision(tx: &Transaction<'_>, name: &str, namespace: &str) -> StoreResult<Option<u32>> {
    let max: Option<u32> = tx.query_row(
        "SELECT MAX(revision) FROM releases WHERE namespace = ?1 AND name = ?2",
        params![namespace, name],
        |row| row.get(0),
    )?;
    Ok(max)
}

fn load_body(
    conn: &Connection,
    name: &str,
    namespace: &str,
    revision: u32,
) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT body FROM releases WHERE namespace = ?1 AND name = ?2 AND revision = ?3",
            params![namespace, name, revision],
            |row| row.get(0),
        )
        .optional()?)
}

fn update_row(tx: &Transaction<'_>, release: &Release) -> StoreResult<()> {
    let existing = load_body(tx, &release.name, &release.namespace, release.revision)?
        .ok_or_else(|| not_found(&release.name, &release.namespace, release.revision))?;
    check_update(&parse_body(existing)?, release)?;

    tx.execute(
        "UPDATE releases SET status = ?4, modified_at = ?5, body = ?6
         WHERE namespace = ?1 AND name = ?2 AND revision = ?3",
        params![
            release.namespace,
            release.name,
            release.revision,
            release.status().as_str(),
            Utc::now().to_rfc3339(),
            serde_json::to_string(release)?,
        ],
    )?;
    Ok(())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl ReleaseStore for SqliteStore {
    async fn create(&self, release: &Release) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let latest = max_revision(&tx, &release.name, &release.namespace)?;
        check_next_revision(release, latest)?;

        let inserted = tx.execute(
            "INSERT INTO releases
             (namespace, name, revision, status, chart_name, chart_version, modified_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                release.namespace,
                release.name,
                release.revision,
                release.status().as_str(),
                release.chart.name,
                release.chart.version,
                Utc::now().to_rfc3339(),
                serde_json::to_string(release)?,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::Conflict {
                    name: release.name.clone(),
                    namespace: release.namespace.clone(),
                    revision: release.revision,
                    latest,
                });
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        debug!(release = %release.label(), status = %release.status(), "Created release record");
        Ok(())
    }

    async fn update(&self, release: &Release) -> StoreResult<()> {
        self.update_all(std::slice::from_ref(release)).await
    }

    async fn update_all(&self, releases: &[Release]) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for release in releases {
            update_row(&tx, release)?;
        }
        tx.commit()?;

        for release in releases {
            debug!(release = %release.label(), status = %release.status(), "Updated release record");
        }
        Ok(())
    }

    async fn get(&self, name: &str, namespace: &str, revision: u32) -> StoreResult<Release> {
        let conn = self.conn.lock().await;
        let body = load_body(&conn, name, namespace, revision)?
            .ok_or_else(|| not_found(name, namespace, revision))?;
        parse_body(body)
    }

    async fn history(&self, name: &str, namespace: &str) -> StoreResult<Vec<Release>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT body FROM releases WHERE namespace = ?1 AND name = ?2 ORDER BY revision",
        )?;
        let bodies = stmt
            .query_map(params![namespace, name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies.into_iter().map(parse_body).collect()
    }

    async fn deployed(&self, name: &str, namespace: &str) -> StoreResult<Option<Release>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT body FROM releases
             WHERE namespace = ?1 AND name = ?2 AND status = ?3
             ORDER BY revision",
        )?;
        let bodies = stmt
            .query_map(
                params![namespace, name, ReleaseStatus::Deployed.as_str()],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        let deployed = bodies
            .into_iter()
            .map(parse_body)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(pick_deployed(deployed))
    }

    async fn latest(&self, name: &str, namespace: &str) -> StoreResult<Option<Release>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM releases WHERE namespace = ?1 AND name = ?2
                 ORDER BY revision DESC LIMIT 1",
                params![namespace, name],
                |row| row.get(0),
            )
            .optional()?;
        body.map(parse_body).transpose()
    }

    async fn delete(&self, name: &str, namespace: &str, revision: u32) -> StoreResult<Release> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let body = load_body(&tx, name, namespace, revision)?
            .ok_or_else(|| not_found(name, namespace, revision))?;
        tx.execute(
            "DELETE FROM releases WHERE namespace = ?1 AND name = ?2 AND revision = ?3",
            params![namespace, name, revision],
        )?;
        tx.commit()?;

        debug!(release = %format!("{namespace}/{name}#{revision}"), "Deleted release record");
        parse_body(body)
    }

    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<Release>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT r.body FROM releases r
             JOIN (
                 SELECT namespace, name, MAX(revision) AS revision
                 FROM releases GROUP BY namespace, name
             ) latest
             ON r.namespace = latest.namespace AND r.name = latest.name
                AND r.revision = latest.revision
             WHERE ?1 IS NULL OR r.namespace = ?1
             ORDER BY r.namespace, r.name",
        )?;
        let bodies = stmt
            .query_map(params![namespace], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies.into_iter().map(parse_body).collect()
    }
}
