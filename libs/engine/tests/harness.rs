//! Shared setup for engine integration tests.
//!
//! Builds a [`Configuration`] over a [`FakeCluster`], the
//! [`PlaceholderRenderer`] and a chosen store backend, plus a small web
//! chart to install.

use std::sync::{Arc, Once};
use std::time::Duration;

use keel_engine::{Chart, Configuration, EngineSettings, PlaceholderRenderer};
use keel_reconcile::FakeCluster;
use keel_release::{DirectoryKv, KvStore, MemoryKv, MemoryStore, ReleaseStore, SqliteStore};
use serde_json::json;
use tempfile::TempDir;

static INIT_TRACING: Once = Once::new();

/// Install a test log subscriber once; `RUST_LOG` or `KEEL_LOG_LEVEL`
/// controls verbosity.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EngineSettings::from_env().log_filter())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Release store backend under test.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    KvMemory,
    KvDirectory,
    Sqlite,
}

#[allow(dead_code)]
pub struct Harness {
    pub cfg: Configuration,
    pub cluster: Arc<FakeCluster>,
    pub store: Arc<dyn ReleaseStore>,
    _dir: Option<TempDir>,
}

#[allow(dead_code)]
impl Harness {
    pub async fn new(backend: Backend) -> Self {
        Self::with_settings(backend, test_settings()).await
    }

    pub async fn with_settings(backend: Backend, settings: EngineSettings) -> Self {
        init_tracing();

        let mut dir = None;
        let store: Arc<dyn ReleaseStore> = match backend {
            Backend::Memory => Arc::new(MemoryStore::new()),
            Backend::KvMemory => Arc::new(KvStore::new(MemoryKv::new())),
            Backend::KvDirectory => {
                let tmp = TempDir::new().unwrap();
                let kv = DirectoryKv::open(tmp.path().join("releases")).await.unwrap();
                dir = Some(tmp);
                Arc::new(KvStore::new(kv))
            }
            Backend::Sqlite => Arc::new(SqliteStore::open_in_memory().unwrap()),
        };

        let mut harness = Self::with_store(store, settings);
        harness._dir = dir;
        harness
    }

    /// Wrap a caller-supplied store, such as one that injects failures.
    pub fn with_store(store: Arc<dyn ReleaseStore>, settings: EngineSettings) -> Self {
        init_tracing();

        let cluster = Arc::new(FakeCluster::new());
        let cfg = Configuration::new(
            store.clone(),
            cluster.clone(),
            Arc::new(PlaceholderRenderer::new()),
        )
        .with_settings(settings);

        Self {
            cfg,
            cluster,
            store,
            _dir: None,
        }
    }
}

/// Short timeouts and fast polling.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        ..EngineSettings::default()
    }
}

pub const DEPLOYMENT: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ release.name }}-web
spec:
  replicas: {{ values.replicas }}
  selector:
    app: {{ release.name }}
  template:
    image: \"nginx:{{ values.image.tag }}\"
";

pub const SERVICE: &str = "\
apiVersion: v1
kind: Service
metadata:
  name: {{ release.name }}-web
spec:
  port: 80
";

pub const CONFIG_MAP: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ release.name }}-config
data:
  greeting: {{ values.greeting }}
";

/// A chart with one workload, its service and a config map.
pub fn web_chart(version: &str) -> Chart {
    Chart::new("web", version)
        .with_values(json!({
            "replicas": 1,
            "image": {"tag": "1.25"},
            "greeting": "hello",
        }))
        .with_template("templates/deployment.yaml", DEPLOYMENT)
        .with_template("templates/service.yaml", SERVICE)
        .with_template("templates/configmap.yaml", CONFIG_MAP)
        .with_template("templates/NOTES.txt", "Visit {{ release.name }}-web")
}

/// A hook job document.
pub fn hook_job(name: &str, phases: &str, weight: i32, policy: &str) -> String {
    format!(
        "\
apiVersion: batch/v1
kind: Job
metadata:
  name: {name}
  annotations:
    keel.sh/hook: {phases}
    keel.sh/hook-weight: \"{weight}\"
    keel.sh/hook-delete-policy: {policy}
spec:
  image: busybox
"
    )
}
