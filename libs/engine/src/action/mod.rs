//! Release actions.
//!
//! Every action is a plain async function taking an explicit
//! [`Configuration`] and [`ActionOptions`]. Steps run strictly in sequence
//! inside the calling task:
//!
//! 1. validate the request and render (no side effects)
//! 2. check preconditions against the stored history
//! 3. create the pending revision; a revision race fails here with
//!    [`ConflictReason::RevisionRace`]
//! 4. pre hooks, apply, post hooks, optional readiness wait
//! 5. commit the terminal status
//!
//! Failures before step 3 leave no trace. Failures after it commit the
//! revision as `failed` with its attempted manifest.

mod install;
mod query;
mod rollback;
mod uninstall;
mod upgrade;

pub use install::install;
pub use query::{history, list, status};
pub use rollback::rollback;
pub use uninstall::uninstall;
pub use upgrade::upgrade;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_reconcile::{
    Applier, ApplyReport, ClusterClient, Owner, Plan, ReconcileError, Resource, Waiter,
};
use keel_release::{
    Hook, HookPhase, ManifestEntry, ManifestSet, Release, ReleaseInfo, ReleaseStatus,
    ReleaseStore, ResourceKey, StoreError,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::error::{ConflictReason, EngineError};
use crate::hooks::{HookError, HookScheduler};
use crate::render::{Chart, RenderContext, Renderer};

/// Longest accepted release name.
pub const MAX_RELEASE_NAME_LEN: usize = 53;

/// Collaborators and settings threaded into every action.
#[derive(Clone)]
pub struct Configuration {
    pub store: Arc<dyn ReleaseStore>,
    pub cluster: Arc<dyn ClusterClient>,
    pub renderer: Arc<dyn Renderer>,
    pub settings: EngineSettings,
}

impl Configuration {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        cluster: Arc<dyn ClusterClient>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            store,
            cluster,
            renderer,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Per-call options. Each action reads the subset that applies to it.
#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
    /// Wait for mutated workloads to become ready (uninstall: for deletion).
    pub wait: bool,
    /// Per hook and per readiness wait; falls back to the settings.
    pub timeout: Option<Duration>,
    /// Undo the cluster changes of a failed install or upgrade.
    pub atomic: bool,
    pub no_hooks: bool,
    /// Uninstall: keep the revision history.
    pub keep_history: bool,
    /// Render and plan only.
    pub dry_run: bool,
    /// Recreate objects whose update hits an immutable field.
    pub force: bool,
    /// Install: reuse a name that only has non-deployed history.
    pub replace: bool,
    /// Upgrade: merge overrides onto the deployed configuration.
    pub reuse_values: bool,
    /// Upgrade: start from chart defaults; wins over `reuse_values`.
    pub reset_values: bool,
    /// Cancels waits once it holds `true`.
    pub cancel: Option<watch::Receiver<bool>>,
}

/// Result of install, upgrade and rollback.
#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    /// The new revision. Pending and unsaved on dry runs.
    pub release: Release,
    /// Changes applied, or that would be applied on a dry run.
    pub plan: Plan,
}

/// Result of uninstall.
#[derive(Debug, Clone)]
pub struct UninstallOutcome {
    /// The uninstalled revision. Purged from the store unless history was kept.
    pub release: Release,
    pub plan: Plan,
    /// Resources left in the cluster by resource policy.
    pub kept: Vec<ResourceKey>,
}

/// Rendered chart, split into resources and hooks.
struct Rendered {
    set: ManifestSet,
    notes: Option<String>,
}

/// State shared by the steps of one action.
struct ActionContext<'a> {
    cfg: &'a Configuration,
    opts: &'a ActionOptions,
    name: &'a str,
    namespace: &'a str,
    /// `namespace/name`, used in errors.
    label: String,
    /// Persist hook run records onto the release being deployed.
    record_hooks: bool,
}

impl<'a> ActionContext<'a> {
    fn new(
        cfg: &'a Configuration,
        opts: &'a ActionOptions,
        name: &'a str,
        namespace: &'a str,
    ) -> Self {
        Self {
            cfg,
            opts,
            name,
            namespace,
            label: format!("{namespace}/{name}"),
            record_hooks: true,
        }
    }

    fn cluster(&self) -> &'a dyn ClusterClient {
        self.cfg.cluster.as_ref()
    }

    fn store(&self) -> &'a dyn ReleaseStore {
        self.cfg.store.as_ref()
    }

    fn timeout(&self) -> Duration {
        self.opts.timeout.unwrap_or(self.cfg.settings.timeout)
    }

    fn waiter(&self) -> Waiter<'a> {
        Waiter::new(self.cluster())
            .with_poll_interval(self.cfg.settings.poll_interval)
            .with_cancel(self.opts.cancel.clone())
    }

    fn applier(&self) -> Applier<'a> {
        Applier::new(
            self.cluster(),
            Owner::new(self.name, self.namespace),
            self.waiter(),
        )
        .with_force(self.opts.force)
        .with_timeout(self.timeout())
    }

    fn storage(&self, source: StoreError) -> EngineError {
        EngineError::storage(&self.label, source)
    }

    fn conflict(&self, reason: ConflictReason) -> EngineError {
        EngineError::conflict(&self.label, reason)
    }

    fn validation(&self, message: impl Into<String>) -> EngineError {
        EngineError::validation(&self.label, message)
    }

    /// Check the release identity, and the chart and overrides when given.
    fn validate(&self, chart: Option<&Chart>, values: &Value) -> Result<(), EngineError> {
        validate_name(self.name).map_err(|m| self.validation(m))?;
        validate_namespace(self.namespace).map_err(|m| self.validation(m))?;
        if let Some(chart) = chart {
            chart.validate().map_err(|m| self.validation(m))?;
        }
        if !(values.is_object() || values.is_null()) {
            return Err(self.validation("configuration overrides must be a map"));
        }
        Ok(())
    }

    async fn history(&self) -> Result<Vec<Release>, EngineError> {
        self.store()
            .history(self.name, self.namespace)
            .await
            .map_err(|e| self.storage(e))
    }

    /// Refuse to start while the latest revision is still pending.
    fn ensure_idle(&self, history: &[Release]) -> Result<(), EngineError> {
        match history.last() {
            Some(latest) if latest.status().is_pending() => {
                Err(self.conflict(ConflictReason::InProgress {
                    revision: latest.revision,
                    status: latest.status(),
                }))
            }
            _ => Ok(()),
        }
    }

    async fn render(
        &self,
        chart: &Chart,
        config: &Value,
        revision: u32,
        is_install: bool,
    ) -> Result<Rendered, EngineError> {
        let context = RenderContext {
            release_name: self.name.to_string(),
            namespace: self.namespace.to_string(),
            revision,
            is_install,
            is_upgrade: !is_install,
            capabilities: self.cfg.settings.capabilities.clone(),
        };
        let output = self
            .cfg
            .renderer
            .render(chart, config, &context)
            .await
            .map_err(|source| EngineError::Render {
                release: self.label.clone(),
                source,
            })?;
        let set = ManifestSet::from_templates(&output.templates, self.namespace)
            .map_err(|e| self.validation(e.to_string()))?;

        debug!(
            resources = set.resources.len(),
            hooks = set.hooks.len(),
            "Rendered chart"
        );
        Ok(Rendered {
            set,
            notes: output.notes,
        })
    }

    /// Validate documents through the cluster client.
    async fn build(&self, entries: &[ManifestEntry]) -> Result<Vec<Resource>, EngineError> {
        let mut resources = Vec::with_capacity(entries.len());
        for entry in entries {
            let resource = self
                .cluster()
                .build(&entry.raw, self.namespace)
                .await
                .map_err(|e| self.validation(format!("{}: {e}", entry.key)))?;
            resources.push(resource);
        }
        Ok(resources)
    }

    async fn build_hooks(&self, hooks: &[Hook]) -> Result<(), EngineError> {
        for hook in hooks {
            self.cluster()
                .build(&hook.manifest, self.namespace)
                .await
                .map_err(|e| self.validation(format!("hook {}: {e}", hook.key)))?;
        }
        Ok(())
    }

    /// Resources of a stored revision, as they were applied.
    fn stored_resources(&self, release: &Release) -> Result<Vec<Resource>, EngineError> {
        ManifestSet::parse_manifest(&release.manifest, &release.namespace)
            .map(|entries| entries.iter().map(Resource::from_entry).collect())
            .map_err(|e| self.validation(format!("stored manifest of {}: {e}", release.label())))
    }

    /// Resources of a stored revision, validated for re-application.
    async fn rebuild_stored(&self, release: &Release) -> Result<Vec<Resource>, EngineError> {
        let entries = ManifestSet::parse_manifest(&release.manifest, &release.namespace)
            .map_err(|e| self.validation(format!("stored manifest of {}: {e}", release.label())))?;
        self.build(&entries).await
    }

    /// A new pending revision derived from rendered output.
    fn pending_release(
        &self,
        revision: u32,
        chart: &Chart,
        config: Value,
        rendered: &Rendered,
        status: ReleaseStatus,
        description: &str,
    ) -> Release {
        let now = Utc::now();
        Release {
            name: self.name.to_string(),
            namespace: self.namespace.to_string(),
            revision,
            chart: chart.reference(),
            config,
            manifest: rendered.set.manifest_text(),
            hooks: rendered.set.hooks.clone(),
            info: ReleaseInfo {
                status,
                description: description.to_string(),
                first_deployed_at: now,
                last_deployed_at: now,
                deleted_at: None,
                notes: rendered.notes.clone(),
            },
        }
    }

    async fn create_record(&self, release: &Release) -> Result<(), EngineError> {
        match self.store().create(release).await {
            Ok(()) => {
                info!(revision = release.revision, status = %release.status(), "Created release record");
                Ok(())
            }
            Err(e) if e.is_conflict() => Err(self.conflict(ConflictReason::RevisionRace {
                revision: release.revision,
            })),
            Err(e) => Err(self.storage(e)),
        }
    }

    /// Run the hooks of `phase`, persisting their run records unless
    /// recording is off for this context.
    async fn run_hooks(&self, phase: HookPhase, release: &mut Release) -> Result<(), EngineError> {
        if self.opts.no_hooks {
            debug!(phase = %phase, "Skipping hooks");
            return Ok(());
        }

        let scheduler = HookScheduler::new(
            self.cluster(),
            self.waiter(),
            self.namespace,
            self.timeout(),
        );
        match scheduler.run(phase, &mut release.hooks).await {
            Ok(0) => Ok(()),
            Ok(ran) if !self.record_hooks => {
                debug!(phase = %phase, ran, revision = release.revision, "Hook runs not recorded");
                Ok(())
            }
            Ok(_) => self
                .store()
                .update(release)
                .await
                .map_err(|e| self.storage(e)),
            Err(HookError {
                phase,
                hook,
                source,
            }) => Err(match source {
                ReconcileError::Cancelled { .. } => EngineError::Cancelled {
                    release: self.label.clone(),
                    revision: release.revision,
                },
                source => EngineError::HookFailure {
                    release: self.label.clone(),
                    revision: release.revision,
                    phase,
                    hook,
                    reason: source.to_string(),
                },
            }),
        }
    }

    async fn apply(&self, plan: &Plan, revision: u32) -> Result<ApplyReport, EngineError> {
        info!(revision, summary = %plan.summary(), "Applying changes");
        self.applier()
            .apply(plan)
            .await
            .map_err(|e| EngineError::reconcile(&self.label, revision, e))
    }

    /// Wait for mutated workloads if requested.
    async fn wait_ready(&self, report: &ApplyReport, revision: u32) -> Result<(), EngineError> {
        if !self.opts.wait {
            return Ok(());
        }
        let keys: Vec<ResourceKey> = report
            .mutated()
            .filter(|key| key.kind.is_workload())
            .cloned()
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        info!(revision, resources = keys.len(), "Waiting for workloads");
        self.waiter()
            .wait_ready(&keys, self.timeout())
            .await
            .map_err(|e| EngineError::reconcile(&self.label, revision, e))
    }

    /// Pre hooks, apply, post hooks, readiness wait.
    async fn deploy(
        &self,
        release: &mut Release,
        plan: &Plan,
        pre: HookPhase,
        post: HookPhase,
    ) -> Result<ApplyReport, EngineError> {
        self.run_hooks(pre, release).await?;
        let report = self.apply(plan, release.revision).await?;
        self.run_hooks(post, release).await?;
        self.wait_ready(&report, release.revision).await?;
        Ok(report)
    }

    /// Record `release` as failed and hand back `err`.
    ///
    /// A store failure here is logged; the original error wins.
    async fn fail(&self, release: &mut Release, err: EngineError) -> EngineError {
        warn!(revision = release.revision, error = %err, "Operation failed");
        release.transition(ReleaseStatus::Failed, err.to_string());
        if let Err(e) = self.store().update(release).await {
            warn!(revision = release.revision, error = %e, "Failed to record failure");
        }
        err
    }

    /// Record a failure after the pending record exists. Under `atomic`
    /// the attempt is undone as well.
    async fn abort(
        &self,
        release: &mut Release,
        attempted: &[Resource],
        previous: Option<Release>,
        err: EngineError,
    ) -> EngineError {
        let err = self.fail(release, err).await;
        if self.opts.atomic {
            return self.undo(release, attempted, previous, err).await;
        }
        err
    }

    /// Mark `release` deployed and `superseded` superseded in one commit.
    ///
    /// On error `release` is left transitioned in memory only; callers
    /// record the failure through [`Self::fail`].
    async fn commit_deployed(
        &self,
        release: &mut Release,
        superseded: Option<&Release>,
        description: impl Into<String>,
    ) -> Result<(), EngineError> {
        release.transition(ReleaseStatus::Deployed, description);
        release.info.last_deployed_at = Utc::now();

        let result = match superseded {
            Some(previous) => {
                let mut previous = previous.clone();
                previous.transition(
                    ReleaseStatus::Superseded,
                    format!("Superseded by revision {}", release.revision),
                );
                self.store()
                    .update_all(&[previous, release.clone()])
                    .await
            }
            None => self.store().update(release).await,
        };
        result.map_err(|e| self.storage(e))?;

        info!(revision = release.revision, "Release deployed");
        Ok(())
    }

    /// Undo a failed attempt: bring the cluster back to `previous` (or to
    /// nothing) and drop the failed record.
    ///
    /// Restoration ignores the caller's cancellation signal, which may be
    /// what ended the attempt. Rollback hooks run against `previous` but
    /// their run records are not written back to it.
    async fn undo(
        &self,
        failed: &Release,
        attempted: &[Resource],
        previous: Option<Release>,
        cause: EngineError,
    ) -> EngineError {
        let restore_opts = ActionOptions {
            cancel: None,
            ..self.opts.clone()
        };
        let mut ctx = ActionContext::new(self.cfg, &restore_opts, self.name, self.namespace);
        ctx.record_hooks = false;

        match ctx.restore(failed, attempted, previous).await {
            Ok(restored_revision) => {
                info!(
                    failed_revision = failed.revision,
                    restored_revision = ?restored_revision,
                    "Rolled back failed operation"
                );
                EngineError::RolledBack {
                    cause: Box::new(cause),
                    restored_revision,
                }
            }
            Err(rollback) => {
                warn!(failed_revision = failed.revision, error = %rollback, "Rollback failed");
                EngineError::RollbackFailed {
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    async fn restore(
        &self,
        failed: &Release,
        attempted: &[Resource],
        previous: Option<Release>,
    ) -> Result<Option<u32>, EngineError> {
        let restored_revision = match previous {
            Some(mut previous) => {
                let target = self.rebuild_stored(&previous).await?;
                let plan = Plan::compute(attempted, &target);
                self.deploy(
                    &mut previous,
                    &plan,
                    HookPhase::PreRollback,
                    HookPhase::PostRollback,
                )
                .await?;
                Some(previous.revision)
            }
            None => {
                let plan = Plan::uninstall(attempted);
                self.apply(&plan, failed.revision).await?;
                None
            }
        };

        self.store()
            .delete(&failed.name, &failed.namespace, failed.revision)
            .await
            .map_err(|e| self.storage(e))?;
        Ok(restored_revision)
    }

    /// Drop the oldest revisions beyond `max_history`.
    ///
    /// The deployed and the latest revision are never pruned. Failures are
    /// logged only.
    async fn prune(&self) {
        let max = self.cfg.settings.max_history;
        if max == 0 {
            return;
        }
        let history = match self.store().history(self.name, self.namespace).await {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "Failed to load history for pruning");
                return;
            }
        };
        if history.len() <= max {
            return;
        }

        let latest = history.last().map(|r| r.revision);
        let excess = history.len() - max;
        let candidates = history
            .iter()
            .filter(|r| r.status() != ReleaseStatus::Deployed && Some(r.revision) != latest)
            .take(excess);

        for release in candidates {
            match self
                .store()
                .delete(self.name, self.namespace, release.revision)
                .await
            {
                Ok(_) => debug!(revision = release.revision, "Pruned revision"),
                Err(e) => warn!(revision = release.revision, error = %e, "Failed to prune revision"),
            }
        }
    }
}

/// The deployed revision of an ascending history.
fn deployed_in(history: &[Release]) -> Option<&Release> {
    history
        .iter()
        .rev()
        .find(|r| r.status() == ReleaseStatus::Deployed)
}

/// Release names are DNS labels of at most [`MAX_RELEASE_NAME_LEN`] characters.
fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("release name is empty".to_string());
    }
    if name.len() > MAX_RELEASE_NAME_LEN {
        return Err(format!(
            "release name '{name}' is longer than {MAX_RELEASE_NAME_LEN} characters"
        ));
    }
    if !is_dns_label(name) {
        return Err(format!(
            "release name '{name}' must consist of lowercase alphanumerics and '-', \
             starting and ending with an alphanumeric"
        ));
    }
    Ok(())
}

fn validate_namespace(namespace: &str) -> Result<(), String> {
    if namespace.len() > 63 || !is_dns_label(namespace) {
        return Err(format!("invalid namespace '{namespace}'"));
    }
    Ok(())
}

fn is_dns_label(s: &str) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    !s.is_empty()
        && s.chars().all(|c| alnum(c) || c == '-')
        && s.starts_with(alnum)
        && s.ends_with(alnum)
}
