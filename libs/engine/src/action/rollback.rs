use chrono::Utc;
use keel_reconcile::Plan;
use keel_release::{HookPhase, Release, ReleaseInfo, ReleaseStatus};
use tracing::{info, instrument, Span};

use super::{deployed_in, ActionContext, ActionOptions, Configuration, ReleaseOutcome};
use crate::error::EngineError;

/// Roll a release back to revision `target`; `0` means the revision before
/// the latest one.
///
/// The new revision copies the target's chart, configuration, manifest and
/// hooks verbatim; nothing is re-rendered. The cluster is diffed from the
/// deployed revision, or from the latest one when nothing is deployed.
#[instrument(
    skip_all,
    fields(
        release = %name,
        namespace = %namespace,
        requested = target,
        revision = tracing::field::Empty
    )
)]
pub async fn rollback(
    cfg: &Configuration,
    name: &str,
    namespace: &str,
    target: u32,
    opts: &ActionOptions,
) -> Result<ReleaseOutcome, EngineError> {
    let ctx = ActionContext::new(cfg, opts, name, namespace);
    ctx.validate(None, &serde_json::Value::Null)?;

    let history = ctx.history().await?;
    let Some(latest) = history.last() else {
        return Err(EngineError::NotFound {
            release: ctx.label.clone(),
            revision: None,
        });
    };
    ctx.ensure_idle(&history)?;

    let deployed = deployed_in(&history).cloned();
    let current = deployed.as_ref().unwrap_or(latest);
    let target = if target == 0 {
        latest.revision.saturating_sub(1)
    } else {
        target
    };
    let Some(source) = history.iter().find(|r| r.revision == target && target > 0) else {
        return Err(EngineError::NotFound {
            release: ctx.label.clone(),
            revision: Some(target),
        });
    };
    let revision = latest.revision + 1;
    Span::current().record("revision", revision);
    info!(from = current.revision, to = target, "Rolling back");

    let previous = ctx.stored_resources(current)?;
    let desired = ctx.rebuild_stored(source).await?;
    let plan = Plan::compute(&previous, &desired);

    let mut hooks = source.hooks.clone();
    for hook in &mut hooks {
        hook.last_run = None;
    }
    let mut release = Release {
        name: name.to_string(),
        namespace: namespace.to_string(),
        revision,
        chart: source.chart.clone(),
        config: source.config.clone(),
        manifest: source.manifest.clone(),
        hooks,
        info: ReleaseInfo {
            status: ReleaseStatus::PendingRollback,
            description: format!("Rollback to {target}"),
            first_deployed_at: current.info.first_deployed_at,
            last_deployed_at: Utc::now(),
            deleted_at: None,
            notes: source.info.notes.clone(),
        },
    };

    if opts.dry_run {
        info!(summary = %plan.summary(), "Dry run, nothing applied");
        return Ok(ReleaseOutcome { release, plan });
    }

    ctx.create_record(&release).await?;
    if let Err(err) = ctx
        .deploy(&mut release, &plan, HookPhase::PreRollback, HookPhase::PostRollback)
        .await
    {
        return Err(ctx.fail(&mut release, err).await);
    }

    if let Err(err) = ctx
        .commit_deployed(&mut release, deployed.as_ref(), format!("Rollback to {target}"))
        .await
    {
        return Err(ctx.fail(&mut release, err).await);
    }
    ctx.prune().await;
    Ok(ReleaseOutcome { release, plan })
}
