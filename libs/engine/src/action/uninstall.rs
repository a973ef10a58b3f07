use chrono::Utc;
use keel_reconcile::Plan;
use keel_release::{HookPhase, Release, ReleaseStatus};
use tracing::{info, instrument, warn, Span};

use super::{deployed_in, ActionContext, ActionOptions, Configuration, UninstallOutcome};
use crate::error::{ConflictReason, EngineError};

/// Delete a release's resources, then its history unless `keep_history`.
///
/// Resources are deleted in reverse apply order, skipping those kept by
/// resource policy. A release already uninstalled with history kept can be
/// purged by a second call without `keep_history`.
#[instrument(
    skip_all,
    fields(release = %name, namespace = %namespace, revision = tracing::field::Empty)
)]
pub async fn uninstall(
    cfg: &Configuration,
    name: &str,
    namespace: &str,
    opts: &ActionOptions,
) -> Result<UninstallOutcome, EngineError> {
    let ctx = ActionContext::new(cfg, opts, name, namespace);
    ctx.validate(None, &serde_json::Value::Null)?;

    let history = ctx.history().await?;
    let Some(latest) = history.last() else {
        return Err(EngineError::NotFound {
            release: ctx.label.clone(),
            revision: None,
        });
    };

    if latest.status() == ReleaseStatus::Uninstalled {
        if opts.keep_history {
            return Err(ctx.conflict(ConflictReason::AlreadyUninstalled {
                revision: latest.revision,
            }));
        }
        let release = latest.clone();
        if !opts.dry_run {
            purge(&ctx, &history).await?;
        }
        return Ok(UninstallOutcome {
            release,
            plan: Plan::default(),
            kept: Vec::new(),
        });
    }
    ctx.ensure_idle(&history)?;

    let mut release = deployed_in(&history).unwrap_or(latest).clone();
    Span::current().record("revision", release.revision);

    let previous = ctx.stored_resources(&release)?;
    let plan = Plan::uninstall(&previous);
    let kept = plan.kept.clone();

    if opts.dry_run {
        info!(summary = %plan.summary(), "Dry run, nothing deleted");
        return Ok(UninstallOutcome {
            release,
            plan,
            kept,
        });
    }

    release.transition(ReleaseStatus::Uninstalling, "Deletion in progress");
    ctx.store()
        .update(&release)
        .await
        .map_err(|e| ctx.storage(e))?;

    if let Err(err) = delete_resources(&ctx, &mut release, &plan).await {
        return Err(ctx.fail(&mut release, err).await);
    }

    release.transition(ReleaseStatus::Uninstalled, "Uninstallation complete");
    release.info.deleted_at = Some(Utc::now());
    for key in &kept {
        warn!(resource = %key, "Resource kept by policy, not deleted");
    }

    let committed = if opts.keep_history {
        ctx.store()
            .update(&release)
            .await
            .map_err(|e| ctx.storage(e))
    } else {
        purge(&ctx, &history).await
    };
    if let Err(err) = committed {
        return Err(ctx.fail(&mut release, err).await);
    }

    info!(deleted = plan.changes.len(), kept = kept.len(), "Release uninstalled");
    Ok(UninstallOutcome {
        release,
        plan,
        kept,
    })
}

async fn delete_resources(
    ctx: &ActionContext<'_>,
    release: &mut Release,
    plan: &Plan,
) -> Result<(), EngineError> {
    ctx.run_hooks(HookPhase::PreDelete, release).await?;
    let report = ctx.apply(plan, release.revision).await?;

    if ctx.opts.wait {
        let waiter = ctx.waiter();
        for key in &report.deleted {
            waiter
                .wait_deleted(key, ctx.timeout())
                .await
                .map_err(|e| EngineError::reconcile(&ctx.label, release.revision, e))?;
        }
    }

    ctx.run_hooks(HookPhase::PostDelete, release).await
}

/// Remove every stored revision.
async fn purge(ctx: &ActionContext<'_>, history: &[Release]) -> Result<(), EngineError> {
    for release in history {
        ctx.store()
            .delete(&release.name, &release.namespace, release.revision)
            .await
            .map_err(|e| ctx.storage(e))?;
    }
    info!(revisions = history.len(), "Purged release history");
    Ok(())
}
