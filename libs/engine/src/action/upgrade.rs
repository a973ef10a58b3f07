use keel_reconcile::Plan;
use keel_release::{HookPhase, ReleaseStatus};
use serde_json::Value;
use tracing::{debug, info, instrument, Span};

use super::{deployed_in, ActionContext, ActionOptions, Configuration, ReleaseOutcome};
use crate::error::{ConflictReason, EngineError};
use crate::render::Chart;
use crate::values::merge_values;

/// Upgrade the deployed revision of a release to `chart` with `values`.
///
/// The new revision is diffed against the deployed revision's stored
/// manifest. On success the two are committed together as `deployed` and
/// `superseded`. With `atomic`, a failure restores the deployed revision
/// and removes the failed attempt from history.
#[instrument(
    skip_all,
    fields(
        release = %name,
        namespace = %namespace,
        chart = %chart.metadata.name,
        revision = tracing::field::Empty
    )
)]
pub async fn upgrade(
    cfg: &Configuration,
    name: &str,
    namespace: &str,
    chart: &Chart,
    values: Value,
    opts: &ActionOptions,
) -> Result<ReleaseOutcome, EngineError> {
    let ctx = ActionContext::new(cfg, opts, name, namespace);
    ctx.validate(Some(chart), &values)?;

    let history = ctx.history().await?;
    let Some(latest) = history.last() else {
        return Err(EngineError::NotFound {
            release: ctx.label.clone(),
            revision: None,
        });
    };
    ctx.ensure_idle(&history)?;
    let Some(deployed) = deployed_in(&history).cloned() else {
        return Err(ctx.conflict(ConflictReason::NotDeployed {
            latest: latest.revision,
            status: latest.status(),
        }));
    };
    let revision = latest.revision + 1;
    Span::current().record("revision", revision);

    let base = if opts.reuse_values && !opts.reset_values {
        debug!(from = deployed.revision, "Reusing deployed configuration");
        &deployed.config
    } else {
        &chart.values
    };
    let config = merge_values(base, &values);

    let rendered = ctx.render(chart, &config, revision, false).await?;
    let desired = ctx.build(&rendered.set.resources).await?;
    ctx.build_hooks(&rendered.set.hooks).await?;
    let previous = ctx.stored_resources(&deployed)?;
    let plan = Plan::compute(&previous, &desired);

    let mut release = ctx.pending_release(
        revision,
        chart,
        config,
        &rendered,
        ReleaseStatus::PendingUpgrade,
        "Upgrade pending",
    );
    release.info.first_deployed_at = deployed.info.first_deployed_at;

    if opts.dry_run {
        info!(summary = %plan.summary(), "Dry run, nothing applied");
        return Ok(ReleaseOutcome { release, plan });
    }

    ctx.create_record(&release).await?;
    if let Err(err) = ctx
        .deploy(&mut release, &plan, HookPhase::PreUpgrade, HookPhase::PostUpgrade)
        .await
    {
        return Err(ctx.abort(&mut release, &desired, Some(deployed), err).await);
    }

    if let Err(err) = ctx
        .commit_deployed(&mut release, Some(&deployed), "Upgrade complete")
        .await
    {
        return Err(ctx.abort(&mut release, &desired, Some(deployed), err).await);
    }
    ctx.prune().await;
    Ok(ReleaseOutcome { release, plan })
}
