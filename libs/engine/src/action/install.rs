use keel_reconcile::Plan;
use keel_release::{HookPhase, ReleaseStatus};
use serde_json::Value;
use tracing::{info, instrument, Span};

use super::{deployed_in, ActionContext, ActionOptions, Configuration, ReleaseOutcome};
use crate::error::{ConflictReason, EngineError};
use crate::render::Chart;
use crate::values::merge_values;

/// Install `chart` as a new release.
///
/// The name must have no history, unless `replace` is set; a replaced
/// release continues its revision sequence and the new revision supersedes
/// any deployed one.
#[instrument(
    skip_all,
    fields(
        release = %name,
        namespace = %namespace,
        chart = %chart.metadata.name,
        revision = tracing::field::Empty
    )
)]
pub async fn install(
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
    ctx.ensure_idle(&history)?;
    let deployed = deployed_in(&history).cloned();
    if !history.is_empty() && !opts.replace {
        return Err(ctx.conflict(match &deployed {
            Some(d) => ConflictReason::AlreadyDeployed {
                revision: d.revision,
            },
            None => ConflictReason::NameInUse,
        }));
    }
    let revision = history.last().map_or(1, |r| r.revision + 1);
    Span::current().record("revision", revision);

    let config = merge_values(&chart.values, &values);
    let rendered = ctx.render(chart, &config, revision, true).await?;
    let desired = ctx.build(&rendered.set.resources).await?;
    ctx.build_hooks(&rendered.set.hooks).await?;

    let previous = match &deployed {
        Some(d) => ctx.stored_resources(d)?,
        None => Vec::new(),
    };
    let plan = Plan::compute(&previous, &desired);
    let mut release = ctx.pending_release(
        revision,
        chart,
        config,
        &rendered,
        ReleaseStatus::PendingInstall,
        "Install pending",
    );

    if opts.dry_run {
        info!(summary = %plan.summary(), "Dry run, nothing applied");
        return Ok(ReleaseOutcome { release, plan });
    }

    ctx.create_record(&release).await?;
    if let Err(err) = ctx
        .deploy(&mut release, &plan, HookPhase::PreInstall, HookPhase::PostInstall)
        .await
    {
        return Err(ctx.abort(&mut release, &desired, deployed, err).await);
    }

    if let Err(err) = ctx
        .commit_deployed(&mut release, deployed.as_ref(), "Install complete")
        .await
    {
        return Err(ctx.abort(&mut release, &desired, deployed, err).await);
    }
    ctx.prune().await;
    Ok(ReleaseOutcome { release, plan })
}
