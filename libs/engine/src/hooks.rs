//! Lifecycle hook execution.
//!
//! Hooks of a phase run one at a time, ascending by weight, ties in
//! declaration order. Each hook resource is created, then awaited until the
//! cluster reports a terminal result if its kind runs to completion (jobs,
//! pods). Other kinds count as succeeded once created. The first failure
//! aborts the phase.

use std::time::Duration;

use chrono::Utc;
use keel_reconcile::{ClusterClient, ClusterError, ReconcileError, ResourceState, Waiter};
use keel_release::{Hook, HookDeletePolicy, HookExecution, HookPhase, HookRunPhase, ResourceKey};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A hook that did not succeed.
#[derive(Debug, Error)]
#[error("{phase} hook {hook} failed: {source}")]
pub struct HookError {
    pub phase: HookPhase,
    /// Identity of the failing hook resource.
    pub hook: String,
    #[source]
    pub source: ReconcileError,
}

/// Runs the hooks of one phase against the cluster.
pub struct HookScheduler<'a> {
    cluster: &'a dyn ClusterClient,
    waiter: Waiter<'a>,
    namespace: &'a str,
    timeout: Duration,
}

impl<'a> HookScheduler<'a> {
    /// `timeout` applies to each hook separately.
    pub fn new(
        cluster: &'a dyn ClusterClient,
        waiter: Waiter<'a>,
        namespace: &'a str,
        timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            waiter,
            namespace,
            timeout,
        }
    }

    /// Indices of the hooks that run in `phase`, in execution order.
    pub fn execution_order(hooks: &[Hook], phase: HookPhase) -> Vec<usize> {
        let mut order: Vec<usize> = (0..hooks.len())
            .filter(|&i| hooks[i].runs_in(phase))
            .collect();
        order.sort_by_key(|&i| hooks[i].weight);
        order
    }

    /// Run every hook of `phase`, recording each run in `hooks`.
    ///
    /// Returns the number of hooks executed.
    pub async fn run(&self, phase: HookPhase, hooks: &mut [Hook]) -> Result<usize, HookError> {
        let order = Self::execution_order(hooks, phase);
        if order.is_empty() {
            return Ok(0);
        }
        info!(phase = %phase, count = order.len(), "Running hooks");

        for &index in &order {
            let hook = &mut hooks[index];
            let key = hook.key.clone();
            let fail = |source: ReconcileError| HookError {
                phase,
                hook: key.to_string(),
                source,
            };

            info!(phase = %phase, hook = %key, weight = hook.weight, "Executing hook");

            if hook.has_policy(HookDeletePolicy::BeforeHookCreation) {
                self.remove_leftover(&key).await.map_err(fail)?;
            }

            let resource = self
                .cluster
                .build(&hook.manifest, self.namespace)
                .await
                .map_err(|e| fail(apply_error(&key, e)))?;

            hook.last_run = Some(HookExecution {
                started_at: Utc::now(),
                completed_at: None,
                phase: HookRunPhase::Running,
            });

            let outcome = match self.cluster.create(&resource).await {
                Ok(_) => self.await_completion(&key).await,
                Err(e) => Err(apply_error(&key, e)),
            };

            if let Some(run) = hook.last_run.as_mut() {
                run.completed_at = Some(Utc::now());
                run.phase = if outcome.is_ok() {
                    HookRunPhase::Succeeded
                } else {
                    HookRunPhase::Failed
                };
            }

            match outcome {
                Ok(()) => {
                    debug!(phase = %phase, hook = %key, "Hook succeeded");
                    if hook.has_policy(HookDeletePolicy::HookSucceeded) {
                        self.delete_quietly(&key).await;
                    }
                }
                Err(source) => {
                    warn!(phase = %phase, hook = %key, error = %source, "Hook failed");
                    if hook.has_policy(HookDeletePolicy::HookFailed) {
                        self.delete_quietly(&key).await;
                    }
                    return Err(fail(source));
                }
            }
        }

        Ok(order.len())
    }

    async fn remove_leftover(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        match self.cluster.get(key).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(apply_error(key, e)),
        }

        debug!(hook = %key, "Deleting previous hook resource");
        match self.cluster.delete(key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(apply_error(key, e)),
        }
        self.waiter.wait_deleted(key, self.timeout).await
    }

    async fn await_completion(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        if !key.kind.runs_to_completion() {
            return Ok(());
        }
        match self.waiter.wait_terminal(key, self.timeout).await? {
            ResourceState::Failed(reason) => Err(ReconcileError::Failed {
                resource: key.to_string(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    /// Apply a delete policy. Failures are logged, not propagated.
    async fn delete_quietly(&self, key: &ResourceKey) {
        match self.cluster.delete(key).await {
            Ok(()) => debug!(hook = %key, "Deleted hook resource per delete policy"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(hook = %key, error = %e, "Failed to delete hook resource"),
        }
    }
}

fn apply_error(key: &ResourceKey, source: ClusterError) -> ReconcileError {
    ReconcileError::Apply {
        resource: key.to_string(),
        source,
    }
}
