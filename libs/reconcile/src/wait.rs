//! Bounded waits on cluster state.
//!
//! Every wait polls [`ClusterClient::state`] (or `get` for deletion) at a
//! fixed interval until the condition holds, the timeout elapses, or the
//! caller's cancellation signal flips to `true`. Waits run inline in the
//! calling task; nothing is spawned.

use std::time::Duration;

use keel_release::ResourceKey;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::cluster::{ClusterClient, ResourceState};
use crate::error::{ClusterError, ReconcileError};

/// Default interval between probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Polls cluster state for a set of resources.
pub struct Waiter<'a> {
    cluster: &'a dyn ClusterClient,
    poll_interval: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> Waiter<'a> {
    pub fn new(cluster: &'a dyn ClusterClient) -> Self {
        Self {
            cluster,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Abort waits once `cancel` holds `true`.
    pub fn with_cancel(mut self, cancel: Option<watch::Receiver<bool>>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait until every resource reports `Ready` or `Succeeded`.
    ///
    /// The timeout covers the whole set. A resource reporting `Failed`
    /// ends the wait immediately.
    pub async fn wait_ready(
        &self,
        keys: &[ResourceKey],
        timeout: Duration,
    ) -> Result<(), ReconcileError> {
        let started = Instant::now();
        let deadline = started + timeout;

        for key in keys {
            loop {
                self.check_cancelled(key)?;
                match self.probe(key).await? {
                    ResourceState::Ready | ResourceState::Succeeded => {
                        debug!(resource = %key, "Resource ready");
                        break;
                    }
                    ResourceState::Failed(reason) => {
                        return Err(ReconcileError::Failed {
                            resource: key.to_string(),
                            reason,
                        });
                    }
                    ResourceState::Pending => self.pause(key, started, deadline).await?,
                }
            }
        }
        Ok(())
    }

    /// Wait until a resource reaches `Succeeded` or `Failed`, returning it.
    pub async fn wait_terminal(
        &self,
        key: &ResourceKey,
        timeout: Duration,
    ) -> Result<ResourceState, ReconcileError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            self.check_cancelled(key)?;
            let state = self.probe(key).await?;
            if state.is_terminal() {
                debug!(resource = %key, state = ?state, "Resource reached terminal state");
                return Ok(state);
            }
            self.pause(key, started, deadline).await?;
        }
    }

    /// Wait until a resource no longer exists.
    pub async fn wait_deleted(
        &self,
        key: &ResourceKey,
        timeout: Duration,
    ) -> Result<(), ReconcileError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            self.check_cancelled(key)?;
            match self.cluster.get(key).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(apply_error(key, e)),
                Ok(_) => self.pause(key, started, deadline).await?,
            }
        }
    }

    async fn probe(&self, key: &ResourceKey) -> Result<ResourceState, ReconcileError> {
        self.cluster
            .state(key)
            .await
            .map_err(|e| apply_error(key, e))
    }

    fn check_cancelled(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        match &self.cancel {
            Some(rx) if *rx.borrow() => Err(ReconcileError::Cancelled {
                resource: key.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Sleep one poll interval, bounded by the deadline.
    async fn pause(
        &self,
        key: &ResourceKey,
        started: Instant,
        deadline: Instant,
    ) -> Result<(), ReconcileError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(ReconcileError::Timeout {
                resource: key.to_string(),
                elapsed: now - started,
            });
        }
        let sleep = tokio::time::sleep(self.poll_interval.min(deadline - now));
        tokio::pin!(sleep);

        let Some(mut cancel) = self.cancel.clone() else {
            sleep.await;
            return Ok(());
        };

        let cancelled = tokio::select! {
            _ = &mut sleep => return Ok(()),
            changed = cancel.changed() => changed.is_ok() && *cancel.borrow(),
        };
        if cancelled {
            return Err(ReconcileError::Cancelled {
                resource: key.to_string(),
            });
        }

        // Sender gone or reset to false: finish the interval.
        sleep.await;
        Ok(())
    }
}

fn apply_error(key: &ResourceKey, source: ClusterError) -> ReconcileError {
    ReconcileError::Apply {
        resource: key.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Resource;
    use crate::fake::FakeCluster;

    async fn job(cluster: &FakeCluster, name: &str) -> ResourceKey {
        let raw = format!("apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: {name}\n");
        let resource = Resource::parse(&raw, "default").unwrap();
        cluster.create(&resource).await.unwrap();
        resource.key
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_terminal_follows_script() {
        let cluster = FakeCluster::new();
        let key = job(&cluster, "migrate").await;
        cluster.script_states(
            "Job",
            "migrate",
            vec![ResourceState::Pending, ResourceState::Pending, ResourceState::Succeeded],
        );

        let waiter = Waiter::new(&cluster).with_poll_interval(Duration::from_millis(10));
        let state = waiter
            .wait_terminal(&key, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state, ResourceState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out() {
        let cluster = FakeCluster::new();
        let key = job(&cluster, "stuck").await;
        cluster.set_state("Job", "stuck", ResourceState::Pending);

        let waiter = Waiter::new(&cluster).with_poll_interval(Duration::from_millis(100));
        let err = waiter
            .wait_ready(&[key], Duration::from_millis(350))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_reports_failure() {
        let cluster = FakeCluster::new();
        let key = job(&cluster, "broken").await;
        cluster.set_state("Job", "broken", ResourceState::Failed("BackoffLimitExceeded".into()));

        let waiter = Waiter::new(&cluster);
        let err = waiter
            .wait_ready(&[key], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Failed { ref reason, .. } if reason == "BackoffLimitExceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let cluster = FakeCluster::new();
        let key = job(&cluster, "slow").await;
        cluster.set_state("Job", "slow", ResourceState::Pending);

        let (tx, rx) = watch::channel(false);
        let waiter = Waiter::new(&cluster)
            .with_poll_interval(Duration::from_secs(1))
            .with_cancel(Some(rx));

        let wait = waiter.wait_terminal(&key, Duration::from_secs(60));
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(wait, cancel);
        assert!(matches!(result, Err(ReconcileError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_wait_deleted() {
        let cluster = FakeCluster::new();
        let key = job(&cluster, "gone").await;
        cluster.delete(&key).await.unwrap();

        Waiter::new(&cluster)
            .wait_deleted(&key, Duration::from_secs(1))
            .await
            .unwrap();
    }
}
