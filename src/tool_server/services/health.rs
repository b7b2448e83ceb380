//! Periodic liveness checks and health-change subscriptions.

use super::instance::SharedHealth;
use crate::tool_server::domain::{
    ContainerId, HealthChange, HealthCheckPolicy, HealthSnapshot, ServerId,
};
use crate::tool_server::ports::ContainerRuntime;
use crate::tool_server::protocol::ProtocolClient;
use mockable::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Watcher {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// What one liveness task checks.
///
/// Each tick runs `exec_command` in the container, then pings the tool
/// process unless a call is already in flight on its client.
pub struct LivenessTarget {
    /// Protocol client of the server.
    pub client: Arc<ProtocolClient>,
    /// Engine running the server's container.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// The server's container.
    pub container_id: ContainerId,
    /// Command that must exit with status zero.
    pub exec_command: Vec<String>,
    /// Bound on one exec check.
    pub exec_timeout: Duration,
}

/// Runs one liveness task per registered server.
pub struct HealthMonitor<C>
where
    C: Clock + Send + Sync + 'static,
{
    clock: Arc<C>,
    ping_timeout: Duration,
    events: broadcast::Sender<HealthChange>,
    watchers: Mutex<HashMap<ServerId, Watcher>>,
}

impl<C> HealthMonitor<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Creates a monitor buffering `event_capacity` changes per subscriber.
    #[must_use]
    pub fn new(clock: Arc<C>, ping_timeout: Duration, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            clock,
            ping_timeout,
            events,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts checking `server_id` every `policy.interval()`.
    ///
    /// A server is reported unhealthy after more than `policy.max_retries()`
    /// consecutive failed checks and healthy again after the next success.
    /// Watching an already-watched server replaces the previous task.
    pub fn watch(
        &self,
        server_id: ServerId,
        target: LivenessTarget,
        health: SharedHealth,
        policy: HealthCheckPolicy,
    ) {
        let (stop, stop_rx) = watch::channel(false);
        let liveness = LivenessLoop {
            server_id: server_id.clone(),
            target,
            health,
            policy,
            ping_timeout: self.ping_timeout,
            clock: Arc::clone(&self.clock),
            events: self.events.clone(),
        };
        let task = tokio::spawn(liveness.run(stop_rx));

        let previous = self
            .watchers
            .lock()
            .ok()
            .and_then(|mut watchers| watchers.insert(server_id, Watcher { stop, task }));
        if let Some(replaced) = previous {
            drop(replaced.stop.send(true));
            replaced.task.abort();
        }
    }

    /// Stops the liveness task for `server_id` and waits for it to finish.
    pub async fn unwatch(&self, server_id: &ServerId) {
        let watcher = self
            .watchers
            .lock()
            .ok()
            .and_then(|mut watchers| watchers.remove(server_id));
        if let Some(Watcher { stop, task }) = watcher {
            drop(stop.send(true));
            if let Err(err) = task.await
                && err.is_panic()
            {
                tracing::warn!(server = %server_id, error = %err, "liveness task panicked");
            }
        }
    }

    /// Stops every liveness task.
    pub async fn unwatch_all(&self) {
        let server_ids: Vec<ServerId> = self
            .watchers
            .lock()
            .map(|watchers| watchers.keys().cloned().collect())
            .unwrap_or_default();
        for server_id in server_ids {
            self.unwatch(&server_id).await;
        }
    }

    /// Returns whether `server_id` has a liveness task.
    #[must_use]
    pub fn is_watching(&self, server_id: &ServerId) -> bool {
        self.watchers
            .lock()
            .is_ok_and(|watchers| watchers.contains_key(server_id))
    }

    /// Subscribes to health changes, optionally for one server only.
    #[must_use]
    pub fn subscribe(&self, filter: Option<ServerId>) -> HealthSubscription {
        HealthSubscription {
            receiver: self.events.subscribe(),
            filter,
        }
    }

    /// Stores `snapshot` and notifies subscribers if the status changed.
    pub fn record(&self, server_id: &ServerId, health: &SharedHealth, snapshot: HealthSnapshot) {
        record_snapshot(server_id, health, snapshot, &self.events);
    }

    /// Returns the current time from the injected clock.
    #[must_use]
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.utc()
    }
}

/// Receiver of health-change notifications. Dropping it unsubscribes.
pub struct HealthSubscription {
    receiver: broadcast::Receiver<HealthChange>,
    filter: Option<ServerId>,
}

impl HealthSubscription {
    /// Waits for the next matching change.
    ///
    /// Returns `None` once the monitor is gone. Changes missed because the
    /// subscriber fell behind are skipped.
    pub async fn recv(&mut self) -> Option<HealthChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if self.matches(&change) => return Some(change),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "health subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, change: &HealthChange) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|server_id| server_id == change.server_id())
    }
}

struct LivenessLoop<C>
where
    C: Clock + Send + Sync + 'static,
{
    server_id: ServerId,
    target: LivenessTarget,
    health: SharedHealth,
    policy: HealthCheckPolicy,
    ping_timeout: Duration,
    clock: Arc<C>,
    events: broadcast::Sender<HealthChange>,
}

impl<C> LivenessLoop<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.policy.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }

            let snapshot = match self.check().await {
                Ok(()) => {
                    consecutive_failures = 0;
                    Some(HealthSnapshot::healthy(self.clock.utc()))
                }
                Err(reason) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::debug!(server = %self.server_id, consecutive_failures, reason = %reason, "liveness check failed");
                    (consecutive_failures > self.policy.max_retries()).then(|| {
                        HealthSnapshot::unhealthy(
                            self.clock.utc(),
                            format!("{consecutive_failures} consecutive failed checks; last: {reason}"),
                        )
                    })
                }
            };

            if let Some(current) = snapshot {
                record_snapshot(&self.server_id, &self.health, current, &self.events);
            }
        }
    }

    async fn check(&self) -> Result<(), String> {
        let target = &self.target;
        let exec = target
            .runtime
            .exec_probe(&target.container_id, &target.exec_command);
        match tokio::time::timeout(target.exec_timeout, exec).await {
            Ok(Ok(0)) => {}
            Ok(Ok(status)) => return Err(format!("exec check exited with status {status}")),
            Ok(Err(err)) => return Err(format!("exec check failed: {err}")),
            Err(_) => {
                return Err(format!("exec check timed out after {:?}", target.exec_timeout));
            }
        }

        match tokio::time::timeout(self.ping_timeout, target.client.ping_if_idle()).await {
            Ok(None) => {
                tracing::trace!(server = %self.server_id, "call in flight; ping skipped");
                Ok(())
            }
            Ok(Some(Ok(()))) => Ok(()),
            Ok(Some(Err(err))) => Err(err.to_string()),
            Err(_) => Err(format!("ping timed out after {:?}", self.ping_timeout)),
        }
    }
}

fn record_snapshot(
    server_id: &ServerId,
    health: &SharedHealth,
    snapshot: HealthSnapshot,
    events: &broadcast::Sender<HealthChange>,
) {
    let previous = match health.write() {
        Ok(mut guard) => std::mem::replace(&mut *guard, snapshot.clone()).status(),
        Err(poisoned) => {
            let mut guard = poisoned.into_inner();
            std::mem::replace(&mut *guard, snapshot.clone()).status()
        }
    };
    if previous != snapshot.status() {
        tracing::info!(server = %server_id, previous = %previous, current = %snapshot.status(), "server health changed");
        // No subscribers is fine.
        drop(events.send(HealthChange::new(server_id.clone(), previous, snapshot)));
    }
}
