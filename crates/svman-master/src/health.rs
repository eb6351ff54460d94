//! Active health monitoring of registered slaves
//!
//! Every sweep probes each entry concurrently with a `Heartbeat` RPC. A
//! probe that keeps failing evicts the entry (generation-checked, so a
//! fresher registration is never removed). After eviction a detached task
//! tries to dial the slave again and re-register it, so a slow restore never
//! holds up the next sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use svman_common::grpc_max_message_size;
use svman_infra::NodeChannel;
use svman_proto::command_listener_client::CommandListenerClient;
use svman_proto::HeartbeatRequest;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registrar::NodeRegistrar;
use crate::registry::{NodeEntry, RemovalReason, SharedNodeRegistry};

/// Heartbeat failures
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// No answer within the probe timeout
    #[error("heartbeat timed out after {0:?}")]
    Timeout(Duration),

    /// The peer answered with an error status
    #[error("heartbeat failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// The channel was closed locally
    #[error("channel closed")]
    Closed,
}

/// One liveness probe against a node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HeartbeatProbe: Send + Sync {
    /// Send a single heartbeat over `channel`
    async fn probe(&self, machine_name: &str, channel: &NodeChannel) -> Result<(), HeartbeatError>;
}

/// Probe that calls `CommandListener.Heartbeat` on the slave
#[derive(Clone, Copy, Debug, Default)]
pub struct GrpcHeartbeatProbe;

#[async_trait]
impl HeartbeatProbe for GrpcHeartbeatProbe {
    async fn probe(&self, machine_name: &str, channel: &NodeChannel) -> Result<(), HeartbeatError> {
        if channel.is_closed() {
            return Err(HeartbeatError::Closed);
        }

        let max = grpc_max_message_size();
        let mut client = CommandListenerClient::new(channel.authenticated())
            .max_decoding_message_size(max)
            .max_encoding_message_size(max);

        let ack = client
            .heartbeat(HeartbeatRequest {
                text: format!("ping to slave {}", machine_name),
            })
            .await?
            .into_inner();

        debug!(machine = %machine_name, ack = %ack.ok, "heartbeat acknowledged");
        Ok(())
    }
}

/// Run `probe` bounded by `timeout`
pub async fn probe_with_timeout(
    probe: &dyn HeartbeatProbe,
    machine_name: &str,
    channel: &NodeChannel,
    timeout: Duration,
) -> Result<(), HeartbeatError> {
    match tokio::time::timeout(timeout, probe.probe(machine_name, channel)).await {
        Ok(result) => result,
        Err(_) => Err(HeartbeatError::Timeout(timeout)),
    }
}

/// Timing and retry knobs for the monitor
#[derive(Clone, Debug)]
pub struct HealthPolicy {
    /// Time between sweeps
    pub interval: Duration,
    /// Bound on a single probe
    pub probe_timeout: Duration,
    /// Probes per entry per sweep before eviction
    pub attempts: u32,
    /// Pause between failed probes
    pub retry_delay: Duration,
    /// Re-registration attempts after eviction (0 disables restore)
    pub restore_attempts: u32,
    /// Pause between restore attempts
    pub restore_delay: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            attempts: 3,
            retry_delay: Duration::from_secs(2),
            restore_attempts: 3,
            restore_delay: Duration::from_secs(2),
        }
    }
}

/// What a health check did to an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Probe succeeded, last-seen advanced
    Healthy,
    /// Removed from the registry
    Evicted,
    /// Probes failed but the entry had already been replaced
    Superseded,
}

/// Periodic prober of every registry entry
#[derive(Clone)]
pub struct HealthMonitor {
    registry: SharedNodeRegistry,
    probe: Arc<dyn HeartbeatProbe>,
    registrar: Option<Arc<NodeRegistrar>>,
    policy: HealthPolicy,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    /// Create a monitor without restore
    pub fn new(
        registry: SharedNodeRegistry,
        probe: Arc<dyn HeartbeatProbe>,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            registry,
            probe,
            registrar: None,
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    /// Re-register evicted nodes through `registrar`
    pub fn with_restore(mut self, registrar: Arc<NodeRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Sweep every `interval` until `shutdown` fires
    ///
    /// Restores still in flight are abandoned on shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.shutdown = shutdown.clone();
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?self.policy.interval, "health monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.sweep() => {}
                    }
                }
            }
        }
        info!("health monitor stopped");
    }

    /// Check every entry once, concurrently
    pub async fn sweep(&self) -> Vec<(String, HealthOutcome)> {
        let mut checks = JoinSet::new();
        for entry in self.registry.snapshot() {
            let monitor = self.clone();
            checks.spawn(async move {
                let outcome = monitor.check_entry(entry.clone()).await;
                (entry, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(checks.len());
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((entry, outcome)) => {
                    if outcome == HealthOutcome::Evicted {
                        self.spawn_restore(entry.clone());
                    }
                    outcomes.push((entry.machine_name, outcome));
                }
                Err(e) => warn!(error = %e, "health check task failed"),
            }
        }
        outcomes
    }

    fn spawn_restore(&self, entry: NodeEntry) {
        if self.registrar.is_none() || self.policy.restore_attempts == 0 {
            return;
        }

        let monitor = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = monitor.shutdown.cancelled() => {
                    debug!(machine = %entry.machine_name, "restore abandoned on shutdown");
                }
                _ = monitor.restore(&entry) => {}
            }
        });
    }

    /// Probe one entry, evicting it if every attempt fails
    pub async fn check_entry(&self, entry: NodeEntry) -> HealthOutcome {
        if entry.channel.is_closed() {
            warn!(machine = %entry.machine_name, address = %entry.address, "channel closed, evicting");
            return self.evict(&entry).await;
        }

        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            match probe_with_timeout(
                self.probe.as_ref(),
                &entry.machine_name,
                &entry.channel,
                self.policy.probe_timeout,
            )
            .await
            {
                Ok(()) => {
                    self.registry.touch_last_seen(&entry.address);
                    return HealthOutcome::Healthy;
                }
                Err(e) => {
                    warn!(
                        machine = %entry.machine_name,
                        address = %entry.address,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "heartbeat failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        self.evict(&entry).await
    }

    async fn evict(&self, entry: &NodeEntry) -> HealthOutcome {
        let removed = self.registry.remove_if_current(
            &entry.address,
            entry.generation,
            RemovalReason::Unhealthy,
        );
        if removed.is_none() {
            debug!(machine = %entry.machine_name, "entry already replaced, skipping eviction");
            return HealthOutcome::Superseded;
        }

        warn!(
            machine = %entry.machine_name,
            address = %entry.address,
            since_last_seen = ?entry.since_last_seen(),
            "slave evicted"
        );
        HealthOutcome::Evicted
    }

    /// Dial an evicted slave and register it again
    ///
    /// Returns `true` once the slave is back in the registry through this
    /// call. Gives up early when the slave re-registered on its own.
    pub async fn restore(&self, entry: &NodeEntry) -> bool {
        let Some(registrar) = &self.registrar else {
            return false;
        };

        let attempts = self.policy.restore_attempts;
        for attempt in 1..=attempts {
            // The slave may have come back on its own
            if self.registry.get_by_machine_name(&entry.machine_name).is_some() {
                debug!(machine = %entry.machine_name, "slave re-registered itself, restore skipped");
                return false;
            }

            match registrar
                .register(&entry.address, &entry.machine_name)
                .await
            {
                Ok(_) => {
                    info!(machine = %entry.machine_name, attempt, "connection restored");
                    return true;
                }
                Err(e) => {
                    debug!(
                        machine = %entry.machine_name,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "restore attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.restore_delay).await;
                    }
                }
            }
        }
        false
    }
}
