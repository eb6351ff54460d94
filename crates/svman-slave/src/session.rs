//! Slave session with the master
//!
//! Runs the dial → register → monitor cycle forever. Failed dials and
//! registrations back off exponentially; a successful registration resets
//! the backoff. Monitoring runs the connectivity watcher and the heartbeat
//! loop side by side, and whichever gives up first ends the session.

use std::sync::Arc;
use std::time::Duration;

use svman_common::{Backoff, BackoffPolicy};
use svman_infra::{ConnectivityState, NodeChannel};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::heartbeat::heartbeat_loop;
use crate::link::{MasterLink, SessionError};
use crate::watcher::{watch_connectivity, WatchExit};

/// Where the session currently is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No channel; waiting out the backoff or not started
    Disconnected,
    /// Dialing the master
    Dialing,
    /// Channel up, register call in flight
    Registering,
    /// Registered with the master
    Connected,
    /// Watcher and heartbeat running
    Monitoring,
}

/// Why monitoring ended
#[derive(Debug)]
pub enum MonitorExit {
    /// Shutdown was requested
    Shutdown,
    /// The watcher saw the channel degrade
    Degraded(ConnectivityState),
    /// The watcher lost its state feed
    WatchAborted,
    /// A heartbeat failed
    HeartbeatFailed(SessionError),
}

/// Dial/register/monitor loop against one master
pub struct Session {
    link: Arc<dyn MasterLink>,
    heartbeat_interval: Duration,
    backoff: BackoffPolicy,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// Create a session using `link` to reach the master
    pub fn new(
        link: Arc<dyn MasterLink>,
        heartbeat_interval: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            link,
            heartbeat_interval,
            backoff,
            state,
        }
    }

    /// Subscribe to session state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "session state");
            *current = next;
            true
        });
    }

    /// Run until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(self.backoff.clone());

        while !shutdown.is_cancelled() {
            match self.establish(&shutdown).await {
                Ok(Some(channel)) => {
                    backoff.reset();
                    let exit = self.monitor(&channel, &shutdown).await;
                    channel.close();
                    self.set_state(SessionState::Disconnected);
                    match exit {
                        MonitorExit::Shutdown => break,
                        MonitorExit::Degraded(state) => {
                            warn!(state = %state, "lost connection to master")
                        }
                        MonitorExit::WatchAborted => warn!("lost connection to master"),
                        MonitorExit::HeartbeatFailed(e) => {
                            warn!(error = %e, "lost connection to master")
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.set_state(SessionState::Disconnected);
                    warn!(error = %e, retry_in = ?backoff.peek(), "could not join master");
                }
            }

            let delay = backoff.next_delay();
            debug!(?delay, "waiting before next session");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SessionState::Disconnected);
        info!("session stopped");
    }

    /// Dial and register once
    ///
    /// `Ok(None)` means shutdown fired first.
    async fn establish(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<NodeChannel>, SessionError> {
        self.set_state(SessionState::Dialing);
        let channel = tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            dialed = self.link.dial() => dialed?,
        };

        self.set_state(SessionState::Registering);
        let registered = tokio::select! {
            _ = shutdown.cancelled() => {
                channel.close();
                return Ok(None);
            }
            registered = self.link.register(&channel) => registered,
        };
        if let Err(e) = registered {
            channel.close();
            return Err(e);
        }

        self.set_state(SessionState::Connected);
        info!("registered with master");
        Ok(Some(channel))
    }

    async fn monitor(&self, channel: &NodeChannel, shutdown: &CancellationToken) -> MonitorExit {
        self.set_state(SessionState::Monitoring);

        let mut watcher = {
            let link = self.link.clone();
            let nudge_channel = channel.clone();
            tokio::spawn(watch_connectivity(channel.watch_state(), move || {
                let link = link.clone();
                let channel = nudge_channel.clone();
                async move {
                    if let Err(e) = link.heartbeat(&channel).await {
                        debug!(error = %e, "nudge heartbeat failed");
                    }
                }
            }))
        };

        let mut heartbeat = {
            let link = self.link.clone();
            let channel = channel.clone();
            let interval = self.heartbeat_interval;
            tokio::spawn(async move { heartbeat_loop(link.as_ref(), &channel, interval).await })
        };

        let exit = tokio::select! {
            _ = shutdown.cancelled() => MonitorExit::Shutdown,
            watched = &mut watcher => match watched {
                Ok(WatchExit::Degraded(state)) => MonitorExit::Degraded(state),
                Ok(WatchExit::Aborted) | Err(_) => MonitorExit::WatchAborted,
            },
            beat = &mut heartbeat => match beat {
                Ok(e) => MonitorExit::HeartbeatFailed(e),
                Err(_) => MonitorExit::WatchAborted,
            },
        };

        watcher.abort();
        heartbeat.abort();
        exit
    }
}
