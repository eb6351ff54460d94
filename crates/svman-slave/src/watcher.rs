//! Passive connectivity watcher
//!
//! Follows the connectivity state of the channel to the master and decides
//! when the session has to be torn down. An idle channel is nudged with a
//! request so the transport reconnects on its own; anything that looks like
//! a failed connection ends the session.

use std::future::Future;

use svman_infra::ConnectivityState;
use tokio::sync::watch;
use tracing::{debug, warn};

/// What the watcher does on a state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchAction {
    /// Nothing to do until the state changes
    Wait,
    /// Issue a request to make the transport reconnect
    Nudge,
    /// Give up on the channel
    Restart,
}

/// Why the watcher stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchExit {
    /// The channel entered a state that requires a new session
    Degraded(ConnectivityState),
    /// The state publisher went away
    Aborted,
}

/// Transition function of the watcher
///
/// `nudged` is true while a nudge is outstanding, i.e. the watcher nudged an
/// idle channel and has not seen it become ready since.
pub fn next_action(state: ConnectivityState, nudged: bool) -> WatchAction {
    match state {
        ConnectivityState::Ready => WatchAction::Wait,
        ConnectivityState::Idle => WatchAction::Nudge,
        ConnectivityState::Connecting if nudged => WatchAction::Wait,
        ConnectivityState::Connecting
        | ConnectivityState::TransientFailure
        | ConnectivityState::Shutdown => WatchAction::Restart,
    }
}

/// Watch `states` until the channel needs replacing
pub async fn watch_connectivity<N, Fut>(
    mut states: watch::Receiver<ConnectivityState>,
    mut nudge: N,
) -> WatchExit
where
    N: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut nudged = false;
    loop {
        let state = *states.borrow_and_update();
        match next_action(state, nudged) {
            WatchAction::Wait => {
                if state == ConnectivityState::Ready {
                    nudged = false;
                }
            }
            WatchAction::Nudge => {
                debug!("channel idle, nudging");
                nudged = true;
                nudge().await;
            }
            WatchAction::Restart => {
                warn!(state = %state, "connection to master degraded");
                return WatchExit::Degraded(state);
            }
        }

        if states.changed().await.is_err() {
            warn!("connectivity publisher dropped");
            return WatchExit::Aborted;
        }
    }
}
