//! Per-connection liveness watchdog
//!
//! Watches a connection's [`ConnectivityState`] and decides when its peer is
//! gone. `Shutdown` is terminal at once. `TransientFailure` is terminal only
//! if it persists (or turns into `Shutdown`) after the settle window, since
//! an unreachable peer shows up as a lasting transient failure rather than a
//! shutdown. Cancelling the watchdog is never reported as peer loss.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connectivity::ConnectivityState;

/// How a watchdog run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The peer is gone; carries the state that proved it
    PeerLost(ConnectivityState),
    /// The owner cancelled the watch
    Cancelled,
}

/// Watches one connection until its peer is lost or the watch is cancelled
pub struct Watchdog {
    endpoint: String,
    states: watch::Receiver<ConnectivityState>,
    cancel: CancellationToken,
    settle_window: Duration,
}

impl Watchdog {
    /// Create a watchdog over `states`
    pub fn new(
        endpoint: impl Into<String>,
        states: watch::Receiver<ConnectivityState>,
        cancel: CancellationToken,
        settle_window: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            states,
            cancel,
            settle_window,
        }
    }

    /// Run until a terminal verdict
    pub async fn run(mut self) -> WatchdogOutcome {
        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }
            let state = *self.states.borrow_and_update();
            debug!(endpoint = %self.endpoint, ?state, "Connectivity state");

            match state {
                ConnectivityState::Shutdown => return WatchdogOutcome::PeerLost(state),
                ConnectivityState::TransientFailure => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return self.cancelled(),
                        _ = tokio::time::sleep(self.settle_window) => {}
                    }

                    let settled = *self.states.borrow_and_update();
                    if matches!(
                        settled,
                        ConnectivityState::TransientFailure | ConnectivityState::Shutdown
                    ) {
                        return WatchdogOutcome::PeerLost(settled);
                    }
                    continue;
                }
                _ => {}
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(),
                changed = self.states.changed() => {
                    // Every tracker is gone, so the owning connection was dropped
                    if changed.is_err() {
                        return self.cancelled();
                    }
                }
            }
        }
    }

    fn cancelled(&self) -> WatchdogOutcome {
        debug!(endpoint = %self.endpoint, "Watchdog cancelled");
        WatchdogOutcome::Cancelled
    }
}
