//! Debounced host restart signalling.
//!
//! Reconcile passes that change the module set call
//! [`RestartDebouncer::emit_restart`]; the background loop coalesces every
//! reason recorded within one quiet window into a single host restart signal.
//! Emitters never block: recording a reason only re-arms the deadline.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

use crate::host::RestartSignaler;

/// Coalescing window between the last recorded reason and the signal.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

/// Coalesces module-change notifications into host restart signals.
#[derive(Debug)]
pub struct RestartDebouncer {
    window: Duration,
    state: Mutex<DebounceState>,
}

#[derive(Debug)]
struct DebounceState {
    reason: String,
    deadline: Instant,
}

impl RestartDebouncer {
    /// Creates a debouncer with the given coalescing window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(DebounceState {
                reason: String::new(),
                deadline: Instant::now() + window,
            }),
        }
    }

    /// Records a restart reason and restarts the coalescing window. Multiple
    /// calls before the window expires collapse into one signal; the last
    /// reason wins.
    pub fn emit_restart(&self, reason: &str) {
        let mut state = self.state.lock();
        state.reason = reason.to_string();
        state.deadline = Instant::now() + self.window;
        debug!(reason, "host restart requested");
    }

    /// Runs the coalescing loop until `shutdown` flips to true.
    ///
    /// When the window expires with a reason recorded, the host signal is
    /// raised and the reason cleared; the timer then re-arms unconditionally.
    /// Failure to deliver the signal is fatal: the process exits, since a
    /// host that cannot be told to reload would keep serving a stale module
    /// set.
    pub async fn run(&self, signaler: &dyn RestartSignaler, mut shutdown: watch::Receiver<bool>) {
        loop {
            let deadline = self.state.lock().deadline;
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    debug!("restart debouncer stopped");
                    return;
                }
                () = time::sleep_until(deadline) => {
                    let reason = {
                        let mut state = self.state.lock();
                        if Instant::now() < state.deadline {
                            // Re-armed while we slept; wait out the new window.
                            continue;
                        }
                        state.deadline = Instant::now() + self.window;
                        if state.reason.is_empty() {
                            None
                        } else {
                            Some(std::mem::take(&mut state.reason))
                        }
                    };

                    if let Some(reason) = reason {
                        info!(%reason, "modules changed, requesting host restart");
                        if let Err(err) = signaler.signal_restart() {
                            error!(%err, "sending the host restart signal failed");
                            std::process::exit(1);
                        }
                    }
                }
            }
        }
    }
}
