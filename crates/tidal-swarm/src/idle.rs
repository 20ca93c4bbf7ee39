//! Idle teardown: wait until no watched core has served a block for a whole
//! window.

use std::time::Duration;

use tidal_core::{Core, CoreEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleState {
    /// Watching, timer not started.
    Active,
    /// Shut down at `deadline` unless a watched core uploads first.
    Armed { deadline: Instant },
    /// The window elapsed.
    ShuttingDown,
}

/// Tracks upload activity on a set of cores.
///
/// Only `Upload` events count; appends and downloads never re-arm the timer.
pub struct IdleMonitor {
    window: Duration,
    state: IdleState,
    tx: mpsc::UnboundedSender<u64>,
    rx: mpsc::UnboundedReceiver<u64>,
    watchers: Vec<JoinHandle<()>>,
}

impl IdleMonitor {
    pub fn new(window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            window,
            state: IdleState::Active,
            tx,
            rx,
            watchers: Vec::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    /// Count uploads of `core` as activity. Must be called from within a
    /// tokio runtime.
    pub fn watch(&mut self, core: &Core) {
        let mut events = core.subscribe();
        let tx = self.tx.clone();
        let name = core.key().short_id();
        self.watchers.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CoreEvent::Upload { bytes, .. }) => {
                        if tx.send(bytes).is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!(core = %name, missed, "idle watcher lagged");
                        if tx.send(0).is_err() {
                            return;
                        }
                    }
                    Ok(CoreEvent::Closed) | Err(RecvError::Closed) => return,
                    Ok(_) => {}
                }
            }
        }));
    }

    /// Arm the timer and wait until it expires. Each upload pushes the
    /// deadline to `now + window`. Returns the bytes uploaded meanwhile.
    pub async fn run(&mut self) -> u64 {
        let mut deadline = Instant::now() + self.window;
        self.state = IdleState::Armed { deadline };
        debug!(window = ?self.window, "idle timer armed");

        let mut uploaded = 0u64;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                activity = self.rx.recv() => match activity {
                    Some(bytes) => {
                        uploaded += bytes;
                        deadline = Instant::now() + self.window;
                        self.state = IdleState::Armed { deadline };
                    }
                    None => {
                        tokio::time::sleep_until(deadline).await;
                        break;
                    }
                },
            }
        }

        self.state = IdleState::ShuttingDown;
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        info!(uploaded, "idle window elapsed");
        uploaded
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}
