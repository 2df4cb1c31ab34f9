//! Connectivity-driven suspension of task schedulers.
//!
//! The suspender owns the channel connectivity sources feed and the
//! subscription its observers read. Each transition is published exactly
//! once; repeated events for the current state are dropped.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scheduler::{TaskPanic, TaskScheduler};

/// Reachability of the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Reachable,
    Unreachable,
}

/// Something whose queue can be paused without cancelling in-flight work.
pub trait Suspendable: Send + Sync {
    fn suspend(&self);
    fn resume(&self);
}

impl<E> Suspendable for TaskScheduler<E>
where
    E: Clone + Send + Sync + From<TaskPanic> + 'static,
{
    fn suspend(&self) {
        TaskScheduler::suspend(self);
    }

    fn resume(&self) {
        TaskScheduler::resume(self);
    }
}

/// Suspends its targets while the network is unreachable.
///
/// Starts in [`Connectivity::Reachable`].
pub struct NetworkAwareSuspender {
    targets: Vec<Arc<dyn Suspendable>>,
    state: Mutex<Connectivity>,
    transitions: watch::Sender<Connectivity>,
    signal_tx: mpsc::Sender<Connectivity>,
    signal_rx: Mutex<Option<mpsc::Receiver<Connectivity>>>,
}

impl NetworkAwareSuspender {
    pub fn new(targets: Vec<Arc<dyn Suspendable>>) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(32);
        let (transitions, _) = watch::channel(Connectivity::Reachable);
        Self {
            targets,
            state: Mutex::new(Connectivity::Reachable),
            transitions,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    /// Sender a connectivity source pushes events into.
    pub fn signal(&self) -> mpsc::Sender<Connectivity> {
        self.signal_tx.clone()
    }

    /// Receiver observing every applied transition.
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.transitions.subscribe()
    }

    pub fn state(&self) -> Connectivity {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a connectivity event. Returns `true` if it caused a transition.
    pub fn apply(&self, connectivity: Connectivity) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == connectivity {
                debug!(state = ?connectivity, "connectivity unchanged");
                return false;
            }
            *state = connectivity;
        }

        match connectivity {
            Connectivity::Unreachable => {
                info!(targets = self.targets.len(), "network unreachable, suspending transfers");
                for target in &self.targets {
                    target.suspend();
                }
            }
            Connectivity::Reachable => {
                info!(targets = self.targets.len(), "network reachable, resuming transfers");
                for target in &self.targets {
                    target.resume();
                }
            }
        }
        self.transitions.send_replace(connectivity);
        true
    }

    /// Consumes signal events until `cancel` fires or every sender is gone.
    ///
    /// Only one loop may run per suspender; later calls return immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut rx) = self
            .signal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("connectivity loop already running");
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("connectivity loop cancelled");
                    break;
                }
                event = rx.recv() => match event {
                    Some(connectivity) => {
                        self.apply(connectivity);
                    }
                    None => break,
                },
            }
        }
    }
}
