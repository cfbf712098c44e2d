//! Cooperative, single-shot, two-level cancellation.
//!
//! `Drain` stops the crawler and the dequeue side of the worker pool but lets
//! children that are already running finish (used when the first failed
//! bucket ends a run without `--keep-going`). `Abort` additionally tears down
//! running children with SIGTERM → grace → SIGKILL (used on user signals).
//! Escalation is one-way; a cancelled run never resumes.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CancelState {
    #[default]
    Run,
    Drain,
    Abort,
}

#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: std::sync::Arc<watch::Sender<CancelState>>,
    rx: watch::Receiver<CancelState>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(CancelState::Run);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn state(&self) -> CancelState {
        *self.rx.borrow()
    }

    /// Stop handing out new buckets; running children finish on their own.
    pub fn drain(&self) {
        self.escalate(CancelState::Drain);
    }

    /// Stop everything; running children are terminated.
    pub fn abort(&self) {
        self.escalate(CancelState::Abort);
    }

    fn escalate(&self, to: CancelState) {
        self.tx.send_modify(|state| {
            if *state < to {
                *state = to;
            }
        });
    }

    pub fn is_stopped(&self) -> bool {
        self.state() >= CancelState::Drain
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == CancelState::Abort
    }

    /// Resolves once the run is draining or aborting.
    pub async fn stopped(&self) {
        self.wait_for(CancelState::Drain).await;
    }

    /// Resolves once the run is aborting.
    pub async fn aborted(&self) {
        self.wait_for(CancelState::Abort).await;
    }

    async fn wait_for(&self, at_least: CancelState) {
        let mut rx = self.rx.clone();
        while *rx.borrow_and_update() < at_least {
            if rx.changed().await.is_err() {
                // all senders gone, cancellation can no longer happen
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
