//! Status poller with statum state machine for its worker task
//!
//! The poller only produces [`PollTick`]s. Publishing the broadcast status
//! request and sweeping the registry is done by whoever receives the ticks,
//! so both happen on the same task that handles device reports.
//!
//! # State Machine
//!
//! ```text
//! Armed ──► Running ──► Stopped
//!             │
//!         (interval)
//! ```
//!
//! Every start hands out a new epoch. A tick that was already queued when the
//! poller was stopped or restarted carries an old epoch and is rejected by
//! [`StatusPoller::accepts`], so nothing fires after `stop()` returned.

use statum::{machine, state};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTick {
    pub epoch: u64,
}

#[state]
#[derive(Debug, Clone)]
pub enum PollerState {
    Armed,
    Running,
    Stopped,
}

#[machine]
pub struct PollWorker<S: PollerState> {
    period: Duration,
    epoch: u64,
    tick_tx: mpsc::Sender<PollTick>,
}

impl PollWorker<Armed> {
    pub fn create(period: Duration, epoch: u64, tick_tx: mpsc::Sender<PollTick>) -> Self {
        debug!("Arming status poller epoch {} with period {:?}", epoch, period);
        Self::new(period, epoch, tick_tx)
    }

    pub fn activate(self) -> PollWorker<Running> {
        self.transition()
    }
}

impl PollWorker<Running> {
    /// Ticks immediately, then once per period until shutdown
    pub async fn run_until_shutdown(self, mut shutdown_rx: oneshot::Receiver<()>) -> PollWorker<Stopped> {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    debug!("Shutdown signal received for poller epoch {}", self.epoch);
                    break;
                }
                _ = ticker.tick() => {
                    // Waiting on a full queue must not block shutdown
                    tokio::select! {
                        biased;
                        _ = &mut shutdown_rx => break,
                        sent = self.tick_tx.send(PollTick { epoch: self.epoch }) => {
                            if sent.is_err() {
                                warn!("Tick receiver gone, stopping poller");
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.transition()
    }
}

impl PollWorker<Stopped> {}

/// Handle owning at most one running poller worker
#[derive(Debug)]
pub struct StatusPoller {
    period: Duration,
    tick_tx: mpsc::Sender<PollTick>,
    epoch: u64,
    running: bool,
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl StatusPoller {
    pub fn new(period: Duration, tick_tx: mpsc::Sender<PollTick>) -> Self {
        Self {
            period,
            tick_tx,
            epoch: 0,
            running: false,
            task_handle: None,
            shutdown_tx: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether a received tick should be acted upon
    pub fn accepts(&self, tick: PollTick) -> bool {
        self.running && tick.epoch == self.epoch
    }

    /// Starts polling, restarting cleanly if already running
    pub async fn start(&mut self) {
        self.stop().await;

        self.epoch += 1;
        let worker = PollWorker::create(self.period, self.epoch, self.tick_tx.clone()).activate();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let epoch = self.epoch;

        self.task_handle = Some(tokio::spawn(async move {
            let _stopped = worker.run_until_shutdown(shutdown_rx).await;
            debug!("Poller epoch {} stopped", epoch);
        }));
        self.shutdown_tx = Some(shutdown_tx);
        self.running = true;
        info!("Status polling started every {:?}", self.period);
    }

    /// Stops polling and waits for the worker to finish
    pub async fn stop(&mut self) {
        let was_running = self.running;
        self.running = false;

        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                debug!("Poller task already terminated");
            }
        }
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                warn!("Poller task ended abnormally: {}", e);
            }
        }
        if was_running {
            info!("Status polling stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    const PERIOD: Duration = Duration::from_secs(5);

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_ticks_immediately_then_every_period() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = StatusPoller::new(PERIOD, tx);

        poller.start().await;
        settle().await;
        let first = rx.try_recv().unwrap();
        assert!(poller.accepts(first));

        tokio::time::advance(PERIOD - Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert!(poller.accepts(rx.try_recv().unwrap()));

        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_silences_the_poller() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = StatusPoller::new(PERIOD, tx);

        poller.start().await;
        settle().await;
        let first = rx.try_recv().unwrap();

        poller.stop().await;
        assert!(!poller.is_running());
        assert!(!poller.accepts(first));

        tokio::time::advance(PERIOD * 3).await;
        settle().await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_invalidates_old_ticks() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = StatusPoller::new(PERIOD, tx);

        poller.start().await;
        settle().await;
        let old = rx.try_recv().unwrap();

        poller.start().await;
        settle().await;
        let new = rx.try_recv().unwrap();

        assert!(!poller.accepts(old));
        assert!(poller.accepts(new));
        // Only one worker is left ticking
        tokio::time::advance(PERIOD).await;
        settle().await;
        assert!(rx.try_recv().is_ok());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_not_blocked_by_a_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let mut poller = StatusPoller::new(PERIOD, tx);

        poller.start().await;
        tokio::time::advance(PERIOD * 3).await;
        settle().await;

        poller.stop().await;
        assert!(!poller.is_running());
    }
}
