//! Remote API reachability tracking
//!
//! Components report definite network failures and successes here. The
//! monitor publishes `ConnStatusDown`/`ConnStatusUp` on transitions only and,
//! while down, rechecks the API with a doubling delay until it answers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiManager;
use crate::bus::EventBus;
use crate::config::BridgeConfig;
use crate::events::Event;

/// Last known reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// No remote call has completed yet
    Unknown,
    Up,
    Down,
}

pub struct ConnectionMonitor {
    bus: EventBus,
    api: Arc<dyn ApiManager>,
    state: watch::Sender<ConnStatus>,
    /// Held across a state change and its publication so subscribers see
    /// transitions in the order they happened
    transition: Mutex<()>,
    /// Bumped on every transition to down; a recheck loop exits once stale
    recheck_generation: AtomicU64,
    recheck_initial: Duration,
    recheck_max: Duration,
    shutdown: CancellationToken,
}

impl ConnectionMonitor {
    pub fn new(
        config: &BridgeConfig,
        bus: EventBus,
        api: Arc<dyn ApiManager>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnStatus::Unknown);
        Arc::new(Self {
            bus,
            api,
            state,
            transition: Mutex::new(()),
            recheck_generation: AtomicU64::new(0),
            recheck_initial: config.recheck_initial(),
            recheck_max: config.recheck_max(),
            shutdown,
        })
    }

    pub fn status(&self) -> ConnStatus {
        *self.state.borrow()
    }

    /// Whether the API should be assumed reachable
    ///
    /// `Unknown` counts as reachable until a call says otherwise.
    pub fn is_up(&self) -> bool {
        self.status() != ConnStatus::Down
    }

    pub fn watch(&self) -> watch::Receiver<ConnStatus> {
        self.state.subscribe()
    }

    /// Record a definite network failure
    ///
    /// Publishes `ConnStatusDown` and starts rechecking on the transition only.
    pub fn report_down(self: &Arc<Self>) {
        let generation = {
            let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = self.state.send_replace(ConnStatus::Down);
            if previous == ConnStatus::Down {
                return;
            }
            warn!(?previous, "remote API unreachable");
            self.bus.publish(Event::ConnStatusDown);
            self.recheck_generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.recheck_loop(generation).await });
    }

    /// Record a successful remote call
    ///
    /// Publishes `ConnStatusUp` only when leaving `Down`.
    pub fn report_up(&self) {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.state.send_replace(ConnStatus::Up);
        if previous == ConnStatus::Down {
            info!("remote API reachable again");
            self.bus.publish(Event::ConnStatusUp);
        }
    }

    /// Wait until the API is considered reachable
    ///
    /// Returns `false` if `cancel` fires first.
    pub async fn wait_until_up(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.state.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => false,
            res = rx.wait_for(|s| *s != ConnStatus::Down) => res.is_ok(),
        }
    }

    fn recheck_is_current(&self, generation: u64) -> bool {
        self.recheck_generation.load(Ordering::SeqCst) == generation
            && self.status() == ConnStatus::Down
    }

    async fn recheck_loop(self: Arc<Self>, generation: u64) {
        let mut delay = self.recheck_initial;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.recheck_is_current(generation) {
                debug!("connection recheck superseded");
                return;
            }
            match self.api.ping().await {
                Ok(()) => {
                    if self.recheck_is_current(generation) {
                        self.report_up();
                    }
                    return;
                }
                Err(e) => {
                    debug!(error = %e, delay_ms = delay.as_millis() as u64, "connection recheck failed");
                    delay = (delay * 2).min(self.recheck_max);
                }
            }
        }
    }
}
