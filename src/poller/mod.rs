//! Flag-gated periodic refresh.
//!
//! A poller runs its callback, then checks the shared `live` flag to decide
//! whether to re-arm. Clearing the flag is the only way to stop it, so one
//! tick already in flight may still run after [`LivePoller::pause`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::export::health::HealthMetrics;

/// Callback run on every tick.
pub type TickFn = Box<dyn FnMut() + Send>;

pub struct LivePoller {
    name: &'static str,
    interval: Duration,
    live: Arc<AtomicBool>,
    tick: Arc<parking_lot::Mutex<TickFn>>,
    health: Option<Arc<HealthMetrics>>,
    /// Session shutdown; stops the poller regardless of `live`.
    shutdown: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LivePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePoller")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("live", &self.is_live())
            .finish()
    }
}

impl LivePoller {
    pub fn new(
        name: &'static str,
        interval: Duration,
        shutdown: CancellationToken,
        tick: TickFn,
    ) -> Self {
        Self {
            name,
            interval,
            live: Arc::new(AtomicBool::new(false)),
            tick: Arc::new(parking_lot::Mutex::new(tick)),
            health: None,
            shutdown,
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Sets the flag and arms the timer if no loop is running.
    pub fn resume(&self) {
        if self.live.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            // Previous loop has not observed the pause yet; it keeps going.
            return;
        }

        let name = self.name;
        let interval = self.interval;
        let live = Arc::clone(&self.live);
        let tick = Arc::clone(&self.tick);
        let health = self.health.clone();
        let shutdown = self.shutdown.clone();

        debug!(poller = name, ?interval, "poller armed");

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                {
                    let mut f = tick.lock();
                    (*f)();
                }
                if let Some(h) = &health {
                    h.poller_ticks.with_label_values(&[name]).inc();
                }

                if !live.load(Ordering::SeqCst) {
                    break;
                }
            }
            debug!(poller = name, "poller stopped");
        }));
    }

    /// Clears the flag. The loop exits after its next tick.
    pub fn pause(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Waits for the loop to exit, if one was started.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
