//! One inspection session: a Broker, the panel side (control and inspector
//! channels feeding a Collector) and the live pollers, wired together for a
//! single monitored page.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::channel::{self, BrokerHandle, Endpoint};
use crate::broker::Broker;
use crate::clock::Clock;
use crate::collector::dispatch::{Dispatch, PanelDispatcher};
use crate::collector::series::Window;
use crate::collector::Collector;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::SeriesSnapshot;
use crate::poller::LivePoller;
use crate::protocol::{self, PageId, Role, Task};

/// Counters from one replayed producer stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub sent: u64,
    pub skipped: u64,
}

enum PanelCommand {
    /// Instruction for the page's producer.
    Instruct(Value),
    /// Acknowledged once both panel inboxes are drained.
    Sync(oneshot::Sender<()>),
}

/// Orchestrates the relay and the panel for one page.
pub struct Session {
    cfg: Config,
    page: PageId,
    health: Arc<HealthMetrics>,
    collector: Arc<Mutex<Collector>>,
    broker: BrokerHandle,
    broker_task: Option<JoinHandle<Broker>>,
    panel_task: Option<JoinHandle<()>>,
    commands: Option<mpsc::UnboundedSender<PanelCommand>>,
    pollers: Vec<LivePoller>,
    snapshots: watch::Sender<Option<Arc<SeriesSnapshot>>>,
    broker_cancel: CancellationToken,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("page", &self.page)
            .field("started", &self.broker_task.is_some())
            .finish()
    }
}

impl Session {
    /// Creates a session, initializing health metrics.
    pub fn new(cfg: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let collector = Collector::new(cfg.collector.capacity, clock).with_health(Arc::clone(&health));
        let (broker, _) = channel::event_channel();
        let (snapshots, _) = watch::channel(None);

        Ok(Self {
            page: PageId(cfg.page_id),
            cfg,
            health,
            collector: Arc::new(Mutex::new(collector)),
            broker,
            broker_task: None,
            panel_task: None,
            commands: None,
            pollers: Vec::new(),
            snapshots,
            broker_cancel: CancellationToken::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn collector(&self) -> &Arc<Mutex<Collector>> {
        &self.collector
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Start the Broker, attach the panel and arm the pollers.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes answer during startup.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Broker event loop.
        let (broker, events) = channel::event_channel();
        self.broker = broker;
        let relay = Broker::new().with_health(Arc::clone(&self.health));
        self.broker_task = Some(tokio::spawn(relay.run(events, self.broker_cancel.clone())));

        // 2. Panel channels: control first, then the inspector sub-channel.
        let control = self.broker.connect(Role::PanelControl, None)?;
        control.send(protocol::init_message(self.page))?;
        control.send(json!({
            "task": Task::CheckInjectedContentScript.as_str(),
            "pageId": self.page,
        }))?;
        let inspector = self.broker.connect(Role::PanelInspector, None)?;
        inspector.send(protocol::init_message(self.page))?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        self.commands = Some(commands);
        let dispatcher =
            PanelDispatcher::new(Arc::clone(&self.collector)).with_health(Arc::clone(&self.health));
        self.panel_task = Some(tokio::spawn(panel_loop(
            control,
            inspector,
            command_rx,
            dispatcher,
            self.cancel.child_token(),
        )));

        // 3. Live refresh.
        self.start_pollers();

        info!(page = %self.page, "session started");
        Ok(())
    }

    /// Opens a producer channel for this session's page and performs its
    /// handshake.
    pub fn connect_producer(&self) -> Result<Endpoint> {
        let producer = self.broker.connect(Role::ProducerRelay, Some(self.page))?;
        producer.send(protocol::init_message(self.page))?;
        Ok(producer)
    }

    /// Sends an instruction (e.g. `checkModuleName`) to the page's producer
    /// through the control channel.
    pub fn instruct(&self, instruction: Value) -> Result<()> {
        let commands = self.commands.as_ref().context("session not started")?;
        commands
            .send(PanelCommand::Instruct(protocol::inspector_envelope(
                self.page,
                instruction,
            )))
            .map_err(|_| anyhow::anyhow!("panel is not running"))
    }

    /// Waits until every message sent so far has reached the Collector.
    pub async fn settle(&self) -> Result<()> {
        self.broker.barrier().await?;
        let commands = self.commands.as_ref().context("session not started")?;
        let (ack, done) = oneshot::channel();
        commands
            .send(PanelCommand::Sync(ack))
            .map_err(|_| anyhow::anyhow!("panel is not running"))?;
        done.await.context("panel stopped before settling")
    }

    /// Replays newline-delimited producer messages through the relay.
    /// Blank lines are skipped; lines that are not JSON are logged and
    /// skipped.
    pub async fn replay<R>(&self, reader: R) -> Result<ReplayStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let producer = self.connect_producer()?;
        let mut stats = ReplayStats::default();
        let mut lines = reader.lines();
        let mut line_no = 0u64;

        while let Some(line) = lines.next_line().await.context("reading producer stream")? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(message) => {
                    producer.send(message)?;
                    stats.sent += 1;
                }
                Err(e) => {
                    warn!(line = line_no, error = %e, "skipping invalid producer line");
                    stats.skipped += 1;
                }
            }
        }

        self.settle().await?;
        info!(sent = stats.sent, skipped = stats.skipped, "replay finished");
        Ok(stats)
    }

    /// Derives a snapshot now, with the configured geometry.
    pub fn snapshot(&self) -> SeriesSnapshot {
        capture(
            &self.collector.lock(),
            self.cfg.collector.digest_timing.window(),
            self.cfg.collector.digest_rate.window(),
        )
    }

    /// Latest snapshot published by the series poller.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<SeriesSnapshot>>> {
        self.snapshots.subscribe()
    }

    /// Toggles live refresh. Pausing lets any in-flight tick finish.
    pub fn set_live(&self, live: bool) {
        for poller in &self.pollers {
            if live {
                poller.resume();
            } else {
                poller.pause();
            }
        }
        debug!(live, "live refresh toggled");
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Pollers and panel first; their disconnects must reach the Broker.
        self.cancel.cancel();
        for poller in &self.pollers {
            poller.join().await;
        }

        self.commands.take();
        if let Some(task) = self.panel_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "panel task failed");
            }
        }

        self.broker_cancel.cancel();
        if let Some(task) = self.broker_task.take() {
            match task.await {
                Ok(broker) => debug!(routes = broker.connection_count(), "broker drained"),
                Err(e) => error!(error = %e, "broker task failed"),
            }
        }

        if self.cfg.health.enabled {
            self.health.stop().await?;
        }

        info!(page = %self.page, "session stopped");
        Ok(())
    }

    fn start_pollers(&mut self) {
        let series = {
            let collector = Arc::clone(&self.collector);
            let snapshots = self.snapshots.clone();
            let timing = self.cfg.collector.digest_timing.window();
            let rate = self.cfg.collector.digest_rate.window();
            LivePoller::new(
                "series",
                self.cfg.refresh.series_interval,
                self.cancel.child_token(),
                Box::new(move || {
                    let snapshot = capture(&collector.lock(), timing, rate);
                    debug!(
                        digests_last_second = snapshot.digests_last_second,
                        events = snapshot.events.len(),
                        "series refreshed",
                    );
                    snapshots.send_replace(Some(Arc::new(snapshot)));
                }),
            )
        };

        let instant = {
            let collector = Arc::clone(&self.collector);
            LivePoller::new(
                "instant",
                self.cfg.refresh.instant_interval,
                self.cancel.child_token(),
                Box::new(move || {
                    let c = collector.lock();
                    let rate = c.digests_in_last_second();
                    let last = c.last_digest_timing().map(|d| d.duration_ms);
                    debug!(digests_per_second = rate, last_digest_ms = ?last, "instant metrics");
                }),
            )
        };

        for poller in [series, instant] {
            let poller = poller.with_health(Arc::clone(&self.health));
            poller.resume();
            self.pollers.push(poller);
        }
    }
}

/// Snapshot including the rankings of the last module the panel asked about.
fn capture(collector: &Collector, timing: Window, rate: Window) -> SeriesSnapshot {
    let modules: Vec<String> = collector
        .module_check()
        .map(|m| m.module_name.clone())
        .into_iter()
        .collect();
    SeriesSnapshot::capture(collector, timing, rate, &modules, None)
}

async fn panel_loop(
    control: Endpoint,
    inspector: Endpoint,
    mut commands: mpsc::UnboundedReceiver<PanelCommand>,
    dispatcher: PanelDispatcher,
    cancel: CancellationToken,
) {
    let mut control = control;
    let mut inspector = inspector;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(PanelCommand::Instruct(msg)) => {
                    if let Err(e) = control.send(msg) {
                        warn!(error = %e, "failed to send instruction");
                    }
                }
                Some(PanelCommand::Sync(ack)) => {
                    while let Some(msg) = control.try_recv() {
                        on_panel_message(&dispatcher, Role::PanelControl, &msg);
                    }
                    while let Some(msg) = inspector.try_recv() {
                        on_panel_message(&dispatcher, Role::PanelInspector, &msg);
                    }
                    let _ = ack.send(());
                }
                None => break,
            },
            msg = control.recv() => match msg {
                Some(msg) => on_panel_message(&dispatcher, Role::PanelControl, &msg),
                None => break,
            },
            msg = inspector.recv() => match msg {
                Some(msg) => on_panel_message(&dispatcher, Role::PanelInspector, &msg),
                None => break,
            },
        }
    }

    inspector.disconnect();
    control.disconnect();
    debug!("panel detached");
}

fn on_panel_message(dispatcher: &PanelDispatcher, role: Role, message: &Value) {
    match dispatcher.handle(message) {
        Dispatch::FrameworkDetected => info!(role = %role, "panel attached to instrumented page"),
        Dispatch::ModuleCheck { module, exists } => {
            debug!(role = %role, module = %module, exists, "module check answered");
        }
        Dispatch::Recorded(_) | Dispatch::Ignored => {}
    }
}
