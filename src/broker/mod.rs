//! Relay Broker: the hub between page producers and inspection panels.
//!
//! Endpoints never talk to each other directly. Each connects to the Broker
//! declaring a [`Role`], registers a route with an `init` handshake, and the
//! Broker forwards messages by role and page. All state is owned by one
//! `Broker` value and mutated only from its own handlers.

pub mod channel;
pub mod routes;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::protocol::{self, Envelope, PageId, Role, Task};

use self::channel::{BrokerEvent, ChannelHandle, ChannelId};
use self::routes::RoutingTable;

/// A connected channel whose listener is installed.
#[derive(Debug)]
struct Connection {
    handle: ChannelHandle,
    /// Page learned from this channel's `init`, if it has sent one.
    page: Option<PageId>,
    /// Set when a newer channel took over this channel's route. A detached
    /// channel's traffic is dropped until it sends `init` again.
    detached: bool,
}

/// Routes messages between producer relays and panel channels.
pub struct Broker {
    connections: HashMap<ChannelId, Connection>,
    routes: RoutingTable,
    /// Pages whose producer reported the framework before a panel attached.
    detected: HashSet<PageId>,
    health: Option<Arc<HealthMetrics>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("connections", &self.connections.len())
            .field("producer_routes", &self.routes.len(Role::ProducerRelay))
            .field("control_routes", &self.routes.len(Role::PanelControl))
            .field("inspector_routes", &self.routes.len(Role::PanelInspector))
            .finish()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            routes: RoutingTable::new(),
            detected: HashSet::new(),
            health: None,
        }
    }

    /// Reports routing activity into the given health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Drains broker events until cancelled or every sender is gone.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<BrokerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        info!("broker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("broker cancelled");
                    // Disconnects already queued still get their cleanup.
                    while let Ok(event) = events.try_recv() {
                        self.handle_event(event);
                    }
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("broker event queue closed");
                        break;
                    };
                    self.handle_event(event);
                }
            }
        }

        info!(connections = self.connections.len(), "broker stopped");
        self
    }

    /// Applies one event to the routing state.
    pub fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connect(handle) => self.handle_connect(handle),
            BrokerEvent::Message { channel, message } => self.on_message(channel, message),
            BrokerEvent::Disconnect(channel) => self.on_disconnect(channel),
            BrokerEvent::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }

    /// Installs the listener for a new channel. No route is registered until
    /// the channel's `init`.
    pub fn handle_connect(&mut self, handle: ChannelHandle) {
        debug!(
            channel = %handle.id(),
            role = %handle.role(),
            sender_page = ?handle.sender_page(),
            "channel connected",
        );
        self.connections.insert(
            handle.id(),
            Connection {
                handle,
                page: None,
                detached: false,
            },
        );
        if let Some(h) = &self.health {
            h.connections_active.set(self.connections.len() as f64);
        }
    }

    /// Handles one message from a connected channel.
    pub fn on_message(&mut self, channel: ChannelId, message: Value) {
        let Some(conn) = self.connections.get(&channel) else {
            debug!(channel = %channel, "message from unknown channel");
            self.count_drop("unknown_channel");
            return;
        };
        let role = conn.handle.role();
        let detached = conn.detached;
        let known_page = if detached {
            None
        } else {
            conn.page.or(conn.handle.sender_page())
        };

        if let Some(h) = &self.health {
            h.messages_received.with_label_values(&[role.as_str()]).inc();
        }

        let envelope = match Envelope::parse(&message) {
            Ok(env) => env,
            Err(e) => {
                warn!(role = %role, error = %e, "dropping malformed message");
                self.count_drop("malformed");
                return;
            }
        };

        let Some(task) = envelope.task else {
            info!(role = %role, task = envelope.task_name, "received unknown task");
            if let Some(h) = &self.health {
                h.unknown_tasks.inc();
            }
            self.count_drop("unknown_task");
            return;
        };

        if detached && task != Task::Init {
            debug!(role = %role, channel = %channel, task = %task, "dropping message from replaced channel");
            self.count_drop("replaced_channel");
            return;
        }

        match task {
            Task::Init => {
                let page = envelope.page_id.or(known_page);
                self.register_route(channel, role, page);
            }
            Task::Log => log_from(role, &message),
            _ => match role {
                Role::ProducerRelay => self.route_from_producer(task, known_page, message),
                Role::PanelControl | Role::PanelInspector => {
                    let page = envelope.page_id.or(known_page);
                    self.route_from_panel(channel, role, task, page, message);
                }
            },
        }
    }

    /// Tears down the channel's listener and the route bound to it.
    pub fn on_disconnect(&mut self, channel: ChannelId) {
        let Some(conn) = self.connections.remove(&channel) else {
            debug!(channel = %channel, "disconnect for unknown channel");
            return;
        };
        let role = conn.handle.role();

        if let Some(h) = &self.health {
            h.connections_active.set(self.connections.len() as f64);
        }

        let Some(page) = self.routes.remove_by_handle(role, channel) else {
            // Replaced by a later handshake, or never registered.
            debug!(channel = %channel, role = %role, "disconnected channel held no route");
            return;
        };
        info!(page = %page, role = %role, channel = %channel, "route removed");
        self.route_released(page, role);
    }

    /// The route currently registered for `(page, role)`.
    pub fn route(&self, page: PageId, role: Role) -> Option<ChannelId> {
        self.routes.get(page, role).map(ChannelHandle::id)
    }

    /// Number of active routes for a role.
    pub fn route_count(&self, role: Role) -> usize {
        self.routes.len(role)
    }

    /// Number of connected channels.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a producer reported the framework on a page no panel had opened yet.
    pub fn is_detected(&self, page: PageId) -> bool {
        self.detected.contains(&page)
    }

    fn register_route(&mut self, channel: ChannelId, role: Role, page: Option<PageId>) {
        let Some(page) = page else {
            warn!(role = %role, channel = %channel, "init without page identity, ignoring");
            self.count_drop("unknown_page");
            return;
        };
        let Some(conn) = self.connections.get_mut(&channel) else {
            return;
        };
        let previous = conn.page.replace(page);
        conn.detached = false;
        let handle = conn.handle.clone();

        // A channel serves one page per role: moving to a new page gives up
        // the route it held for the old one.
        if let Some(old_page) = previous.filter(|&p| p != page) {
            if self.routes.remove_if_held(old_page, role, channel) {
                info!(page = %old_page, role = %role, channel = %channel, "route moved to another page");
                self.route_released(old_page, role);
            }
        }

        if let Some(old) = self.routes.register(page, role, handle) {
            if old.id() != channel {
                // The old handle is forgotten; its later disconnect is a no-op.
                if let Some(stale) = self.connections.get_mut(&old.id()) {
                    stale.page = None;
                    stale.detached = true;
                }
                debug!(
                    page = %page,
                    role = %role,
                    old_channel = %old.id(),
                    new_channel = %channel,
                    "route replaced",
                );
            }
        }
        self.update_route_gauge(role);
        info!(page = %page, role = %role, channel = %channel, "route registered");

        if role == Role::ProducerRelay && self.routes.contains(page, Role::PanelControl) {
            if let Some(producer) = self.routes.get(page, Role::ProducerRelay) {
                producer.post(protocol::panel_attached_message());
                debug!(page = %page, "notified producer that a panel is attached");
            }
        }
    }

    /// Side effects of `(page, role)` losing its route.
    fn route_released(&mut self, page: PageId, role: Role) {
        self.update_route_gauge(role);
        match role {
            Role::PanelInspector => {
                if let Some(producer) = self.routes.get(page, Role::ProducerRelay) {
                    if producer.post(protocol::cleanup_message()) {
                        info!(page = %page, "sent cleanup to producer");
                        if let Some(h) = &self.health {
                            h.cleanup_signals.inc();
                        }
                    } else {
                        debug!(page = %page, "producer channel closed before cleanup");
                    }
                }
            }
            Role::ProducerRelay => {
                self.detected.remove(&page);
            }
            Role::PanelControl => {}
        }
    }

    fn route_from_producer(&mut self, task: Task, page: Option<PageId>, message: Value) {
        let Some(page) = page else {
            debug!(task = %task, "producer page unknown, dropping");
            self.count_drop("unknown_page");
            return;
        };

        if task == Task::InitDevToolPanel {
            if self.routes.contains(page, Role::PanelControl) {
                self.forward(page, Role::PanelControl, task, message);
            } else {
                debug!(page = %page, "framework detected before panel attached");
                self.detected.insert(page);
            }
            return;
        }

        // The inspector sub-channel may not have registered yet.
        let target = if self.routes.contains(page, Role::PanelInspector) {
            Role::PanelInspector
        } else {
            Role::PanelControl
        };
        self.forward(page, target, task, message);
    }

    fn route_from_panel(
        &mut self,
        channel: ChannelId,
        role: Role,
        task: Task,
        page: Option<PageId>,
        mut message: Value,
    ) {
        let Some(page) = page else {
            debug!(role = %role, task = %task, "panel message without page, dropping");
            self.count_drop("unknown_page");
            return;
        };

        match task {
            Task::SendTaskToInspector => {
                let Some(instruction) = message.get_mut("data").map(Value::take) else {
                    warn!(page = %page, "sendTaskToInspector without data, dropping");
                    self.count_drop("malformed");
                    return;
                };
                self.forward(page, Role::ProducerRelay, task, instruction);
            }
            t if t.is_producer_instruction() => {
                self.forward(page, Role::ProducerRelay, task, message);
            }
            Task::CheckInjectedContentScript => {
                if self.detected.contains(&page) {
                    if let Some(conn) = self.connections.get(&channel) {
                        conn.handle.post(protocol::panel_attached_message());
                    }
                }
            }
            _ => {
                info!(role = %role, task = %task, "unexpected task from panel, dropping");
                self.count_drop("unexpected_task");
            }
        }
    }

    /// Posts `message` on the route `(page, role)`. A missing route is an
    /// expected transient state, not an error.
    fn forward(&self, page: PageId, role: Role, task: Task, message: Value) -> bool {
        let Some(target) = self.routes.get(page, role) else {
            debug!(page = %page, role = %role, task = %task, "no route, dropping");
            self.count_drop("no_route");
            return false;
        };

        if !target.post(message) {
            debug!(page = %page, role = %role, task = %task, "route channel closed, dropping");
            self.count_drop("channel_closed");
            return false;
        }

        if let Some(h) = &self.health {
            h.messages_forwarded.with_label_values(&[task.as_str()]).inc();
        }
        true
    }

    fn count_drop(&self, reason: &str) {
        if let Some(h) = &self.health {
            h.messages_dropped.with_label_values(&[reason]).inc();
        }
    }

    fn update_route_gauge(&self, role: Role) {
        if let Some(h) = &self.health {
            h.routes_active
                .with_label_values(&[role.as_str()])
                .set(self.routes.len(role) as f64);
        }
    }
}

/// Writes a `log` task as a diagnostic line tagged with the sender role.
fn log_from(role: Role, message: &Value) {
    let text = message.get("text").and_then(Value::as_str).unwrap_or("");
    match message.get("obj") {
        Some(obj) => info!(role = %role, obj = %obj, "{text}"),
        None => info!(role = %role, "{text}"),
    }
}
