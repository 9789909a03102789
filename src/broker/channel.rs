use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{PageId, Role};

/// Identity of one connected channel.
///
/// Ids are never reused within a Broker, so comparing ids is how the
/// routing table tells a reconnected page apart from its stale handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Broker-side half of a channel: where the Broker posts messages for the
/// endpoint.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    role: Role,
    sender_page: Option<PageId>,
    outbound: mpsc::UnboundedSender<Value>,
}

impl ChannelHandle {
    pub fn new(
        id: ChannelId,
        role: Role,
        sender_page: Option<PageId>,
        outbound: mpsc::UnboundedSender<Value>,
    ) -> Self {
        Self {
            id,
            role,
            sender_page,
            outbound,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Page the transport attributed to this channel at connect time, if any.
    pub fn sender_page(&self) -> Option<PageId> {
        self.sender_page
    }

    /// Posts a message to the endpoint. Returns false if the endpoint is gone.
    pub fn post(&self, message: Value) -> bool {
        self.outbound.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Input of the Broker's event loop.
#[derive(Debug)]
pub enum BrokerEvent {
    Connect(ChannelHandle),
    Message { channel: ChannelId, message: Value },
    Disconnect(ChannelId),
    /// Acknowledged once every earlier event has been handled.
    Barrier(oneshot::Sender<()>),
}

/// Cloneable entry point used by endpoints to open channels to a running Broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    events: mpsc::UnboundedSender<BrokerEvent>,
    next_id: Arc<AtomicU64>,
}

/// Creates the event queue feeding [`super::Broker::run`].
pub fn event_channel() -> (BrokerHandle, mpsc::UnboundedReceiver<BrokerEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    (
        BrokerHandle {
            events,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        rx,
    )
}

impl BrokerHandle {
    /// Opens a channel declaring `role`. `sender_page` is the page identity
    /// the transport knows for the caller (the sender tab), if any.
    pub fn connect(&self, role: Role, sender_page: Option<PageId>) -> Result<Endpoint> {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, inbox) = mpsc::unbounded_channel();

        self.events
            .send(BrokerEvent::Connect(ChannelHandle::new(
                id,
                role,
                sender_page,
                outbound,
            )))
            .map_err(|_| anyhow!("broker is not running"))?;

        Ok(Endpoint {
            id,
            role,
            inbox,
            events: self.events.clone(),
            connected: true,
        })
    }

    /// Resolves once the Broker has handled every event sent before it.
    pub async fn barrier(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.events
            .send(BrokerEvent::Barrier(ack))
            .map_err(|_| anyhow!("broker is not running"))?;
        done.await.map_err(|_| anyhow!("broker stopped before the barrier"))
    }

    /// Opens a channel by its declared connection name.
    pub fn connect_named(&self, name: &str, sender_page: Option<PageId>) -> Result<Endpoint> {
        let role = Role::from_name(name).ok_or_else(|| anyhow!("unknown connection name: {name}"))?;
        self.connect(role, sender_page)
    }
}

/// Endpoint-side half of a channel.
///
/// Dropping an endpoint disconnects it, the same as calling
/// [`Endpoint::disconnect`].
#[derive(Debug)]
pub struct Endpoint {
    id: ChannelId,
    role: Role,
    inbox: mpsc::UnboundedReceiver<Value>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    connected: bool,
}

impl Endpoint {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Sends a message to the Broker.
    pub fn send(&self, message: Value) -> Result<()> {
        self.events
            .send(BrokerEvent::Message {
                channel: self.id,
                message,
            })
            .map_err(|_| anyhow!("broker is not running"))
    }

    /// Waits for the next message from the Broker. `None` once the Broker
    /// has dropped this channel.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbox.recv().await
    }

    /// Returns a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.inbox.try_recv().ok()
    }

    /// Closes the channel; the Broker tears down any route bound to it.
    pub fn disconnect(mut self) {
        self.signal_disconnect();
    }

    fn signal_disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            let _ = self.events.send(BrokerEvent::Disconnect(self.id));
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.signal_disconnect();
    }
}
