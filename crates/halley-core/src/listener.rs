//! Listener variants for servers, channels and sessions.
//!
//! Each owner accepts a closed set of listener kinds. A listener is registered
//! as one variant and dispatch matches on the variant, so every callback site
//! knows exactly which kinds it has to visit.
//!
//! Packet listeners return `Some(packet)` to continue (possibly rewritten) or
//! `None` to stop the packet.

use crate::channel::Channel;
use crate::packet::Packet;
use crate::session::{Session, SessionId};
use parking_lot::RwLock;
use std::sync::Arc;

/// Channel membership callbacks, registered on one channel.
pub trait ChannelSessionListener: Send + Sync {
    /// A session joined the channel.
    fn on_subscribed(&self, channel: &Channel, session_id: &SessionId);

    /// A session left the channel (including forced removal).
    fn on_unsubscribed(&self, channel: &Channel, session_id: &SessionId);

    /// Persistent listeners keep their channel from going idle.
    fn is_persistent(&self) -> bool {
        false
    }
}

/// Delivery hook, called once per channel fan-out.
///
/// The packet is already a private copy for this channel's fan-out: changes
/// are seen by this channel's recipients only.
pub trait ChannelPacketListener: Send + Sync {
    fn on_delivery(&self, sender: Option<&SessionId>, packet: Packet) -> Option<Packet>;

    /// Persistent listeners keep their channel from going idle.
    fn is_persistent(&self) -> bool {
        false
    }
}

/// Listener registered on a channel.
#[derive(Clone)]
pub enum ChannelListener {
    Session(Arc<dyn ChannelSessionListener>),
    Packet(Arc<dyn ChannelPacketListener>),
}

impl ChannelListener {
    /// Whether this listener pins its channel against idle eviction.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        match self {
            ChannelListener::Session(listener) => listener.is_persistent(),
            ChannelListener::Packet(listener) => listener.is_persistent(),
        }
    }

    /// Whether both handles refer to the same registered listener.
    #[must_use]
    pub fn same_as(&self, other: &ChannelListener) -> bool {
        match (self, other) {
            (ChannelListener::Session(a), ChannelListener::Session(b)) => Arc::ptr_eq(a, b),
            (ChannelListener::Packet(a), ChannelListener::Packet(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Per-session packet hooks. Changes are visible to this session only.
pub trait SessionPacketListener: Send + Sync {
    /// A delivery is about to reach the session.
    fn on_delivery(&self, sender: Option<&SessionId>, packet: Packet) -> Option<Packet> {
        let _ = sender;
        Some(packet)
    }

    /// A meta response is about to reach the session.
    fn on_response(&self, sender: Option<&SessionId>, packet: Packet) -> Option<Packet> {
        let _ = sender;
        Some(packet)
    }
}

/// Listener registered on a session.
#[derive(Clone)]
pub enum SessionListener {
    Packet(Arc<dyn SessionPacketListener>),
}

impl SessionListener {
    /// Whether both handles refer to the same registered listener.
    #[must_use]
    pub fn same_as(&self, other: &SessionListener) -> bool {
        match (self, other) {
            (SessionListener::Packet(a), SessionListener::Packet(b)) => Arc::ptr_eq(a, b),
        }
    }
}

/// Session lifecycle callbacks.
pub trait SessionLifecycleListener: Send + Sync {
    /// A session completed its first connect.
    fn on_connected(&self, session: &Session);

    /// A session disconnected, by request or by eviction.
    fn on_disconnected(&self, session: &Session);
}

/// Channel lifecycle callbacks.
pub trait ChannelLifecycleListener: Send + Sync {
    /// A channel was created; initializers have already run.
    fn on_created(&self, channel: &Channel);

    /// A channel was removed from the registry.
    fn on_removed(&self, channel: &Channel);
}

/// Subscription callbacks across all channels.
pub trait SubscriptionListener: Send + Sync {
    fn on_subscribed(&self, channel: &Channel, session_id: &SessionId);

    fn on_unsubscribed(&self, channel: &Channel, session_id: &SessionId);
}

/// Server-wide packet hooks. Changes are seen by all further processing.
///
/// Request and response hooks see the session the exchange belongs to. On
/// `/meta/handshake` that is the session being created, so extensions can
/// negotiate per-session state before the handshake completes.
pub trait ServerPacketListener: Send + Sync {
    fn on_request(&self, sender: Option<&Session>, packet: Packet) -> Option<Packet> {
        let _ = sender;
        Some(packet)
    }

    fn on_response(&self, sender: Option<&Session>, packet: Packet) -> Option<Packet> {
        let _ = sender;
        Some(packet)
    }

    fn on_delivery(&self, sender: Option<&SessionId>, packet: Packet) -> Option<Packet> {
        let _ = sender;
        Some(packet)
    }
}

/// Listener registered on the server.
#[derive(Clone)]
pub enum ServerListener {
    Session(Arc<dyn SessionLifecycleListener>),
    Channel(Arc<dyn ChannelLifecycleListener>),
    Subscription(Arc<dyn SubscriptionListener>),
    Packet(Arc<dyn ServerPacketListener>),
}

impl ServerListener {
    /// Whether both handles refer to the same registered listener.
    #[must_use]
    pub fn same_as(&self, other: &ServerListener) -> bool {
        match (self, other) {
            (ServerListener::Session(a), ServerListener::Session(b)) => Arc::ptr_eq(a, b),
            (ServerListener::Channel(a), ServerListener::Channel(b)) => Arc::ptr_eq(a, b),
            (ServerListener::Subscription(a), ServerListener::Subscription(b)) => {
                Arc::ptr_eq(a, b)
            }
            (ServerListener::Packet(a), ServerListener::Packet(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Server-level listener list, shared by the server and the channel registry.
#[derive(Default)]
pub struct ServerListeners {
    listeners: RwLock<Vec<ServerListener>>,
}

impl ServerListeners {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add(&self, listener: ServerListener) {
        self.listeners.write().push(listener);
    }

    /// Unregister a listener. Returns `true` if it was registered.
    pub fn remove(&self, listener: &ServerListener) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| !registered.same_as(listener));
        listeners.len() != before
    }

    // Callbacks run on a snapshot so listeners may register or remove
    // listeners without deadlocking.
    fn snapshot(&self) -> Vec<ServerListener> {
        self.listeners.read().clone()
    }

    pub(crate) fn connected(&self, session: &Session) {
        for listener in self.snapshot() {
            if let ServerListener::Session(listener) = listener {
                listener.on_connected(session);
            }
        }
    }

    pub(crate) fn disconnected(&self, session: &Session) {
        for listener in self.snapshot() {
            if let ServerListener::Session(listener) = listener {
                listener.on_disconnected(session);
            }
        }
    }

    pub(crate) fn created(&self, channel: &Channel) {
        for listener in self.snapshot() {
            if let ServerListener::Channel(listener) = listener {
                listener.on_created(channel);
            }
        }
    }

    pub(crate) fn removed(&self, channel: &Channel) {
        for listener in self.snapshot() {
            if let ServerListener::Channel(listener) = listener {
                listener.on_removed(channel);
            }
        }
    }

    pub(crate) fn subscribed(&self, channel: &Channel, session_id: &SessionId) {
        for listener in self.snapshot() {
            if let ServerListener::Subscription(listener) = listener {
                listener.on_subscribed(channel, session_id);
            }
        }
    }

    pub(crate) fn unsubscribed(&self, channel: &Channel, session_id: &SessionId) {
        for listener in self.snapshot() {
            if let ServerListener::Subscription(listener) = listener {
                listener.on_unsubscribed(channel, session_id);
            }
        }
    }

    fn packet_listeners(&self) -> impl Iterator<Item = Arc<dyn ServerPacketListener>> {
        self.snapshot().into_iter().filter_map(|listener| match listener {
            ServerListener::Packet(listener) => Some(listener),
            _ => None,
        })
    }

    pub(crate) fn request(&self, sender: Option<&Session>, mut packet: Packet) -> Option<Packet> {
        for listener in self.packet_listeners() {
            packet = listener.on_request(sender, packet)?;
        }
        Some(packet)
    }

    pub(crate) fn response(&self, sender: Option<&Session>, mut packet: Packet) -> Option<Packet> {
        for listener in self.packet_listeners() {
            packet = listener.on_response(sender, packet)?;
        }
        Some(packet)
    }

    pub(crate) fn delivery(&self, sender: Option<&SessionId>, mut packet: Packet) -> Option<Packet> {
        for listener in self.packet_listeners() {
            packet = listener.on_delivery(sender, packet)?;
        }
        Some(packet)
    }
}
