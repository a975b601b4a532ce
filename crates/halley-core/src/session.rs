//! Client sessions.
//!
//! A [`Session`] is one client's identity and lifecycle on this node. It owns
//! a bounded queue of packets waiting for a long-polling transport, or an
//! [`Outlet`] that push transports drain directly. Sessions never hold
//! channels; they remember the paths they subscribed to and the channel
//! registry is consulted when those need to be walked.

use crate::error::SessionError;
use crate::listener::SessionListener;
use crate::packet::Packet;
use crate::policy::{Outlet, TransportKind};
use crate::route::Route;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Counter mixed into generated ids so two sessions created in the same
/// nanosecond still differ.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque session identifier, sent to clients as `clientId`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// Generate a fresh, process-unique id.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(Arc::from(format!("{timestamp:016x}{counter:08x}")))
    }

    /// The id as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session lifecycle. Variants are ordered, so `state >= Handshook` reads as
/// "has at least handshaken".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Created, handshake not yet accepted.
    Handshaking,
    /// Handshake accepted, waiting for the first connect.
    Handshook,
    /// Connected at least once.
    Connected,
    /// Terminal.
    Disconnected,
}

/// One client's session.
pub struct Session {
    id: SessionId,
    local: bool,
    state: Mutex<SessionState>,
    transport: Mutex<Option<TransportKind>>,
    long_polling: AtomicBool,
    max_queue_size: usize,
    queue: Mutex<VecDeque<Packet>>,
    ready: Notify,
    outlet: RwLock<Option<Arc<dyn Outlet>>>,
    listeners: RwLock<Vec<SessionListener>>,
    attributes: DashMap<String, Value>,
    subscriptions: Mutex<HashSet<String>>,
    last_contact: Mutex<Instant>,
}

impl Session {
    /// Create a session in the `Handshaking` state.
    #[must_use]
    pub fn new(id: SessionId, local: bool, max_queue_size: usize) -> Self {
        Self {
            id,
            local,
            state: Mutex::new(SessionState::Handshaking),
            transport: Mutex::new(None),
            long_polling: AtomicBool::new(false),
            max_queue_size,
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            outlet: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            attributes: DashMap::new(),
            subscriptions: Mutex::new(HashSet::new()),
            last_contact: Mutex::new(Instant::now()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Whether the session belongs to an in-process client.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.local
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The transport negotiated on first connect.
    #[must_use]
    pub fn transport(&self) -> Option<TransportKind> {
        *self.transport.lock()
    }

    pub(crate) fn set_transport(&self, transport: TransportKind) {
        *self.transport.lock() = Some(transport);
    }

    /// Whether deliveries are queued for a polling transport.
    #[must_use]
    pub fn is_long_polling(&self) -> bool {
        self.long_polling.load(Ordering::Acquire)
    }

    pub fn set_long_polling(&self, long_polling: bool) {
        self.long_polling.store(long_polling, Ordering::Release);
    }

    /// Install (or clear) the push outlet used while not long-polling.
    pub fn set_outlet(&self, outlet: Option<Arc<dyn Outlet>>) {
        *self.outlet.write() = outlet;
    }

    /// Accept the handshake.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyHandshook`] unless the session is still
    /// handshaking.
    pub fn complete_handshake(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Handshaking => {
                *state = SessionState::Handshook;
                debug!(session = %self.id, "Handshake completed");
                Ok(())
            }
            SessionState::Disconnected => Err(SessionError::Disconnected),
            _ => Err(SessionError::AlreadyHandshook),
        }
    }

    /// Record a connect. Returns `true` for the first one.
    ///
    /// # Errors
    ///
    /// [`SessionError::HandshakeRequired`] before a handshake,
    /// [`SessionError::Disconnected`] after a disconnect.
    pub fn complete_connection(&self) -> Result<bool, SessionError> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Handshaking => Err(SessionError::HandshakeRequired),
            SessionState::Handshook => {
                *state = SessionState::Connected;
                debug!(session = %self.id, "Session connected");
                Ok(true)
            }
            SessionState::Connected => Ok(false),
            SessionState::Disconnected => Err(SessionError::Disconnected),
        }
    }

    /// Move to the terminal state, discard queued packets and wake pollers.
    ///
    /// # Errors
    ///
    /// [`SessionError::Disconnected`] if already disconnected.
    pub fn complete_disconnect(&self) -> Result<(), SessionError> {
        {
            let mut queue = self.queue.lock();
            let mut state = self.state.lock();
            if *state == SessionState::Disconnected {
                return Err(SessionError::Disconnected);
            }
            *state = SessionState::Disconnected;
            queue.clear();
        }
        self.ready.notify_waiters();
        debug!(session = %self.id, "Session disconnected");
        Ok(())
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: SessionListener) {
        self.listeners.write().push(listener);
    }

    /// Unregister a listener.
    pub fn remove_listener(&self, listener: &SessionListener) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| !registered.same_as(listener));
        listeners.len() != before
    }

    fn listener_snapshot(&self) -> Vec<SessionListener> {
        self.listeners.read().clone()
    }

    /// Hand a delivery to this session.
    ///
    /// Session listeners see (and may rewrite) this session's copy only.
    /// The packet is pushed to the outlet when the session is not
    /// long-polling and has one, and queued otherwise. A full queue rejects
    /// the new packet. Returns whether the packet was accepted.
    pub fn deliver(&self, from: &Route, sender: Option<&SessionId>, packet: Packet) -> bool {
        if self.state() == SessionState::Disconnected {
            trace!(session = %self.id, channel = %from, "Dropping delivery to disconnected session");
            return false;
        }

        let mut packet = packet;
        for listener in self.listener_snapshot() {
            let SessionListener::Packet(listener) = listener;
            match listener.on_delivery(sender, packet) {
                Some(rewritten) => packet = rewritten,
                None => {
                    trace!(session = %self.id, channel = %from, "Delivery stopped by session listener");
                    return false;
                }
            }
        }

        if !self.is_long_polling() {
            let outlet = self.outlet.read().clone();
            if let Some(outlet) = outlet {
                return outlet.push(packet);
            }
        }

        {
            let mut queue = self.queue.lock();
            if *self.state.lock() == SessionState::Disconnected {
                return false;
            }
            if queue.len() >= self.max_queue_size {
                warn!(
                    session = %self.id,
                    channel = %from,
                    max_queue_size = self.max_queue_size,
                    "Delivery queue full, dropping packet"
                );
                return false;
            }
            queue.push_back(packet);
        }
        self.ready.notify_waiters();
        true
    }

    /// Number of queued packets.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Take everything queued without waiting.
    #[must_use]
    pub fn drain(&self) -> Vec<Packet> {
        self.queue.lock().drain(..).collect()
    }

    /// Wait up to `timeout` for queued packets.
    ///
    /// Returns at once when something is queued. Returns empty on timeout or
    /// when the session disconnects while waiting.
    pub async fn poll(&self, timeout: Duration) -> Vec<Packet> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before checking so a delivery between the check and
            // the await still wakes us.
            notified.as_mut().enable();

            let ready = self.drain();
            if !ready.is_empty() {
                return ready;
            }
            if self.state() == SessionState::Disconnected {
                return Vec::new();
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.drain();
            }
        }
    }

    /// Run session response listeners over a meta response addressed here.
    #[must_use]
    pub fn on_response(&self, sender: Option<&SessionId>, packet: Packet) -> Option<Packet> {
        let mut packet = packet;
        for listener in self.listener_snapshot() {
            let SessionListener::Packet(listener) = listener;
            packet = listener.on_response(sender, packet)?;
        }
        Some(packet)
    }

    /// Note activity from the client.
    pub fn contact(&self) {
        *self.last_contact.lock() = Instant::now();
    }

    /// Whether the client has been silent for at least `max_idle`.
    #[must_use]
    pub fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(*self.last_contact.lock()) >= max_idle
    }

    pub(crate) fn add_subscription(&self, path: &str) {
        self.subscriptions.lock().insert(path.to_string());
    }

    pub(crate) fn remove_subscription(&self, path: &str) {
        self.subscriptions.lock().remove(path);
    }

    /// Paths this session is subscribed to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    pub(crate) fn take_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().drain().collect()
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.get(key).map(|value| value.clone())
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.remove(key).map(|(_, value)| value)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
