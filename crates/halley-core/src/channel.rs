//! Channels.
//!
//! A channel is one node of the routing table: a concrete path that publishes
//! fan out on, or a wildcard pattern whose subscribers receive publishes on
//! every path it matches. Channels track subscribers by session id only and
//! resolve sessions through the [`SessionRegistry`] at delivery time.

use crate::error::ChannelStateError;
use crate::listener::{ChannelListener, ServerListeners};
use crate::packet::{Packet, PacketType};
use crate::route::Route;
use crate::session::SessionId;
use crate::sessions::SessionRegistry;
use dashmap::DashMap;
use halley_protocol::Message;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug)]
struct Membership {
    subscribers: HashSet<SessionId>,
    terminated: bool,
    /// When the channel last became unused.
    quiescent_since: Option<Instant>,
}

/// A channel.
pub struct Channel {
    route: Route,
    ttl: Duration,
    reflecting: AtomicBool,
    persistent: AtomicBool,
    membership: Mutex<Membership>,
    listeners: RwLock<Vec<ChannelListener>>,
    /// Serializes fan-out so each subscriber sees publishes in order.
    delivery: Mutex<()>,
    hub: Arc<ServerListeners>,
    attributes: DashMap<String, Value>,
}

impl Channel {
    pub(crate) fn new(
        route: Route,
        ttl: Duration,
        reflecting: bool,
        hub: Arc<ServerListeners>,
    ) -> Self {
        Self {
            route,
            ttl,
            reflecting: AtomicBool::new(reflecting),
            persistent: AtomicBool::new(false),
            membership: Mutex::new(Membership {
                subscribers: HashSet::new(),
                terminated: false,
                quiescent_since: Some(Instant::now()),
            }),
            listeners: RwLock::new(Vec::new()),
            delivery: Mutex::new(()),
            hub,
            attributes: DashMap::new(),
        }
    }

    #[must_use]
    pub fn route(&self) -> &Route {
        &self.route
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.route.path()
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    /// Persistent channels are never swept and cannot be removed.
    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
    }

    #[must_use]
    pub fn is_reflecting(&self) -> bool {
        self.reflecting.load(Ordering::Acquire)
    }

    /// Reflecting channels deliver a publish back to its sender.
    pub fn set_reflecting(&self, reflecting: bool) {
        self.reflecting.store(reflecting, Ordering::Release);
    }

    /// Whether the channel has been removed from its registry.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.membership.lock().terminated
    }

    pub fn add_listener(&self, listener: ChannelListener) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &ChannelListener) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| !registered.same_as(listener));
        listeners.len() != before
    }

    fn listener_snapshot(&self) -> Vec<ChannelListener> {
        self.listeners.read().clone()
    }

    /// Current subscribers.
    #[must_use]
    pub fn subscribers(&self) -> Vec<SessionId> {
        self.membership.lock().subscribers.iter().cloned().collect()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.membership.lock().subscribers.len()
    }

    #[must_use]
    pub fn is_subscribed(&self, session_id: &SessionId) -> bool {
        self.membership.lock().subscribers.contains(session_id)
    }

    /// Add a subscriber. Returns `false` if it was already subscribed.
    ///
    /// # Errors
    ///
    /// [`ChannelStateError::Terminated`] once the channel has been removed.
    pub fn subscribe(&self, session_id: &SessionId) -> Result<bool, ChannelStateError> {
        {
            let mut membership = self.membership.lock();
            if membership.terminated {
                return Err(ChannelStateError::Terminated(self.path().to_string()));
            }
            if !membership.subscribers.insert(session_id.clone()) {
                return Ok(false);
            }
            membership.quiescent_since = None;
        }

        debug!(channel = %self.route, session = %session_id, "Subscribed");
        self.fire_subscribed(session_id);
        Ok(true)
    }

    /// Remove a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, session_id: &SessionId) -> bool {
        {
            let mut membership = self.membership.lock();
            if !membership.subscribers.remove(session_id) {
                return false;
            }
            if membership.subscribers.is_empty() {
                membership.quiescent_since = Some(Instant::now());
            }
        }

        debug!(channel = %self.route, session = %session_id, "Unsubscribed");
        self.fire_unsubscribed(session_id);
        true
    }

    /// Whether the idle sweep may evict this channel at `now`.
    ///
    /// A channel is removable when it is not persistent, carries no
    /// persistent listener, has no subscribers, and has been unused for at
    /// least its time-to-live.
    #[must_use]
    pub fn is_removable(&self, now: Instant) -> bool {
        if self.is_persistent() || self.listener_snapshot().iter().any(ChannelListener::is_persistent) {
            return false;
        }
        let membership = self.membership.lock();
        !membership.terminated
            && membership.subscribers.is_empty()
            && membership
                .quiescent_since
                .is_some_and(|since| now.saturating_duration_since(since) >= self.ttl)
    }

    /// Close the channel and force every subscriber off.
    ///
    /// Returns the sessions that were subscribed.
    pub(crate) fn terminate(&self) -> Vec<SessionId> {
        let evicted: Vec<SessionId> = {
            let mut membership = self.membership.lock();
            membership.terminated = true;
            membership.subscribers.drain().collect()
        };
        for session_id in &evicted {
            self.fire_unsubscribed(session_id);
        }
        evicted
    }

    fn fire_subscribed(&self, session_id: &SessionId) {
        for listener in self.listener_snapshot() {
            if let ChannelListener::Session(listener) = listener {
                listener.on_subscribed(self, session_id);
            }
        }
        self.hub.subscribed(self, session_id);
    }

    fn fire_unsubscribed(&self, session_id: &SessionId) {
        for listener in self.listener_snapshot() {
            if let ChannelListener::Session(listener) = listener {
                listener.on_unsubscribed(self, session_id);
            }
        }
        self.hub.unsubscribed(self, session_id);
    }

    /// Build a publish of `data` on this channel and deliver it.
    ///
    /// Returns how many sessions accepted the delivery.
    pub fn publish(
        &self,
        sessions: &SessionRegistry,
        sender: Option<&SessionId>,
        data: Value,
    ) -> usize {
        let packet = Packet::single(
            PacketType::Publish,
            sender.cloned(),
            Some(self.route.clone()),
            Message::new(self.path()).with_data(data),
        );
        self.deliver(sessions, sender, &packet, &mut HashSet::new())
    }

    /// Fan `packet` out to this channel's subscribers.
    ///
    /// Sessions already in `seen` are skipped and every visited subscriber is
    /// added to it, so a session matched by several channels of one publish
    /// gets one copy. The sender is skipped unless the channel reflects.
    /// Channel packet listeners run once, before the fan-out; each recipient
    /// gets its own copy. A recipient that cannot take the packet is skipped.
    ///
    /// Returns how many sessions accepted the delivery.
    pub fn deliver(
        &self,
        sessions: &SessionRegistry,
        sender: Option<&SessionId>,
        packet: &Packet,
        seen: &mut HashSet<SessionId>,
    ) -> usize {
        let _ordered = self.delivery.lock();

        let mut packet = packet.to_delivery();
        for listener in self.listener_snapshot() {
            if let ChannelListener::Packet(listener) = listener {
                match listener.on_delivery(sender, packet) {
                    Some(rewritten) => packet = rewritten,
                    None => {
                        trace!(channel = %self.route, "Delivery stopped by channel listener");
                        return 0;
                    }
                }
            }
        }

        let reflecting = self.is_reflecting();
        let mut delivered = 0;
        for session_id in self.subscribers() {
            if !seen.insert(session_id.clone()) {
                continue;
            }
            if !reflecting && sender == Some(&session_id) {
                continue;
            }
            match sessions.get(session_id.as_str()) {
                Some(session) => {
                    if session.deliver(&self.route, sender, packet.freeze()) {
                        delivered += 1;
                    }
                }
                None => trace!(channel = %self.route, session = %session_id, "Subscriber no longer registered"),
            }
        }

        trace!(channel = %self.route, delivered, "Fan-out complete");
        delivered
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

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("route", &self.route)
            .field("persistent", &self.is_persistent())
            .field("reflecting", &self.is_reflecting())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{
        ChannelPacketListener, ChannelSessionListener, ServerListener, SubscriptionListener,
    };
    use crate::session::Session;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn channel(path: &str) -> Channel {
        Channel::new(
            Route::parse(path).unwrap(),
            Duration::from_secs(60),
            false,
            Arc::new(ServerListeners::new()),
        )
    }

    fn connected(sessions: &SessionRegistry) -> Arc<Session> {
        let session = sessions.create(false);
        session.complete_handshake().unwrap();
        session.complete_connection().unwrap();
        session.set_long_polling(true);
        session
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let channel = channel("/chat/room");
        let id = SessionId::from("a");
        assert_eq!(channel.subscribe(&id), Ok(true));
        assert_eq!(channel.subscribe(&id), Ok(false));
        assert_eq!(channel.subscriber_count(), 1);
        assert!(channel.unsubscribe(&id));
        assert!(!channel.unsubscribe(&id));
    }

    #[test]
    fn test_publish_skips_sender_unless_reflecting() {
        let sessions = SessionRegistry::new(16);
        let a = connected(&sessions);
        let b = connected(&sessions);
        let channel = channel("/chat/room");
        channel.subscribe(a.id()).unwrap();
        channel.subscribe(b.id()).unwrap();

        assert_eq!(channel.publish(&sessions, Some(a.id()), json!({"n": 1})), 1);
        assert_eq!(a.queue_len(), 0);
        assert_eq!(b.queue_len(), 1);

        channel.set_reflecting(true);
        assert_eq!(channel.publish(&sessions, Some(a.id()), json!({"n": 2})), 2);
        assert_eq!(a.queue_len(), 1);
        assert_eq!(b.queue_len(), 2);
    }

    #[test]
    fn test_delivery_failure_is_local() {
        let sessions = SessionRegistry::new(16);
        let gone = connected(&sessions);
        let live = connected(&sessions);
        let channel = channel("/chat/room");
        channel.subscribe(gone.id()).unwrap();
        channel.subscribe(live.id()).unwrap();
        gone.complete_disconnect().unwrap();

        assert_eq!(channel.publish(&sessions, None, json!("x")), 1);
        assert_eq!(live.queue_len(), 1);
    }

    #[test]
    fn test_seen_set_deduplicates_across_channels() {
        let sessions = SessionRegistry::new(16);
        let a = connected(&sessions);
        let exact = channel("/chat/room");
        let wild = channel("/chat/*");
        exact.subscribe(a.id()).unwrap();
        wild.subscribe(a.id()).unwrap();

        let packet = Packet::single(
            PacketType::Publish,
            None,
            Some(Route::parse("/chat/room").unwrap()),
            Message::new("/chat/room"),
        );
        let mut seen = HashSet::new();
        assert_eq!(exact.deliver(&sessions, None, &packet, &mut seen), 1);
        assert_eq!(wild.deliver(&sessions, None, &packet, &mut seen), 0);
        assert_eq!(a.queue_len(), 1);
    }

    struct Counting(AtomicUsize);

    impl ChannelPacketListener for Counting {
        fn on_delivery(&self, _sender: Option<&SessionId>, packet: Packet) -> Option<Packet> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(packet)
        }
    }

    #[test]
    fn test_packet_listener_runs_once_per_fan_out() {
        let sessions = SessionRegistry::new(16);
        let channel = channel("/chat/room");
        for _ in 0..3 {
            let session = connected(&sessions);
            channel.subscribe(session.id()).unwrap();
        }
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        channel.add_listener(ChannelListener::Packet(counting.clone()));

        assert_eq!(channel.publish(&sessions, None, json!(1)), 3);
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    struct Pinning;

    impl ChannelSessionListener for Pinning {
        fn on_subscribed(&self, _channel: &Channel, _session_id: &SessionId) {}
        fn on_unsubscribed(&self, _channel: &Channel, _session_id: &SessionId) {}
        fn is_persistent(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_removability() {
        let channel = channel("/chat/room");
        let later = Instant::now() + Duration::from_secs(61);
        assert!(!channel.is_removable(Instant::now()));
        assert!(channel.is_removable(later));

        channel.subscribe(&SessionId::from("a")).unwrap();
        assert!(!channel.is_removable(later));
        channel.unsubscribe(&SessionId::from("a"));
        assert!(channel.is_removable(Instant::now() + Duration::from_secs(61)));

        channel.set_persistent(true);
        assert!(!channel.is_removable(later));
        channel.set_persistent(false);

        let pin = ChannelListener::Session(Arc::new(Pinning));
        channel.add_listener(pin.clone());
        assert!(!channel.is_removable(later));
        channel.remove_listener(&pin);
    }

    #[derive(Default)]
    struct Membership {
        joined: AtomicUsize,
        left: AtomicUsize,
    }

    impl Membership {
        fn counts(&self) -> (usize, usize) {
            (
                self.joined.load(Ordering::SeqCst),
                self.left.load(Ordering::SeqCst),
            )
        }
    }

    impl ChannelSessionListener for Membership {
        fn on_subscribed(&self, _channel: &Channel, _session_id: &SessionId) {
            self.joined.fetch_add(1, Ordering::SeqCst);
        }
        fn on_unsubscribed(&self, _channel: &Channel, _session_id: &SessionId) {
            self.left.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl SubscriptionListener for Membership {
        fn on_subscribed(&self, _channel: &Channel, _session_id: &SessionId) {
            self.joined.fetch_add(1, Ordering::SeqCst);
        }
        fn on_unsubscribed(&self, _channel: &Channel, _session_id: &SessionId) {
            self.left.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_membership_changes_reach_listeners() {
        let hub = Arc::new(ServerListeners::new());
        let server_side = Arc::new(Membership::default());
        hub.add(ServerListener::Subscription(server_side.clone()));
        let channel = Channel::new(
            Route::parse("/chat/room").unwrap(),
            Duration::from_secs(60),
            false,
            hub,
        );
        let channel_side = Arc::new(Membership::default());
        channel.add_listener(ChannelListener::Session(channel_side.clone()));

        let a = SessionId::from("a");
        channel.subscribe(&a).unwrap();
        channel.subscribe(&SessionId::from("b")).unwrap();
        // Repeats change nothing and notify nobody.
        channel.subscribe(&a).unwrap();
        assert_eq!(channel_side.counts(), (2, 0));
        assert_eq!(server_side.counts(), (2, 0));

        assert!(channel.unsubscribe(&a));
        assert!(!channel.unsubscribe(&a));
        assert_eq!(channel_side.counts(), (2, 1));
        assert_eq!(server_side.counts(), (2, 1));

        channel.terminate();
        assert_eq!(channel_side.counts(), (2, 2));
        assert_eq!(server_side.counts(), (2, 2));
    }

    #[test]
    fn test_terminated_channel_rejects_subscribers() {
        let channel = channel("/chat/room");
        channel.subscribe(&SessionId::from("a")).unwrap();
        assert_eq!(channel.terminate(), vec![SessionId::from("a")]);
        assert!(channel.is_terminated());
        assert!(matches!(
            channel.subscribe(&SessionId::from("b")),
            Err(ChannelStateError::Terminated(_))
        ));
    }
}
