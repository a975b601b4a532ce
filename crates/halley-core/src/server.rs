//! The server: meta-protocol dispatch and publish fan-out.
//!
//! Transports hand each inbound batch to [`Server::on_request`] together with
//! a [`Carrier`] describing how the client is attached. Every message is
//! validated, run through the server's request listeners, dispatched to a
//! meta handler, a service, or a channel publish, and answered with packets
//! for the transport to send back. Protocol violations are answered with
//! failed meta responses; nothing a client sends makes `on_request` fail.

use crate::channel::Channel;
use crate::config::EngineConfig;
use crate::error::{ChannelStateError, PathError, SessionError, SubscriptionError};
use crate::listener::{ServerListener, ServerListeners};
use crate::meta::Meta;
use crate::packet::{Packet, PacketType};
use crate::policy::{
    AllowAll, Backbone, BayeuxService, Carrier, ChannelInitializer, SecurityPolicy, TransportKind,
};
use crate::registry::ChannelRegistry;
use crate::route::Route;
use crate::session::{Session, SessionId, SessionState};
use crate::sessions::SessionRegistry;
use halley_protocol::advice::keys;
use halley_protocol::{fields, Message, Reconnect, BAYEUX_VERSION, MINIMUM_BAYEUX_VERSION};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// A refused request: the client-visible error and reconnect advice.
struct Refusal {
    error: String,
    reconnect: Option<Reconnect>,
}

impl Refusal {
    fn new(error: impl Into<String>, reconnect: Option<Reconnect>) -> Self {
        Self {
            error: error.into(),
            reconnect,
        }
    }
}

impl From<SessionError> for Refusal {
    fn from(error: SessionError) -> Self {
        let reconnect = match error {
            SessionError::ConnectionRequired | SessionError::AlreadyHandshook => Reconnect::Retry,
            _ => Reconnect::Handshake,
        };
        Self::new(error.to_string(), Some(reconnect))
    }
}

/// Handle on the idle maintenance tasks started by [`Server::start`].
#[derive(Debug)]
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop both sweeps.
    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// The engine.
pub struct Server {
    config: EngineConfig,
    listeners: Arc<ServerListeners>,
    channels: ChannelRegistry,
    sessions: SessionRegistry,
    policy: RwLock<Arc<dyn SecurityPolicy>>,
    backbone: RwLock<Option<Arc<dyn Backbone>>>,
    services: RwLock<Vec<(Route, Arc<dyn BayeuxService>)>>,
    initializers: RwLock<Vec<Arc<dyn ChannelInitializer>>>,
    transports: RwLock<Vec<TransportKind>>,
}

impl Server {
    /// Create a server.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] if a configured reflecting path is malformed.
    pub fn new(config: EngineConfig) -> Result<Self, PathError> {
        let reflecting = config
            .reflecting_paths
            .iter()
            .map(Route::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let listeners = Arc::new(ServerListeners::new());

        info!(
            max_queue_size = config.max_queue_size,
            reflecting = reflecting.len(),
            create_on_publish = config.create_on_publish,
            "Creating server"
        );

        Ok(Self {
            channels: ChannelRegistry::new(listeners.clone(), config.channel_ttl(), reflecting),
            sessions: SessionRegistry::new(config.max_queue_size),
            listeners,
            policy: RwLock::new(Arc::new(AllowAll)),
            backbone: RwLock::new(None),
            services: RwLock::new(Vec::new()),
            initializers: RwLock::new(Vec::new()),
            transports: RwLock::new(vec![TransportKind::LongPolling, TransportKind::WebSocket]),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn set_security_policy(&self, policy: Arc<dyn SecurityPolicy>) {
        *self.policy.write() = policy;
    }

    fn policy(&self) -> Arc<dyn SecurityPolicy> {
        self.policy.read().clone()
    }

    pub fn set_backbone(&self, backbone: Option<Arc<dyn Backbone>>) {
        *self.backbone.write() = backbone;
    }

    /// Transports advertised in handshake responses.
    pub fn set_transports(&self, transports: Vec<TransportKind>) {
        *self.transports.write() = transports;
    }

    fn transport_names(&self) -> Vec<&'static str> {
        self.transports.read().iter().map(TransportKind::as_str).collect()
    }

    pub fn add_listener(&self, listener: ServerListener) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &ServerListener) -> bool {
        self.listeners.remove(listener)
    }

    /// Run `initializer` on every channel created from now on.
    pub fn add_initializer(&self, initializer: Arc<dyn ChannelInitializer>) {
        self.initializers.write().push(initializer);
    }

    /// Bind a service to `path`, which may be a wildcard pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] if `path` is malformed.
    pub fn add_service(
        &self,
        path: &str,
        service: Arc<dyn BayeuxService>,
    ) -> Result<(), PathError> {
        let route = Route::parse(path)?;
        debug!(service = %route, "Service bound");
        self.services.write().push((route, service));
        Ok(())
    }

    fn service_for(&self, route: &Route) -> Option<Arc<dyn BayeuxService>> {
        let services = self.services.read();
        services
            .iter()
            .find(|(bound, _)| bound == route)
            .or_else(|| services.iter().find(|(bound, _)| bound.matches(route)))
            .map(|(_, service)| service.clone())
    }

    #[must_use]
    pub fn find_channel(&self, path: &str) -> Option<Arc<Channel>> {
        self.channels.find(path)
    }

    /// Look up or create a channel, running the server's initializers on
    /// creation.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] if `path` is malformed.
    pub fn require_channel(&self, path: &str) -> Result<Arc<Channel>, PathError> {
        let initializers = self.initializers.read().clone();
        self.channels.require(path, &initializers)
    }

    /// Remove a channel and forget it in its former subscribers.
    ///
    /// # Errors
    ///
    /// [`ChannelStateError::Persistent`] for a persistent channel.
    pub fn remove_channel(&self, channel: &Arc<Channel>) -> Result<(), ChannelStateError> {
        for session_id in self.channels.remove(channel)? {
            if let Some(session) = self.sessions.get(session_id.as_str()) {
                session.remove_subscription(channel.path());
            }
        }
        Ok(())
    }

    /// Create a connected session for an in-process client.
    pub fn create_local_session(&self) -> Arc<Session> {
        let session = self.sessions.create(true);
        session.set_transport(TransportKind::Local);
        let handshook = session.complete_handshake();
        let connected = session.complete_connection();
        debug_assert!(
            handshook.is_ok() && connected.is_ok(),
            "fresh session refused a transition"
        );
        self.listeners.connected(&session);
        session
    }

    /// Subscribe `session` to `path` on its behalf, bypassing the security
    /// policy. Meant for local sessions.
    ///
    /// # Errors
    ///
    /// [`SubscriptionError::Path`] if `path` is malformed,
    /// [`SubscriptionError::State`] if the channel was removed under us twice.
    pub fn subscribe_session(
        &self,
        session: &Session,
        path: &str,
    ) -> Result<Arc<Channel>, SubscriptionError> {
        let mut channel = self.require_channel(path)?;
        if let Err(e) = channel.subscribe(session.id()) {
            // Swept between lookup and subscribe; look it up again once.
            debug!(channel = %path, error = %e, "Subscribe raced channel removal");
            channel = self.require_channel(path)?;
            channel.subscribe(session.id())?;
        }
        session.add_subscription(path);
        Ok(channel)
    }

    /// Publish `data` on `path` from an optional session.
    ///
    /// Fans out locally and forwards to the backbone. Returns how many local
    /// sessions accepted the delivery.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] if `path` is malformed.
    pub fn publish(
        &self,
        sender: Option<&Session>,
        path: &str,
        data: Value,
    ) -> Result<usize, PathError> {
        let route = Route::parse(path)?;
        let sender = sender.map(|session| session.id().clone());
        let packet = Packet::single(
            PacketType::Publish,
            sender.clone(),
            Some(route),
            Message::new(path).with_data(data),
        );
        Ok(self.deliver(sender.as_ref(), packet, true))
    }

    /// Fan a publish out to the channel on its route and every wildcard
    /// channel matching it.
    ///
    /// `clustered` publishes originated here and are also handed to the
    /// backbone without waiting for it. Packets arriving from the backbone
    /// come in with `clustered` unset and stay on this node. Each session
    /// receives at most one copy however many of its subscriptions match.
    pub fn deliver(&self, sender: Option<&SessionId>, packet: Packet, clustered: bool) -> usize {
        let Some(route) = packet.route().cloned() else {
            warn!("Dropping publish without a route");
            return 0;
        };
        let Some(packet) = self.listeners.delivery(sender, packet) else {
            trace!(channel = %route, "Publish stopped by server listener");
            return 0;
        };

        if clustered {
            self.forward(&packet);
        }

        let mut seen = HashSet::new();
        let mut delivered = 0;
        if let Some(channel) = self.channels.find(route.path()) {
            delivered += channel.deliver(&self.sessions, sender, &packet, &mut seen);
        }
        for channel in self.channels.matching_wildcards(&route) {
            delivered += channel.deliver(&self.sessions, sender, &packet, &mut seen);
        }

        trace!(channel = %route, delivered, clustered, "Publish delivered");
        delivered
    }

    fn forward(&self, packet: &Packet) {
        let Some(backbone) = self.backbone.read().clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let packet = packet.clone();
                handle.spawn(async move {
                    if let Err(e) = backbone.publish(packet).await {
                        warn!(error = %e, "Backbone publish failed");
                    }
                });
            }
            Err(_) => warn!("No runtime available, publish not forwarded to backbone"),
        }
    }

    /// Start the backbone, if one is installed.
    ///
    /// # Errors
    ///
    /// Propagates the backbone's startup failure.
    pub async fn start_up(&self) -> Result<(), crate::error::BackboneError> {
        let backbone = self.backbone.read().clone();
        if let Some(backbone) = backbone {
            backbone.start_up().await?;
            info!("Backbone started");
        }
        Ok(())
    }

    /// Disconnect every session and stop the backbone.
    ///
    /// # Errors
    ///
    /// Propagates the backbone's shutdown failure.
    pub async fn shut_down(&self) -> Result<(), crate::error::BackboneError> {
        for session in self.sessions.snapshot() {
            self.purge_session(&session);
        }
        let backbone = self.backbone.read().clone();
        if let Some(backbone) = backbone {
            backbone.shut_down().await?;
            info!("Backbone stopped");
        }
        Ok(())
    }

    /// Disconnect a session and drop it from the registry.
    ///
    /// The session leaves every channel it subscribed to and the server's
    /// session listeners hear `on_disconnected`. Purging twice is harmless.
    pub fn purge_session(&self, session: &Session) {
        if session.state() != SessionState::Disconnected {
            let _ = session.complete_disconnect();
        }
        if self.sessions.remove(session.id().as_str()).is_none() {
            return;
        }
        for path in session.take_subscriptions() {
            if let Some(channel) = self.channels.find(&path) {
                channel.unsubscribe(session.id());
            }
        }
        self.listeners.disconnected(session);
    }

    /// Run one idle channel sweep. Returns the number of channels removed.
    pub fn sweep_channels(&self) -> usize {
        self.channels.sweep(Instant::now()).len()
    }

    /// Force off every remote session silent for longer than the configured
    /// idle limit. Returns the number of sessions purged.
    pub fn sweep_sessions(&self) -> usize {
        let now = Instant::now();
        let max_idle = self.config.session_max_idle();
        let mut purged = 0;
        for session in self.sessions.snapshot() {
            if !session.is_local() && session.is_idle(now, max_idle) {
                debug!(session = %session.id(), "Evicting idle session");
                self.purge_session(&session);
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Idle sessions swept");
        }
        purged
    }

    /// Spawn the idle channel and idle session sweeps.
    ///
    /// The tasks hold the server weakly and end on their own once it is
    /// dropped.
    pub fn start(self: &Arc<Self>) -> MaintenanceHandle {
        let sifter = Self::every(
            Arc::downgrade(self),
            self.config.idle_channel_cycle(),
            |server| {
                server.sweep_channels();
            },
        );
        let inspector = Self::every(
            Arc::downgrade(self),
            self.config.idle_session_cycle(),
            |server| {
                server.sweep_sessions();
            },
        );
        info!("Maintenance tasks started");
        MaintenanceHandle {
            tasks: vec![sifter, inspector],
        }
    }

    fn every(
        server: Weak<Server>,
        period: Duration,
        work: fn(&Server),
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                work(&server);
            }
        })
    }

    /// Process one inbound batch and return the packets to send back.
    pub async fn on_request(&self, carrier: &Carrier, messages: Vec<Message>) -> Vec<Packet> {
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            out.extend(self.process(carrier, message).await);
        }
        out
    }

    async fn process(&self, carrier: &Carrier, message: Message) -> Vec<Packet> {
        let Some(path) = message.channel().map(str::to_owned) else {
            let mut response = error_message(
                "",
                &message,
                Refusal::new("All messages require a channel attribute", None),
            );
            response.remove(fields::CHANNEL);
            return vec![reply(None, None, response)];
        };

        let route = match Route::parse(&path) {
            Ok(route) => route,
            Err(e) => {
                return vec![reply(
                    None,
                    None,
                    error_message(&path, &message, Refusal::new(e.to_string(), None)),
                )]
            }
        };

        let meta = Meta::from_route(&route);
        if route.is_meta() && meta.is_none() {
            return vec![reply(
                None,
                Some(&route),
                error_message(
                    &path,
                    &message,
                    Refusal::new("Attempt to publish to a meta channel", None),
                ),
            )];
        }

        let session = if meta == Some(Meta::Handshake) {
            match self.open_session(carrier, &message) {
                Ok(session) => session,
                Err(refusal) => {
                    return vec![reply(
                        None,
                        Some(&route),
                        self.with_handshake_fields(error_message(&path, &message, refusal)),
                    )]
                }
            }
        } else {
            match self.resolve(&message) {
                Ok(session) => session,
                Err(e) => {
                    return vec![reply(
                        None,
                        Some(&route),
                        error_message(&path, &message, e.into()),
                    )]
                }
            }
        };
        session.contact();

        let packet_type = if meta.is_some() || route.is_service() {
            PacketType::MetaRequest
        } else {
            PacketType::Publish
        };
        let request = Packet::single(
            packet_type,
            Some(session.id().clone()),
            Some(route.clone()),
            message,
        );

        let mut out = Vec::new();
        match self.listeners.request(Some(&*session), request) {
            Some(request) => {
                for message in request.into_messages() {
                    let produced = self.dispatch(carrier, &session, meta, &route, &message).await;
                    out.extend(produced.into_iter().filter_map(|packet| self.respond(packet)));
                }
            }
            None => debug!(channel = %route, "Request stopped by server listener"),
        }

        if meta == Some(Meta::Handshake) && session.state() == SessionState::Handshaking {
            // Refused, or stopped by a listener.
            self.sessions.remove(session.id().as_str());
        } else if session.state() == SessionState::Disconnected {
            self.purge_session(&session);
        }
        out
    }

    async fn dispatch(
        &self,
        carrier: &Carrier,
        session: &Arc<Session>,
        meta: Option<Meta>,
        route: &Route,
        message: &Message,
    ) -> Vec<Packet> {
        match meta {
            Some(Meta::Connect) => self.connect(carrier, session, route, message).await,
            Some(Meta::Disconnect) => vec![self.disconnect(session, route, message)],
            Some(Meta::Subscribe) => vec![self.subscribe(session, route, message)],
            Some(Meta::Unsubscribe) => vec![self.unsubscribe(session, route, message)],
            Some(Meta::Handshake) => vec![self.handshake(session, route, message)],
            None if route.is_service() => self.service(carrier, session, route, message).await,
            None => vec![self.publish_message(session, route, message)],
        }
    }

    fn resolve(&self, message: &Message) -> Result<Arc<Session>, SessionError> {
        let client_id = message.client_id().ok_or(SessionError::MissingClientId)?;
        let session = self
            .sessions
            .get(client_id)
            .ok_or(SessionError::UnknownSession)?;
        if session.state() == SessionState::Disconnected {
            return Err(SessionError::Disconnected);
        }
        Ok(session)
    }

    /// Run response listeners over a meta response; other packets pass.
    fn respond(&self, packet: Packet) -> Option<Packet> {
        if packet.packet_type() != PacketType::MetaResponse {
            return Some(packet);
        }
        let addressee = packet
            .sender_id()
            .and_then(|id| self.sessions.get(id.as_str()));
        let packet = self.listeners.response(addressee.as_deref(), packet)?;
        match addressee {
            Some(session) => session.on_response(Some(session.id()), packet),
            None => Some(packet),
        }
    }

    fn with_handshake_fields(&self, message: Message) -> Message {
        message
            .with(fields::VERSION, BAYEUX_VERSION.to_string())
            .with(fields::MINIMUM_VERSION, MINIMUM_BAYEUX_VERSION.to_string())
            .with(fields::SUPPORTED_CONNECTION_TYPES, self.transport_names())
    }

    /// Validate a handshake request and register a session for it.
    ///
    /// The session stays `Handshaking` until [`Server::handshake`] completes
    /// it, so request listeners can attach state to it first.
    fn open_session(
        &self,
        carrier: &Carrier,
        message: &Message,
    ) -> Result<Arc<Session>, Refusal> {
        if let Some(client_id) = message.client_id() {
            let error = match self.sessions.get(client_id) {
                Some(existing) if existing.state() >= SessionState::Handshook => {
                    SessionError::AlreadyHandshook
                }
                _ => SessionError::UnexpectedClientId,
            };
            return Err(error.into());
        }

        let transport = carrier.transport();
        if transport != TransportKind::Local
            && !message
                .supported_connection_types()
                .contains(&transport.as_str())
        {
            return Err(Refusal::new(
                "Handshake attempted on an unsupported transport",
                Some(Reconnect::Handshake),
            ));
        }

        Ok(self.sessions.create(transport == TransportKind::Local))
    }

    fn handshake(&self, session: &Arc<Session>, route: &Route, message: &Message) -> Packet {
        let path = route.path();
        let refuse = |refusal: Refusal| {
            reply(
                Some(session.id()),
                Some(route),
                self.with_handshake_fields(error_message(path, message, refusal)),
            )
        };

        if let Err(rejection) = self.policy().can_handshake(session, message) {
            debug!(session = %session.id(), reason = %rejection, "Handshake denied");
            return refuse(Refusal::new(rejection.to_string(), Some(Reconnect::None)));
        }
        if let Err(e) = session.complete_handshake() {
            return refuse(e.into());
        }

        let response = Message::success_response(
            path,
            message.id().as_deref(),
            Some(session.id().as_str()),
            Some(Reconnect::Retry),
        )
        .with_advice(keys::INTERVAL, self.config.session_connect_interval_ms)
        .with_advice(
            keys::TIMEOUT,
            u64::try_from(self.config.long_poll_ceiling().as_millis()).unwrap_or(u64::MAX),
        );
        reply(
            Some(session.id()),
            Some(route),
            self.with_handshake_fields(response),
        )
    }

    async fn connect(
        &self,
        carrier: &Carrier,
        session: &Arc<Session>,
        route: &Route,
        message: &Message,
    ) -> Vec<Packet> {
        let path = route.path();
        let refuse = |refusal: Refusal| {
            vec![reply(
                Some(session.id()),
                Some(route),
                error_message(path, message, refusal),
            )]
        };

        let state = session.state();
        if state < SessionState::Handshook {
            return refuse(SessionError::HandshakeRequired.into());
        }
        let transport = carrier.transport();
        if state == SessionState::Handshook
            && transport != TransportKind::Local
            && message.connection_type() != Some(transport.as_str())
        {
            return refuse(Refusal::new(
                "Connection requested on an unsupported transport",
                Some(Reconnect::Handshake),
            ));
        }

        let first = match session.complete_connection() {
            Ok(first) => first,
            Err(e) => return refuse(e.into()),
        };
        session.set_transport(transport);
        // Extensions may already have switched a push session to polling.
        if transport.is_long_polling() {
            session.set_long_polling(true);
        }
        session.set_outlet(carrier.outlet().cloned());
        if first {
            self.listeners.connected(session);
        }

        let ceiling = self.config.long_poll_ceiling();
        let timeout = message
            .advised_timeout()
            .map_or(ceiling, |advised| Duration::from_millis(advised).min(ceiling));
        let response = Message::success_response(
            path,
            message.id().as_deref(),
            Some(session.id().as_str()),
            Some(Reconnect::Retry),
        )
        .with_advice(keys::INTERVAL, self.config.session_connect_interval_ms)
        .with_advice(keys::TIMEOUT, timeout.as_millis() as u64);

        // Deliveries ride in the connect response packet, after the response.
        let mut packet = reply(Some(session.id()), Some(route), response);
        if session.is_long_polling() {
            let deliveries = if first {
                session.drain()
            } else {
                let polled = session.poll(timeout).await;
                session.contact();
                polled
            };
            for delivery in deliveries {
                packet.merge(delivery);
            }
        }
        vec![packet]
    }

    fn disconnect(&self, session: &Arc<Session>, route: &Route, message: &Message) -> Packet {
        let path = route.path();
        if session.state() < SessionState::Handshook {
            return reply(
                Some(session.id()),
                Some(route),
                error_message(path, message, SessionError::HandshakeRequired.into()),
            );
        }

        let response = Message::success_response(
            path,
            message.id().as_deref(),
            Some(session.id().as_str()),
            Some(Reconnect::None),
        );
        // The purge after dispatch removes the session once this response
        // has been through the response listeners.
        let _ = session.complete_disconnect();
        reply(Some(session.id()), Some(route), response)
    }

    fn subscribe(&self, session: &Arc<Session>, route: &Route, message: &Message) -> Packet {
        let target = message.subscription();
        let mut response = match self.attach(session, target, message) {
            Ok(()) => Message::success_response(
                route.path(),
                message.id().as_deref(),
                Some(session.id().as_str()),
                None,
            ),
            Err(refusal) => error_message(route.path(), message, refusal),
        };
        if let Some(target) = target {
            response.put(fields::SUBSCRIPTION, target);
        }
        reply(Some(session.id()), Some(route), response)
    }

    fn attach(
        &self,
        session: &Session,
        target: Option<&str>,
        message: &Message,
    ) -> Result<(), Refusal> {
        let target = target.ok_or_else(|| Refusal::new("Missing subscription", None))?;
        require_connected(session)?;
        let route =
            Route::parse(target).map_err(|e| Refusal::new(e.to_string(), None))?;
        if route.is_meta() {
            return Err(Refusal::new(
                "Attempted subscription to a meta channel",
                None,
            ));
        }

        // A channel swept between lookup and subscribe is terminated; look
        // it up again once.
        for _ in 0..2 {
            let channel = match self.channels.find(target) {
                Some(channel) => channel,
                None => {
                    self.policy()
                        .can_create(session, &route, message)
                        .map_err(|e| Refusal::new(e.to_string(), Some(Reconnect::None)))?;
                    self.require_channel(target)
                        .map_err(|e| Refusal::new(e.to_string(), None))?
                }
            };
            self.policy()
                .can_subscribe(session, &channel, message)
                .map_err(|e| Refusal::new(e.to_string(), Some(Reconnect::None)))?;

            match channel.subscribe(session.id()) {
                Ok(_) => {
                    session.add_subscription(target);
                    return Ok(());
                }
                Err(e) => debug!(channel = %target, error = %e, "Subscribe raced channel removal"),
            }
        }
        Err(Refusal::new(
            ChannelStateError::Terminated(target.to_string()).to_string(),
            Some(Reconnect::Retry),
        ))
    }

    fn unsubscribe(&self, session: &Arc<Session>, route: &Route, message: &Message) -> Packet {
        let target = message.subscription();
        let result = target
            .ok_or_else(|| Refusal::new("Missing subscription", None))
            .and_then(|target| {
                require_connected(session)?;
                if let Some(channel) = self.channels.find(target) {
                    channel.unsubscribe(session.id());
                }
                session.remove_subscription(target);
                Ok(())
            });

        let mut response = match result {
            Ok(()) => Message::success_response(
                route.path(),
                message.id().as_deref(),
                Some(session.id().as_str()),
                None,
            ),
            Err(refusal) => error_message(route.path(), message, refusal),
        };
        if let Some(target) = target {
            response.put(fields::SUBSCRIPTION, target);
        }
        reply(Some(session.id()), Some(route), response)
    }

    fn publish_message(&self, session: &Arc<Session>, route: &Route, message: &Message) -> Packet {
        let path = route.path();
        match self.accept_publish(session, route, message) {
            Ok(()) => reply(
                Some(session.id()),
                Some(route),
                Message::success_response(
                    path,
                    message.id().as_deref(),
                    Some(session.id().as_str()),
                    None,
                ),
            ),
            Err(refusal) => reply(
                Some(session.id()),
                Some(route),
                error_message(path, message, refusal),
            ),
        }
    }

    fn accept_publish(
        &self,
        session: &Arc<Session>,
        route: &Route,
        message: &Message,
    ) -> Result<(), Refusal> {
        require_connected(session)?;
        if route.is_wildcard() {
            return Err(Refusal::new(
                "Attempted to publish to a wildcard channel",
                None,
            ));
        }

        let channel = match self.channels.find(route.path()) {
            Some(channel) => channel,
            None if self.config.create_on_publish => {
                self.policy()
                    .can_create(session, route, message)
                    .map_err(|e| Refusal::new(e.to_string(), None))?;
                self.require_channel(route.path())
                    .map_err(|e| Refusal::new(e.to_string(), None))?
            }
            None => return Err(Refusal::new("Unknown channel", None)),
        };
        self.policy()
            .can_publish(session, &channel, message)
            .map_err(|e| Refusal::new(e.to_string(), None))?;

        let mut delivery = Message::new(route.path());
        if let Some(id) = message.get(fields::ID) {
            delivery.put(fields::ID, id.clone());
        }
        let delivery = delivery.with_data(message.data().cloned().unwrap_or(Value::Null));
        let packet = Packet::single(
            PacketType::Publish,
            Some(session.id().clone()),
            Some(route.clone()),
            delivery,
        );
        self.deliver(Some(session.id()), packet, true);
        Ok(())
    }

    async fn service(
        &self,
        carrier: &Carrier,
        session: &Arc<Session>,
        route: &Route,
        message: &Message,
    ) -> Vec<Packet> {
        let refused = |refusal: Refusal| {
            vec![reply(
                Some(session.id()),
                Some(route),
                error_message(route.path(), message, refusal),
            )]
        };
        if let Err(refusal) = require_connected(session) {
            return refused(refusal);
        }
        let Some(service) = self.service_for(route) else {
            return refused(Refusal::new("Unknown service", None));
        };
        service
            .process(carrier.transport(), route, self, session, message)
            .await
            .into_iter()
            .collect()
    }
}

fn require_connected(session: &Session) -> Result<(), Refusal> {
    match session.state() {
        SessionState::Handshaking => Err(SessionError::HandshakeRequired.into()),
        SessionState::Handshook => Err(SessionError::ConnectionRequired.into()),
        SessionState::Connected => Ok(()),
        SessionState::Disconnected => Err(SessionError::Disconnected.into()),
    }
}

fn error_message(path: &str, request: &Message, refusal: Refusal) -> Message {
    Message::error_response(
        path,
        request.id().as_deref(),
        request.client_id(),
        refusal.error,
        refusal.reconnect,
    )
}

/// A meta response addressed to `session`.
fn reply(session: Option<&SessionId>, route: Option<&Route>, message: Message) -> Packet {
    Packet::single(
        PacketType::MetaResponse,
        session.cloned(),
        route.cloned(),
        message,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackboneError, SecurityRejection};
    use crate::listener::{ServerPacketListener, SessionLifecycleListener};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn server() -> Server {
        Server::new(EngineConfig::default()).unwrap()
    }

    fn carrier() -> Carrier {
        Carrier::long_polling()
    }

    fn first(packets: &[Packet]) -> &Message {
        &packets[0].messages()[0]
    }

    async fn request(server: &Server, message: Message) -> Vec<Packet> {
        server.on_request(&carrier(), vec![message]).await
    }

    async fn handshake(server: &Server) -> String {
        let packets = request(
            server,
            Message::new("/meta/handshake")
                .with(fields::ID, "1")
                .with(fields::VERSION, "1.0")
                .with(fields::SUPPORTED_CONNECTION_TYPES, json!(["long-polling"])),
        )
        .await;
        let response = first(&packets);
        assert_eq!(response.successful(), Some(true), "{response:?}");
        response.client_id().unwrap().to_string()
    }

    async fn connect(server: &Server, client_id: &str) -> Vec<Packet> {
        request(
            server,
            Message::new("/meta/connect")
                .with(fields::CLIENT_ID, client_id)
                .with(fields::CONNECTION_TYPE, "long-polling"),
        )
        .await
    }

    async fn subscribe(server: &Server, client_id: &str, target: &str) -> Message {
        let packets = request(
            server,
            Message::new("/meta/subscribe")
                .with(fields::CLIENT_ID, client_id)
                .with(fields::SUBSCRIPTION, target),
        )
        .await;
        first(&packets).clone()
    }

    async fn publish(server: &Server, client_id: &str, path: &str, data: Value) -> Message {
        let packets = request(
            server,
            Message::new(path)
                .with(fields::CLIENT_ID, client_id)
                .with_data(data),
        )
        .await;
        first(&packets).clone()
    }

    async fn join(server: &Server) -> String {
        let client_id = handshake(server).await;
        let packets = connect(server, &client_id).await;
        assert_eq!(first(&packets).successful(), Some(true));
        client_id
    }

    fn session(server: &Server, client_id: &str) -> Arc<Session> {
        server.sessions().get(client_id).unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_poll() {
        let server = server();
        let reader = join(&server).await;
        assert_eq!(
            subscribe(&server, &reader, "/chat/room1").await.successful(),
            Some(true)
        );
        let writer = join(&server).await;

        let ack = publish(&server, &writer, "/chat/room1", json!({"text": "hi"})).await;
        assert_eq!(ack.successful(), Some(true));

        let polled = session(&server, &reader)
            .poll(Duration::from_secs(5))
            .await;
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].packet_type(), PacketType::Delivery);
        let delivery = &polled[0].messages()[0];
        assert_eq!(delivery.channel(), Some("/chat/room1"));
        assert_eq!(delivery.data(), Some(&json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn test_reflecting_controls_self_delivery() {
        let server = Server::new(EngineConfig {
            reflecting_paths: vec!["/echo/**".to_string()],
            ..EngineConfig::default()
        })
        .unwrap();
        let a = join(&server).await;
        let b = join(&server).await;
        for client in [&a, &b] {
            subscribe(&server, client, "/echo/x").await;
            subscribe(&server, client, "/chat/x").await;
        }

        publish(&server, &a, "/chat/x", json!(1)).await;
        assert_eq!(session(&server, &a).queue_len(), 0);
        assert_eq!(session(&server, &b).queue_len(), 1);

        publish(&server, &a, "/echo/x", json!(2)).await;
        assert_eq!(session(&server, &a).queue_len(), 1);
        assert_eq!(session(&server, &b).queue_len(), 2);
    }

    #[tokio::test]
    async fn test_wildcard_subscribers_get_one_copy() {
        let server = server();
        let reader = join(&server).await;
        subscribe(&server, &reader, "/chat/*").await;
        subscribe(&server, &reader, "/chat/**").await;
        subscribe(&server, &reader, "/chat/room").await;
        let writer = join(&server).await;

        publish(&server, &writer, "/chat/room", json!("once")).await;
        assert_eq!(session(&server, &reader).queue_len(), 1);

        // Only the deep wildcard covers two levels down; the concrete
        // channel has to exist for the publish to be accepted.
        server.require_channel("/chat/room/deep").unwrap();
        publish(&server, &writer, "/chat/room/deep", json!("deep")).await;
        assert_eq!(session(&server, &reader).queue_len(), 2);
    }

    #[tokio::test]
    async fn test_protocol_violations_become_error_responses() {
        let server = server();

        let packets = request(&server, Message::empty().with(fields::ID, "7")).await;
        assert_eq!(first(&packets).successful(), Some(false));
        assert_eq!(
            first(&packets).error(),
            Some("All messages require a channel attribute")
        );

        let packets = request(&server, Message::new("/chat/room")).await;
        assert_eq!(first(&packets).error(), Some("Missing client id"));
        assert_eq!(first(&packets).reconnect(), Some("handshake"));

        let packets = request(
            &server,
            Message::new("/meta/connect").with(fields::CLIENT_ID, "nobody"),
        )
        .await;
        assert_eq!(first(&packets).error(), Some("Invalid client id"));
        assert_eq!(first(&packets).reconnect(), Some("handshake"));

        let client = join(&server).await;
        let packets = request(
            &server,
            Message::new("/meta/bogus").with(fields::CLIENT_ID, client.as_str()),
        )
        .await;
        assert_eq!(
            first(&packets).error(),
            Some("Attempt to publish to a meta channel")
        );

        let packets = request(&server, Message::new("/chat//room")).await;
        assert_eq!(first(&packets).successful(), Some(false));

        let ack = publish(&server, &client, "/nowhere", json!(1)).await;
        assert_eq!(ack.error(), Some("Unknown channel"));

        let ack = publish(&server, &client, "/chat/*", json!(1)).await;
        assert_eq!(ack.successful(), Some(false));
    }

    #[tokio::test]
    async fn test_handshake_negotiates_transport() {
        let server = server();
        let packets = request(
            &server,
            Message::new("/meta/handshake")
                .with(fields::SUPPORTED_CONNECTION_TYPES, json!(["callback-polling"])),
        )
        .await;
        let response = first(&packets);
        assert_eq!(response.successful(), Some(false));
        assert_eq!(
            response.error(),
            Some("Handshake attempted on an unsupported transport")
        );
        assert_eq!(response.get(fields::VERSION), Some(&json!("1.0")));
        assert!(server.sessions().is_empty());

        let client = handshake(&server).await;
        let packets = request(
            &server,
            Message::new("/meta/connect")
                .with(fields::CLIENT_ID, client.as_str())
                .with(fields::CONNECTION_TYPE, "websocket"),
        )
        .await;
        assert_eq!(
            first(&packets).error(),
            Some("Connection requested on an unsupported transport")
        );

        let packets = request(
            &server,
            Message::new("/meta/handshake").with(fields::CLIENT_ID, client.as_str()),
        )
        .await;
        assert_eq!(
            first(&packets).error(),
            Some("Handshake was previously completed")
        );
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let server = server();
        server.require_channel("/chat/room").unwrap();
        let client = handshake(&server).await;
        let ack = publish(&server, &client, "/chat/room", json!(1)).await;
        assert_eq!(ack.error(), Some("Connection required"));
        assert_eq!(ack.reconnect(), Some("retry"));
    }

    #[tokio::test]
    async fn test_create_on_publish() {
        let server = Server::new(EngineConfig {
            create_on_publish: true,
            ..EngineConfig::default()
        })
        .unwrap();
        let client = join(&server).await;
        let ack = publish(&server, &client, "/fresh", json!(1)).await;
        assert_eq!(ack.successful(), Some(true));
        assert!(server.find_channel("/fresh").is_some());
    }

    struct DenySubscribe;

    impl SecurityPolicy for DenySubscribe {
        fn can_subscribe(
            &self,
            _session: &Session,
            channel: &Channel,
            _message: &Message,
        ) -> Result<(), SecurityRejection> {
            if channel.path().starts_with("/private") {
                Err(SecurityRejection::unauthorized())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_security_policy_denial() {
        let server = server();
        server.set_security_policy(Arc::new(DenySubscribe));
        let client = join(&server).await;

        let response = subscribe(&server, &client, "/private/room").await;
        assert_eq!(response.successful(), Some(false));
        assert_eq!(response.error(), Some("Unauthorized"));
        assert_eq!(response.subscription(), Some("/private/room"));
        assert!(session(&server, &client).subscriptions().is_empty());

        let response = subscribe(&server, &client, "/meta/connect").await;
        assert_eq!(
            response.error(),
            Some("Attempted subscription to a meta channel")
        );
    }

    #[derive(Default)]
    struct Lifecycle {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl SessionLifecycleListener for Lifecycle {
        fn on_connected(&self, _session: &Session) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self, _session: &Session) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_disconnect_purges_session() {
        let server = server();
        let lifecycle = Arc::new(Lifecycle::default());
        server.add_listener(ServerListener::Session(lifecycle.clone()));

        let client = join(&server).await;
        subscribe(&server, &client, "/chat/room").await;
        let held = session(&server, &client);
        assert_eq!(lifecycle.connected.load(Ordering::SeqCst), 1);

        let packets = request(
            &server,
            Message::new("/meta/disconnect").with(fields::CLIENT_ID, client.as_str()),
        )
        .await;
        assert_eq!(first(&packets).successful(), Some(true));
        assert!(server.sessions().get(&client).is_none());
        assert_eq!(lifecycle.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(
            server.find_channel("/chat/room").unwrap().subscriber_count(),
            0
        );

        let other = join(&server).await;
        publish(&server, &other, "/chat/room", json!(1)).await;
        assert_eq!(held.queue_len(), 0);

        let packets = connect(&server, &client).await;
        assert_eq!(first(&packets).error(), Some("Invalid client id"));
    }

    #[tokio::test]
    async fn test_connect_waits_for_deliveries() {
        let server = Arc::new(server());
        let reader = join(&server).await;
        subscribe(&server, &reader, "/chat/room").await;
        let writer = join(&server).await;

        let pending = {
            let server = server.clone();
            let reader = reader.clone();
            tokio::spawn(async move {
                server
                    .on_request(
                        &Carrier::long_polling(),
                        vec![Message::new("/meta/connect")
                            .with(fields::CLIENT_ID, reader.as_str())
                            .with_advice(keys::TIMEOUT, 5_000)],
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        publish(&server, &writer, "/chat/room", json!("wake")).await;

        let packets = pending.await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type(), PacketType::MetaResponse);
        let messages = packets[0].messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].channel(), Some("/meta/connect"));
        assert_eq!(messages[1].data(), Some(&json!("wake")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_poll_timeout_is_capped() {
        let server = Server::new(EngineConfig {
            long_poll_timeout_ms: 1_000,
            ..EngineConfig::default()
        })
        .unwrap();
        let client = join(&server).await;

        let started = tokio::time::Instant::now();
        let packets = tokio::time::timeout(
            Duration::from_secs(3),
            request(
                &server,
                Message::new("/meta/connect")
                    .with(fields::CLIENT_ID, client.as_str())
                    .with_advice(keys::TIMEOUT, u64::MAX),
            ),
        )
        .await
        .expect("connect outlived the server's poll ceiling");

        assert!(started.elapsed() < Duration::from_secs(2));
        let response = first(&packets);
        assert_eq!(response.successful(), Some(true));
        assert_eq!(response.advised_timeout(), Some(1_000));
        assert!(server.sessions().get(&client).is_some());
    }

    #[derive(Default)]
    struct HandshakeWitness {
        requests: Mutex<Vec<Option<String>>>,
        responses: Mutex<Vec<Option<String>>>,
    }

    impl ServerPacketListener for HandshakeWitness {
        fn on_request(&self, sender: Option<&Session>, packet: Packet) -> Option<Packet> {
            if packet.messages()[0].channel() == Some("/meta/handshake") {
                self.requests
                    .lock()
                    .push(sender.map(|s| s.id().as_str().to_string()));
            }
            Some(packet)
        }

        fn on_response(&self, sender: Option<&Session>, packet: Packet) -> Option<Packet> {
            if packet.messages()[0].channel() == Some("/meta/handshake") {
                self.responses
                    .lock()
                    .push(sender.map(|s| s.id().as_str().to_string()));
            }
            Some(packet)
        }
    }

    #[tokio::test]
    async fn test_handshake_listeners_see_the_new_session() {
        let server = server();
        let witness = Arc::new(HandshakeWitness::default());
        server.add_listener(ServerListener::Packet(witness.clone()));

        let client = handshake(&server).await;
        assert_eq!(*witness.requests.lock(), vec![Some(client.clone())]);
        assert_eq!(*witness.responses.lock(), vec![Some(client)]);
    }

    struct DenyHandshake;

    impl SecurityPolicy for DenyHandshake {
        fn can_handshake(
            &self,
            _session: &Session,
            _message: &Message,
        ) -> Result<(), SecurityRejection> {
            Err(SecurityRejection::unauthorized())
        }
    }

    #[tokio::test]
    async fn test_refused_handshake_leaves_no_session() {
        let server = server();
        server.set_security_policy(Arc::new(DenyHandshake));
        let witness = Arc::new(HandshakeWitness::default());
        server.add_listener(ServerListener::Packet(witness.clone()));

        let packets = request(
            &server,
            Message::new("/meta/handshake")
                .with(fields::VERSION, "1.0")
                .with(fields::SUPPORTED_CONNECTION_TYPES, json!(["long-polling"])),
        )
        .await;
        assert_eq!(first(&packets).successful(), Some(false));
        assert!(server.sessions().is_empty());
        // The refusal is still addressed to the provisional session.
        assert!(witness.responses.lock()[0].is_some());
    }

    #[tokio::test]
    async fn test_subscribe_session_gives_up_on_dead_channels() {
        let server = server();
        server.add_initializer(Arc::new(|channel: &Channel| {
            channel.terminate();
        }));
        let session = server.create_local_session();

        let result = server.subscribe_session(&session, "/doomed");
        assert_eq!(
            result.err(),
            Some(SubscriptionError::State(ChannelStateError::Terminated(
                "/doomed".to_string()
            )))
        );
        assert!(session.subscriptions().is_empty());
        assert!(matches!(
            server.subscribe_session(&session, "bad"),
            Err(SubscriptionError::Path(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_channel_rules() {
        let server = server();
        let client = join(&server).await;
        subscribe(&server, &client, "/chat/room").await;

        let channel = server.find_channel("/chat/room").unwrap();
        channel.set_persistent(true);
        assert!(matches!(
            server.remove_channel(&channel),
            Err(ChannelStateError::Persistent(_))
        ));

        channel.set_persistent(false);
        server.remove_channel(&channel).unwrap();
        assert!(server.find_channel("/chat/room").is_none());
        assert!(session(&server, &client).subscriptions().is_empty());

        // Subscribing again lands on a fresh channel.
        assert_eq!(
            subscribe(&server, &client, "/chat/room").await.successful(),
            Some(true)
        );
    }

    struct Recorder(mpsc::UnboundedSender<Packet>);

    #[async_trait]
    impl Backbone for Recorder {
        async fn publish(&self, packet: Packet) -> Result<(), BackboneError> {
            self.0.send(packet).map_err(|_| BackboneError::Shutdown)
        }
    }

    #[tokio::test]
    async fn test_backbone_sees_local_publishes_only() {
        let server = server();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_backbone(Some(Arc::new(Recorder(tx))));
        server.start_up().await.unwrap();

        let reader = join(&server).await;
        subscribe(&server, &reader, "/chat/room").await;
        let writer = join(&server).await;
        publish(&server, &writer, "/chat/room", json!("local")).await;

        let forwarded = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.messages()[0].data(), Some(&json!("local")));

        let inbound = Packet::single(
            PacketType::Publish,
            None,
            Some(Route::parse("/chat/room").unwrap()),
            Message::new("/chat/room").with_data(json!("remote")),
        );
        assert_eq!(server.deliver(None, inbound, false), 1);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session(&server, &reader).queue_len(), 2);
    }

    #[tokio::test]
    async fn test_idle_sessions_are_swept() {
        let server = Server::new(EngineConfig {
            session_max_idle_ms: 0,
            ..EngineConfig::default()
        })
        .unwrap();
        let remote = join(&server).await;
        let local = server.create_local_session();

        assert_eq!(server.sweep_sessions(), 1);
        assert!(server.sessions().get(&remote).is_none());
        assert!(server.sessions().get(local.id().as_str()).is_some());
    }

    #[tokio::test]
    async fn test_local_session_publish() {
        let server = server();
        let local = server.create_local_session();
        assert_eq!(local.state(), SessionState::Connected);
        server.subscribe_session(&local, "/news").unwrap();

        let remote = join(&server).await;
        publish(&server, &remote, "/news", json!("headline")).await;
        assert_eq!(local.drain().len(), 1);

        let reader = join(&server).await;
        subscribe(&server, &reader, "/news").await;
        assert_eq!(server.publish(Some(&local), "/news", json!("x")).unwrap(), 1);
    }

    struct Echo;

    #[async_trait]
    impl BayeuxService for Echo {
        async fn process(
            &self,
            _transport: TransportKind,
            route: &Route,
            _server: &Server,
            session: &Arc<Session>,
            message: &Message,
        ) -> Option<Packet> {
            Some(Packet::single(
                PacketType::Delivery,
                Some(session.id().clone()),
                Some(route.clone()),
                Message::new(route.path()).with_data(message.data().cloned()?),
            ))
        }
    }

    #[tokio::test]
    async fn test_service_requests_bypass_channels() {
        let server = server();
        server.add_service("/service/echo", Arc::new(Echo)).unwrap();
        let client = join(&server).await;

        let packets = request(
            &server,
            Message::new("/service/echo")
                .with(fields::CLIENT_ID, client.as_str())
                .with_data(json!("ping")),
        )
        .await;
        assert_eq!(first(&packets).data(), Some(&json!("ping")));
        assert!(server.find_channel("/service/echo").is_none());

        let packets = request(
            &server,
            Message::new("/service/missing").with(fields::CLIENT_ID, client.as_str()),
        )
        .await;
        assert_eq!(first(&packets).error(), Some("Unknown service"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_sweeps_idle_channels() {
        let server = Arc::new(
            Server::new(EngineConfig {
                channel_ttl_ms: 0,
                idle_channel_cycle_ms: 1_000,
                ..EngineConfig::default()
            })
            .unwrap(),
        );
        server.require_channel("/idle").unwrap();
        let handle = server.start();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(server.find_channel("/idle").is_none());
        handle.stop();
    }
}
