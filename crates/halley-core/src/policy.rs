//! Seams to collaborators outside the engine.
//!
//! Security decisions, channel customization, cluster replication, service
//! handlers and push transports all plug in through the traits here.

use crate::channel::Channel;
use crate::error::{BackboneError, SecurityRejection};
use crate::packet::Packet;
use crate::route::Route;
use crate::server::Server;
use crate::session::Session;
use async_trait::async_trait;
use halley_protocol::Message;
use std::fmt;
use std::sync::Arc;

/// Authorization decisions, consulted before the matching state change.
///
/// Every method allows by default. Implementations must not have side
/// effects on the engine.
pub trait SecurityPolicy: Send + Sync {
    fn can_handshake(&self, session: &Session, message: &Message) -> Result<(), SecurityRejection> {
        let _ = (session, message);
        Ok(())
    }

    fn can_create(
        &self,
        session: &Session,
        route: &Route,
        message: &Message,
    ) -> Result<(), SecurityRejection> {
        let _ = (session, route, message);
        Ok(())
    }

    fn can_subscribe(
        &self,
        session: &Session,
        channel: &Channel,
        message: &Message,
    ) -> Result<(), SecurityRejection> {
        let _ = (session, channel, message);
        Ok(())
    }

    fn can_publish(
        &self,
        session: &Session,
        channel: &Channel,
        message: &Message,
    ) -> Result<(), SecurityRejection> {
        let _ = (session, channel, message);
        Ok(())
    }
}

/// Policy that allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl SecurityPolicy for AllowAll {}

/// Runs once on a new channel before any other caller can see it.
pub trait ChannelInitializer: Send + Sync {
    fn initialize(&self, channel: &Channel);
}

impl<F> ChannelInitializer for F
where
    F: Fn(&Channel) + Send + Sync,
{
    fn initialize(&self, channel: &Channel) {
        self(channel);
    }
}

/// Cluster replication.
///
/// The server hands every locally originated publish to the backbone without
/// waiting for it; packets arriving from other nodes come back in through
/// [`Server::deliver`] with `clustered` unset.
#[async_trait]
pub trait Backbone: Send + Sync {
    async fn start_up(&self) -> Result<(), BackboneError> {
        Ok(())
    }

    async fn shut_down(&self) -> Result<(), BackboneError> {
        Ok(())
    }

    /// Replicate a publish to the other nodes.
    async fn publish(&self, packet: Packet) -> Result<(), BackboneError>;
}

/// Handler bound to a `/service/...` path.
///
/// Service requests never fan out; whatever packet the handler returns is
/// sent back to the requesting session only.
#[async_trait]
pub trait BayeuxService: Send + Sync {
    async fn process(
        &self,
        transport: TransportKind,
        route: &Route,
        server: &Server,
        session: &Arc<Session>,
        message: &Message,
    ) -> Option<Packet>;
}

/// Push side of a streaming transport.
pub trait Outlet: Send + Sync {
    /// Hand a packet to the transport. `false` if the connection is gone or
    /// cannot take more.
    fn push(&self, packet: Packet) -> bool;
}

/// How a client reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    LongPolling,
    WebSocket,
    /// In-process clients.
    Local,
}

impl TransportKind {
    /// The Bayeux connection type name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LongPolling => "long-polling",
            TransportKind::WebSocket => "websocket",
            TransportKind::Local => "local",
        }
    }

    /// Whether deliveries wait in the session queue for a poll.
    #[must_use]
    pub fn is_long_polling(&self) -> bool {
        matches!(self, TransportKind::LongPolling)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transport-side context of one inbound batch.
#[derive(Clone)]
pub struct Carrier {
    transport: TransportKind,
    outlet: Option<Arc<dyn Outlet>>,
}

impl Carrier {
    /// A request/response carrier whose deliveries are polled.
    #[must_use]
    pub fn long_polling() -> Self {
        Self {
            transport: TransportKind::LongPolling,
            outlet: None,
        }
    }

    /// A streaming carrier; deliveries are pushed to `outlet`.
    #[must_use]
    pub fn websocket(outlet: Arc<dyn Outlet>) -> Self {
        Self {
            transport: TransportKind::WebSocket,
            outlet: Some(outlet),
        }
    }

    /// An in-process carrier.
    #[must_use]
    pub fn local(outlet: Option<Arc<dyn Outlet>>) -> Self {
        Self {
            transport: TransportKind::Local,
            outlet,
        }
    }

    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    #[must_use]
    pub fn outlet(&self) -> Option<&Arc<dyn Outlet>> {
        self.outlet.as_ref()
    }
}

impl fmt::Debug for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Carrier")
            .field("transport", &self.transport)
            .field("outlet", &self.outlet.is_some())
            .finish()
    }
}
