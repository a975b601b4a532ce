//! # halley-core
//!
//! Channel routing, sessions and meta-protocol dispatch for the Halley
//! Bayeux engine.
//!
//! - **Route** - validated channel paths and wildcard matching
//! - **Channel** / **ChannelRegistry** - subscriber sets and ordered fan-out
//! - **Session** / **SessionRegistry** - client lifecycle and delivery queues
//! - **Server** - meta commands, security checks, publish delivery
//! - **extension** - acknowledged delivery and clock sync over `ext` fields
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Server    │────▶│   Channel   │────▶│   Session   │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                                       │
//!        │                   ▼                                       │
//!        │            ┌─────────────┐                                │
//!        │            │  Backbone   │                                │
//!        │            └─────────────┘                                │
//!        └───────────────── poll / outlet ───────────────────────────┘
//! ```
//!
//! Registries own channels and sessions; channels and sessions refer to each
//! other by path and id only.

pub mod channel;
pub mod config;
pub mod error;
pub mod extension;
pub mod listener;
pub mod meta;
pub mod packet;
pub mod policy;
pub mod registry;
pub mod route;
pub mod server;
pub mod session;
pub mod sessions;

pub use channel::Channel;
pub use config::EngineConfig;
pub use error::{
    BackboneError, ChannelStateError, InvalidPathKind, PathError, SecurityRejection, SessionError,
    SubscriptionError,
};
pub use extension::{AckExtension, TimesyncExtension};
pub use listener::{
    ChannelLifecycleListener, ChannelListener, ChannelPacketListener, ChannelSessionListener,
    ServerListener, ServerPacketListener, SessionLifecycleListener, SessionListener,
    SessionPacketListener, SubscriptionListener,
};
pub use meta::Meta;
pub use packet::{Packet, PacketType};
pub use policy::{
    AllowAll, Backbone, BayeuxService, Carrier, ChannelInitializer, Outlet, SecurityPolicy,
    TransportKind,
};
pub use registry::{ChannelRegistry, RegistryStats};
pub use route::Route;
pub use server::{MaintenanceHandle, Server};
pub use session::{Session, SessionId, SessionState};
pub use sessions::SessionRegistry;
