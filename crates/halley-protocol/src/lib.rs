//! # halley-protocol
//!
//! Bayeux message definitions for the Halley messaging engine.
//!
//! A Bayeux message is a JSON object addressed to a channel. This crate wraps
//! that object in a typed [`Message`] with accessors for the well-known
//! fields, builds the standard meta responses, and encodes/decodes the JSON
//! batches that transports exchange with clients.
//!
//! ## Meta Channels
//!
//! - `/meta/handshake` - Open a session
//! - `/meta/connect` - Keep the session alive, pick up queued deliveries
//! - `/meta/disconnect` - Close the session
//! - `/meta/subscribe` / `/meta/unsubscribe` - Channel membership
//!
//! ## Example
//!
//! ```rust
//! use halley_protocol::{codec, Message};
//!
//! let message = Message::new("/chat/lobby").with_data(serde_json::json!({"text": "hi"}));
//!
//! let encoded = codec::encode(&[message]).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded[0].channel(), Some("/chat/lobby"));
//! ```

pub mod advice;
pub mod codec;
pub mod message;
pub mod version;

pub use advice::Reconnect;
pub use codec::{decode, encode, encode_text, ProtocolError};
pub use message::{fields, Message};
pub use version::{Version, BAYEUX_VERSION, MINIMUM_BAYEUX_VERSION};
