//! Protocol extensions negotiated through the `ext` field.
//!
//! Each extension is an ordinary server listener. Install one on a
//! [`Server`](crate::Server) before it starts taking requests.

pub mod ack;
pub mod timesync;

pub use ack::AckExtension;
pub use timesync::TimesyncExtension;

use crate::meta::Meta;
use crate::packet::Packet;

/// The meta command a request or response packet belongs to.
fn meta_of(packet: &Packet) -> Option<Meta> {
    packet.route().and_then(Meta::from_route)
}
