//! Packets moving through the engine.
//!
//! A [`Packet`] groups the messages of one request, response or delivery
//! together with the route they travel on. Message storage is shared between
//! clones and copied on first write, so a packet handed to one session can be
//! rewritten by that session's listeners without any other recipient seeing
//! the change.

use crate::route::Route;
use crate::session::SessionId;
use halley_protocol::Message;
use std::sync::Arc;

/// What a packet is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Inbound meta command from a client.
    MetaRequest,
    /// Answer to a meta command.
    MetaResponse,
    /// Application data entering a channel.
    Publish,
    /// Application data leaving a channel toward one subscriber.
    Delivery,
}

/// An immutable batch of messages on a route.
#[derive(Debug, Clone)]
pub struct Packet {
    packet_type: PacketType,
    sender_id: Option<SessionId>,
    route: Option<Route>,
    messages: Arc<Vec<Message>>,
}

impl Packet {
    /// Create a packet.
    #[must_use]
    pub fn new(
        packet_type: PacketType,
        sender_id: Option<SessionId>,
        route: Option<Route>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            packet_type,
            sender_id,
            route,
            messages: Arc::new(messages),
        }
    }

    /// Create a packet holding one message.
    #[must_use]
    pub fn single(
        packet_type: PacketType,
        sender_id: Option<SessionId>,
        route: Option<Route>,
        message: Message,
    ) -> Self {
        Self::new(packet_type, sender_id, route, vec![message])
    }

    /// The packet type.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// The session that produced this packet, if any.
    #[must_use]
    pub fn sender_id(&self) -> Option<&SessionId> {
        self.sender_id.as_ref()
    }

    /// The route the packet travels on.
    ///
    /// Only responses to messages whose channel could not be parsed lack one.
    #[must_use]
    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    /// The messages.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the packet carries no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Mutable access to this copy's messages.
    ///
    /// The first call on a shared packet copies the message list; other
    /// clones keep the original.
    pub fn messages_mut(&mut self) -> &mut Vec<Message> {
        Arc::make_mut(&mut self.messages)
    }

    /// An independent copy for one downstream consumer.
    #[must_use]
    pub fn freeze(&self) -> Self {
        self.clone()
    }

    /// A copy retagged as a per-recipient delivery.
    #[must_use]
    pub fn to_delivery(&self) -> Self {
        Self {
            packet_type: PacketType::Delivery,
            ..self.clone()
        }
    }

    /// Consume into the message list, copying only if still shared.
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        Arc::try_unwrap(self.messages).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Append another packet's messages to this one.
    pub fn merge(&mut self, other: Packet) {
        let other = other.into_messages();
        self.messages_mut().extend(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery() -> Packet {
        Packet::single(
            PacketType::Publish,
            Some(SessionId::from("sender")),
            Some(Route::parse("/chat/room").unwrap()),
            Message::new("/chat/room").with_data(json!({"text": "hi"})),
        )
    }

    #[test]
    fn test_frozen_copies_are_isolated() {
        let original = delivery();
        let mut first = original.freeze();
        let second = original.freeze();

        first.messages_mut()[0].put("data", json!({"text": "changed"}));

        assert_eq!(first.messages()[0].data(), Some(&json!({"text": "changed"})));
        assert_eq!(second.messages()[0].data(), Some(&json!({"text": "hi"})));
        assert_eq!(original.messages()[0].data(), Some(&json!({"text": "hi"})));
    }

    #[test]
    fn test_to_delivery_keeps_sender_and_route() {
        let packet = delivery().to_delivery();
        assert_eq!(packet.packet_type(), PacketType::Delivery);
        assert_eq!(packet.sender_id().map(SessionId::as_str), Some("sender"));
        assert_eq!(packet.route().map(Route::path), Some("/chat/room"));
    }

    #[test]
    fn test_merge() {
        let mut packet = delivery();
        packet.merge(delivery());
        assert_eq!(packet.len(), 2);
    }
}
