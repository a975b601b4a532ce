//! Acknowledged delivery.
//!
//! A client that handshakes with `ext: {"ack": true}` is switched to polling
//! and every connect response carrying deliveries is numbered with
//! `ext.ack`. The client echoes the highest number it processed on its next
//! connect. Batches numbered below the echoed one were lost in transit and
//! ride along with the next connect response.

use super::meta_of;
use crate::listener::{ServerListener, ServerPacketListener, SessionLifecycleListener};
use crate::meta::Meta;
use crate::packet::{Packet, PacketType};
use crate::server::Server;
use crate::session::{Session, SessionId};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

const EXT_KEY: &str = "ack";
const REQUESTED: &str = "halley.ack.requested";

#[derive(Debug, Default)]
struct AckState {
    counter: u64,
    /// Messages held across `unacknowledged`.
    size: usize,
    unacknowledged: BTreeMap<u64, Packet>,
    resend: VecDeque<Packet>,
}

impl AckState {
    /// Settle everything up to `ack_id`: drop that batch, requeue older ones.
    fn acknowledge(&mut self, ack_id: u64) {
        if let Some(acked) = self.unacknowledged.remove(&ack_id) {
            self.size = self.size.saturating_sub(acked.len());
        }
        let newer = self.unacknowledged.split_off(&ack_id);
        let missed = std::mem::replace(&mut self.unacknowledged, newer);
        for (_, packet) in missed {
            self.size = self.size.saturating_sub(packet.len());
            self.resend.push_back(packet);
        }
    }

    /// Hold `packet` under `ack_id`, evicting the newest held batches while
    /// over `max_size`.
    fn hold(&mut self, ack_id: u64, packet: Packet, max_size: usize) -> bool {
        self.size += packet.len();
        let overflowed = self.size > max_size;
        while self.size > max_size {
            let Some((_, dropped)) = self.unacknowledged.pop_last() else {
                break;
            };
            self.size = self.size.saturating_sub(dropped.len());
        }
        self.unacknowledged.insert(ack_id, packet);
        overflowed
    }
}

/// Server side of the `ack` extension.
pub struct AckExtension {
    max_queue_size: usize,
    sessions: DashMap<SessionId, AckState>,
}

impl AckExtension {
    /// Create the extension. At most `max_queue_size` messages are held for
    /// redelivery per session.
    #[must_use]
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            sessions: DashMap::new(),
        }
    }

    /// Register a new extension on `server`.
    pub fn install(server: &Server, max_queue_size: usize) -> Arc<Self> {
        let extension = Arc::new(Self::new(max_queue_size));
        server.add_listener(ServerListener::Packet(extension.clone()));
        server.add_listener(ServerListener::Session(extension.clone()));
        extension
    }

    /// Whether `session_id` negotiated acknowledged delivery.
    #[must_use]
    pub fn is_enabled(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Messages held for `session_id` until acknowledged.
    #[must_use]
    pub fn unacknowledged(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map_or(0, |state| state.size)
    }

    fn on_handshake_response(&self, session: &Session, mut packet: Packet) -> Packet {
        if session.remove_attribute(REQUESTED) != Some(Value::Bool(true)) {
            return packet;
        }
        let mut accepted = false;
        for message in packet.messages_mut() {
            if message.successful() == Some(true) {
                message.put_ext(EXT_KEY, true);
                accepted = true;
            }
        }
        if accepted {
            session.set_long_polling(true);
            self.sessions
                .insert(session.id().clone(), AckState::default());
            debug!(session = %session.id(), "Acknowledged delivery enabled");
        }
        packet
    }

    fn on_connect_response(&self, session: &Session, mut packet: Packet) -> Packet {
        let Some(mut state) = self.sessions.get_mut(session.id()) else {
            return packet;
        };
        if packet.is_empty() {
            return packet;
        }
        while let Some(missed) = state.resend.pop_front() {
            packet.merge(missed);
        }
        if packet.len() < 2 {
            return packet;
        }

        let connect = Meta::Connect.path();
        let Some(index) = packet
            .messages()
            .iter()
            .position(|m| m.successful() == Some(true) && m.channel() == Some(connect))
        else {
            return packet;
        };

        state.counter += 1;
        let ack_id = state.counter;
        packet.messages_mut()[index].put_ext(EXT_KEY, ack_id);

        let deliveries = packet
            .messages()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, message)| message.clone())
            .collect();
        let held = Packet::new(PacketType::Delivery, None, None, deliveries);
        if state.hold(ack_id, held, self.max_queue_size) {
            warn!(session = %session.id(), "Session overflowed the ack queue");
        }
        packet
    }
}

impl ServerPacketListener for AckExtension {
    fn on_request(&self, sender: Option<&Session>, packet: Packet) -> Option<Packet> {
        let Some(session) = sender else {
            return Some(packet);
        };
        match meta_of(&packet) {
            Some(Meta::Handshake) => {
                let requested = packet.messages().iter().any(|message| {
                    message
                        .ext()
                        .and_then(|ext| ext.get(EXT_KEY))
                        .and_then(Value::as_bool)
                        == Some(true)
                });
                if requested {
                    session.set_attribute(REQUESTED, Value::Bool(true));
                }
            }
            Some(Meta::Connect) => {
                let acked = packet
                    .messages()
                    .iter()
                    .filter_map(|message| message.ext()?.get(EXT_KEY)?.as_u64())
                    .max();
                if let (Some(ack_id), Some(mut state)) =
                    (acked, self.sessions.get_mut(session.id()))
                {
                    state.acknowledge(ack_id);
                }
            }
            _ => {}
        }
        Some(packet)
    }

    fn on_response(&self, sender: Option<&Session>, packet: Packet) -> Option<Packet> {
        let Some(session) = sender else {
            return Some(packet);
        };
        Some(match meta_of(&packet) {
            Some(Meta::Handshake) => self.on_handshake_response(session, packet),
            Some(Meta::Connect) => self.on_connect_response(session, packet),
            _ => packet,
        })
    }
}

impl SessionLifecycleListener for AckExtension {
    fn on_connected(&self, _session: &Session) {}

    fn on_disconnected(&self, session: &Session) {
        self.sessions.remove(session.id());
    }
}
