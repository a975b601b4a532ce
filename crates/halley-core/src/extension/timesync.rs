//! Clock synchronisation.
//!
//! Clients stamp handshake and connect requests with
//! `ext.timesync = {tc, l, o}`: their send time, measured latency and
//! estimated offset. The response to that message carries back
//! `{tc, ts, p, a}` so the client can refine its estimate.

use super::meta_of;
use crate::listener::{ServerListener, ServerPacketListener};
use crate::meta::Meta;
use crate::packet::Packet;
use crate::server::Server;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const EXT_KEY: &str = "timesync";
const SAMPLE: &str = "halley.timesync.sample";

/// The latest client sample, kept as a session attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TimeSync {
    id: String,
    /// Server receive time.
    ts: i64,
    tc: i64,
    l: i64,
    o: i64,
}

impl TimeSync {
    fn from_message(id: String, ext: &Value) -> Option<Self> {
        Some(Self {
            id,
            ts: now_millis(),
            tc: ext.get("tc")?.as_i64()?,
            l: ext.get("l")?.as_i64()?,
            o: ext.get("o")?.as_i64()?,
        })
    }

    fn reply(&self, now: i64) -> Value {
        json!({
            "tc": self.tc,
            "ts": self.ts,
            "p": now - self.ts,
            "a": self.tc + self.o + self.l - self.ts,
        })
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

fn stored(session: &Session) -> Option<TimeSync> {
    serde_json::from_value(session.attribute(SAMPLE)?).ok()
}

/// Server side of the `timesync` extension.
#[derive(Debug, Default)]
pub struct TimesyncExtension;

impl TimesyncExtension {
    /// Register the extension on `server`.
    pub fn install(server: &Server) -> Arc<Self> {
        let extension = Arc::new(Self);
        server.add_listener(ServerListener::Packet(extension.clone()));
        extension
    }
}

impl ServerPacketListener for TimesyncExtension {
    fn on_request(&self, sender: Option<&Session>, packet: Packet) -> Option<Packet> {
        let Some(session) = sender else {
            return Some(packet);
        };
        if !matches!(meta_of(&packet), Some(Meta::Handshake | Meta::Connect)) {
            return Some(packet);
        }

        for message in packet.messages() {
            let Some(id) = message.id() else {
                continue;
            };
            let Some(ext) = message
                .ext()
                .and_then(|ext| ext.get(EXT_KEY))
                .filter(|value| value.is_object())
            else {
                continue;
            };
            if let Some(sample) = TimeSync::from_message(id, ext) {
                // Samples arriving out of order never replace a newer one.
                let newer = stored(session).map_or(true, |previous| previous.tc <= sample.tc);
                if newer {
                    if let Ok(value) = serde_json::to_value(&sample) {
                        session.set_attribute(SAMPLE, value);
                    }
                }
            }
            break;
        }
        Some(packet)
    }

    fn on_response(&self, sender: Option<&Session>, mut packet: Packet) -> Option<Packet> {
        let Some(session) = sender else {
            return Some(packet);
        };
        if !matches!(meta_of(&packet), Some(Meta::Handshake | Meta::Connect)) {
            return Some(packet);
        }
        let Some(sample) = stored(session) else {
            return Some(packet);
        };

        if let Some(message) = packet
            .messages_mut()
            .iter_mut()
            .find(|message| message.id().as_deref() == Some(sample.id.as_str()))
        {
            message.put_ext(EXT_KEY, sample.reply(now_millis()));
        }
        Some(packet)
    }
}
