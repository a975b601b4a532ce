//! Bayeux message type.
//!
//! A message is a JSON object. The well-known fields get typed accessors;
//! everything else (extensions, application data) stays plain JSON.

use crate::advice::{keys, Reconnect};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known message field names.
pub mod fields {
    pub const CHANNEL: &str = "channel";
    pub const ID: &str = "id";
    pub const CLIENT_ID: &str = "clientId";
    pub const DATA: &str = "data";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const SUCCESSFUL: &str = "successful";
    pub const ERROR: &str = "error";
    pub const ADVICE: &str = "advice";
    pub const EXT: &str = "ext";
    pub const VERSION: &str = "version";
    pub const MINIMUM_VERSION: &str = "minimumVersion";
    pub const SUPPORTED_CONNECTION_TYPES: &str = "supportedConnectionTypes";
    pub const CONNECTION_TYPE: &str = "connectionType";
}

/// A single Bayeux message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    /// Create a message addressed to a channel.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self::empty().with(fields::CHANNEL, channel.into())
    }

    /// Create a message with no fields.
    #[must_use]
    pub fn empty() -> Self {
        Self(Map::new())
    }

    /// Wrap an existing JSON object.
    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Set a field, returning the message.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.put(key, value);
        self
    }

    /// Set a field in place.
    pub fn put(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Remove a field.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Get a raw field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Get a raw field mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// The channel this message is addressed to.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.get_str(fields::CHANNEL)
    }

    /// The client-assigned message id.
    ///
    /// Clients send ids as strings or numbers; both are rendered as text.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        match self.0.get(fields::ID)? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    /// The session id (`clientId`).
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.get_str(fields::CLIENT_ID)
    }

    /// The application payload.
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.0.get(fields::DATA)
    }

    /// Attach an application payload.
    #[must_use]
    pub fn with_data(self, data: Value) -> Self {
        self.with(fields::DATA, data)
    }

    /// The subscription target of a subscribe/unsubscribe request.
    #[must_use]
    pub fn subscription(&self) -> Option<&str> {
        self.get_str(fields::SUBSCRIPTION)
    }

    /// Whether a response reports success.
    #[must_use]
    pub fn successful(&self) -> Option<bool> {
        self.0.get(fields::SUCCESSFUL).and_then(Value::as_bool)
    }

    /// The error description of a failed response.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.get_str(fields::ERROR)
    }

    /// The advice object.
    #[must_use]
    pub fn advice(&self) -> Option<&Map<String, Value>> {
        self.0.get(fields::ADVICE).and_then(Value::as_object)
    }

    /// The reconnect advice, if any.
    #[must_use]
    pub fn reconnect(&self) -> Option<&str> {
        self.advice()
            .and_then(|advice| advice.get(keys::RECONNECT))
            .and_then(Value::as_str)
    }

    /// The long-poll timeout the client asked for, in milliseconds.
    #[must_use]
    pub fn advised_timeout(&self) -> Option<u64> {
        self.advice()
            .and_then(|advice| advice.get(keys::TIMEOUT))
            .and_then(Value::as_u64)
    }

    /// The extension object.
    #[must_use]
    pub fn ext(&self) -> Option<&Map<String, Value>> {
        self.0.get(fields::EXT).and_then(Value::as_object)
    }

    /// Set one entry of the extension object, creating the object if needed.
    pub fn put_ext(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        match self.0.get_mut(fields::EXT) {
            Some(Value::Object(ext)) => {
                ext.insert(key.to_string(), value.into());
            }
            _ => {
                let mut ext = Map::new();
                ext.insert(key.to_string(), value.into());
                self.0.insert(fields::EXT.to_string(), Value::Object(ext));
            }
        }
        self
    }

    /// The connection type named by a connect request.
    #[must_use]
    pub fn connection_type(&self) -> Option<&str> {
        self.get_str(fields::CONNECTION_TYPE)
    }

    /// The connection types a handshake request offers.
    #[must_use]
    pub fn supported_connection_types(&self) -> Vec<&str> {
        self.0
            .get(fields::SUPPORTED_CONNECTION_TYPES)
            .and_then(Value::as_array)
            .map(|types| types.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// The underlying JSON object.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume into the underlying JSON object.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Build the common part of a meta response.
    #[must_use]
    pub fn response(path: &str, id: Option<&str>, client_id: Option<&str>) -> Self {
        let mut response = Message::new(path);
        if let Some(id) = id {
            response.put(fields::ID, id);
        }
        if let Some(client_id) = client_id {
            response.put(fields::CLIENT_ID, client_id);
        }
        response
    }

    /// Build a successful meta response.
    #[must_use]
    pub fn success_response(
        path: &str,
        id: Option<&str>,
        client_id: Option<&str>,
        reconnect: Option<Reconnect>,
    ) -> Self {
        Self::response(path, id, client_id)
            .with(fields::SUCCESSFUL, true)
            .with_reconnect(reconnect)
    }

    /// Build a failed meta response.
    #[must_use]
    pub fn error_response(
        path: &str,
        id: Option<&str>,
        client_id: Option<&str>,
        error: impl Into<String>,
        reconnect: Option<Reconnect>,
    ) -> Self {
        Self::response(path, id, client_id)
            .with(fields::SUCCESSFUL, false)
            .with(fields::ERROR, error.into())
            .with_reconnect(reconnect)
    }

    fn with_reconnect(self, reconnect: Option<Reconnect>) -> Self {
        match reconnect {
            Some(reconnect) => self.with_advice(keys::RECONNECT, reconnect.as_str()),
            None => self,
        }
    }

    /// Merge a key into the advice object, creating it when absent.
    #[must_use]
    pub fn with_advice(mut self, key: &str, value: impl Into<Value>) -> Self {
        let advice = self
            .0
            .entry(fields::ADVICE)
            .or_insert_with(|| Value::Object(Map::new()));
        if !advice.is_object() {
            *advice = Value::Object(Map::new());
        }
        if let Value::Object(advice) = advice {
            advice.insert(key.to_string(), value.into());
        }
        self
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
