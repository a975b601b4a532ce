//! Reconnect advice sent back to clients.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Advice field names.
pub mod keys {
    pub const RECONNECT: &str = "reconnect";
    pub const INTERVAL: &str = "interval";
    pub const TIMEOUT: &str = "timeout";
}

/// What a client should do after receiving a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    /// Reconnect with the same session.
    Retry,
    /// Start over with a new handshake.
    Handshake,
    /// Do not reconnect.
    None,
}

impl Reconnect {
    /// The wire value of this advice.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Reconnect::Retry => "retry",
            Reconnect::Handshake => "handshake",
            Reconnect::None => "none",
        }
    }
}

impl fmt::Display for Reconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_wire_values() {
        assert_eq!(Reconnect::Retry.as_str(), "retry");
        assert_eq!(Reconnect::Handshake.to_string(), "handshake");
        assert_eq!(
            serde_json::to_value(Reconnect::None).unwrap(),
            serde_json::json!("none")
        );
    }
}
