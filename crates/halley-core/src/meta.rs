//! Meta channels.

use crate::route::Route;
use std::fmt;

/// A Bayeux meta command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Meta {
    Handshake,
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
}

impl Meta {
    /// All meta commands.
    pub const ALL: [Meta; 5] = [
        Meta::Handshake,
        Meta::Connect,
        Meta::Disconnect,
        Meta::Subscribe,
        Meta::Unsubscribe,
    ];

    /// The channel path of this command.
    #[must_use]
    pub fn path(&self) -> &'static str {
        match self {
            Meta::Handshake => "/meta/handshake",
            Meta::Connect => "/meta/connect",
            Meta::Disconnect => "/meta/disconnect",
            Meta::Subscribe => "/meta/subscribe",
            Meta::Unsubscribe => "/meta/unsubscribe",
        }
    }

    /// The command addressed by `route`, if it is one.
    #[must_use]
    pub fn from_route(route: &Route) -> Option<Meta> {
        if route.len() != 2 || !route.is_meta() {
            return None;
        }
        Self::ALL.into_iter().find(|meta| meta.path() == route.path())
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}
