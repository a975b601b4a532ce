//! Bayeux protocol versioning.
//!
//! Clients announce the version they speak during the handshake and the
//! server answers with its own version and the minimum it accepts.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Protocol version spoken by the server.
pub const BAYEUX_VERSION: Version = Version { major: 1, minor: 0 };

/// Oldest protocol version the server accepts.
pub const MINIMUM_BAYEUX_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = String;

    /// Parse `major.minor`; a trailing patch component is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("invalid version: {s}"))?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| format!("invalid version: {s}"))?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl Default for Version {
    fn default() -> Self {
        BAYEUX_VERSION
    }
}
