//! Error types for the Halley core.

use thiserror::Error;

/// Why a channel path was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidPathKind {
    /// The path does not begin with `/`.
    MissingLeadingSlash,
    /// Two consecutive slashes, a trailing slash, or the bare root.
    EmptySegment,
    /// A character outside the channel alphabet.
    IllegalCharacter(char),
    /// A `*` inside a segment that is not exactly `*` or `**`.
    EmbeddedWildcard,
    /// More than one wildcard segment.
    MultipleWildcards,
    /// A wildcard segment that is not the last one.
    WildcardNotLast,
}

impl std::fmt::Display for InvalidPathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidPathKind::MissingLeadingSlash => f.write_str("must begin with '/'"),
            InvalidPathKind::EmptySegment => f.write_str("contains an empty segment"),
            InvalidPathKind::IllegalCharacter(c) => write!(f, "contains illegal character {c:?}"),
            InvalidPathKind::EmbeddedWildcard => {
                f.write_str("wildcard segments must be exactly '*' or '**'")
            }
            InvalidPathKind::MultipleWildcards => f.write_str("contains more than one wildcard"),
            InvalidPathKind::WildcardNotLast => {
                f.write_str("wildcards are only allowed in the last segment")
            }
        }
    }
}

/// A malformed channel path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid channel path {path:?}: {kind}")]
pub struct PathError {
    /// The rejected path.
    pub path: String,
    /// What was wrong with it.
    pub kind: InvalidPathKind,
}

/// Illegal operations on a channel's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelStateError {
    /// Persistent channels cannot be removed.
    #[error("Attempt to remove persistent channel({0})")]
    Persistent(String),

    /// The channel has been removed from the registry.
    #[error("Attempted subscription to a closed channel({0})")]
    Terminated(String),
}

/// Why a server-side subscription could not be made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    State(#[from] ChannelStateError),
}

/// Session protocol violations.
///
/// The display strings are what clients see in the `error` field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// A non-handshake message without a `clientId`.
    #[error("Missing client id")]
    MissingClientId,

    /// A handshake that carried a `clientId`.
    #[error("Handshake must not carry a client id")]
    UnexpectedClientId,

    /// No session with the given id.
    #[error("Invalid client id")]
    UnknownSession,

    /// The session has already disconnected.
    #[error("Session has been disconnected")]
    Disconnected,

    /// The session has not completed a handshake.
    #[error("Handshake required")]
    HandshakeRequired,

    /// The session has not completed its first connect.
    #[error("Connection required")]
    ConnectionRequired,

    /// The session already completed a handshake.
    #[error("Handshake was previously completed")]
    AlreadyHandshook,
}

/// A security policy denial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{}", .reason.as_deref().unwrap_or("Unauthorized"))]
pub struct SecurityRejection {
    /// Optional human-readable reason shown to the client.
    pub reason: Option<String>,
}

impl SecurityRejection {
    /// A denial without a reason.
    #[must_use]
    pub fn unauthorized() -> Self {
        Self::default()
    }

    /// A denial with a reason.
    #[must_use]
    pub fn because(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

/// Failures reported by a cluster backbone.
#[derive(Debug, Error)]
pub enum BackboneError {
    /// The backbone could not hand the packet to the cluster.
    #[error("Backbone publish failed: {0}")]
    Publish(String),

    /// The backbone is not running.
    #[error("Backbone is shut down")]
    Shutdown,
}
