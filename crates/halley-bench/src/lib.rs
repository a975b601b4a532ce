//! Fixtures shared by the Halley benchmarks.

use halley_core::{EngineConfig, PathError, Server, Session, SubscriptionError};
use std::sync::Arc;

/// A server whose session queues are large enough to absorb a benchmark run
/// between drains.
///
/// # Errors
///
/// Returns a [`PathError`] if the engine configuration is invalid.
pub fn server() -> Result<Server, PathError> {
    let config = EngineConfig {
        max_queue_size: usize::MAX,
        ..EngineConfig::default()
    };
    Server::new(config)
}

/// Create `count` local sessions, each subscribed to `path`.
///
/// # Errors
///
/// Returns a [`SubscriptionError`] if `path` is malformed.
pub fn subscribers(
    server: &Server,
    path: &str,
    count: usize,
) -> Result<Vec<Arc<Session>>, SubscriptionError> {
    (0..count)
        .map(|_| {
            let session = server.create_local_session();
            server.subscribe_session(&session, path)?;
            Ok(session)
        })
        .collect()
}

/// Discard everything queued for `sessions`.
pub fn drain(sessions: &[Arc<Session>]) {
    for session in sessions {
        session.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fixture_subscribers_receive() {
        let server = server().unwrap();
        let sessions = subscribers(&server, "/bench/room", 3).unwrap();
        let delivered = server.publish(None, "/bench/room", json!(1)).unwrap();
        assert_eq!(delivered, 3);
        assert!(sessions.iter().all(|s| s.queue_len() == 1));
        drain(&sessions);
        assert!(sessions.iter().all(|s| s.queue_len() == 0));
    }

    #[test]
    fn test_fixture_rejects_bad_path() {
        let server = server().unwrap();
        assert!(subscribers(&server, "no/slash", 1).is_err());
    }
}
