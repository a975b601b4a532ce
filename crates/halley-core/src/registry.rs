//! Channel registry.
//!
//! The registry owns every channel on this node. Lookups go straight to a
//! sharded map; creation and eviction of a path are serialized by a per-path
//! lock so concurrent `require` calls converge on one channel and the idle
//! sweep never races a creation.

use crate::channel::Channel;
use crate::error::{ChannelStateError, PathError};
use crate::listener::ServerListeners;
use crate::policy::ChannelInitializer;
use crate::route::{Route, DEEP_WILD, WILD};
use crate::session::SessionId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of channels.
    pub channel_count: usize,
    /// Number of wildcard pattern channels.
    pub wildcard_count: usize,
    /// Sum of subscriber counts.
    pub total_subscriptions: usize,
}

/// Owns the channels.
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<Channel>>,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
    hub: Arc<ServerListeners>,
    ttl: Duration,
    reflecting: Vec<Route>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    ///
    /// New channels get `ttl` as their idle time-to-live and reflect when
    /// their path matches one of `reflecting`.
    #[must_use]
    pub fn new(hub: Arc<ServerListeners>, ttl: Duration, reflecting: Vec<Route>) -> Self {
        Self {
            channels: DashMap::new(),
            creation_locks: DashMap::new(),
            hub,
            ttl,
            reflecting,
        }
    }

    /// Exact lookup. Never creates.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<Arc<Channel>> {
        self.channels.get(path).map(|entry| entry.value().clone())
    }

    /// Look up `path`, creating it if absent.
    ///
    /// A new channel runs every initializer before it is published to the
    /// table, then the server's channel listeners hear `on_created`. Racing
    /// callers for one path all receive the same channel.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] if `path` is malformed.
    pub fn require(
        &self,
        path: &str,
        initializers: &[Arc<dyn ChannelInitializer>],
    ) -> Result<Arc<Channel>, PathError> {
        if let Some(channel) = self.find(path) {
            return Ok(channel);
        }
        let route = Route::parse(path)?;

        let channel = self.with_path_lock(path, || {
            if let Some(channel) = self.find(path) {
                return channel;
            }

            let reflecting = self.reflecting.iter().any(|pattern| pattern.matches(&route));
            let channel = Arc::new(Channel::new(
                route,
                self.ttl,
                reflecting,
                self.hub.clone(),
            ));
            for initializer in initializers {
                initializer.initialize(&channel);
            }
            self.channels.insert(path.to_string(), channel.clone());
            debug!(channel = %path, reflecting, "Channel created");
            self.hub.created(&channel);
            channel
        });
        Ok(channel)
    }

    /// Remove `channel`, forcing its subscribers off.
    ///
    /// Returns the evicted subscribers.
    ///
    /// # Errors
    ///
    /// [`ChannelStateError::Persistent`] for a persistent channel.
    pub fn remove(&self, channel: &Arc<Channel>) -> Result<Vec<SessionId>, ChannelStateError> {
        if channel.is_persistent() {
            return Err(ChannelStateError::Persistent(channel.path().to_string()));
        }
        Ok(self.with_path_lock(channel.path(), || self.evict(channel)))
    }

    // Callers hold the path lock.
    fn evict(&self, channel: &Arc<Channel>) -> Vec<SessionId> {
        self.channels
            .remove_if(channel.path(), |_, registered| Arc::ptr_eq(registered, channel));
        let evicted = channel.terminate();
        debug!(channel = %channel.path(), evicted = evicted.len(), "Channel removed");
        self.hub.removed(channel);
        evicted
    }

    fn with_path_lock<T>(&self, path: &str, f: impl FnOnce() -> T) -> T {
        let lock = self
            .creation_locks
            .entry(path.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        // Only the map still holds the lock when nobody else is waiting on it.
        self.creation_locks
            .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Wildcard channels whose pattern matches the concrete `route`.
    ///
    /// Probes `prefix/*` for the parent and `prefix/**` for every proper
    /// ancestor instead of scanning the table.
    #[must_use]
    pub fn matching_wildcards(&self, route: &Route) -> Vec<Arc<Channel>> {
        let mut matches = Vec::new();
        if route.is_wildcard() {
            return matches;
        }

        let mut probe = String::with_capacity(route.path().len() + 3);
        let parent = route.len() - 1;
        probe.push_str(route.prefix(parent));
        probe.push('/');
        probe.push_str(WILD);
        if let Some(channel) = self.find(&probe) {
            matches.push(channel);
        }

        for depth in 0..route.len() {
            probe.clear();
            probe.push_str(route.prefix(depth));
            probe.push('/');
            probe.push_str(DEEP_WILD);
            if let Some(channel) = self.find(&probe) {
                matches.push(channel);
            }
        }
        matches
    }

    /// Evict every channel that is removable at `now`.
    ///
    /// Returns the removed channels.
    pub fn sweep(&self, now: Instant) -> Vec<Arc<Channel>> {
        let candidates: Vec<Arc<Channel>> = self
            .channels
            .iter()
            .filter(|entry| entry.value().is_removable(now))
            .map(|entry| entry.value().clone())
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for channel in candidates {
            let evicted = self.with_path_lock(channel.path(), || {
                // Re-check: a subscriber may have arrived since the scan.
                if channel.is_removable(now) {
                    let stray = self.evict(&channel);
                    if !stray.is_empty() {
                        warn!(channel = %channel.path(), "Swept channel still had subscribers");
                    }
                    true
                } else {
                    false
                }
            });
            if evicted {
                removed.push(channel);
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "Idle channels swept");
        }
        removed
    }

    /// A point-in-time copy of every channel.
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in &self.channels {
            stats.channel_count += 1;
            if entry.value().route().is_wildcard() {
                stats.wildcard_count += 1;
            }
            stats.total_subscriptions += entry.value().subscriber_count();
        }
        stats
    }
}
