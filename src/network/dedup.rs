// Seen-message tracking for gossip fan-out
//
// Pure optimization: lets broadcast logic skip peers that already have a
// message. Handlers stay idempotent and never rely on this for
// correctness; lost or duplicated deliveries must still be tolerated.

use crate::core::Hash256;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// TTL map: message identity -> (peer id -> last seen)
pub struct SeenCache {
    inner: Mutex<HashMap<Hash256, HashMap<String, Instant>>>,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Note that `peer` has seen the message
    pub fn mark_seen(&self, message: &Hash256, peer: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(*message)
            .or_default()
            .insert(peer.to_string(), Instant::now());
    }

    /// Whether `peer` is known to have seen the message recently
    pub fn has_seen(&self, message: &Hash256, peer: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .get(message)
            .and_then(|peers| peers.get(peer))
            .is_some_and(|seen| seen.elapsed() <= self.ttl)
    }

    /// Peers known to have seen the message; used to trim broadcast
    /// fan-out.
    pub fn seen_by(&self, message: &Hash256) -> HashSet<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(message)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(_, seen)| seen.elapsed() <= self.ttl)
                    .map(|(peer, _)| peer.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop entries older than the TTL
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap();
        for peers in inner.values_mut() {
            peers.retain(|_, seen| seen.elapsed() <= self.ttl);
        }
        inner.retain(|_, peers| !peers.is_empty());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_query() {
        let cache = SeenCache::new(Duration::from_secs(60));
        let message = Hash256::new([1; 32]);

        assert!(!cache.has_seen(&message, "a"));
        cache.mark_seen(&message, "a");
        assert!(cache.has_seen(&message, "a"));
        assert!(!cache.has_seen(&message, "b"));

        cache.mark_seen(&message, "b");
        let seen = cache.seen_by(&message);
        assert!(seen.contains("a") && seen.contains("b"));
    }

    #[test]
    fn test_expiry() {
        let cache = SeenCache::new(Duration::from_millis(0));
        let message = Hash256::new([1; 32]);

        cache.mark_seen(&message, "a");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.has_seen(&message, "a"));
        assert!(cache.seen_by(&message).is_empty());
    }

    #[test]
    fn test_sweep_drops_expired() {
        let cache = SeenCache::new(Duration::from_millis(0));
        cache.mark_seen(&Hash256::new([1; 32]), "a");
        cache.mark_seen(&Hash256::new([2; 32]), "b");
        assert_eq!(cache.len(), 2);

        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert_eq!(cache.len(), 0);
    }
}
