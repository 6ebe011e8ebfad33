// Per-peer sync bookkeeping and target selection

use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// What the node knows about one peer's chain
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer: String,
    pub height: u64,
    pub work: BigUint,
    pub last_seen: Instant,
    /// Set once the peer's reported height matched ours
    pub synced: bool,
    /// Whether this peer is the current sync target
    pub is_target: bool,
}

/// Sync manager: tracks peer tips and picks the peer worth syncing from.
pub struct SyncManager {
    inner: Mutex<HashMap<String, PeerStatus>>,
    ttl: Duration,
}

impl SyncManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record a header announcement from a peer and reselect the target.
    pub fn record_header(&self, peer: &str, height: u64, work: BigUint) {
        let mut inner = self.inner.lock().unwrap();
        let status = inner.entry(peer.to_string()).or_insert_with(|| PeerStatus {
            peer: peer.to_string(),
            height: 0,
            work: BigUint::from(0u8),
            last_seen: Instant::now(),
            synced: false,
            is_target: false,
        });
        status.height = height;
        status.work = work;
        status.last_seen = Instant::now();
        Self::reselect(&mut inner);
    }

    /// Mark a peer as height-synced with us
    pub fn mark_synced(&self, peer: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = inner.get_mut(peer) {
            status.synced = true;
            status.last_seen = Instant::now();
        }
    }

    /// Forget a peer; reselect if it was the target.
    pub fn remove_peer(&self, peer: &str) {
        let mut inner = self.inner.lock().unwrap();
        let was_target = inner.remove(peer).map(|s| s.is_target).unwrap_or(false);
        if was_target {
            Self::reselect(&mut inner);
        }
    }

    /// Evict peers not seen within the TTL. Returns the evicted ids; the
    /// target is reselected if it was among them.
    pub fn sweep(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .values()
            .filter(|status| status.last_seen.elapsed() > self.ttl)
            .map(|status| status.peer.clone())
            .collect();
        let mut lost_target = false;
        for peer in &expired {
            if let Some(status) = inner.remove(peer) {
                lost_target |= status.is_target;
            }
        }
        if lost_target {
            Self::reselect(&mut inner);
        }
        expired
    }

    /// The current sync target, if any
    pub fn target(&self) -> Option<PeerStatus> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .find(|status| status.is_target)
            .cloned()
    }

    /// True iff there is no target, or the local chain meets or exceeds
    /// the target's height and work. Gates mining eligibility.
    pub fn is_synced(&self, local_height: u64, local_work: &BigUint) -> bool {
        match self.target() {
            None => true,
            Some(target) => local_height >= target.height && *local_work >= target.work,
        }
    }

    /// True once every tracked peer has been marked height-synced, or no
    /// peers are tracked.
    pub fn all_synced(&self) -> bool {
        self.inner.lock().unwrap().values().all(|status| status.synced)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    // Strictly greater work wins; ties break on greater height. The
    // previous target is deselected when replaced.
    fn reselect(inner: &mut HashMap<String, PeerStatus>) {
        let best = inner
            .values()
            .max_by(|a, b| a.work.cmp(&b.work).then(a.height.cmp(&b.height)))
            .map(|status| status.peer.clone());
        for status in inner.values_mut() {
            status.is_target = Some(&status.peer) == best.as_ref();
        }
    }
}
