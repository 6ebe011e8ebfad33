// Persisted peer book
//
// A JSON file of known peer addresses with freshness and reliability
// counters, used to reconnect across restarts.

use crate::error::NodeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One known peer address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: String,
    /// Unix seconds of the last successful contact
    pub last_seen: u64,
    pub successes: u32,
    pub failures: u32,
}

/// Peer book
pub struct PeerBook {
    path: PathBuf,
    inner: Mutex<HashMap<String, PeerRecord>>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PeerBook {
    /// Load the book from `path`, starting empty if the file is absent.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NodeError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let json = fs::read_to_string(&path)
                .map_err(|e| NodeError::Internal(format!("failed to read peer book: {}", e)))?;
            let list: Vec<PeerRecord> = serde_json::from_str(&json)
                .map_err(|e| NodeError::Internal(format!("corrupt peer book: {}", e)))?;
            list.into_iter()
                .map(|record| (record.address.clone(), record))
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(records),
        })
    }

    /// Write the book back to disk
    pub fn save(&self) -> Result<(), NodeError> {
        let records: Vec<PeerRecord> = {
            let inner = self.inner.lock().unwrap();
            let mut list: Vec<PeerRecord> = inner.values().cloned().collect();
            list.sort_by(|a, b| a.address.cmp(&b.address));
            list
        };
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| NodeError::Internal(format!("failed to serialize peer book: {}", e)))?;
        fs::write(&self.path, json)
            .map_err(|e| NodeError::Internal(format!("failed to write peer book: {}", e)))?;
        Ok(())
    }

    /// Record a successful contact; clears the failure streak.
    pub fn record_success(&self, address: &str) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .entry(address.to_string())
            .or_insert_with(|| PeerRecord {
                address: address.to_string(),
                last_seen: 0,
                successes: 0,
                failures: 0,
            });
        record.last_seen = unix_now();
        record.successes += 1;
        record.failures = 0;
    }

    /// Record a failed dial attempt
    pub fn record_failure(&self, address: &str) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .entry(address.to_string())
            .or_insert_with(|| PeerRecord {
                address: address.to_string(),
                last_seen: 0,
                successes: 0,
                failures: 0,
            });
        record.failures += 1;
    }

    /// Drop entries that keep failing or have gone stale
    pub fn prune(&self, max_age: Duration, max_failures: u32) {
        let cutoff = unix_now().saturating_sub(max_age.as_secs());
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, record| {
            record.failures <= max_failures && (record.last_seen >= cutoff || record.successes == 0)
        });
    }

    /// All known addresses, most recently seen first
    pub fn addresses(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<&PeerRecord> = inner.values().collect();
        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        records.iter().map(|record| record.address.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
