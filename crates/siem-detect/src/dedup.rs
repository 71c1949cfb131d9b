//! Exact-duplicate event suppression
//!
//! Ingestion is at-least-once: a collector retry can deliver the same
//! event twice. Events are fingerprinted over their identifying columns
//! (including event time, so repeated real-world occurrences are NOT
//! collapsed) and duplicates inside the window are dropped before rule
//! evaluation.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use siem_common::NormalizedEvent;
use std::sync::atomic::{AtomicU64, Ordering};

struct DedupEntry {
    first_seen: DateTime<Utc>,
}

/// Sliding dedup window over event fingerprints.
pub struct FingerprintWindow {
    seen: DashMap<String, DedupEntry>,
    window_secs: u64,
    suppressed: AtomicU64,
}

impl FingerprintWindow {
    /// New window of the given length.
    pub fn new(window_secs: u64) -> Self {
        Self {
            seen: DashMap::new(),
            window_secs,
            suppressed: AtomicU64::new(0),
        }
    }

    /// Record the event; returns true when it is a duplicate delivery
    /// already seen inside the window.
    pub fn is_duplicate(&self, event: &NormalizedEvent) -> bool {
        let fp = fingerprint(event);
        let window = Duration::seconds(self.window_secs as i64);

        if let Some(entry) = self.seen.get(&fp) {
            if event.event_time - entry.first_seen < window {
                drop(entry);
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
        self.seen.insert(
            fp,
            DedupEntry {
                first_seen: event.event_time,
            },
        );
        false
    }

    /// Duplicates dropped so far.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Evict fingerprints older than twice the window. Called by the
    /// maintenance sweeper.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let ttl = Duration::seconds((self.window_secs * 2) as i64);
        self.seen.retain(|_, entry| now - entry.first_seen <= ttl);
    }

    /// Live fingerprint count.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn fingerprint(event: &NormalizedEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.event_time.timestamp_millis().to_le_bytes());
    for part in [
        Some(event.source_type.as_str()),
        Some(event.event_code.as_str()),
        event.host.as_deref(),
        event.subject_user.as_deref(),
        event.source_ip.as_deref(),
        event.process_name.as_deref(),
    ] {
        hasher.update(part.unwrap_or("-").as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..8])
}
