//! Time-bounded location cache.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::detection::Match;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub location: Match,
    pub timestamp: Instant,
}

/// Successful locations keyed by descriptor identity.
///
/// Entries are live while `now - timestamp <= ttl`. Expired entries are
/// removed lazily on lookup. The clock is passed in so TTL behaviour can
/// be tested without sleeping.
#[derive(Debug)]
pub struct LocationCache {
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl LocationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<Match> {
        let entry = self.entries.get(key)?;
        if now.saturating_duration_since(entry.timestamp) > self.ttl {
            self.entries.remove(key);
            return None;
        }
        Some(entry.location.clone())
    }

    pub fn insert(&mut self, key: impl Into<String>, location: Match, now: Instant) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                location,
                timestamp: now,
            },
        );
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
