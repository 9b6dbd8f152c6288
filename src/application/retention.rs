//! Process-wide registry of downloadable batches.
//!
//! Written by the compile path, read by the download and info endpoints, pruned by
//! the reclaimer. Every operation is a single map access, so a concurrent reader sees
//! either the entry or nothing.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use metrics::gauge;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionEntry {
    pub id: Uuid,
    pub archive_filename: String,
    pub created_at: OffsetDateTime,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl RetentionEntry {
    /// Time since creation, never negative.
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        let age = now - self.created_at;
        age.try_into().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: OffsetDateTime, window: Duration) -> bool {
        self.age(now) > window
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetentionStore {
    entries: Arc<DashMap<Uuid, RetentionEntry>>,
}

impl RetentionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, entry: RetentionEntry) {
        self.entries.insert(entry.id, entry);
        self.record_len();
    }

    pub fn get(&self, id: &Uuid) -> Option<RetentionEntry> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &Uuid) -> Option<RetentionEntry> {
        let removed = self.entries.remove(id).map(|(_, entry)| entry);
        self.record_len();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every entry older than `window`.
    pub fn evict_expired(&self, now: OffsetDateTime, window: Duration) -> Vec<RetentionEntry> {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now, window))
            .map(|entry| *entry.key())
            .collect();

        // Collected first: removing while iterating would deadlock the shard.
        let evicted = expired
            .iter()
            .filter_map(|id| self.entries.remove(id).map(|(_, entry)| entry))
            .collect();
        self.record_len();
        evicted
    }

    fn record_len(&self) {
        gauge!("amxforge_retention_entries").set(self.entries.len() as f64);
    }
}
