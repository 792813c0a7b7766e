//! Optional raw-sample store capability.
//!
//! Relational persistence of raw samples lives outside this crate; the engine
//! only appends through this trait when a store is configured, and nothing in
//! the detection path depends on it. `MemorySampleStore` exists for the
//! simulation binary and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::RawSample;

/// Append/range access to historical raw samples.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Persist one accepted sample. Best-effort; failures are the store's
    /// concern and must not affect detection.
    async fn append(&self, sample: &RawSample);

    /// Samples for `location` with timestamps in `[from_ms, to_ms]`,
    /// oldest first.
    async fn range(&self, location: &str, from_ms: u64, to_ms: u64) -> Vec<RawSample>;
}

/// In-memory store, bounded per location.
pub struct MemorySampleStore {
    samples: Mutex<HashMap<String, Vec<RawSample>>>,
    max_per_location: usize,
}

impl MemorySampleStore {
    pub fn new(max_per_location: usize) -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            max_per_location,
        }
    }

    pub fn total_count(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl Default for MemorySampleStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl SampleStore for MemorySampleStore {
    async fn append(&self, sample: &RawSample) {
        let mut samples = self
            .samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bucket = samples
            .entry(sample.location_key().to_string())
            .or_default();
        if bucket.len() >= self.max_per_location {
            bucket.remove(0);
        }
        bucket.push(sample.clone());
    }

    async fn range(&self, location: &str, from_ms: u64, to_ms: u64) -> Vec<RawSample> {
        let samples = self
            .samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        samples
            .get(location)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|s| {
                        s.timestamp
                            .map(|ts| ts >= from_ms && ts <= to_ms)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u64, location: &str) -> RawSample {
        RawSample {
            timestamp: Some(ts),
            pressure: 50.0,
            flow: 10.0,
            location: Some(location.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_append_and_range() {
        let store = MemorySampleStore::default();
        for ts in [1_000_u64, 2_000, 3_000, 4_000] {
            store.append(&sample(ts, "main")).await;
        }
        store.append(&sample(2_500, "other")).await;

        let hits = store.range("main", 2_000, 3_000).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].timestamp, Some(2_000));
        assert!(store.range("nowhere", 0, u64::MAX).await.is_empty());
    }

    #[tokio::test]
    async fn test_per_location_bound() {
        let store = MemorySampleStore::new(3);
        for ts in 0..5_u64 {
            store.append(&sample(ts * 1000, "main")).await;
        }
        let all = store.range("main", 0, u64::MAX).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, Some(2_000));
    }
}
