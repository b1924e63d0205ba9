//! # Position store.
//!
//! Keeps the last-acked sequence per durable across subscription lifetimes,
//! so a re-created subscription resumes where the old one stopped even when
//! the bus itself forgot the durable.
//!
//! Implementations own their failure handling; the core treats `save` as
//! best effort because the bus-side ack and duplicate filtering already
//! cover a lost write.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// Durable position persistence.
#[async_trait]
pub trait PositionStore: Send + Sync + 'static {
    /// Last-acked sequence for `durable` (0 if unknown).
    async fn load(&self, durable: &str) -> u64;

    /// Records `seq` as the last-acked sequence for `durable`.
    async fn save(&self, durable: &str, seq: u64);
}

/// Process-local store. Positions never move backwards.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: Mutex<HashMap<String, u64>>,
}

impl MemoryPositionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self, durable: &str) -> u64 {
        let map = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        map.get(durable).copied().unwrap_or(0)
    }

    async fn save(&self, durable: &str, seq: u64) {
        let mut map = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        let pos = map.entry(durable.to_string()).or_insert(0);
        *pos = (*pos).max(seq);
    }
}
