use super::WindowOutcome;
use crate::trade::Instrument;
use fnv::FnvHashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CachedOutcome {
    outcome: WindowOutcome,
    computed_at: Instant,
}

/// Short-lived cache of [`WindowOutcome`]s keyed by `(Instrument, window_minutes)`.
///
/// Entries expire by age. An expired entry is removed when read, and every insert purges all
/// expired entries, so the cache never holds more than the keys queried within one TTL.
#[derive(Debug, Clone)]
pub struct WindowCache {
    ttl: Duration,
    entries: FnvHashMap<(Instrument, u32), CachedOutcome>,
}

impl WindowCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: FnvHashMap::default(),
        }
    }

    pub fn get(&mut self, instrument: &Instrument, window_minutes: u32) -> Option<WindowOutcome> {
        let key = (instrument.clone(), window_minutes);
        let entry = self.entries.get(&key)?;
        if entry.computed_at.elapsed() < self.ttl {
            return Some(entry.outcome.clone());
        }
        self.entries.remove(&key);
        None
    }

    pub fn insert(&mut self, instrument: Instrument, window_minutes: u32, outcome: WindowOutcome) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.computed_at.elapsed() < ttl);
        self.entries.insert(
            (instrument, window_minutes),
            CachedOutcome {
                outcome,
                computed_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
