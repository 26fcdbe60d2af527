//! Bounded in-memory result history served by the status API.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use mirrorprobe_core::{CacheError, History, ResultEnvelope};

/// Envelopes kept per (registry, probe) pair.
pub const DEFAULT_CAPACITY: usize = 1000;

type Key = (String, String);

/// The most recent envelopes per (registry, probe), ordered by start time.
#[derive(Debug)]
pub struct RecentHistory {
    capacity: usize,
    series: RwLock<HashMap<Key, VecDeque<ResultEnvelope>>>,
}

impl Default for RecentHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RecentHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Insert in start order, evicting the oldest beyond capacity.
    pub fn record(&self, envelope: ResultEnvelope) {
        let key = (envelope.registry.clone(), envelope.probe.clone());
        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        let queue = series.entry(key).or_default();
        let at = queue.partition_point(|e| e.start <= envelope.start);
        queue.insert(at, envelope);
        while queue.len() > self.capacity {
            queue.pop_front();
        }
    }

    pub fn extend(&self, envelopes: impl IntoIterator<Item = ResultEnvelope>) {
        for envelope in envelopes {
            self.record(envelope);
        }
    }

    /// Total envelopes held.
    pub fn len(&self) -> usize {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl History for RecentHistory {
    fn history(&self, registry: &str, probe: &str) -> Result<Vec<ResultEnvelope>, CacheError> {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        Ok(series
            .get(&(registry.to_string(), probe.to_string()))
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorprobe_core::{Describe, ResultPayload};

    fn ping(registry: &str, start: i64) -> ResultEnvelope {
        let payload = ResultPayload::Ping(Describe::ZERO);
        ResultEnvelope::new("ping", registry, payload, start, start + 1)
    }

    #[test]
    fn out_of_order_completions_are_sorted() {
        let history = RecentHistory::new(10);
        history.extend([
            ping("npmjs", 30),
            ping("npmjs", 10),
            ping("npmjs", 20),
            ping("yarnpkg", 5),
        ]);

        let starts: Vec<i64> = history
            .history("npmjs", "ping")
            .unwrap()
            .iter()
            .map(|e| e.start)
            .collect();
        assert_eq!(starts, vec![10, 20, 30]);
        assert_eq!(history.len(), 4);
        assert!(history.history("npmjs", "delta").unwrap().is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let history = RecentHistory::new(2);
        history.extend((0..5).map(|i| ping("npmjs", i)));

        let starts: Vec<i64> = history
            .history("npmjs", "ping")
            .unwrap()
            .iter()
            .map(|e| e.start)
            .collect();
        assert_eq!(starts, vec![3, 4]);
    }
}
