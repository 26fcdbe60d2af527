//! In-process cache backend.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use mirrorprobe_core::{BoxFuture, Cache, CacheError, History, ResultEnvelope};

/// A `Cache` that keeps envelopes in a map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<BTreeMap<String, ResultEnvelope>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ResultEnvelope> {
        self.lock().ok()?.get(key).cloned()
    }

    /// All stored keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, ResultEnvelope>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError("memory cache lock poisoned".to_string()))
    }
}

impl Cache for MemoryCache {
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a ResultEnvelope,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.lock()?.insert(key.to_string(), value.clone());
            Ok(())
        })
    }
}

impl History for MemoryCache {
    fn history(&self, registry: &str, probe: &str) -> Result<Vec<ResultEnvelope>, CacheError> {
        let mut found: Vec<ResultEnvelope> = self
            .lock()?
            .values()
            .filter(|e| e.registry == registry && e.probe == probe)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.start);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorprobe_core::{PublishReport, ResultPayload};

    #[tokio::test]
    async fn set_then_get() {
        let cache = MemoryCache::new();
        let env = ResultEnvelope::new(
            "publish",
            "npmjs",
            ResultPayload::Publish(PublishReport {
                published: false,
                time: 3,
                error: Some("E403".to_string()),
            }),
            10,
            13,
        );

        cache.set("npmjs/publish/10", &env).await.unwrap();
        assert_eq!(cache.get("npmjs/publish/10"), Some(env));
        assert_eq!(cache.keys(), vec!["npmjs/publish/10".to_string()]);
        assert!(!cache.is_empty());
    }

    #[tokio::test]
    async fn history_filters_and_sorts() {
        let cache = MemoryCache::new();
        for (registry, start) in [("npmjs", 30), ("npmjs", 4), ("yarnpkg", 5)] {
            let env = ResultEnvelope::new(
                "publish",
                registry,
                ResultPayload::Publish(PublishReport {
                    published: true,
                    time: 1,
                    error: None,
                }),
                start,
                start + 1,
            );
            cache.set(&env.cache_key(), &env).await.unwrap();
        }
        let starts: Vec<i64> = cache
            .history("npmjs", "publish")
            .unwrap()
            .iter()
            .map(|e| e.start)
            .collect();
        assert_eq!(starts, vec![4, 30]);
        assert!(cache.history("npmjs", "ping").unwrap().is_empty());
    }
}
