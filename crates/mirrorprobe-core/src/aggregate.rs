//! Generic reduction of result histories into time buckets.
//!
//! A probe supplies three pieces: `group` maps a start timestamp to a
//! bucket key, `zero` is the value a fresh bucket starts from, and
//! `transform` folds one envelope into its bucket. `transform` also sees
//! the full history and the envelope's index so trailing windows can look
//! backwards.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ResultEnvelope;

const DAY_MS: i64 = 86_400_000;

/// One aggregation slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket<V> {
    pub key: i64,
    pub values: V,
}

/// Build a pipeline bound to a probe's `group`, `transform` and `zero`.
///
/// The returned function expects its input sorted ascending by start
/// time; buckets come out in first-seen order, which is then ascending by
/// key.
pub fn aggregate<P, V, G, T>(
    group: G,
    transform: T,
    zero: V,
) -> impl Fn(&[ResultEnvelope<P>]) -> Vec<Bucket<V>>
where
    V: Clone,
    G: Fn(i64) -> i64,
    T: Fn(&V, &ResultEnvelope<P>, usize, &[ResultEnvelope<P>]) -> V,
{
    move |history: &[ResultEnvelope<P>]| {
        let mut buckets: Vec<Bucket<V>> = Vec::new();
        let mut slots: HashMap<i64, usize> = HashMap::new();

        for (index, envelope) in history.iter().enumerate() {
            let key = group(envelope.start);
            let slot = *slots.entry(key).or_insert_with(|| {
                buckets.push(Bucket {
                    key,
                    values: zero.clone(),
                });
                buckets.len() - 1
            });
            let bucket = &mut buckets[slot];
            bucket.values = transform(&bucket.values, envelope, index, history);
        }

        buckets
    }
}

/// Expand buckets whose values are sequences into one entry per element.
pub fn flatten<T>(buckets: Vec<Bucket<Vec<T>>>) -> Vec<Bucket<T>> {
    buckets
        .into_iter()
        .flat_map(|bucket| {
            let key = bucket.key;
            bucket
                .values
                .into_iter()
                .map(move |values| Bucket { key, values })
        })
        .collect()
}

/// Identity grouping: every tick is its own bucket.
pub fn group_by_tick(timestamp: i64) -> i64 {
    timestamp
}

/// Truncate an epoch-millisecond timestamp to the start of its UTC day.
pub fn group_by_day(timestamp: i64) -> i64 {
    match DateTime::<Utc>::from_timestamp_millis(timestamp) {
        Some(dt) => Utc
            .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
            .single()
            .map(|d| d.timestamp_millis())
            .unwrap_or_else(|| timestamp - timestamp.rem_euclid(DAY_MS)),
        None => timestamp - timestamp.rem_euclid(DAY_MS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::moving_average;

    fn env(start: i64, value: f64) -> ResultEnvelope<f64> {
        ResultEnvelope::new("test", "local", value, start, start + 5)
    }

    /// Trailing five-tick average, ignoring the incoming bucket value.
    fn trailing(
        _: &f64,
        current: &ResultEnvelope<f64>,
        index: usize,
        history: &[ResultEnvelope<f64>],
    ) -> f64 {
        moving_average(current.payload, index, 5, |i| history[i].payload)
    }

    #[test]
    fn same_key_folds_into_one_bucket() {
        let pipeline = aggregate(
            |_| 7,
            |acc: &f64, e: &ResultEnvelope<f64>, _, _| acc + e.payload,
            0.0,
        );
        let out = pipeline(&[env(1, 1.0), env(2, 2.0), env(3, 3.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, 7);
        assert_eq!(out[0].values, 6.0);
    }

    #[test]
    fn fold_is_order_sensitive() {
        let pipeline = aggregate(|_| 0, trailing, 0.0);
        let forward = [env(1, 10.0), env(2, 20.0), env(3, 90.0)];
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = pipeline(&forward);
        let b = pipeline(&reversed);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        // (90 + 20 + 10 + 10 + 10) / 5 against (10 + 20 + 90 + 90 + 90) / 5.
        assert_eq!(a[0].values, 28.0);
        assert_eq!(b[0].values, 60.0);
        assert_ne!(a[0].values, b[0].values);
    }

    #[test]
    fn unseen_keys_start_from_zero_template() {
        let pipeline = aggregate(
            group_by_tick,
            |acc: &Vec<f64>, e: &ResultEnvelope<f64>, _, _| {
                let mut next = acc.clone();
                next.push(e.payload);
                next
            },
            vec![-1.0],
        );
        let out = pipeline(&[env(1, 1.0), env(2, 2.0)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].values, vec![-1.0, 1.0]);
        assert_eq!(out[1].values, vec![-1.0, 2.0]);
    }

    #[test]
    fn flatten_emits_one_entry_per_element() {
        let out = flatten(vec![
            Bucket {
                key: 1,
                values: vec!["a", "b"],
            },
            Bucket {
                key: 2,
                values: vec!["c"],
            },
        ]);
        let keys: Vec<i64> = out.iter().map(|b| b.key).collect();
        assert_eq!(keys, vec![1, 1, 2]);
        assert_eq!(out[2].values, "c");
    }

    #[test]
    fn group_by_day_truncates_to_midnight() {
        // 2024-01-02T13:45:10Z
        let ts = 1_704_203_110_000;
        assert_eq!(group_by_day(ts), 1_704_153_600_000);
        assert_eq!(group_by_day(1_704_153_600_000), 1_704_153_600_000);
    }

    #[test]
    fn empty_history_yields_no_buckets() {
        let keep = |acc: &f64, _: &ResultEnvelope<f64>, _: usize, _: &[ResultEnvelope<f64>]| *acc;
        let pipeline = aggregate(group_by_day, keep, 0.0);
        assert!(pipeline(&[]).is_empty());
    }
}
