// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide aggregation of records between two harvests.
//!
//! Every finished transaction merges its records here, and so do records
//! captured outside of any transaction. Each record kind is kept in a
//! [`SampledBuffer`]: a reservoir of fixed capacity that holds a uniform
//! random sample of everything offered to it during the harvest period, and
//! counts how many records it has seen.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::custom_event::CustomEvent;
use crate::error_trace::ErrorRecord;
use crate::transaction::TransactionBatch;
use crate::util::unix_timestamp;

/// Reservoir sample of at most `capacity` items.
///
/// After `n` offers each offered item is retained with probability
/// `min(1, capacity / n)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampledBuffer<T> {
    #[serde(rename = "reservoir_size")]
    capacity: usize,
    #[serde(rename = "events_seen")]
    seen: u64,
    #[serde(rename = "events")]
    items: Vec<T>,
}

impl<T> SampledBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        SampledBuffer {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity.min(1024)),
        }
    }

    /// Offers `item` to the reservoir. Returns whether it was retained.
    pub fn add(&mut self, item: T) -> bool {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return true;
        }
        let slot = fastrand::u64(..self.seen);
        match usize::try_from(slot) {
            Ok(slot) if slot < self.capacity => {
                self.items[slot] = item;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items offered, retained or not.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }
}

/// Everything collected during one harvest period.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestPayload {
    pub start_time: f64,
    pub end_time: f64,
    pub custom_events: SampledBuffer<CustomEvent>,
    pub error_events: SampledBuffer<ErrorRecord>,
}

impl HarvestPayload {
    pub fn is_empty(&self) -> bool {
        self.custom_events.seen() == 0 && self.error_events.seen() == 0
    }
}

#[derive(Debug)]
struct HarvestAggregate {
    start_time: f64,
    custom_events: SampledBuffer<CustomEvent>,
    error_events: SampledBuffer<ErrorRecord>,
}

impl HarvestAggregate {
    fn new(max_custom_events: usize, max_errors: usize) -> Self {
        HarvestAggregate {
            start_time: unix_timestamp(),
            custom_events: SampledBuffer::new(max_custom_events),
            error_events: SampledBuffer::new(max_errors),
        }
    }
}

/// Shared aggregate swapped out at every harvest.
///
/// Every operation holds the lock for its whole duration, so a merged batch
/// lands entirely in one harvest period.
#[derive(Debug)]
pub struct HarvestAggregator {
    aggregate: Mutex<HarvestAggregate>,
    max_custom_events: usize,
    max_errors: usize,
}

impl HarvestAggregator {
    pub fn new(max_custom_events: usize, max_errors: usize) -> Self {
        HarvestAggregator {
            aggregate: Mutex::new(HarvestAggregate::new(max_custom_events, max_errors)),
            max_custom_events,
            max_errors,
        }
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        Arc::new(Self::new(
            config.max_custom_events_per_harvest,
            config.max_errors_per_harvest,
        ))
    }

    /// Folds the records of a finished transaction into the aggregate.
    pub fn merge(&self, batch: TransactionBatch) {
        #[allow(clippy::expect_used)]
        let mut aggregate = self.aggregate.lock().expect("lock poisoned");
        debug!(
            "Merging {} errors and {} custom events into harvest",
            batch.errors.len(),
            batch.custom_events.len()
        );
        for record in batch.errors {
            aggregate.error_events.add(record);
        }
        for event in batch.custom_events {
            aggregate.custom_events.add(event);
        }
    }

    pub fn add_error(&self, record: ErrorRecord) -> bool {
        #[allow(clippy::expect_used)]
        let mut aggregate = self.aggregate.lock().expect("lock poisoned");
        aggregate.error_events.add(record)
    }

    pub fn add_custom_event(&self, event: CustomEvent) -> bool {
        #[allow(clippy::expect_used)]
        let mut aggregate = self.aggregate.lock().expect("lock poisoned");
        aggregate.custom_events.add(event)
    }

    /// Replaces the aggregate with an empty one and returns what it held.
    pub fn swap_and_flush(&self) -> HarvestPayload {
        let fresh = HarvestAggregate::new(self.max_custom_events, self.max_errors);
        let previous = {
            #[allow(clippy::expect_used)]
            let mut aggregate = self.aggregate.lock().expect("lock poisoned");
            std::mem::replace(&mut *aggregate, fresh)
        };
        if previous.error_events.seen() > previous.error_events.len() as u64 {
            warn!(
                "Per harvest error limit of {} reached, sampled {} errors",
                previous.error_events.capacity(),
                previous.error_events.seen()
            );
        }
        debug!(
            "Harvested {} of {} errors and {} of {} custom events",
            previous.error_events.len(),
            previous.error_events.seen(),
            previous.custom_events.len(),
            previous.custom_events.seen()
        );
        HarvestPayload {
            start_time: previous.start_time,
            end_time: unix_timestamp(),
            custom_events: previous.custom_events,
            error_events: previous.error_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_event::create_custom_event;
    use crate::error_trace::ErrorIntrinsics;
    use proptest::prelude::*;
    use serde_json::json;

    const NO_PARAMS: [(&str, serde_json::Value); 0] = [];

    fn error(message: &str) -> ErrorRecord {
        ErrorRecord::new(
            ErrorIntrinsics::new("RuntimeError", message, false, None),
            Default::default(),
            None,
        )
    }

    fn event(event_type: &str) -> CustomEvent {
        create_custom_event(event_type, NO_PARAMS, 64).expect("valid event")
    }

    #[test]
    fn test_reservoir_fills_before_sampling() {
        let mut buffer = SampledBuffer::new(3);
        assert!(buffer.add(1));
        assert!(buffer.add(2));
        assert!(buffer.add(3));
        assert_eq!(buffer.items(), &[1, 2, 3]);
        buffer.add(4);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.seen(), 4);
    }

    #[test]
    fn test_zero_capacity_only_counts() {
        let mut buffer = SampledBuffer::new(0);
        assert!(!buffer.add("x"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.seen(), 1);
    }

    #[test]
    fn test_reservoir_is_uniform() {
        const CAPACITY: usize = 10;
        const OFFERED: usize = 100;
        const TRIALS: usize = 4000;

        let mut hits = [0usize; OFFERED];
        for _ in 0..TRIALS {
            let mut buffer = SampledBuffer::new(CAPACITY);
            for i in 0..OFFERED {
                buffer.add(i);
            }
            for &i in buffer.items() {
                hits[i] += 1;
            }
        }

        // each item is expected TRIALS * CAPACITY / OFFERED = 400 times
        let expected = (TRIALS * CAPACITY / OFFERED) as f64;
        for (i, &count) in hits.iter().enumerate() {
            let deviation = (count as f64 - expected).abs() / expected;
            assert!(deviation < 0.3, "item {i} retained {count} times");
        }
        let first_half: usize = hits[..OFFERED / 2].iter().sum();
        let second_half: usize = hits[OFFERED / 2..].iter().sum();
        let ratio = first_half as f64 / second_half as f64;
        assert!((0.9..1.1).contains(&ratio), "ratio {ratio}");
    }

    proptest! {
        #[test]
        fn test_reservoir_bounds(capacity in 0usize..50, offered in 0usize..500) {
            let mut buffer = SampledBuffer::new(capacity);
            for i in 0..offered {
                buffer.add(i);
            }
            prop_assert_eq!(buffer.len(), capacity.min(offered));
            prop_assert_eq!(buffer.seen(), offered as u64);
        }
    }

    #[test]
    fn test_merge_respects_harvest_limit() {
        let harvest = HarvestAggregator::new(1200, 20);
        for t in 0..5 {
            let batch = TransactionBatch {
                errors: (0..10).map(|i| error(&format!("txn {t} error {i}"))).collect(),
                custom_events: vec![],
            };
            harvest.merge(batch);
        }
        let payload = harvest.swap_and_flush();
        assert_eq!(payload.error_events.capacity(), 20);
        assert_eq!(payload.error_events.len(), 20);
        assert_eq!(payload.error_events.seen(), 50);
        assert_eq!(payload.custom_events.capacity(), 1200);
        assert!(payload.custom_events.is_empty());
    }

    #[test]
    fn test_swap_and_flush_resets() {
        let harvest = HarvestAggregator::new(10, 10);
        harvest.add_error(error("first"));
        harvest.add_custom_event(event("First"));
        let payload = harvest.swap_and_flush();
        assert!(!payload.is_empty());
        assert_eq!(payload.custom_events.items()[0].event_type(), "First");
        assert!(payload.end_time >= payload.start_time);

        let payload = harvest.swap_and_flush();
        assert!(payload.is_empty());
        assert_eq!(payload.error_events.seen(), 0);
    }

    #[test]
    fn test_payload_serialization() {
        let harvest = HarvestAggregator::new(10, 10);
        harvest.add_custom_event(event("Serialized"));
        let value = serde_json::to_value(harvest.swap_and_flush()).expect("serialize");
        assert_eq!(value["custom_events"]["reservoir_size"], json!(10));
        assert_eq!(value["custom_events"]["events_seen"], json!(1));
        assert_eq!(value["custom_events"]["events"][0][0]["type"], "Serialized");
        assert_eq!(value["error_events"]["events"], json!([]));
    }

    #[test]
    fn test_concurrent_merge_and_flush() {
        use std::thread;

        let harvest = Arc::new(HarvestAggregator::new(10_000, 10_000));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let harvest = Arc::clone(&harvest);
                thread::spawn(move || {
                    for i in 0..250 {
                        harvest.merge(TransactionBatch {
                            errors: vec![error(&format!("{w}-{i}"))],
                            custom_events: vec![event("Concurrent")],
                        });
                    }
                })
            })
            .collect();

        let mut errors_seen = 0;
        let mut events_seen = 0;
        for _ in 0..10 {
            let payload = harvest.swap_and_flush();
            // a batch never straddles two harvests
            assert_eq!(payload.error_events.seen(), payload.custom_events.seen());
            errors_seen += payload.error_events.seen();
            events_seen += payload.custom_events.seen();
            thread::yield_now();
        }
        for writer in writers {
            writer.join().unwrap();
        }
        let payload = harvest.swap_and_flush();
        errors_seen += payload.error_events.seen();
        events_seen += payload.custom_events.seen();

        assert_eq!(errors_seen, 1000);
        assert_eq!(events_seen, 1000);
    }
}
