// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transactions and their per-transaction aggregation.
//!
//! A [`Transaction`] collects the errors and custom events recorded while its
//! unit of work runs. The per-transaction caps bound memory and transport
//! cost for a single request: once a cap is reached later records are
//! rejected, so the first records win.
//!
//! A [`TransactionGuard`] keeps the transaction registered in the
//! [`TransactionContext`] for as long as it lives. Releasing the guard, on any
//! exit path including unwinding, clears the context entry and merges the
//! transaction's records into the [`HarvestAggregator`].

use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::config::Config;
use crate::constants::{BACKGROUND_TRANSACTION_PREFIX, WEB_TRANSACTION_PREFIX};
use crate::context::{ContextId, TransactionContext};
use crate::custom_event::CustomEvent;
use crate::error_trace::ErrorRecord;
use crate::errors::ContextError;
use crate::harvest::HarvestAggregator;
use crate::util::generate_guid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TransactionKind {
    #[display("web")]
    Web,
    #[display("background")]
    Background,
}

/// Records produced by one finished transaction.
#[derive(Debug, Default)]
pub struct TransactionBatch {
    pub errors: Vec<ErrorRecord>,
    pub custom_events: Vec<CustomEvent>,
}

impl TransactionBatch {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.custom_events.is_empty()
    }
}

/// Outcome of offering a record to a [`Transaction`].
#[derive(Debug)]
pub enum Admission<T> {
    Accepted,
    /// The per-transaction cap was reached; the record is gone.
    OverLimit,
    /// The transaction already finished. The record is handed back so the
    /// caller can route it elsewhere.
    Finalized(T),
}

impl<T> Admission<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Bounded, insertion-ordered storage for the records of one transaction.
#[derive(Debug)]
pub struct TransactionAggregator {
    errors: Vec<ErrorRecord>,
    custom_events: Vec<CustomEvent>,
    max_errors: usize,
    max_custom_events: usize,
    dropped_errors: usize,
    dropped_custom_events: usize,
    finalized: bool,
}

impl TransactionAggregator {
    pub fn new(max_errors: usize, max_custom_events: usize) -> Self {
        TransactionAggregator {
            errors: Vec::new(),
            custom_events: Vec::new(),
            max_errors,
            max_custom_events,
            dropped_errors: 0,
            dropped_custom_events: 0,
            finalized: false,
        }
    }

    /// Returns `false`, dropping `record`, once the error cap is reached.
    pub fn add_error(&mut self, record: ErrorRecord) -> bool {
        if self.errors.len() >= self.max_errors {
            self.dropped_errors += 1;
            debug!(
                "Per transaction error limit of {} reached, dropping error {}",
                self.max_errors,
                record.error_class()
            );
            return false;
        }
        self.errors.push(record);
        true
    }

    /// Returns `false`, dropping `event`, once the custom event cap is reached.
    pub fn add_custom_event(&mut self, event: CustomEvent) -> bool {
        if self.custom_events.len() >= self.max_custom_events {
            self.dropped_custom_events += 1;
            debug!(
                "Per transaction custom event limit of {} reached, dropping event {}",
                self.max_custom_events,
                event.event_type()
            );
            return false;
        }
        self.custom_events.push(event);
        true
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn custom_events(&self) -> &[CustomEvent] {
        &self.custom_events
    }

    pub fn dropped_errors(&self) -> usize {
        self.dropped_errors
    }

    pub fn dropped_custom_events(&self) -> usize {
        self.dropped_custom_events
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn take_batch(&mut self) -> TransactionBatch {
        TransactionBatch {
            errors: std::mem::take(&mut self.errors),
            custom_events: std::mem::take(&mut self.custom_events),
        }
    }

    /// Seals the aggregator and drains it. `None` when already sealed.
    fn finalize(&mut self) -> Option<TransactionBatch> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        Some(self.take_batch())
    }
}

/// One tracked unit of work.
#[derive(Debug)]
pub struct Transaction {
    guid: String,
    name: String,
    kind: TransactionKind,
    sampled: bool,
    priority: f32,
    aggregator: Mutex<TransactionAggregator>,
}

impl Transaction {
    /// Transaction for a web request, named after its URI path.
    pub fn web(uri: &str, config: &Config) -> Self {
        Self::new(
            TransactionKind::Web,
            format!("{WEB_TRANSACTION_PREFIX}{uri}"),
            config,
        )
    }

    /// Transaction for a background task.
    pub fn background(name: &str, config: &Config) -> Self {
        Self::new(
            TransactionKind::Background,
            format!("{BACKGROUND_TRANSACTION_PREFIX}{name}"),
            config,
        )
    }

    fn new(kind: TransactionKind, name: String, config: &Config) -> Self {
        let sampled = fastrand::f32() < config.trace_sample_rate;
        let mut priority = fastrand::f32();
        if sampled {
            priority += 1.0;
        }
        Transaction {
            guid: generate_guid(),
            name,
            kind,
            sampled,
            priority,
            aggregator: Mutex::new(TransactionAggregator::new(
                config.max_errors_per_transaction,
                config.max_custom_events_per_transaction,
            )),
        }
    }

    /// Replaces the local sampling decision, e.g. with one propagated by an
    /// upstream service.
    pub fn with_sampling(mut self, sampled: bool, priority: f32) -> Self {
        self.sampled = sampled;
        self.priority = priority;
        self
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn is_finalized(&self) -> bool {
        self.with_aggregator(TransactionAggregator::is_finalized)
    }

    pub fn add_error(&self, record: ErrorRecord) -> Admission<ErrorRecord> {
        #[allow(clippy::expect_used)]
        let mut aggregator = self.aggregator.lock().expect("lock poisoned");
        if aggregator.is_finalized() {
            debug!(
                "Transaction {} already finished, rejecting error {}",
                self.guid,
                record.error_class()
            );
            return Admission::Finalized(record);
        }
        if aggregator.add_error(record) {
            Admission::Accepted
        } else {
            Admission::OverLimit
        }
    }

    pub fn add_custom_event(&self, event: CustomEvent) -> Admission<CustomEvent> {
        #[allow(clippy::expect_used)]
        let mut aggregator = self.aggregator.lock().expect("lock poisoned");
        if aggregator.is_finalized() {
            debug!(
                "Transaction {} already finished, rejecting custom event {}",
                self.guid,
                event.event_type()
            );
            return Admission::Finalized(event);
        }
        if aggregator.add_custom_event(event) {
            Admission::Accepted
        } else {
            Admission::OverLimit
        }
    }

    /// Runs `f` with read access to the per-transaction records.
    pub fn with_aggregator<R>(&self, f: impl FnOnce(&TransactionAggregator) -> R) -> R {
        #[allow(clippy::expect_used)]
        let aggregator = self.aggregator.lock().expect("lock poisoned");
        f(&aggregator)
    }

    /// Marks the transaction read-only and hands out its records. Only the
    /// first call returns anything; every record accepted before it is in
    /// the batch, every record offered after it is rejected.
    pub fn finalize(&self) -> TransactionBatch {
        #[allow(clippy::expect_used)]
        let mut aggregator = self.aggregator.lock().expect("lock poisoned");
        if aggregator.dropped_errors() > 0 || aggregator.dropped_custom_events() > 0 {
            debug!(
                "Transaction {} dropped {} errors and {} custom events over its limits",
                self.guid,
                aggregator.dropped_errors(),
                aggregator.dropped_custom_events()
            );
        }
        aggregator.finalize().unwrap_or_default()
    }
}

/// Scoped registration of a transaction in the [`TransactionContext`].
#[must_use = "dropping the guard immediately ends the transaction"]
pub struct TransactionGuard {
    transaction: Arc<Transaction>,
    context_id: ContextId,
    context: Arc<TransactionContext>,
    harvest: Arc<HarvestAggregator>,
    released: bool,
}

impl TransactionGuard {
    pub(crate) fn enter(
        transaction: Arc<Transaction>,
        context_id: ContextId,
        context: Arc<TransactionContext>,
        harvest: Arc<HarvestAggregator>,
    ) -> Result<Self, ContextError> {
        context.enter_in(context_id, Arc::clone(&transaction))?;
        Ok(TransactionGuard {
            transaction,
            context_id,
            context,
            harvest,
            released: false,
        })
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// Ends the transaction, reporting a corrupted context entry to the
    /// caller. The transaction's records are merged either way.
    pub fn finish(mut self) -> Result<(), ContextError> {
        self.released = true;
        self.release()
    }

    fn release(&self) -> Result<(), ContextError> {
        let exited = self.context.exit_in(self.context_id, &self.transaction);
        let batch = self.transaction.finalize();
        if !batch.is_empty() {
            self.harvest.merge(batch);
        }
        exited
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.release() {
            error!(
                "Failed to release transaction {} from {}: {e}",
                self.transaction.guid(),
                self.context_id
            );
        }
    }
}
