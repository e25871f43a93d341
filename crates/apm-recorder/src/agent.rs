// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point used by instrumentation hooks.
//!
//! ```rust,ignore
//! let agent = Agent::new(Config::default());
//! let guard = agent.start_web_transaction("/checkout")?;
//! agent.record_custom_event("Purchase", [("amount", json!(12.5))]);
//! let result = agent.wrap(ErrorTraceOptions::new(), || charge(&order));
//! guard.finish()?;
//! ```

use std::borrow::Borrow;
use std::sync::Arc;

use tracing::debug;

use crate::attribute::RawValue;
use crate::config::Config;
use crate::context::{ContextId, TransactionContext};
use crate::custom_event::{create_custom_event, create_transaction_custom_event};
use crate::error_trace::{Capture, ErrorRecorder, ErrorTrace, ErrorTraceOptions, Exception};
use crate::errors::{ConfigError, ContextError};
use crate::flusher::{HarvestSink, Harvester};
use crate::harvest::HarvestAggregator;
use crate::transaction::{Admission, Transaction, TransactionGuard};

#[derive(Debug, Clone)]
pub struct Agent {
    config: Arc<Config>,
    context: Arc<TransactionContext>,
    harvest: Arc<HarvestAggregator>,
    errors: ErrorRecorder,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let context = Arc::new(TransactionContext::new());
        let harvest = HarvestAggregator::from_config(&config);
        let errors = ErrorRecorder::new(
            Arc::clone(&config),
            Arc::clone(&context),
            Arc::clone(&harvest),
        );
        Agent {
            config,
            context,
            harvest,
            errors,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(Config::from_env()?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &Arc<TransactionContext> {
        &self.context
    }

    pub fn harvest(&self) -> &Arc<HarvestAggregator> {
        &self.harvest
    }

    pub fn start_web_transaction(&self, uri: &str) -> Result<TransactionGuard, ContextError> {
        self.start_transaction_in(
            ContextId::current_thread(),
            Transaction::web(uri, &self.config),
        )
    }

    pub fn start_background_task(&self, name: &str) -> Result<TransactionGuard, ContextError> {
        self.start_transaction_in(
            ContextId::current_thread(),
            Transaction::background(name, &self.config),
        )
    }

    /// Registers `transaction` as the active transaction of `context`.
    pub fn start_transaction_in(
        &self,
        context: ContextId,
        transaction: Transaction,
    ) -> Result<TransactionGuard, ContextError> {
        TransactionGuard::enter(
            Arc::new(transaction),
            context,
            Arc::clone(&self.context),
            Arc::clone(&self.harvest),
        )
    }

    pub fn current_transaction(&self) -> Option<Arc<Transaction>> {
        self.context.current()
    }

    /// Records a custom event against the current thread's transaction, or
    /// directly into the harvest when none is active. Returns whether the
    /// event was kept.
    pub fn record_custom_event<I, K, V>(&self, event_type: &str, params: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<RawValue>,
    {
        self.record_custom_event_for(self.current_transaction().as_ref(), event_type, params)
    }

    pub fn record_custom_event_in<I, K, V>(
        &self,
        context: ContextId,
        event_type: &str,
        params: I,
    ) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<RawValue>,
    {
        let transaction = self.context.current_in(context);
        self.record_custom_event_for(transaction.as_ref(), event_type, params)
    }

    fn record_custom_event_for<I, K, V>(
        &self,
        transaction: Option<&Arc<Transaction>>,
        event_type: &str,
        params: I,
    ) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<RawValue>,
    {
        if !self.config.custom_events_enabled {
            debug!("Custom events are disabled, dropping event {event_type:?}");
            return false;
        }
        let max_attributes = self.config.max_user_attributes;
        let event = match transaction.filter(|t| !t.is_finalized()) {
            Some(txn) => {
                let Some(event) = create_transaction_custom_event(
                    txn,
                    event_type,
                    params,
                    max_attributes,
                    self.config.distributed_tracing_enabled,
                ) else {
                    return false;
                };
                match txn.add_custom_event(event) {
                    Admission::Accepted => return true,
                    Admission::OverLimit => return false,
                    Admission::Finalized(event) => event.without_transaction(),
                }
            }
            None => match create_custom_event(event_type, params, max_attributes) {
                Some(event) => event,
                None => return false,
            },
        };
        self.harvest.add_custom_event(event)
    }

    pub fn record_exception<I, K, V>(
        &self,
        error: &dyn Exception,
        options: &ErrorTraceOptions,
        params: I,
    ) -> Capture
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<RawValue>,
    {
        self.errors.record_exception(error, options, params)
    }

    /// Records `error` against the transaction active in `context`, such as
    /// an async task that migrates between threads.
    pub fn record_exception_in<I, K, V>(
        &self,
        context: ContextId,
        error: &dyn Exception,
        options: &ErrorTraceOptions,
        params: I,
    ) -> Capture
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<RawValue>,
    {
        self.errors.record_exception_in(context, error, options, params)
    }

    pub fn error_trace(&self, options: ErrorTraceOptions) -> ErrorTrace {
        self.errors.error_trace(options)
    }

    pub fn error_trace_in(&self, context: ContextId, options: ErrorTraceOptions) -> ErrorTrace {
        self.errors.error_trace_in(context, options)
    }

    pub fn wrap<T, E, F>(&self, options: ErrorTraceOptions, f: F) -> Result<T, E>
    where
        E: Exception,
        F: FnOnce() -> Result<T, E>,
    {
        self.errors.wrap(options, f)
    }

    /// Harvester draining this agent's aggregate every configured interval.
    pub fn harvester(&self, sink: Arc<dyn HarvestSink + Send + Sync>) -> Harvester {
        Harvester::new(Arc::clone(&self.harvest), sink, self.config.harvest_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_trace::ObservedError;
    use serde_json::json;

    const NO_PARAMS: [(&str, RawValue); 0] = [];

    #[test]
    fn test_custom_event_inside_transaction() {
        let agent = Agent::new(Config::default());
        let guard = agent.start_web_transaction("/events").expect("start");
        assert!(agent.record_custom_event("Visit", [("page", json!("/events"))]));
        guard.transaction().with_aggregator(|agg| {
            assert_eq!(agg.custom_events().len(), 1);
            assert_eq!(
                agg.custom_events()[0].intrinsics().transaction_id.as_deref(),
                Some(guard.transaction().guid())
            );
        });
        guard.finish().expect("finish");

        let payload = agent.harvest().swap_and_flush();
        assert_eq!(payload.custom_events.len(), 1);
    }

    #[test]
    fn test_custom_event_outside_transaction_goes_to_harvest() {
        let agent = Agent::new(Config::default());
        assert!(agent.record_custom_event("Standalone", NO_PARAMS));
        assert!(!agent.record_custom_event("bad/type", NO_PARAMS));
        let payload = agent.harvest().swap_and_flush();
        assert_eq!(payload.custom_events.len(), 1);
        assert!(payload.custom_events.items()[0]
            .intrinsics()
            .transaction_id
            .is_none());
    }

    #[test]
    fn test_per_transaction_custom_event_cap() {
        let agent = Agent::new(Config {
            max_custom_events_per_transaction: 3,
            ..Config::default()
        });
        let guard = agent.start_background_task("batch").expect("start");
        let kept = (0..5)
            .filter(|_| agent.record_custom_event("Tick", NO_PARAMS))
            .count();
        assert_eq!(kept, 3);
        drop(guard);
        assert_eq!(agent.harvest().swap_and_flush().custom_events.seen(), 3);
    }

    #[test]
    fn test_disabled_collectors() {
        let agent = Agent::new(Config {
            custom_events_enabled: false,
            error_collector_enabled: false,
            ..Config::default()
        });
        assert!(!agent.record_custom_event("Off", NO_PARAMS));
        let capture = agent.record_exception(
            &ObservedError::new("E", "off"),
            &ErrorTraceOptions::new(),
            NO_PARAMS,
        );
        assert_eq!(capture, Capture::Disabled);
        assert!(agent.harvest().swap_and_flush().is_empty());
    }

    #[test]
    fn test_nested_transaction_is_rejected() {
        let agent = Agent::new(Config::default());
        let outer = agent.start_web_transaction("/outer").expect("start");
        let inner = agent.start_background_task("inner");
        assert!(matches!(inner, Err(ContextError::AlreadyActive { .. })));
        assert_eq!(
            agent.current_transaction().map(|t| t.name().to_string()),
            Some("WebTransaction/Uri/outer".to_string())
        );
        outer.finish().expect("finish");
        assert!(agent.current_transaction().is_none());
    }

    #[test]
    fn test_task_context_recording() {
        let agent = Agent::new(Config::default());
        let task = ContextId::Task(7);
        let guard = agent
            .start_transaction_in(task, Transaction::background("worker", agent.config()))
            .expect("start");
        assert!(agent.current_transaction().is_none());
        assert!(agent.record_custom_event_in(task, "TaskEvent", NO_PARAMS));
        guard.transaction().with_aggregator(|agg| assert_eq!(agg.custom_events().len(), 1));
    }

    #[test]
    fn test_task_context_error_recording() {
        let agent = Agent::new(Config::default());
        let task = ContextId::Task(11);
        let guard = agent
            .start_transaction_in(task, Transaction::background("worker", agent.config()))
            .expect("start");

        let capture = agent.record_exception_in(
            task,
            &ObservedError::new("TimeoutError", "upstream timed out"),
            &ErrorTraceOptions::new(),
            [("attempt", json!(3))],
        );
        assert_eq!(capture, Capture::Transaction);
        let result: Result<(), ObservedError> = agent
            .error_trace_in(task, ErrorTraceOptions::new())
            .finish(Err(ObservedError::new("IoError", "connection reset")));
        assert!(result.is_err());

        guard.transaction().with_aggregator(|agg| {
            assert_eq!(agg.errors().len(), 2);
            for record in agg.errors() {
                assert_eq!(
                    record.transaction_name(),
                    Some("OtherTransaction/Function/worker")
                );
                assert_eq!(record.intrinsics().guid.as_deref(), Some(guard.transaction().guid()));
            }
        });
        // the calling thread has no transaction of its own
        assert!(agent.current_transaction().is_none());
        guard.finish().expect("finish");
        assert_eq!(agent.harvest().swap_and_flush().error_events.len(), 2);
    }

    #[test]
    fn test_custom_event_after_finalize_goes_to_harvest() {
        let agent = Agent::new(Config::default());
        let txn = Arc::new(Transaction::web("/done", agent.config()));
        let _ = txn.finalize();
        assert!(agent.record_custom_event_for(Some(&txn), "Late", NO_PARAMS));
        let payload = agent.harvest().swap_and_flush();
        let event = &payload.custom_events.items()[0];
        assert_eq!(event.event_type(), "Late");
        assert!(event.intrinsics().transaction_id.is_none());
    }
}
