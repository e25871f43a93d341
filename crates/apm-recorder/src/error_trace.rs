// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture of errors observed while instrumented code runs.
//!
//! The recorder is transparent to the application: an `Err` handed to an
//! [`ErrorTrace`] or returned from a wrapped closure is given back unchanged,
//! and a panic is resumed with its original payload. Recording is only ever a
//! side effect.
//!
//! # Capture procedure
//!
//! 1. Resolve the class name and message of the error.
//! 2. Skip it entirely when the class is ignored, per call or by config.
//! 3. Flag it as expected when the class is expected, per call or by config.
//! 4. Build the intrinsics and validate user attributes, keeping whichever
//!    attributes pass.
//! 5. Attach the record to the active transaction, subject to the
//!    per-transaction cap, or hand it to the harvest aggregator when no
//!    transaction is active or the transaction has already finished.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::{Borrow, Cow};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::attribute::{process_user_attributes, Attributes, RawValue};
use crate::config::{ClassNameList, Config};
use crate::constants::{PANIC_CLASS_NAME, TRANSACTION_ERROR_EVENT_TYPE};
use crate::context::{ContextId, TransactionContext};
use crate::harvest::HarvestAggregator;
use crate::transaction::{Admission, Transaction};
use crate::util::unix_timestamp;

/// An error as seen by the recorder.
pub trait Exception: fmt::Display {
    /// Fully-qualified class name, matched against ignore and expected lists.
    fn class_name(&self) -> Cow<'_, str>;

    fn message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }
}

impl Exception for std::io::Error {
    fn class_name(&self) -> Cow<'_, str> {
        Cow::Borrowed("std::io::Error")
    }
}

/// Error already resolved by instrumentation into a class name and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedError {
    pub class: String,
    pub message: String,
}

impl ObservedError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        ObservedError {
            class: class.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl Exception for ObservedError {
    fn class_name(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.class)
    }

    fn message(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.message)
    }
}

/// A panic observed while an error trace was active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPanic {
    pub message: String,
}

impl CapturedPanic {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        CapturedPanic { message }
    }
}

impl fmt::Display for CapturedPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Exception for CapturedPanic {
    fn class_name(&self) -> Cow<'_, str> {
        Cow::Borrowed(PANIC_CLASS_NAME)
    }
}

/// Agent assigned fields of an error record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorIntrinsics {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "error.class")]
    pub error_class: String,
    #[serde(rename = "error.message")]
    pub error_message: String,
    #[serde(rename = "error.expected")]
    pub expected: bool,
    #[serde(rename = "transactionName")]
    pub transaction_name: Option<String>,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampled: Option<bool>,
}

impl ErrorIntrinsics {
    pub fn new(
        error_class: impl Into<String>,
        error_message: impl Into<String>,
        expected: bool,
        transaction_name: Option<String>,
    ) -> Self {
        ErrorIntrinsics {
            event_type: TRANSACTION_ERROR_EVENT_TYPE.to_string(),
            error_class: error_class.into(),
            error_message: error_message.into(),
            expected,
            transaction_name,
            timestamp: unix_timestamp(),
            guid: None,
            priority: None,
            sampled: None,
        }
    }

    fn for_transaction(mut self, transaction: &Transaction, distributed_tracing: bool) -> Self {
        self.guid = Some(transaction.guid().to_string());
        if distributed_tracing {
            self.priority = Some(transaction.priority());
            self.sampled = Some(transaction.sampled());
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<String>>,
}

/// A recorded error.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    intrinsics: ErrorIntrinsics,
    user_attributes: Attributes,
    agent_attributes: AgentAttributes,
}

impl ErrorRecord {
    pub fn new(
        intrinsics: ErrorIntrinsics,
        user_attributes: Attributes,
        stack_trace: Option<Vec<String>>,
    ) -> Self {
        ErrorRecord {
            intrinsics,
            user_attributes,
            agent_attributes: AgentAttributes { stack_trace },
        }
    }

    pub fn intrinsics(&self) -> &ErrorIntrinsics {
        &self.intrinsics
    }

    pub fn user_attributes(&self) -> &Attributes {
        &self.user_attributes
    }

    pub fn stack_trace(&self) -> Option<&[String]> {
        self.agent_attributes.stack_trace.as_deref()
    }

    pub fn error_class(&self) -> &str {
        &self.intrinsics.error_class
    }

    pub fn error_message(&self) -> &str {
        &self.intrinsics.error_message
    }

    pub fn transaction_name(&self) -> Option<&str> {
        self.intrinsics.transaction_name.as_deref()
    }

    pub fn is_expected(&self) -> bool {
        self.intrinsics.expected
    }

    /// Strips the identity of a transaction that finished before the record
    /// could be attached to it.
    pub(crate) fn without_transaction(mut self) -> Self {
        self.intrinsics.transaction_name = None;
        self.intrinsics.guid = None;
        self.intrinsics.priority = None;
        self.intrinsics.sampled = None;
        self
    }
}

impl Serialize for ErrorRecord {
    /// Serialized as `[intrinsics, user_attributes, agent_attributes]`.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            &self.intrinsics,
            &self.user_attributes,
            &self.agent_attributes,
        )
            .serialize(serializer)
    }
}

/// Per call-site class name lists, applied on top of the configured ones.
#[derive(Debug, Clone, Default)]
pub struct ErrorTraceOptions {
    pub ignore_errors: ClassNameList,
    pub expected_errors: ClassNameList,
}

impl ErrorTraceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore(mut self, class_name: impl Into<String>) -> Self {
        self.ignore_errors.insert(class_name);
        self
    }

    pub fn expect(mut self, class_name: impl Into<String>) -> Self {
        self.expected_errors.insert(class_name);
        self
    }
}

/// Outcome of a capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Attached to the owning transaction.
    Transaction,
    /// Handed to the harvest aggregator; no transaction was active.
    Harvest,
    Ignored,
    /// The per-transaction cap was reached or the transaction had finished.
    Dropped,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ErrorRecorder {
    config: Arc<Config>,
    context: Arc<TransactionContext>,
    harvest: Arc<HarvestAggregator>,
}

impl ErrorRecorder {
    pub fn new(
        config: Arc<Config>,
        context: Arc<TransactionContext>,
        harvest: Arc<HarvestAggregator>,
    ) -> Self {
        ErrorRecorder {
            config,
            context,
            harvest,
        }
    }

    /// Starts an error trace bound to the current thread's transaction.
    pub fn error_trace(&self, options: ErrorTraceOptions) -> ErrorTrace {
        self.error_trace_for(self.context.current(), options)
    }

    pub fn error_trace_in(&self, context: ContextId, options: ErrorTraceOptions) -> ErrorTrace {
        self.error_trace_for(self.context.current_in(context), options)
    }

    pub fn error_trace_for(
        &self,
        transaction: Option<Arc<Transaction>>,
        options: ErrorTraceOptions,
    ) -> ErrorTrace {
        ErrorTrace {
            recorder: self.clone(),
            transaction,
            options,
            finished: false,
        }
    }

    /// Runs `f`, recording an `Err` it returns or a panic it raises, and
    /// hands the outcome back unchanged.
    pub fn wrap<T, E, F>(&self, options: ErrorTraceOptions, f: F) -> Result<T, E>
    where
        E: Exception,
        F: FnOnce() -> Result<T, E>,
    {
        let trace = self.error_trace(options);
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => trace.finish(result),
            Err(payload) => {
                trace.capture_panic(&*payload);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Records `error` against the current thread's transaction, or against
    /// the harvest when none is active.
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
        let transaction = self.context.current();
        self.record_for(transaction.as_ref(), error, options, params)
    }

    /// Like [`ErrorRecorder::record_exception`], for the transaction active
    /// in `context`.
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
        let transaction = self.context.current_in(context);
        self.record_for(transaction.as_ref(), error, options, params)
    }

    pub fn record_for<I, K, V>(
        &self,
        transaction: Option<&Arc<Transaction>>,
        error: &dyn Exception,
        options: &ErrorTraceOptions,
        params: I,
    ) -> Capture
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<RawValue>,
    {
        if !self.config.error_collector_enabled {
            return Capture::Disabled;
        }

        let class_name = error.class_name();
        if options.ignore_errors.contains(&class_name)
            || self.config.ignore_errors.contains(&class_name)
        {
            debug!("Ignoring error of class {class_name}");
            return Capture::Ignored;
        }
        let expected = options.expected_errors.contains(&class_name)
            || self.config.expected_errors.contains(&class_name);

        let transaction = transaction.filter(|t| !t.is_finalized());
        let mut intrinsics = ErrorIntrinsics::new(
            &*class_name,
            error.message(),
            expected,
            transaction.map(|t| t.name().to_string()),
        );
        if let Some(txn) = transaction {
            intrinsics = intrinsics.for_transaction(txn, self.config.distributed_tracing_enabled);
        }

        let user_attributes =
            process_user_attributes("error", params, self.config.max_user_attributes);
        let stack_trace = self
            .config
            .capture_stack_traces
            .then(capture_stack_trace)
            .flatten();
        let record = ErrorRecord::new(intrinsics, user_attributes, stack_trace);

        let record = match transaction {
            Some(txn) => match txn.add_error(record) {
                Admission::Accepted => return Capture::Transaction,
                Admission::OverLimit => return Capture::Dropped,
                // finished between the check above and the add
                Admission::Finalized(record) => record.without_transaction(),
            },
            None => record,
        };
        self.harvest.add_error(record);
        Capture::Harvest
    }
}

fn capture_stack_trace() -> Option<Vec<String>> {
    let backtrace = Backtrace::capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return None;
    }
    Some(
        backtrace
            .to_string()
            .lines()
            .map(|line| line.trim().to_string())
            .collect(),
    )
}

const NO_PARAMS: [(&str, RawValue); 0] = [];

/// Scoped error capture.
///
/// [`ErrorTrace::finish`] records an `Err` and returns the result unchanged.
/// Dropping the guard during a panic records the panic; dropping it in any
/// other situation records nothing.
#[must_use = "an error trace records nothing unless finished or unwound"]
pub struct ErrorTrace {
    recorder: ErrorRecorder,
    transaction: Option<Arc<Transaction>>,
    options: ErrorTraceOptions,
    finished: bool,
}

impl ErrorTrace {
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    pub fn finish<T, E: Exception>(mut self, result: Result<T, E>) -> Result<T, E> {
        self.finished = true;
        if let Err(error) = &result {
            self.capture(error);
        }
        result
    }

    fn capture(&self, error: &dyn Exception) -> Capture {
        self.recorder
            .record_for(self.transaction.as_ref(), error, &self.options, NO_PARAMS)
    }

    fn capture_panic(mut self, payload: &(dyn Any + Send)) {
        self.finished = true;
        self.capture(&CapturedPanic::from_payload(payload));
    }
}

impl Drop for ErrorTrace {
    fn drop(&mut self) {
        if !self.finished && std::thread::panicking() {
            self.capture(&CapturedPanic {
                message: "panic while an error trace was active".to_string(),
            });
        }
    }
}
