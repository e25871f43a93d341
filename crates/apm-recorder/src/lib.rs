// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction and event recording core of an APM agent.
//!
//! Instrumentation hooks open transactions through the [`Agent`], record
//! custom events and errors against them, and a [`Harvester`] periodically
//! ships a bounded, sampled aggregate of everything recorded to a
//! [`HarvestSink`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod attribute;
pub mod config;
pub mod constants;
pub mod context;
pub mod custom_event;
pub mod error_trace;
pub mod errors;
pub mod flusher;
pub mod harvest;
pub mod logger;
pub mod transaction;
mod util;

pub use agent::Agent;
pub use attribute::{AttributeValue, Attributes};
pub use config::Config;
pub use context::{ContextId, TransactionContext};
pub use custom_event::{create_custom_event, CustomEvent};
pub use error_trace::{
    Capture, ErrorRecord, ErrorRecorder, ErrorTrace, ErrorTraceOptions, Exception, ObservedError,
};
pub use errors::{ConfigError, ContextError, SinkError};
pub use flusher::{HarvestSink, Harvester};
pub use harvest::{HarvestAggregator, HarvestPayload, SampledBuffer};
pub use transaction::{Admission, Transaction, TransactionGuard};
