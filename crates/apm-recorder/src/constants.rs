// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default limits for recorded telemetry.

/// Maximum length, in UTF-8 bytes, of an attribute key or event type.
pub const MAX_ATTRIBUTE_NAME_LENGTH: usize = 255;

/// Maximum length, in UTF-8 bytes, of a string attribute value. Longer
/// values are truncated.
pub const MAX_ATTRIBUTE_VALUE_LENGTH: usize = 255;

/// Maximum number of user attributes carried by a single record.
pub const MAX_USER_ATTRIBUTES: usize = 64;

pub const MAX_ERRORS_PER_TRANSACTION: usize = 20;
pub const MAX_ERRORS_PER_HARVEST: usize = 20;

pub const MAX_CUSTOM_EVENTS_PER_TRANSACTION: usize = 100;
pub const MAX_CUSTOM_EVENTS_PER_HARVEST: usize = 1200;

/// Seconds between two harvests.
pub const HARVEST_INTERVAL_SECS: u64 = 60;

pub const TRANSACTION_ERROR_EVENT_TYPE: &str = "TransactionError";

/// Class name recorded for a panic observed by an error trace.
pub const PANIC_CLASS_NAME: &str = "panic";

pub const WEB_TRANSACTION_PREFIX: &str = "WebTransaction/Uri";
pub const BACKGROUND_TRANSACTION_PREFIX: &str = "OtherTransaction/Function/";
