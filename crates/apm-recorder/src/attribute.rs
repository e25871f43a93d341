// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Validation and normalization of user supplied attribute names and values.
//!
//! Instrumentation hands over attributes as [`RawValue`]s (arbitrary JSON
//! values). Everything past this module only ever sees an [`AttributeValue`],
//! which is limited to the scalar types the collector accepts.
//!
//! Rejections are expected outcomes: they are reported as a [`Rejection`],
//! logged at debug level, and the offending attribute is dropped. They never
//! reach the instrumented application.

use std::borrow::Borrow;
use std::sync::OnceLock;

use regex::Regex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::debug;

use crate::constants::{MAX_ATTRIBUTE_NAME_LENGTH, MAX_ATTRIBUTE_VALUE_LENGTH};

/// Dynamic attribute value as received from instrumentation.
pub type RawValue = serde_json::Value;

/// A validated attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, derive_more::Display)]
#[serde(untagged)]
pub enum AttributeValue {
    #[display("{_0}")]
    Bool(bool),
    #[display("{_0}")]
    Int(i64),
    #[display("{_0}")]
    Float(f64),
    #[display("{_0}")]
    Str(String),
}

/// Reason an attribute, or an event type, was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("name is not a string")]
    NameNotString,
    #[error("name is empty")]
    NameEmpty,
    #[error("name exceeds {} bytes", MAX_ATTRIBUTE_NAME_LENGTH)]
    NameTooLong,
    #[error("name contains invalid characters")]
    InvalidCharacters,
    #[error("value type is not supported")]
    UnsupportedType,
    #[error("integer value does not fit in 64 bits")]
    IntTooLarge,
}

#[allow(clippy::expect_used)]
fn event_type_regex() -> &'static Regex {
    static EVENT_TYPE_VALID_CHARS: OnceLock<Regex> = OnceLock::new();
    EVENT_TYPE_VALID_CHARS
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9:_ ]+$").expect("event type pattern is valid"))
}

/// Checks that `name` is usable as an attribute key or event type.
pub fn check_name(name: &str) -> Result<(), Rejection> {
    if name.is_empty() {
        return Err(Rejection::NameEmpty);
    }
    if name.len() > MAX_ATTRIBUTE_NAME_LENGTH {
        return Err(Rejection::NameTooLong);
    }
    Ok(())
}

pub fn check_event_type_chars(name: &str) -> Result<(), Rejection> {
    if event_type_regex().is_match(name) {
        Ok(())
    } else {
        Err(Rejection::InvalidCharacters)
    }
}

/// Returns the longest prefix of `value` that fits in `max_bytes` without
/// splitting a character.
pub fn truncate(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Coerces a raw value into an [`AttributeValue`].
///
/// Scalars map directly. Arrays and objects are kept as their JSON text.
/// `null` and integers outside the `i64` range are rejected.
pub fn sanitize(value: &RawValue) -> Result<AttributeValue, Rejection> {
    match value {
        RawValue::Bool(b) => Ok(AttributeValue::Bool(*b)),
        RawValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(AttributeValue::Int(i))
            } else if n.is_u64() {
                Err(Rejection::IntTooLarge)
            } else {
                n.as_f64()
                    .map(AttributeValue::Float)
                    .ok_or(Rejection::UnsupportedType)
            }
        }
        RawValue::String(s) => Ok(AttributeValue::Str(
            truncate(s, MAX_ATTRIBUTE_VALUE_LENGTH).to_string(),
        )),
        RawValue::Array(_) | RawValue::Object(_) => Ok(AttributeValue::Str(
            truncate(&value.to_string(), MAX_ATTRIBUTE_VALUE_LENGTH).to_string(),
        )),
        RawValue::Null => Err(Rejection::UnsupportedType),
    }
}

/// Validates a user attribute. Rejections are logged and returned.
pub fn process_user_attribute(
    name: &str,
    value: &RawValue,
) -> Result<(String, AttributeValue), Rejection> {
    let result = check_name(name).and_then(|()| sanitize(value));
    match result {
        Ok(value) => Ok((name.to_string(), value)),
        Err(rejection) => {
            debug!("Dropping attribute {name:?}={value}: {rejection}");
            Err(rejection)
        }
    }
}

/// Like [`process_user_attribute`] for callers that hand over the name as a
/// raw value as well.
pub fn process_json_attribute(
    name: &RawValue,
    value: &RawValue,
) -> Result<(String, AttributeValue), Rejection> {
    match name.as_str() {
        Some(name) => process_user_attribute(name, value),
        None => {
            debug!("Attribute name must be a string. Dropping attribute: {name}");
            Err(Rejection::NameNotString)
        }
    }
}

/// Validates a custom event type. Returns `None`, after logging, when the
/// type is unusable and the event must be dropped.
pub fn process_event_type(name: &str) -> Option<String> {
    match check_name(name).and_then(|()| check_event_type_chars(name)) {
        Ok(()) => Some(name.to_string()),
        Err(rejection) => {
            debug!("Invalid event type, dropping event {name:?}: {rejection}");
            None
        }
    }
}

/// Insertion-ordered attribute set with unique keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: Vec<(String, AttributeValue)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `key`. Returns `false` when `key` is new and the
    /// set already holds `max` entries, in which case nothing is stored.
    pub fn insert_capped(&mut self, key: String, value: AttributeValue, max: usize) -> bool {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            return true;
        }
        if self.entries.len() >= max {
            return false;
        }
        self.entries.push((key, value));
        true
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl Serialize for Attributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Validates every `(name, value)` pair of `params` into a new attribute set
/// holding at most `max` entries. Invalid pairs and pairs beyond the cap are
/// dropped individually; `owner` only appears in the diagnostic logs.
pub fn process_user_attributes<I, K, V>(owner: &str, params: I, max: usize) -> Attributes
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Borrow<RawValue>,
{
    let mut attributes = Attributes::new();
    for (name, value) in params {
        let name = name.as_ref();
        let Ok((key, value)) = process_user_attribute(name, value.borrow()) else {
            continue;
        };
        if !attributes.insert_capped(key, value, max) {
            debug!(
                "Maximum number of attributes already added to {owner}. Dropping attribute: {name:?}"
            );
        }
    }
    attributes
}
