// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Borrow;

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::attribute::{process_event_type, process_user_attributes, Attributes, RawValue};
use crate::transaction::Transaction;
use crate::util::unix_timestamp;

/// Agent assigned fields of a custom event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventIntrinsics {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: f64,
    #[serde(rename = "transactionId", skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampled: Option<bool>,
}

/// A validated custom event. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    intrinsics: EventIntrinsics,
    attributes: Attributes,
}

impl CustomEvent {
    pub fn intrinsics(&self) -> &EventIntrinsics {
        &self.intrinsics
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn event_type(&self) -> &str {
        &self.intrinsics.event_type
    }

    pub(crate) fn without_transaction(mut self) -> Self {
        self.intrinsics.transaction_id = None;
        self.intrinsics.priority = None;
        self.intrinsics.sampled = None;
        self
    }
}

impl Serialize for CustomEvent {
    /// Serialized as `[intrinsics, attributes]`.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.intrinsics, &self.attributes).serialize(serializer)
    }
}

/// Creates a custom event outside of any transaction.
///
/// Returns `None` when `event_type` is invalid. Invalid attributes, and valid
/// ones past `max_attributes`, are dropped individually; the first
/// `max_attributes` valid entries of `params`, in iteration order, are kept.
pub fn create_custom_event<I, K, V>(
    event_type: &str,
    params: I,
    max_attributes: usize,
) -> Option<CustomEvent>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Borrow<RawValue>,
{
    build(event_type, params, max_attributes, None, false)
}

/// Like [`create_custom_event`], stamping the event with the identity of
/// `transaction`, and with its sampling decision when distributed tracing is
/// enabled.
pub fn create_transaction_custom_event<I, K, V>(
    transaction: &Transaction,
    event_type: &str,
    params: I,
    max_attributes: usize,
    distributed_tracing: bool,
) -> Option<CustomEvent>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Borrow<RawValue>,
{
    build(
        event_type,
        params,
        max_attributes,
        Some(transaction),
        distributed_tracing,
    )
}

/// Entry point for callers holding the event type as a raw value.
pub fn create_custom_event_from_json(
    event_type: &RawValue,
    params: &serde_json::Map<String, RawValue>,
    max_attributes: usize,
) -> Option<CustomEvent> {
    let Some(event_type) = event_type.as_str() else {
        debug!("Event type must be a string. Dropping event: {event_type}");
        return None;
    };
    create_custom_event(event_type, params, max_attributes)
}

fn build<I, K, V>(
    event_type: &str,
    params: I,
    max_attributes: usize,
    transaction: Option<&Transaction>,
    distributed_tracing: bool,
) -> Option<CustomEvent>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Borrow<RawValue>,
{
    let event_type = process_event_type(event_type)?;
    let attributes = process_user_attributes(
        &format!("event {event_type:?}"),
        params,
        max_attributes,
    );

    let dt = transaction.filter(|_| distributed_tracing);
    let intrinsics = EventIntrinsics {
        event_type,
        timestamp: unix_timestamp(),
        transaction_id: transaction.map(|t| t.guid().to_string()),
        priority: dt.map(Transaction::priority),
        sampled: dt.map(Transaction::sampled),
    };

    Some(CustomEvent {
        intrinsics,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeValue;
    use crate::config::Config;
    use serde_json::json;
    use tracing_test::traced_test;

    const NO_PARAMS: [(&str, RawValue); 0] = [];

    #[test]
    fn test_create_custom_event() {
        let params = json!({"user": "alice", "amount": 12.5, "count": 3, "vip": true});
        let event = create_custom_event("Purchase", params.as_object().unwrap(), 64)
            .expect("valid event");
        assert_eq!(event.event_type(), "Purchase");
        assert!(event.intrinsics().timestamp > 0.0);
        assert!(event.intrinsics().transaction_id.is_none());
        assert_eq!(
            event.attributes().get("user"),
            Some(&AttributeValue::Str("alice".to_string()))
        );
        assert_eq!(event.attributes().get("count"), Some(&AttributeValue::Int(3)));
        assert_eq!(event.attributes().len(), 4);
    }

    #[test]
    #[traced_test]
    fn test_invalid_event_type_drops_event() {
        assert!(create_custom_event("bad/type", NO_PARAMS, 64).is_none());
        assert!(logs_contain("Invalid event type"));
        assert!(create_custom_event(&"a".repeat(256), NO_PARAMS, 64).is_none());
    }

    #[test]
    fn test_invalid_attributes_dropped_individually() {
        let long_name = "k".repeat(256);
        let params = vec![
            ("good", json!("yes")),
            ("", json!("empty name")),
            ("nothing", json!(null)),
            ("huge", json!(u64::MAX)),
            (long_name.as_str(), json!(1)),
        ];
        let event = create_custom_event("Test", params, 64).expect("valid event");
        assert_eq!(event.attributes().keys().collect::<Vec<_>>(), vec!["good"]);
    }

    #[test]
    #[traced_test]
    fn test_attribute_cap_keeps_first_in_iteration_order() {
        let params: Vec<(String, RawValue)> =
            (0..100).map(|i| (format!("attr{i:03}"), json!(i))).collect();
        let event = create_custom_event("Capped", params, 64).expect("valid event");
        assert_eq!(event.attributes().len(), 64);
        let expected: Vec<String> = (0..64).map(|i| format!("attr{i:03}")).collect();
        assert_eq!(event.attributes().keys().collect::<Vec<_>>(), expected);
        assert!(logs_contain("Maximum number of attributes already added"));
    }

    #[test]
    fn test_attribute_cap_follows_insertion_order_not_sorted_order() {
        let params: Vec<(String, RawValue)> =
            (0..10).rev().map(|i| (format!("k{i}"), json!(i))).collect();
        let event = create_custom_event("Ordered", params, 3).expect("valid event");
        assert_eq!(
            event.attributes().keys().collect::<Vec<_>>(),
            vec!["k9", "k8", "k7"]
        );
    }

    #[test]
    fn test_from_json_requires_string_type() {
        let params = json!({"a": 1});
        let params = params.as_object().unwrap();
        assert!(create_custom_event_from_json(&json!(5), params, 64).is_none());
        assert!(create_custom_event_from_json(&json!("Ok"), params, 64).is_some());
    }

    #[test]
    fn test_transaction_event_intrinsics() {
        let txn = Transaction::web("/checkout", &Config::default()).with_sampling(true, 1.25);
        let event = create_transaction_custom_event(&txn, "Checkout", NO_PARAMS, 64, true)
            .expect("valid event");
        assert_eq!(event.intrinsics().transaction_id.as_deref(), Some(txn.guid()));
        assert_eq!(event.intrinsics().priority, Some(1.25));
        assert_eq!(event.intrinsics().sampled, Some(true));

        let event = create_transaction_custom_event(&txn, "Checkout", NO_PARAMS, 64, false)
            .expect("valid event");
        assert_eq!(event.intrinsics().transaction_id.as_deref(), Some(txn.guid()));
        assert!(event.intrinsics().priority.is_none());
    }

    #[test]
    fn test_serialize_as_pair() {
        let event =
            create_custom_event("Pair", [("a", json!(1))], 64).expect("valid event");
        let value = serde_json::to_value(&event).expect("serialize");
        let pair = value.as_array().expect("array");
        assert_eq!(pair.len(), 2);
        assert_eq!(pair[0]["type"], "Pair");
        assert!(pair[0].get("transactionId").is_none());
        assert_eq!(pair[1], json!({"a": 1}));
    }
}
