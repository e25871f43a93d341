// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Misuse of the transaction context by the calling instrumentation.
///
/// These are contract violations in the hook code, so they are returned to
/// the caller instead of being logged and swallowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("transaction {active} is already active in execution context {context}")]
    AlreadyActive { context: String, active: String },

    #[error("no transaction is active in execution context {context}")]
    NotActive { context: String },

    #[error("cannot exit transaction {exiting}: transaction {active} is active in execution context {context}")]
    Mismatch {
        context: String,
        active: String,
        exiting: String,
    },
}

/// Failure reported by a [`crate::flusher::HarvestSink`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The payload may be sent again on the next harvest.
    #[error("retryable sink failure: {0}")]
    Retryable(String),

    /// The payload must be dropped.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_error_display() {
        let error = ContextError::AlreadyActive {
            context: "thread:ThreadId(1)".to_string(),
            active: "abc".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "transaction abc is already active in execution context thread:ThreadId(1)"
        );
    }

    #[test]
    fn test_sink_error_display() {
        let error = SinkError::Retryable("503".into());
        assert_eq!(error.to_string(), "retryable sink failure: 503");
        let error = SinkError::Permanent("413".into());
        assert_eq!(error.to_string(), "permanent sink failure: 413");
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Invalid("harvest interval must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: harvest interval must be positive"
        );
    }
}
