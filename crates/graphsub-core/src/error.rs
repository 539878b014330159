//! GraphQL error payloads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured GraphQL error.
///
/// This is the shape that travels inside `error` and `connection_error`
/// frames, and the error type returned by [`SubscriptionService`]
/// implementations.
///
/// [`SubscriptionService`]: crate::SubscriptionService
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct GraphQLError {
    /// Human-readable description of the failure.
    pub message: String,
    /// Optional machine-readable extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Map<String, serde_json::Value>>,
}

impl GraphQLError {
    /// Create an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            extensions: None,
        }
    }

    /// Wrap any standard error by its display message.
    pub fn from_std(err: &(dyn std::error::Error + '_)) -> Self {
        Self::new(err.to_string())
    }

    /// Attach an extension entry, keeping any existing ones.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }
}

impl From<&str> for GraphQLError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for GraphQLError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}
