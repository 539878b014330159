//! Connection initialisation payloads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The payload a client attaches to its `connection_init` frame.
///
/// Typically carries authentication and session data. The transport decodes
/// it once during the init handshake and it is read-only from then on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InitPayload(HashMap<String, Value>);

impl InitPayload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a raw value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert an entry, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Look up a string value by key.
    ///
    /// Returns the empty string when the key is absent or the value is not a
    /// JSON string.
    pub fn get_string(&self, key: &str) -> String {
        match self.0.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// The authorization entry, wherever the client put it.
    ///
    /// Checks the canonical `Authorization` key first and falls back to the
    /// lowercase spelling. Returns the empty string when neither is present.
    pub fn authorization(&self) -> String {
        let value = self.get_string("Authorization");
        if !value.is_empty() {
            return value;
        }
        self.get_string("authorization")
    }

    /// Whether the payload has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries in the payload.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, Value)> for InitPayload {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<HashMap<String, Value>> for InitPayload {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}
