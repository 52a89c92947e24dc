//! Inbound requests: a command name plus command-specific fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `{command: string, <command-specific fields>}`
///
/// Fields are kept untyped until the command handler validates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// The `uri` field when it is a string, used to label log lines and
    /// timeout errors.
    pub fn uri(&self) -> Option<&str> {
        self.fields.get("uri").and_then(Value::as_str)
    }
}
