//! Outbound responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;

/// Result of one dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    /// Bare acknowledgement
    Ok,
    /// Acknowledgement with a payload
    Dump {
        data: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        messages: Vec<String>,
    },
    Error(CommandError),
}

impl Response {
    /// Serialize `data` into a payload response.
    pub fn dump<T: Serialize>(data: &T) -> serde_json::Result<Self> {
        Ok(Response::Dump {
            data: serde_json::to_value(data)?,
            messages: Vec::new(),
        })
    }

    /// Attach informational messages to a payload response.
    pub fn with_messages(self, extra: Vec<String>) -> Self {
        match self {
            Response::Dump { data, mut messages } => {
                messages.extend(extra);
                Response::Dump { data, messages }
            }
            other => other,
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, Response::Error(_))
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Response::Dump { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CommandError> {
        match self {
            Response::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl From<Result<Response, CommandError>> for Response {
    fn from(result: Result<Response, CommandError>) -> Self {
        result.unwrap_or_else(Response::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_wire_shape() {
        assert_eq!(serde_json::to_value(Response::Ok).unwrap(), json!({"status": "OK"}));

        let dump = Response::dump(&vec!["a", "b"]).unwrap();
        assert_eq!(
            serde_json::to_value(&dump).unwrap(),
            json!({"status": "DUMP", "data": ["a", "b"]})
        );

        let err = Response::Error(CommandError::restricted("_private"));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], "ERROR");
        assert_eq!(value["command"], "_private");
        assert!(!err.is_ok());
    }

    #[test]
    fn test_messages_only_attach_to_dumps() {
        let dump = Response::dump(&"uuid").unwrap().with_messages(vec!["warn".to_string()]);
        assert!(matches!(dump, Response::Dump { ref messages, .. } if messages.len() == 1));
        assert_eq!(Response::Ok.with_messages(vec!["x".to_string()]), Response::Ok);
    }
}
