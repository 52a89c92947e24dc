//! Translatable messages and the wire-level command error.
//!
//! Messages are never formatted where they are raised. A [`TranslatableText`]
//! keeps the template and its arguments apart so the edge can look the
//! template up in a catalogue before substituting.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A message template with `{name}` placeholders and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatableText {
    /// Untranslated template, e.g. `Domain {domain} not found`
    #[serde(rename = "message_template")]
    pub template: String,
    /// Substitution values keyed by placeholder name
    #[serde(rename = "template_args", default)]
    pub args: BTreeMap<String, Value>,
}

impl TranslatableText {
    /// Create a text without arguments.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add (or replace) a substitution value.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Look up a substitution value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Substitute the arguments into the untranslated template.
    pub fn render(&self) -> String {
        self.render_with(|template| template.to_string())
    }

    /// Translate the template through `translate`, then substitute.
    ///
    /// Placeholders without a matching argument are kept verbatim.
    pub fn render_with<F>(&self, translate: F) -> String
    where
        F: Fn(&str) -> String,
    {
        let template = translate(&self.template);
        let mut out = String::with_capacity(template.len());
        let mut rest = template.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            match tail.find('}') {
                Some(close) => {
                    let name = &tail[1..close];
                    match self.args.get(name) {
                        Some(value) => out.push_str(&value_text(value)),
                        None => out.push_str(&tail[..=close]),
                    }
                    rest = &tail[close + 1..];
                }
                None => {
                    out.push_str(tail);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl fmt::Display for TranslatableText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

/// The only error type crossing the dispatcher boundary.
///
/// `text.args` always contains `command`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{command}: {text}")]
pub struct CommandError {
    /// Name of the command that failed
    pub command: String,
    #[serde(flatten)]
    pub text: TranslatableText,
}

impl CommandError {
    /// Create an error for `command` from an untranslated template.
    pub fn new(command: impl Into<String>, template: impl Into<String>) -> Self {
        Self::from_text(command, TranslatableText::new(template))
    }

    /// Tag an existing text with the originating command.
    pub fn from_text(command: impl Into<String>, text: TranslatableText) -> Self {
        let command = command.into();
        let text = text.arg("command", command.clone());
        Self { command, text }
    }

    /// Wrap a collaborator-reported message.
    ///
    /// The collaborator's template and arguments are preserved; `message`
    /// carries the rendered collaborator text.
    pub fn wrap(command: impl Into<String>, text: TranslatableText) -> Self {
        let message = text.render();
        Self::from_text(command, text.arg("message", message))
    }

    /// Add a substitution value.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.text = self.text.arg(name, value);
        self
    }

    pub fn unknown(command: impl Into<String>) -> Self {
        Self::new(command, "Unknown command {command}")
    }

    pub fn restricted(command: impl Into<String>) -> Self {
        Self::new(command, "Restricted command {command}")
    }

    pub fn template(&self) -> &str {
        &self.text.template
    }

    pub fn args(&self) -> &BTreeMap<String, Value> {
        &self.text.args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_substitutes_arguments() {
        let text = TranslatableText::new("Domain {domain} on {uri} has {count} disks")
            .arg("domain", "vm1")
            .arg("uri", "qemu://h1/system")
            .arg("count", 3);
        assert_eq!(text.render(), "Domain vm1 on qemu://h1/system has 3 disks");
    }

    #[test]
    fn test_render_keeps_unknown_placeholders() {
        let text = TranslatableText::new("{known} {unknown} {").arg("known", "x");
        assert_eq!(text.render(), "x {unknown} {");
    }

    #[test]
    fn test_render_with_catalogue() {
        let text = TranslatableText::new("Node {uri} is not available").arg("uri", "xen://h2/");
        let german = text.render_with(|t| match t {
            "Node {uri} is not available" => "Knoten {uri} ist nicht erreichbar".to_string(),
            other => other.to_string(),
        });
        assert_eq!(german, "Knoten xen://h2/ ist nicht erreichbar");
    }

    #[test]
    fn test_command_error_always_names_command() {
        let err = CommandError::new("NODE_ADD", "Something failed");
        assert_eq!(err.args().get("command"), Some(&json!("NODE_ADD")));

        let wrapped = CommandError::wrap(
            "DOMAIN_MIGRATE",
            TranslatableText::new("target full").arg("uri", "qemu://h1/system"),
        );
        assert_eq!(wrapped.template(), "target full");
        assert_eq!(wrapped.args().get("command"), Some(&json!("DOMAIN_MIGRATE")));
        assert_eq!(wrapped.args().get("message"), Some(&json!("target full")));
        assert_eq!(wrapped.args().get("uri"), Some(&json!("qemu://h1/system")));
    }

    #[test]
    fn test_command_error_wire_shape() {
        let err = CommandError::unknown("FOO");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["command"], "FOO");
        assert_eq!(value["message_template"], "Unknown command {command}");
        assert_eq!(value["template_args"]["command"], "FOO");
        assert_eq!(err.to_string(), "FOO: Unknown command FOO");
    }
}
