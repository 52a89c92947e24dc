//! Error types for the hypervisor collaborator layer.

use serde_json::Value;
use thiserror::Error;
use vmmd_proto::TranslatableText;

/// Category of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    AlreadyConnected,
    NotConnected,
    /// Node is known but currently unreachable
    Unavailable,
    UnknownDomain,
    DomainExists,
    /// Requested transition is not possible from the current state
    InvalidState,
    InvalidDefinition,
    Snapshot,
    Storage,
    Migration,
    /// Failure reported by the hypervisor itself
    Backend,
}

/// Failure reported by a node or storage collaborator.
///
/// The message stays a template so the command layer can hand it to the
/// caller untranslated.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{text}")]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub text: TranslatableText,
}

impl NodeError {
    /// A plain backend error whose template is `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(NodeErrorKind::Backend, message)
    }

    pub fn with_kind(kind: NodeErrorKind, template: impl Into<String>) -> Self {
        Self {
            kind,
            text: TranslatableText::new(template),
        }
    }

    /// Add a substitution value.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.text = self.text.arg(name, value);
        self
    }

    pub fn already_connected(uri: &str) -> Self {
        Self::with_kind(
            NodeErrorKind::AlreadyConnected,
            "Hypervisor \"{uri}\" is already connected.",
        )
        .arg("uri", uri)
    }

    pub fn not_connected(uri: &str) -> Self {
        Self::with_kind(NodeErrorKind::NotConnected, "Hypervisor \"{uri}\" is not connected.")
            .arg("uri", uri)
    }

    pub fn unavailable(uri: &str) -> Self {
        Self::with_kind(NodeErrorKind::Unavailable, "Hypervisor \"{uri}\" is not available.")
            .arg("uri", uri)
    }

    pub fn unknown_domain(uri: &str, domain: &str) -> Self {
        Self::with_kind(
            NodeErrorKind::UnknownDomain,
            "Domain \"{domain}\" not found on \"{uri}\"",
        )
        .arg("uri", uri)
        .arg("domain", domain)
    }

    pub fn domain_exists(domain: &str, uuid: &str) -> Self {
        Self::with_kind(
            NodeErrorKind::DomainExists,
            "Domain \"{domain}\" already exists: {uuid}",
        )
        .arg("domain", domain)
        .arg("uuid", uuid)
    }

    pub fn unsupported_transition(cur_state: &str, next_state: &str) -> Self {
        Self::with_kind(
            NodeErrorKind::InvalidState,
            "Unsupported state transition {cur_state} to {next_state}",
        )
        .arg("cur_state", cur_state)
        .arg("next_state", next_state)
    }

    pub fn is_kind(&self, kind: NodeErrorKind) -> bool {
        self.kind == kind
    }
}

/// Result type alias for collaborator operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Failure to turn a descriptor document into a value object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// The document is not well-formed XML.
    #[error("Malformed descriptor at byte {position}: {message}")]
    Malformed { position: usize, message: String },

    /// The document has no root element.
    #[error("Empty descriptor")]
    Empty,

    #[error("Unexpected root element <{found}>, expected <{expected}>")]
    UnexpectedRoot { found: String, expected: &'static str },

    #[error("Element <{0}> is never closed")]
    UnclosedElement(String),

    #[error("Unsupported domain type \"{found}\" in domain {domain}")]
    UnsupportedDomainType { found: String, domain: String },

    #[error("Invalid value \"{value}\" for {element}@{attribute} in domain {domain}")]
    InvalidValue {
        element: &'static str,
        attribute: &'static str,
        value: String,
        domain: String,
    },
}

impl From<DescriptorError> for NodeError {
    fn from(err: DescriptorError) -> Self {
        NodeError::with_kind(NodeErrorKind::InvalidDefinition, "Invalid descriptor: {error}")
            .arg("error", err.to_string())
    }
}
