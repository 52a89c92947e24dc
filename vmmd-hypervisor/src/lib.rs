//! # vmmd Hypervisor
//!
//! Everything between the command layer and a hypervisor host:
//!
//! - **Descriptors**: libvirt domain XML into [`vmmd_proto::Domain`] and back
//! - **Capabilities**: host capability XML into domain templates
//! - **Collaborators**: the [`NodeBackend`] and [`StorageBackend`] traits
//!   the command layer calls, plus an in-memory [`MockBackend`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      NodeBackend / StorageBackend       │
//! │  (node_add, domain_state, migrate ...)  │
//! └─────────────────────┬───────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────┐
//! │              MockBackend                │
//! │  descriptors ──parse──▶ NodeSnapshot    │
//! │                 (published via NodeCell)│
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmmd_hypervisor::{parse_domain, ParserOptions};
//!
//! let domain = parse_domain(&xml, &ParserOptions::default())?;
//! println!("{} has {} disks", domain.name, domain.disks.len());
//! ```

pub mod capabilities;
pub mod descriptor;
pub mod error;
pub mod mock;
pub mod snapshot;
pub mod traits;
mod tree;
pub mod xml;

pub use capabilities::parse_capabilities;
pub use descriptor::{parse_domain, platform_arch, ParserOptions};
pub use error::{DescriptorError, NodeError, NodeErrorKind};
pub use mock::MockBackend;
pub use snapshot::NodeCell;
pub use traits::{CloneSubstitutions, NodeBackend, StorageBackend};
pub use xml::DomainXmlBuilder;
