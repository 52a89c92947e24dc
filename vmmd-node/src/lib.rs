//! # vmmd Node
//!
//! The command layer of the daemon: the single boundary between inbound
//! requests and the node/storage collaborators.
//!
//! ```text
//! Request ──▶ Server::dispatch ──▶ CommandRegistry ──▶ handler
//!                                                        │ validate fields
//!                                                        ▼
//!                                          NodeBackend / StorageBackend
//!                                                        │
//! Response ◀── Ok / Dump / Error(CommandError) ◀─────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmmd_node::{Config, Server};
//! use vmmd_proto::Request;
//!
//! let server = Server::from_config(&Config::load("/etc/vmmd/vmmd.yaml")?);
//! let response = server.handle(&Request::new("NODE_ADD").with("uri", "qemu:///system")).await;
//! ```

pub mod commands;
pub mod config;
pub mod server;
pub mod validate;

pub use commands::{CommandRegistry, Handler, COMMANDS};
pub use config::Config;
pub use server::Server;
pub use validate::Fields;
