//! # vmmd Protocol
//!
//! The typed request/response/error vocabulary shared by every command:
//!
//! - [`model`]: normalized value objects (`Domain`, `NodeSnapshot`, ...)
//! - [`request`]: inbound `{command, <fields>}` requests
//! - [`response`]: acknowledgements, payload dumps and errors
//! - [`error`]: translatable message templates and [`CommandError`]
//!
//! Nothing in this crate performs I/O; all values are plain data.

pub mod error;
pub mod model;
pub mod request;
pub mod response;

pub use error::{CommandError, TranslatableText};
pub use model::*;
pub use request::Request;
pub use response::Response;
