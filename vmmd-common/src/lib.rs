//! # vmmd Common
//!
//! Shared utilities for the vmmd crates.
//!
//! ```rust,ignore
//! use vmmd_common::{init_logging, default_keymap};
//!
//! init_logging("info").unwrap();
//! let keymap = default_keymap();
//! ```

pub mod locale;
pub mod logging;

pub use locale::{default_keymap, keymap_from_locale, FALLBACK_KEYMAP};
pub use logging::{init_logging, init_logging_json, init_test_logging};
