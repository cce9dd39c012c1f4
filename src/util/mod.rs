//! Utility functions for common operations.
//!
//! - **URL validation**: scheme checks and an optional SSRF guard
//! - **Text sanitizing**: control-character removal for feed-supplied names
//! - **Files**: logged removal of downloaded enclosures

mod fs;
mod text;
mod url_validator;

pub use fs::discard_file;
pub use text::strip_control_chars;
pub use url_validator::{validate_feed_url, UrlValidationError};
