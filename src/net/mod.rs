//! HTTP access with retries, size limits and cooperative cancellation.

mod loader;

pub use loader::{LoadError, Loader};
