//! Display helpers.

pub mod format;

pub use format::{format_countdown, format_timestamp};
