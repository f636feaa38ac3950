//! Ambient utilities shared across the crate.

pub mod logger;

pub use logger::{dialog_span, setup_logging};
