//! Helpers shared by the USB device stack crates.

mod logger;
pub mod timeout;

pub use logger::{file_level, output_level, setup_logging};
