//! # Loggers Module
//!
//! Process-wide logging setup on top of the `log` facade.

/// `fern` dispatch to stdout and a rotated, timestamped log file.
pub mod file_logger;

pub use file_logger::{parse_level, setup_logging};
