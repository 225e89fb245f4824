//! # File Logger
//!
//! Installs a `fern` dispatcher that writes every record to stdout and to a
//! timestamped file `<app>_<YYYY-mm-dd_HH-MM-SS>.log` in the log directory.
//!
//! On startup, older log files of the same application are pruned so that
//! only the newest previous run is kept next to the new file.
//!
//! Line format: `[2025-01-31 12:00:00][target][LEVEL] message`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

/// Maps a level name to a filter. Unknown names fall back to `Info`.
pub fn parse_level(level: &str) -> log::LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

fn log_file_name(app_name: &str) -> String {
    format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"))
}

/// # Setup Logging
///
/// Creates `log_dir` if needed, prunes old files and installs the global
/// logger. Returns the path of the new log file.
///
/// # Errors
/// The directory or file cannot be created, or a global logger is already set.
pub fn setup_logging(log_dir: &Path, app_name: &str, level: &str) -> Result<PathBuf> {
    fs::create_dir_all(log_dir).with_context(|| format!("creating log directory {}", log_dir.display()))?;

    rotate_logs(log_dir, app_name, 1)?;

    let log_path = log_dir.join(log_file_name(app_name));

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(level))
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path).with_context(|| format!("opening log file {}", log_path.display()))?)
        .apply()
        .context("installing the global logger")?;

    Ok(log_path)
}

/// Deletes all but the `keep` most recent `<app_name>_*.log` files in
/// `log_dir`. Returns how many files were removed. Files that cannot be
/// removed are reported on stderr and skipped.
pub fn rotate_logs(log_dir: &Path, app_name: &str, keep: usize) -> Result<usize> {
    let prefix = format!("{}_", app_name);

    let mut entries: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)
        .with_context(|| format!("reading log directory {}", log_dir.display()))?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".log")
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first; the name carries the timestamp, so it breaks ties.
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            // The logger is not installed yet, so this goes to stderr.
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}
