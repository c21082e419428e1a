// src/logging.rs
//
// Timestamped logging to stderr and an optional log file, filtered by the
// level and per-module switches from logging.json.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use once_cell::sync::Lazy;

use crate::config::types::{LogLevel, LoggingConfig};

/// Global log file handle. When `Some`, `tlog!` writes to both stderr and this file.
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Active filter, swapped whenever logging.json changes.
struct LogFilter {
    level: LogLevel,
    modules: HashMap<String, bool>,
    full_timestamps: bool,
}

static LOG_FILTER: Lazy<RwLock<LogFilter>> = Lazy::new(|| {
    RwLock::new(LogFilter {
        level: LogLevel::Info,
        modules: HashMap::new(),
        full_timestamps: false,
    })
});

/// Apply a logging configuration. Called at startup and after every
/// successful `update_logging_config` mutation.
pub fn configure(cfg: &LoggingConfig) {
    if let Ok(mut filter) = LOG_FILTER.write() {
        filter.level = cfg.level;
        filter.modules = cfg.modules.clone();
        filter.full_timestamps = cfg.rtc_timestamps;
    }
}

/// Whether a message at `level` from `module` should be emitted.
/// Modules absent from the map are enabled.
pub fn enabled(level: LogLevel, module: &str) -> bool {
    match LOG_FILTER.read() {
        Ok(filter) => level <= filter.level && *filter.modules.get(module).unwrap_or(&true),
        Err(_) => true,
    }
}

/// Format the timestamp prefix. `HH:MM:SS.mmm` normally; full date when
/// `rtc_timestamps` is set and the platform clock is trusted.
pub fn timestamp_prefix() -> String {
    let full = LOG_FILTER
        .read()
        .map(|f| f.full_timestamps)
        .unwrap_or(false);
    if full {
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    } else {
        chrono::Local::now().format("%H:%M:%S%.3f").to_string()
    }
}

/// Initialise file logging to the given reports directory.
/// Creates a timestamped log file and prunes old ones beyond `retention`.
pub fn init_file_logging(reports_dir: &Path, retention: u32) -> Result<(), String> {
    std::fs::create_dir_all(reports_dir)
        .map_err(|e| format!("Failed to create log dir: {}", e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-fieldgate.log")
        .to_string();
    let log_path = reports_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to create log file: {}", e))?;

    prune_old_logs(reports_dir, retention);

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    // Use eprintln directly here since tlog! would try to lock LOG_FILE (which we just set)
    eprintln!(
        "{} [logging] File logging started: {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        log_path.display()
    );

    Ok(())
}

/// Keep at most `retention` fieldgate log files, deleting the oldest.
/// `retention == 0` disables pruning.
fn prune_old_logs(reports_dir: &Path, retention: u32) {
    if retention == 0 {
        return;
    }
    let mut logs: Vec<_> = match std::fs::read_dir(reports_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with("-fieldgate.log"))
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => return,
    };
    // Timestamped names sort chronologically
    logs.sort();
    while logs.len() > retention as usize {
        let oldest = logs.remove(0);
        let _ = std::fs::remove_file(&oldest);
    }
}

/// Stop file logging and close the log file.
pub fn stop_file_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if guard.is_some() {
            *guard = None;
            eprintln!(
                "{} [logging] File logging stopped",
                chrono::Local::now().format("%H:%M:%S%.3f")
            );
        }
    }
}

/// Timestamped logging macro.
/// Prepends local time to every message written to stderr.
/// Also writes to the log file when file logging is enabled.
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = format!("{} {}", $crate::logging::timestamp_prefix(), format_args!($($arg)*));
        eprintln!("{}", msg);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(ref mut f) = *guard {
                let _ = writeln!(f, "{}", msg);
            }
        }
    }};
}

/// Debug-level variant gated on logging.json: the message is emitted only
/// when the level is Debug and the named module is not switched off.
macro_rules! tdbg {
    ($module:expr, $($arg:tt)*) => {{
        if $crate::logging::enabled($crate::config::types::LogLevel::Debug, $module) {
            tlog!($($arg)*);
        }
    }};
}
