//! Structured logging for conductor.
//!
//! Log levels:
//! - ERROR: Failures that abort a coordinator operation
//! - WARN: Recoverable conditions (task timeouts, blocked tasks, failed gates)
//! - INFO: Workflow lifecycle (registration, execution start/finish)
//! - DEBUG: Routing decisions, group dispatch, state transitions
//! - TRACE: Cache hits and per-agent scoring detail
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `CONDUCTOR_LOG` accepts a full `EnvFilter` directive and wins over both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable holding a custom filter directive.
pub const LOG_ENV: &str = "CONDUCTOR_LOG";

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Falls back to stderr when the log file cannot be created. Calling this
/// more than once keeps the first subscriber.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false);

    let installed = match open_log_file() {
        Some((path, file)) => {
            let _ = LOG_PATH.set(path);
            builder.with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    if installed.is_err() {
        tracing::debug!("logging already initialised, keeping existing subscriber");
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if logging goes to a file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "conductor=debug"
    } else {
        "conductor=info"
    }
}

fn open_log_file() -> Option<(PathBuf, File)> {
    let dir = dirs::home_dir()?.join(".conductor");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("conductor.log");
    // Truncate file on startup
    let file = File::create(&path).ok()?;
    Some((path, file))
}
