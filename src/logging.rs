//! Logging initialization
//!
//! The host process calls [`init`] once at startup. The desktop shell
//! owns stdout and stderr, so debug logging writes to a file kept for
//! the whole process lifetime instead.

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Initialize logging based on debug flag
/// Returns the log file path if debug logging is enabled
pub fn init(debug: bool) -> Option<PathBuf> {
    if !debug {
        // concise info-level logging on stderr
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter("info"))
            .init();
        return None;
    }

    let (file, path) = debug_log_file();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("debug"))
        .with_writer(file)
        .with_ansi(false) // No ANSI codes in log file
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();
    Some(path)
}

/// `RUST_LOG` wins over the given default level.
fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// A log file that outlives the tempfile handle. `keep` detaches the
/// file from tempfile's cleanup, so the open handle doubles as the
/// subscriber's writer; the OS temp dir is the fallback when no temp
/// file can be created.
fn debug_log_file() -> (std::fs::File, PathBuf) {
    let kept = tempfile::Builder::new()
        .prefix("clusterlens-")
        .suffix(".log")
        .tempfile()
        .and_then(|tmp| tmp.keep().map_err(|err| err.error));
    match kept {
        Ok((file, path)) => (file, path),
        Err(_) => {
            let path = std::env::temp_dir().join(format!("clusterlens-{}.log", std::process::id()));
            let file = std::fs::File::create(&path).expect("Failed to open log file");
            (file, path)
        }
    }
}
