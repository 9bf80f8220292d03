use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing startup configuration; prevents the service from starting
    #[error("{0}")]
    Config(String),

    #[error("{context} ({}): {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backend rejected an insert; the sample is dropped
    #[error("failed to write sample for '{key}': {reason}")]
    Write { key: String, reason: String },

    /// An invalid request or a failed read; reported to the caller of the query
    #[error("{0}")]
    Query(String),
}

impl Error {
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            context,
            path: path.into(),
            source,
        }
    }

    pub fn write(key: &str, reason: impl ToString) -> Self {
        Error::Write {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Whether to log (verbose) error output.
/// Set at startup from the `ERROR_LOGGER` env var or `--verbose` (on, off)
static ERROR_LOGGER: AtomicBool = AtomicBool::new(false);

pub fn debug_error_enabled(enabled: bool) {
    ERROR_LOGGER.store(enabled, Ordering::Relaxed);
}

/// Logs a steady-state error that is isolated from its caller
pub fn debug_error(err: anyhow::Error) {
    if ERROR_LOGGER.load(Ordering::Relaxed) {
        let causes = err
            .chain()
            .skip(1)
            .map(|cause| cause.to_string())
            .collect::<Vec<_>>();
        if causes.is_empty() {
            tracing::warn!("{}", err);
        } else {
            tracing::warn!(caused_by = ?causes, "{}", err);
        }
    }
}
