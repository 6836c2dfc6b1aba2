//! This module provides logging and diagnostics for the compression pipeline.
//!
//! The library itself only talks to the `log` facade. Applications that want to
//! see the pipeline's stage transitions and per-channel decisions call
//! `init_logging` once, which installs an `env_logger` backend. The
//! `log_metric!` macro is the tool for structured key/value metrics.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Once;

use log::LevelFilter;

use crate::error::GsvqError;

/// Logs a structured key-value metric line at debug level.
///
/// # Example
/// ```
/// use gsvq::log_metric;
/// let clusters = 256;
/// log_metric!("event"="fit_channel", "channel"="opacity", "clusters"=&clusters);
/// ```
#[macro_export]
macro_rules! log_metric {
    ($($key:literal = $value:expr),+ $(,)?) => {
        if $crate::__log::log_enabled!($crate::__log::Level::Debug) {
            // Collect each pair as a JSON string fragment
            let mut parts = Vec::new();
            $(
                parts.push(format!("\"{}\": \"{}\"", $key, $value));
            )+
            $crate::__log::debug!("GSVQ_METRIC: {{ {} }}", parts.join(", "));
        }
    };
}

static INIT_LOGGER: Once = Once::new();

/// Installs an `env_logger` backend at `level`, optionally appending to `log_file`.
///
/// Only the first call has any effect; later calls return `Ok(())` without
/// touching the installed logger.
pub fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> Result<(), GsvqError> {
    // Open the file up front so a bad path is reported instead of swallowed by `Once`.
    let file = match log_file {
        Some(path) => Some(OpenOptions::new().append(true).create(true).open(path)?),
        None => None,
    };

    INIT_LOGGER.call_once(|| {
        let mut builder = env_logger::Builder::new();

        builder.is_test(false);
        builder.filter_level(level);

        // Custom formatter: just print the level and message
        builder.format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "[{}] {}", record.level(), record.args())?;
            buf.flush()?;
            Ok(())
        });

        if let Some(file) = file {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }

        let _ = builder.try_init();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        assert!(init_logging(LevelFilter::Debug, None).is_ok());
        assert!(init_logging(LevelFilter::Info, None).is_ok());
        let value = 3;
        log_metric!("event" = "test", "value" = &value);
    }

    #[test]
    fn test_init_logging_reports_unopenable_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        assert!(matches!(
            init_logging(LevelFilter::Info, Some(dir.path())),
            Err(GsvqError::Io(_))
        ));
    }
}
