//! Optional tracing bootstrap for embedding hosts
//!
//! The library itself only emits `tracing` events under its subsystem
//! targets (`engine`, `engine::chunk`, `store`, `store::evict`, `hasher`,
//! `compression`, `endpoint`, `transport`, `kernel`) and assumes the host
//! owns subscriber installation. Hosts without their own subscriber can ask
//! [`init`] to install one: compact stdout output, plus a daily-rotated JSON
//! file when a log directory is configured. If some other subscriber won the
//! race, [`init`] backs off and the library's events flow there instead.

use crate::error::{FcResult, FileChunkError};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Targets raised to `info` by the default filter
const SUBSYSTEM_TARGETS: &[&str] = &[
    "engine",
    "store",
    "hasher",
    "compression",
    "endpoint",
    "transport",
    "kernel",
];

/// Where and how much to log
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory for the rolling JSON file; `None` logs to stdout only
    pub directory: Option<PathBuf>,
    /// File name prefix of the rolling log
    pub file_prefix: String,
    /// Rotated files kept on disk
    pub max_files: usize,
    /// Filter directives applied when `RUST_LOG` is unset; `None` enables
    /// every subsystem target at `info` and everything else at `warn`
    pub default_directives: Option<String>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "filechunk".to_string(),
            max_files: 7,
            default_directives: None,
        }
    }
}

impl LogOptions {
    /// Stdout plus a rolling JSON file under `directory`.
    pub fn to_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Self::default()
        }
    }
}

/// Keeps the file writer flushing. Hold it for the host's lifetime; dropping
/// it flushes and stops the background writer.
pub struct LogHandle {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl LogHandle {
    /// Whether this process ended up writing the rolling file.
    pub fn file_logging(&self) -> bool {
        self._file_guard.is_some()
    }
}

/// Install the library subscriber.
///
/// Filter precedence: `RUST_LOG`, then `default_directives`, then the
/// built-in subsystem defaults. Returns a no-op handle when the host already
/// installed a global subscriber.
pub fn init(options: LogOptions) -> FcResult<LogHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            options
                .default_directives
                .clone()
                .unwrap_or_else(default_directives),
        )
    });

    let (file_layer, file_guard) = match &options.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).map_err(|e| {
                FileChunkError::io(format!("create log dir {}: {e}", directory.display()))
            })?;
            let appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(&options.file_prefix)
                .filename_suffix("log")
                .max_log_files(options.max_files)
                .build(directory)
                .map_err(|e| FileChunkError::io(format!("open rolling log: {e}")))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_layer = fmt::layer().compact().with_target(true);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init();

    match installed {
        Ok(()) => {
            tracing::info!(
                target: "kernel",
                file = file_guard.is_some(),
                "Tracing subscriber installed"
            );
            Ok(LogHandle {
                _file_guard: file_guard,
            })
        }
        Err(_) => {
            // Host subscriber was installed first; ours stands down
            tracing::debug!(target: "kernel", "Subscriber already present, not replacing it");
            Ok(LogHandle { _file_guard: None })
        }
    }
}

fn default_directives() -> String {
    let mut directives = Vec::with_capacity(SUBSYSTEM_TARGETS.len() + 1);
    directives.push("warn".to_string());
    for target in SUBSYSTEM_TARGETS {
        directives.push(format!("{target}=info"));
    }
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_stdout_only() {
        let options = LogOptions::default();
        assert!(options.directory.is_none());
        assert_eq!(options.file_prefix, "filechunk");
    }

    #[test]
    fn default_filter_raises_subsystems_to_info() {
        let directives = default_directives();
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("engine=info"));
        assert!(directives.contains("store=info"));
        assert!(directives.contains("endpoint=info"));
    }

    #[test]
    fn init_creates_the_log_directory_and_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        let first = init(LogOptions::to_directory(&log_dir)).unwrap();
        assert!(log_dir.exists());

        // A second call backs off instead of failing
        let second = init(LogOptions::default()).unwrap();
        assert!(!second.file_logging());
        drop(first);
    }
}
