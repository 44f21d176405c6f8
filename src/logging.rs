//! File logging for the CLI.
//!
//! Every run writes its own timestamped file under the log directory; older runs beyond
//! [`DEFAULT_KEEP_FILES`] are pruned at startup. Level and directory come from the
//! environment.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_LEVEL_ENV: &str = "DUE_NOTIFY_LOG_LEVEL";
pub const LOG_DIR_ENV: &str = "DUE_NOTIFY_LOG_DIR";
pub const DEFAULT_KEEP_FILES: usize = 10;
const LOG_FILE_PREFIX: &str = "due-notify-";
const LOG_FILE_SUFFIX: &str = ".log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub level: LogLevel,
    pub keep_files: usize,
}

impl LogConfig {
    /// Directory from `DUE_NOTIFY_LOG_DIR` or the local data dir, level from
    /// `DUE_NOTIFY_LOG_LEVEL`. Unknown levels fall back to `warn`.
    pub fn from_env() -> Result<Self> {
        let directory = match std::env::var_os(LOG_DIR_ENV).filter(|dir| !dir.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => default_log_directory()?,
        };
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();
        Ok(Self {
            directory,
            level,
            keep_files: DEFAULT_KEEP_FILES,
        })
    }

    /// Our own crate logs at the configured level; dependencies never below `warn`.
    pub fn directives(&self) -> String {
        let floor = match self.level {
            LogLevel::Error => "error",
            _ => "warn",
        };
        format!("{floor},due_notify={}", self.level.as_str())
    }

    pub fn file_path(&self) -> PathBuf {
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        self.directory
            .join(format!("{LOG_FILE_PREFIX}{timestamp}{LOG_FILE_SUFFIX}"))
    }

    /// Install the global subscriber writing to a fresh file.
    pub fn init(&self) -> Result<Logging> {
        fs::create_dir_all(&self.directory).with_context(|| {
            format!("failed to create log directory '{}'", self.directory.display())
        })?;
        // Make room for the file about to be created.
        let pruned = prune_logs(&self.directory, self.keep_files.saturating_sub(1))?;

        let path = self.file_path();
        let file = fs::File::create(&path)
            .with_context(|| format!("failed to create log file '{}'", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(EnvFilter::new(self.directives()))
            .with(file_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to install log subscriber: {err}"))?;

        tracing::info!(
            path = %path.display(),
            level = self.level.as_str(),
            pruned,
            "logging initialized"
        );
        Ok(Logging {
            path,
            _guard: guard,
        })
    }
}

/// Keeps the background writer alive; dropping it flushes pending lines.
pub struct Logging {
    pub path: PathBuf,
    _guard: WorkerGuard,
}

pub fn default_log_directory() -> Result<PathBuf> {
    let data_dir =
        dirs::data_local_dir().ok_or_else(|| anyhow!("unable to determine local data directory"))?;
    Ok(data_dir.join("due-notify").join("logs"))
}

/// Delete the oldest run logs so at most `keep` remain. Returns how many were removed.
pub fn prune_logs(directory: &Path, keep: usize) -> Result<usize> {
    let mut logs = fs::read_dir(directory)
        .with_context(|| format!("failed to list log directory '{}'", directory.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_run_log(path))
        .collect::<Vec<_>>();
    if logs.len() <= keep {
        return Ok(0);
    }

    // Timestamped names sort chronologically.
    logs.sort();
    let excess = logs.len() - keep;
    let mut removed = 0;
    for path in logs.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => eprintln!("warning: failed to remove old log '{}': {err}", path.display()),
        }
    }
    Ok(removed)
}

fn is_run_log(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(LOG_FILE_SUFFIX))
}

/// Printed to stderr so `--json` output on stdout stays machine readable.
pub fn print_log_location(log_path: &Path) {
    eprintln!("log file: {}", log_path.display());
}
