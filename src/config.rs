use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Deserialize;

use crate::command::ConversionOptions;
use crate::error::Error;

/// Run-wide settings of a queue.
///
/// Every field has a default, so a JSON document only needs the keys it changes:
///
/// ```json
/// { "output_dir": "/home/me/Videos/converted", "tagged": true, "stop_grace_ms": 5000 }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Directory converted files are written to.
    pub output_dir: PathBuf,
    /// Append the profile name to output file names.
    pub tagged: bool,
    /// Burn in a `<stem>.srt` found next to the source.
    pub subtitle: bool,
    /// Delete each source file once it has been converted.
    pub delete_input: bool,
    /// Encoder threads. Defaults to all cores but one.
    pub threads: Option<usize>,
    /// How long a stopped encoder may take to exit before it is killed.
    pub stop_grace_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            tagged: false,
            subtitle: false,
            delete_input: false,
            threads: None,
            stop_grace_ms: 3000,
        }
    }
}

impl QueueConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Config {
            reason: e.to_string(),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| Error::Config {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_json_str(&json)
    }

    pub fn tagged(mut self, tagged: bool) -> Self {
        self.tagged = tagged;
        self
    }

    pub fn subtitle(mut self, subtitle: bool) -> Self {
        self.subtitle = subtitle;
        self
    }

    pub fn delete_input(mut self, delete_input: bool) -> Self {
        self.delete_input = delete_input;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn effective_threads(&self) -> usize {
        self.threads.filter(|t| *t > 0).unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1)
        })
    }

    pub fn conversion_options(&self) -> ConversionOptions<'_> {
        ConversionOptions {
            output_dir: &self.output_dir,
            tagged: self.tagged,
            subtitle: self.subtitle,
            threads: self.effective_threads(),
        }
    }
}
