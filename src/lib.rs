use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tracing::debug;

mod clock;
mod command;
mod config;
mod error;
mod event;
mod handle;
mod orchestrator;
mod parser;
mod probe;
mod queue;
mod runner;
mod task;

#[cfg(windows)]
const ENCODER_NAME: &str = "ffmpeg.exe";
#[cfg(not(windows))]
const ENCODER_NAME: &str = "ffmpeg";

#[cfg(windows)]
const PROBER_NAME: &str = "ffprobe.exe";
#[cfg(not(windows))]
const PROBER_NAME: &str = "ffprobe";

/// Reads the release from the `ffmpeg version <release> ...` banner.
fn parse_version_banner(stdout: &[u8]) -> Option<String> {
    let first_line = String::from_utf8_lossy(stdout).lines().next()?.trim().to_string();
    let release = first_line.strip_prefix("ffmpeg version ")?.split_whitespace().next()?;
    Some(release.to_string())
}

/// Runs `<path> -version` and returns the reported release.
async fn probe_encoder_version(path: &Path) -> Result<String, Error> {
    let invalid = |reason: String| Error::InvalidExecutable {
        path: path.to_path_buf(),
        reason,
    };

    let output = Command::new(path)
        .arg("-version")
        .output()
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !output.status.success() {
        return Err(invalid(format!("-version exited with {}", output.status)));
    }

    parse_version_banner(&output.stdout)
        .ok_or_else(|| invalid("no ffmpeg version banner in -version output".to_string()))
}

/// First directory of a PATH-style list holding a file called `name`.
fn locate_in(search_path: &OsStr, name: &str) -> Option<PathBuf> {
    env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// The `ffprobe` shipped next to `encoder`, if there is one.
fn sibling_prober(encoder: &Path) -> Option<PathBuf> {
    let candidate = encoder.parent()?.join(PROBER_NAME);
    candidate.is_file().then_some(candidate)
}

pub use clock::{ProgressClock, format_duration, percent};
pub use command::{CommandBuilder, ConversionCommand, ConversionOptions};
pub use config::QueueConfig;
pub use error::Error;
pub use event::{FailureKind, QueueEvent, RunOutcome};
pub use handle::QueueHandle;
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use parser::{OutputParser, ParsedOutput};
pub use probe::{
    FfprobeProber, IntakeEvent, Prober, Rejection, VALID_VIDEO_FORMATS, create_task,
    has_video_extension, spawn_intake,
};
pub use queue::TaskQueue;
pub use runner::{DEFAULT_STOP_GRACE, ProcessFailure, ProcessRunner, RunnerEvent};
pub use task::{MediaInfo, QualityPreset, TargetProfile, Task, TaskStatus};

/// The ffmpeg installation conversions run through.
#[derive(Debug, Clone)]
pub struct Encoder {
    executable_path: PathBuf,
    prober_path: Option<PathBuf>,
    version: String,
}

impl Encoder {
    /// Discovers ffmpeg, and the ffprobe next to it, in the system PATH.
    pub async fn new() -> Result<Self, Error> {
        let search_path = env::var_os("PATH").unwrap_or_default();
        let executable_path =
            locate_in(&search_path, ENCODER_NAME).ok_or_else(|| Error::ExecutableNotFound {
                searched_paths: env::split_paths(&search_path).collect(),
            })?;
        Self::new_with_path(executable_path).await
    }

    /// Uses the ffmpeg at `path`. It must answer `-version` with an ffmpeg banner.
    pub async fn new_with_path(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let executable_path = path.into();
        let version = probe_encoder_version(&executable_path).await?;
        let prober_path = sibling_prober(&executable_path);
        debug!(path = %executable_path.display(), %version, ?prober_path, "encoder found");
        Ok(Self {
            executable_path,
            prober_path,
            version,
        })
    }

    /// The release reported by `ffmpeg -version`, e.g. `6.1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    /// A prober using the ffprobe installed alongside ffmpeg, or the one in PATH.
    pub fn prober(&self) -> FfprobeProber {
        match &self.prober_path {
            Some(path) => FfprobeProber::new(path),
            None => FfprobeProber::default(),
        }
    }

    /// Spawns a queue service converting through this encoder.
    ///
    /// Must be called from within a tokio runtime.
    pub fn queue(&self, config: QueueConfig, prober: Arc<dyn Prober>) -> QueueHandle {
        QueueHandle::spawn(self.executable_path.clone(), config, prober)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_banner() {
        let stdout = b"ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023 the FFmpeg developers\nbuilt with gcc 13\n";
        assert_eq!(parse_version_banner(stdout).as_deref(), Some("6.1.1-3ubuntu5"));
    }

    #[test]
    fn test_version_banner_of_another_program() {
        assert_eq!(parse_version_banner(b"HandBrake 1.7.2\n"), None);
        assert_eq!(parse_version_banner(b""), None);
    }

    #[test]
    fn test_locate_in_skips_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ENCODER_NAME), b"").unwrap();
        let search_path = env::join_paths([Path::new("/definitely/not/here"), dir.path()]).unwrap();

        assert_eq!(locate_in(&search_path, ENCODER_NAME), Some(dir.path().join(ENCODER_NAME)));
        assert_eq!(locate_in(&search_path, PROBER_NAME), None);
        assert_eq!(locate_in(OsStr::new(""), ENCODER_NAME), None);
    }

    #[test]
    fn test_sibling_prober() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = dir.path().join(ENCODER_NAME);
        assert_eq!(sibling_prober(&encoder), None);

        std::fs::write(dir.path().join(PROBER_NAME), b"").unwrap();
        assert_eq!(sibling_prober(&encoder), Some(dir.path().join(PROBER_NAME)));
    }

    #[tokio::test]
    async fn test_invalid_executable() {
        let result = Encoder::new_with_path("/definitely/not/ffmpeg").await;
        assert!(matches!(result, Err(Error::InvalidExecutable { .. })));
    }
}
