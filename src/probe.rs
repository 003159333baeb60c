use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Error;
use crate::task::{MediaInfo, TargetProfile, Task};

/// Extensions accepted as video input.
pub const VALID_VIDEO_FORMATS: &[&str] = &[
    "mkv", "ogg", "mp4", "mpg", "dat", "f4v", "flv", "wv", "3gp", "avi", "webm", "wmv", "mov",
    "vob", "ogv", "ts",
];

/// Looks up stream and container metadata of a media file.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, Error>;
}

/// A [`Prober`] backed by the `ffprobe` executable.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    executable_path: PathBuf,
}

impl FfprobeProber {
    pub fn new(executable_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: executable_path.into(),
        }
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, Error> {
        let probe_error = |reason: String| Error::Probe {
            path: path.to_path_buf(),
            reason,
        };

        let output = Command::new(&self.executable_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output()
            .await
            .map_err(|e| probe_error(e.to_string()))?;

        if !output.status.success() {
            return Err(probe_error(format!(
                "ffprobe failed with exit code: {:?}",
                output.status.code()
            )));
        }

        let json = String::from_utf8_lossy(&output.stdout);
        MediaInfo::from_probe_json(&json).map_err(|e| probe_error(e.to_string()))
    }
}

/// A file that did not make it into the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub path: PathBuf,
    pub reason: String,
}

/// Results of a background intake batch, in submission order.
#[derive(Debug)]
pub enum IntakeEvent {
    Accepted(Task),
    Rejected(Rejection),
    /// The whole batch has been probed. Always the last event of a batch.
    Settled { accepted: usize, rejected: usize },
}

pub fn has_video_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VALID_VIDEO_FORMATS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Returns the `<stem>.srt` file next to `path`, if there is one.
fn sibling_subtitle(path: &Path) -> Option<PathBuf> {
    let subtitle = path.with_extension("srt");
    subtitle.is_file().then_some(subtitle)
}

/// Probes one file and turns it into a task, or explains why it can't be one.
pub async fn create_task(
    prober: &dyn Prober,
    path: PathBuf,
    profile: TargetProfile,
    quality: String,
) -> Result<Task, Error> {
    if !has_video_extension(&path) {
        return Err(Error::InvalidTask {
            path,
            reason: "not a supported video format".to_string(),
        });
    }

    let media = prober.probe(&path).await.map_err(|e| Error::InvalidTask {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    if !media.is_valid() {
        return Err(Error::InvalidTask {
            path,
            reason: format!("invalid duration: {}", media.duration),
        });
    }

    let subtitle = sibling_subtitle(&path);
    let mut task = Task::new(path, media, profile, quality);
    if let Some(subtitle) = subtitle {
        task = task.with_subtitle(subtitle);
    }
    Ok(task)
}

/// Probes `paths` on a background task.
///
/// The receiver yields one `Accepted` or `Rejected` per path, then `Settled`.
pub fn spawn_intake(
    prober: Arc<dyn Prober>,
    paths: Vec<PathBuf>,
    profile: TargetProfile,
    quality: String,
) -> mpsc::Receiver<IntakeEvent> {
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let (mut accepted, mut rejected) = (0, 0);
        for path in paths {
            let event = match create_task(prober.as_ref(), path.clone(), profile.clone(), quality.clone()).await {
                Ok(task) => {
                    accepted += 1;
                    IntakeEvent::Accepted(task)
                }
                Err(e) => {
                    rejected += 1;
                    debug!(path = %path.display(), error = %e, "file rejected");
                    IntakeEvent::Rejected(Rejection {
                        path,
                        reason: e.to_string(),
                    })
                }
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
        info!(accepted, rejected, "intake batch settled");
        let _ = tx.send(IntakeEvent::Settled { accepted, rejected }).await;
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticProber(HashMap<PathBuf, f64>);

    #[async_trait]
    impl Prober for StaticProber {
        async fn probe(&self, path: &Path) -> Result<MediaInfo, Error> {
            self.0
                .get(path)
                .map(|d| MediaInfo::new(*d))
                .ok_or_else(|| Error::Probe {
                    path: path.to_path_buf(),
                    reason: "unreadable".to_string(),
                })
        }
    }

    #[test]
    fn test_has_video_extension() {
        assert!(has_video_extension(Path::new("/a/b.MKV")));
        assert!(has_video_extension(Path::new("clip.ts")));
        assert!(!has_video_extension(Path::new("notes.txt")));
        assert!(!has_video_extension(Path::new("noext")));
    }

    #[tokio::test]
    async fn test_intake_reports_every_file_then_settles() {
        let prober = StaticProber(HashMap::from([
            (PathBuf::from("/v/a.mp4"), 120.0),
            (PathBuf::from("/v/zero.mp4"), 0.0),
        ]));
        let paths = vec![
            PathBuf::from("/v/a.mp4"),
            PathBuf::from("/v/zero.mp4"),
            PathBuf::from("/v/gone.mkv"),
            PathBuf::from("/v/readme.txt"),
        ];
        let mut rx = spawn_intake(
            Arc::new(prober),
            paths,
            TargetProfile::new("MP4", "mp4"),
            "Default".to_string(),
        );

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut settled = None;
        while let Some(event) = rx.recv().await {
            match event {
                IntakeEvent::Accepted(task) => accepted.push(task),
                IntakeEvent::Rejected(r) => rejected.push(r.path),
                IntakeEvent::Settled { accepted, rejected } => settled = Some((accepted, rejected)),
            }
        }

        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].duration(), 120.0);
        assert_eq!(
            rejected,
            vec![
                PathBuf::from("/v/zero.mp4"),
                PathBuf::from("/v/gone.mkv"),
                PathBuf::from("/v/readme.txt"),
            ]
        );
        assert_eq!(settled, Some((1, 3)));
    }
}
