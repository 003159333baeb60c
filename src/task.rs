use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

/// Conversion state of a single task.
///
/// A task being encoded stays `ToConvert` until its process finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    ToConvert,
    Done,
    Stopped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStatus::ToConvert => "To convert",
            TaskStatus::Done => "Done!",
            TaskStatus::Stopped => "Stopped!",
        };
        f.write_str(text)
    }
}

/// Metadata of a probed media file.
///
/// `duration` is the only field the queue relies on; everything else the prober
/// returned stays reachable through [`field`](Self::field) and [`streams`](Self::streams).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub duration: f64,
    format: Value,
    streams: Vec<Value>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Value,
    #[serde(default)]
    streams: Vec<Value>,
}

impl MediaInfo {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            format: Value::Null,
            streams: Vec::new(),
        }
    }

    /// Builds the info from `ffprobe -print_format json -show_format -show_streams` output.
    ///
    /// A missing or unparsable duration becomes `0.0`, which the queue rejects.
    pub fn from_probe_json(json: &str) -> Result<Self, serde_json::Error> {
        let output: ProbeOutput = serde_json::from_str(json)?;
        // ffprobe prints the duration as a string
        let duration = match output.format.get("duration") {
            Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        };
        Ok(Self {
            duration,
            format: output.format,
            streams: output.streams,
        })
    }

    /// Looks up an arbitrary container-level field, e.g. `"format_name"` or `"bit_rate"`.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.format.get(name)
    }

    pub fn streams(&self) -> &[Value] {
        &self.streams
    }

    pub fn is_valid(&self) -> bool {
        self.duration.is_finite() && self.duration > 0.0
    }
}

/// A named set of encoder parameters within a profile, e.g. `"H.264 High"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QualityPreset {
    pub name: String,
    pub params: Vec<String>,
}

/// An output container together with the quality presets it offers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetProfile {
    pub name: String,
    /// Output file extension without the dot.
    pub extension: String,
    #[serde(default)]
    pub presets: Vec<QualityPreset>,
}

impl TargetProfile {
    pub fn new(name: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            presets: Vec::new(),
        }
    }

    /// Adds a quality preset. A preset with the same name is replaced.
    pub fn preset<I, S>(mut self, name: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let preset = QualityPreset {
            name: name.into(),
            params: params.into_iter().map(Into::into).collect(),
        };
        self.presets.retain(|p| p.name != preset.name);
        self.presets.push(preset);
        self
    }

    pub fn find_preset(&self, quality: &str) -> Option<&QualityPreset> {
        self.presets.iter().find(|p| p.name == quality)
    }
}

/// One file waiting in the queue.
#[derive(Debug, Clone)]
pub struct Task {
    source: PathBuf,
    media: MediaInfo,
    subtitle: Option<PathBuf>,
    profile: TargetProfile,
    quality: String,
    status: TaskStatus,
}

impl Task {
    pub fn new(
        source: impl Into<PathBuf>,
        media: MediaInfo,
        profile: TargetProfile,
        quality: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            media,
            subtitle: None,
            profile,
            quality: quality.into(),
            status: TaskStatus::ToConvert,
        }
    }

    /// Attaches an external subtitle file to burn in when subtitles are requested.
    pub fn with_subtitle(mut self, subtitle: impl Into<PathBuf>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn media(&self) -> &MediaInfo {
        &self.media
    }

    pub fn duration(&self) -> f64 {
        self.media.duration
    }

    pub fn subtitle(&self) -> Option<&Path> {
        self.subtitle.as_deref()
    }

    pub fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    pub fn quality(&self) -> &str {
        &self.quality
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    pub(crate) fn set_options(&mut self, profile: TargetProfile, quality: String) {
        self.profile = profile;
        self.quality = quality;
    }

    /// File name of the source, with or without its extension.
    pub fn name(&self, with_extension: bool) -> String {
        let name = if with_extension {
            self.source.file_name()
        } else {
            self.source.file_stem()
        };
        name.map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Where the converted file goes: `<output_dir>/<stem>[_<profile>].<extension>`.
    pub fn output_path(&self, output_dir: &Path, tagged: bool) -> PathBuf {
        let mut file_name = self.name(false);
        if tagged {
            file_name.push('_');
            file_name.push_str(&self.profile.name);
        }
        file_name.push('.');
        file_name.push_str(&self.profile.extension);
        output_dir.join(file_name)
    }
}
