use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ffmpeg executable not found in system PATH. Searched paths: {searched_paths:?}")]
    ExecutableNotFound { searched_paths: Vec<PathBuf> },
    #[error("Invalid encoder executable at '{path}': {reason}")]
    InvalidExecutable { path: PathBuf, reason: String },
    #[error("Failed to spawn encoder process: {source}")]
    ProcessSpawnFailed { source: std::io::Error },
    #[error("Failed to {action} the encoder process: {source}")]
    ControlFailed {
        action: &'static str,
        source: std::io::Error,
    },
    #[error("Invalid media file '{path}': {reason}")]
    InvalidTask { path: PathBuf, reason: String },
    #[error("Could not probe '{path}': {reason}")]
    Probe { path: PathBuf, reason: String },
    #[error("Input file '{path}' not found")]
    SourceMissing { path: PathBuf },
    #[error("Can not write output file '{path}': {reason}")]
    InvalidOutputTarget { path: PathBuf, reason: String },
    #[error("Profile '{profile}' has no quality preset named '{quality}'")]
    UnknownQuality { profile: String, quality: String },
    #[error("The encoder failed with error: {message}")]
    EncoderRuntime { message: String },
    #[error("Task {index} is being converted")]
    TaskRunning { index: usize },
    #[error("Task index {index} is out of range for a queue of {len} tasks")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("The queue can not be edited while a conversion is running")]
    QueueBusy,
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
    #[error("The queue service has shut down")]
    ServiceClosed,
}
