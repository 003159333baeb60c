use std::path::PathBuf;

use crate::error::Error;
use crate::probe::Rejection;
use crate::task::TaskStatus;

/// A notification pushed by the queue service to its front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A probed file entered the queue at `index`.
    TaskAdded { index: usize, path: PathBuf },
    /// Files of an intake batch that were not added. Sent once per batch.
    TasksRejected(Vec<Rejection>),
    /// Every file of an intake batch has been probed.
    IntakeSettled { accepted: usize, rejected: usize },
    /// A task was removed; later indices shifted down by one.
    TaskRemoved { index: usize },
    /// All tasks were removed.
    QueueCleared,
    TaskStatusChanged { index: usize, status: TaskStatus },
    /// Completion of the file being encoded, `0..=100`.
    OperationProgress(u8),
    /// Completion of the whole run, `0..=100`.
    QueueProgress(u8),
    /// Human readable summary of the running conversion.
    StatusLine(String),
    /// A task could not be converted. The run goes on with the next one.
    TaskFailed {
        index: usize,
        kind: FailureKind,
        message: String,
    },
    /// The run is over and the queue is idle again.
    RunFinished(RunOutcome),
}

/// How a queue run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task that was attempted finished.
    Done,
    /// The user stopped the run.
    Stopped,
    /// At least one task failed; carries the first error message.
    Error(String),
}

/// Why a task failed, as reported in [`QueueEvent::TaskFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The encoder could not be started.
    Spawn,
    /// The encoder reported a fatal error or exited abnormally.
    EncoderRuntime,
    /// The output file could not be written where it was asked to go.
    InvalidOutputTarget,
    /// The source file disappeared after it was queued.
    SourceMissing,
    /// The task's quality is not a preset of its profile.
    UnknownQuality,
    Other,
}

impl From<&Error> for FailureKind {
    fn from(error: &Error) -> Self {
        match error {
            Error::ProcessSpawnFailed { .. } => FailureKind::Spawn,
            Error::EncoderRuntime { .. } => FailureKind::EncoderRuntime,
            Error::InvalidOutputTarget { .. } => FailureKind::InvalidOutputTarget,
            Error::SourceMissing { .. } => FailureKind::SourceMissing,
            Error::UnknownQuality { .. } => FailureKind::UnknownQuality,
            _ => FailureKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_failure_kind_from_error() {
        let spawn = Error::ProcessSpawnFailed {
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        let runtime = Error::EncoderRuntime {
            message: "encoder exited with code 1".to_string(),
        };
        let target = Error::InvalidOutputTarget {
            path: PathBuf::from("/out/a.mp4"),
            reason: "output directory is not writable".to_string(),
        };

        assert_eq!(FailureKind::from(&spawn), FailureKind::Spawn);
        assert_eq!(FailureKind::from(&runtime), FailureKind::EncoderRuntime);
        assert_eq!(FailureKind::from(&target), FailureKind::InvalidOutputTarget);
        assert_eq!(FailureKind::from(&Error::QueueBusy), FailureKind::Other);
    }
}
