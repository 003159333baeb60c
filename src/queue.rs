use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::command::{CommandBuilder, ConversionCommand, ConversionOptions};
use crate::error::Error;
use crate::task::{Task, TaskStatus, TargetProfile};

/// The ordered list of conversion tasks.
///
/// Insertion order is conversion order. `position` points at the task being
/// processed during a run and is `None` otherwise; once it moves past the last
/// task the queue is exhausted.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Vec<Task>,
    position: Option<usize>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// The task at `position`, if the run is on one.
    pub fn running_task(&self) -> Option<&Task> {
        self.position.and_then(|p| self.tasks.get(p))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.position, Some(p) if p >= self.tasks.len())
    }

    /// Appends a task and returns its index.
    pub fn add_task(&mut self, task: Task) -> Result<usize, Error> {
        if !task.media().is_valid() {
            return Err(Error::InvalidTask {
                path: task.source().to_path_buf(),
                reason: format!("invalid duration: {}", task.duration()),
            });
        }
        debug!(path = %task.source().display(), duration = task.duration(), "task added");
        self.tasks.push(task);
        Ok(self.tasks.len() - 1)
    }

    /// Removes a task, keeping `position` on the same task it pointed at.
    ///
    /// Removing the task at `position` moves `position` back one step, so the
    /// next advance lands on the task that followed it.
    pub fn remove_task(&mut self, index: usize) -> Result<Task, Error> {
        self.check_index(index)?;
        let task = self.tasks.remove(index);
        if let Some(p) = self.position {
            if index <= p {
                self.position = p.checked_sub(1);
            }
        }
        Ok(task)
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.position = None;
    }

    pub fn set_task_status(&mut self, index: usize, status: TaskStatus) -> Result<(), Error> {
        self.check_index(index)?;
        self.tasks[index].set_status(status);
        Ok(())
    }

    /// Sets `status` on every task for which `filter` returns true.
    /// Returns the indices that were changed.
    pub fn set_status_where<F>(&mut self, status: TaskStatus, mut filter: F) -> Vec<usize>
    where
        F: FnMut(&Task) -> bool,
    {
        let mut changed = Vec::new();
        for (index, task) in self.tasks.iter_mut().enumerate() {
            if task.status() != status && filter(task) {
                task.set_status(status);
                changed.push(index);
            }
        }
        changed
    }

    /// Changes the target of a task; it has to be converted again.
    pub fn update_task_options(
        &mut self,
        index: usize,
        profile: TargetProfile,
        quality: impl Into<String>,
    ) -> Result<(), Error> {
        self.check_index(index)?;
        let task = &mut self.tasks[index];
        task.set_options(profile, quality.into());
        task.set_status(TaskStatus::ToConvert);
        Ok(())
    }

    /// Moves `position` to the next task that still has to be converted.
    ///
    /// Tasks in any other state are skipped. Returns `None` once the queue is exhausted.
    pub fn advance(&mut self) -> Option<usize> {
        let mut next = self.position.map_or(0, |p| p + 1);
        while next < self.tasks.len() && self.tasks[next].status() != TaskStatus::ToConvert {
            next += 1;
        }
        self.position = Some(next.min(self.tasks.len()));
        (next < self.tasks.len()).then_some(next)
    }

    pub fn reset_position(&mut self) {
        self.position = None;
    }

    /// Sum of the durations of every task not yet done.
    pub fn total_duration(&self) -> f64 {
        self.tasks
            .iter()
            .filter(|t| t.status() != TaskStatus::Done)
            .map(Task::duration)
            .sum()
    }

    /// Sum of the durations of the tasks after `index` that are not yet done.
    pub fn duration_after(&self, index: usize) -> f64 {
        self.tasks
            .iter()
            .skip(index + 1)
            .filter(|t| t.status() != TaskStatus::Done)
            .map(Task::duration)
            .sum()
    }

    pub fn all_done(&self) -> bool {
        self.tasks.iter().all(|t| t.status() == TaskStatus::Done)
    }

    pub fn all_stopped(&self) -> bool {
        self.tasks.iter().all(|t| t.status() == TaskStatus::Stopped)
    }

    pub fn any_stopped(&self) -> bool {
        self.tasks.iter().any(|t| t.status() == TaskStatus::Stopped)
    }

    /// Builds the encoder invocation for the task at `index`.
    ///
    /// Fails if the source is gone, if the output can not be written, or if the
    /// task's quality is not a preset of its profile. Nothing is touched on disk.
    pub fn build_conversion_command(
        &self,
        index: usize,
        encoder: &Path,
        options: ConversionOptions<'_>,
    ) -> Result<ConversionCommand, Error> {
        self.check_index(index)?;
        let task = &self.tasks[index];

        if !task.source().is_file() {
            return Err(Error::SourceMissing {
                path: task.source().to_path_buf(),
            });
        }

        let output = task.output_path(options.output_dir, options.tagged);
        check_output_target(task.source(), &output, options.output_dir)?;

        let preset = task
            .profile()
            .find_preset(task.quality())
            .ok_or_else(|| Error::UnknownQuality {
                profile: task.profile().name.clone(),
                quality: task.quality().to_string(),
            })?;

        let mut builder = CommandBuilder::new(encoder, task.source(), output)
            .params(preset.params.iter().cloned())
            .threads(options.threads);
        if options.subtitle {
            if let Some(subtitle) = task.subtitle() {
                builder = builder.subtitle_file(subtitle);
            }
        }

        Ok(builder.build())
    }

    /// Deletes the partially written output of the running task.
    ///
    /// Best effort: a missing file is the common case and only gets logged.
    pub fn delete_running_output(&self, output_dir: &Path, tagged: bool) -> bool {
        match self.running_task() {
            Some(task) => remove_file_logged(&task.output_path(output_dir, tagged), "output"),
            None => false,
        }
    }

    /// Deletes the source file of the running task. Same best-effort policy.
    pub fn delete_running_input(&self) -> bool {
        match self.running_task() {
            Some(task) => remove_file_logged(task.source(), "input"),
            None => false,
        }
    }

    fn check_index(&self, index: usize) -> Result<(), Error> {
        if index < self.tasks.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                index,
                len: self.tasks.len(),
            })
        }
    }
}

fn check_output_target(source: &Path, output: &Path, output_dir: &Path) -> Result<(), Error> {
    let invalid = |reason: &str| Error::InvalidOutputTarget {
        path: output.to_path_buf(),
        reason: reason.to_string(),
    };

    let metadata = fs::metadata(output_dir).map_err(|e| invalid(&e.to_string()))?;
    if !metadata.is_dir() {
        return Err(invalid("output directory is not a directory"));
    }
    if !is_writable_dir(output_dir, &metadata) {
        return Err(invalid("output directory is not writable"));
    }
    if same_file(source, output) {
        return Err(invalid("output would overwrite the input file"));
    }
    Ok(())
}

/// Whether the current user may create files in `dir`.
#[cfg(unix)]
fn is_writable_dir(dir: &Path, _metadata: &fs::Metadata) -> bool {
    use nix::unistd::{AccessFlags, access};
    access(dir, AccessFlags::W_OK | AccessFlags::X_OK).is_ok()
}

#[cfg(not(unix))]
fn is_writable_dir(_dir: &Path, metadata: &fs::Metadata) -> bool {
    !metadata.permissions().readonly()
}

fn same_file(a: &Path, b: &Path) -> bool {
    let canonical = |p: &Path| -> PathBuf { fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf()) };
    canonical(a) == canonical(b)
}

fn remove_file_logged(path: &Path, what: &str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "deleted {what} file");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not delete {what} file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::MediaInfo;

    fn profile() -> TargetProfile {
        TargetProfile::new("MP4", "mp4").preset("Default", ["-c:v", "libx264"])
    }

    fn task(name: &str, duration: f64) -> Task {
        Task::new(format!("/videos/{name}.mkv"), MediaInfo::new(duration), profile(), "Default")
    }

    fn queue(durations: &[f64]) -> TaskQueue {
        let mut queue = TaskQueue::new();
        for (i, d) in durations.iter().enumerate() {
            queue.add_task(task(&format!("v{i}"), *d)).unwrap();
        }
        queue
    }

    fn assert_duration_invariant(queue: &TaskQueue) {
        let expected: f64 = queue
            .iter()
            .filter(|t| t.status() != TaskStatus::Done)
            .map(Task::duration)
            .sum();
        assert_eq!(queue.total_duration(), expected);
    }

    #[test]
    fn test_add_rejects_zero_duration() {
        let mut queue = queue(&[10.0]);
        let result = queue.add_task(task("empty", 0.0));

        assert!(matches!(result, Err(Error::InvalidTask { .. })));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_total_duration_tracks_edits() {
        let mut queue = queue(&[120.0, 60.0, 30.0]);
        assert_eq!(queue.total_duration(), 210.0);

        queue.set_task_status(0, TaskStatus::Done).unwrap();
        assert_eq!(queue.total_duration(), 90.0);
        assert_duration_invariant(&queue);

        queue.remove_task(2).unwrap();
        assert_eq!(queue.total_duration(), 60.0);
        assert_duration_invariant(&queue);

        queue.add_task(task("late", 15.0)).unwrap();
        assert_duration_invariant(&queue);

        queue.clear();
        assert_eq!(queue.total_duration(), 0.0);
        assert_eq!(queue.position(), None);
    }

    #[test]
    fn test_advance_skips_finished_tasks() {
        let mut queue = queue(&[1.0, 2.0, 3.0]);
        queue.set_task_status(1, TaskStatus::Done).unwrap();

        assert_eq!(queue.advance(), Some(0));
        assert_eq!(queue.advance(), Some(2));
        assert!(!queue.is_exhausted());
        assert_eq!(queue.advance(), None);
        assert!(queue.is_exhausted());
    }

    #[test]
    fn test_remove_before_position_keeps_running_task() {
        let mut queue = queue(&[1.0, 2.0, 3.0]);
        queue.advance();
        queue.advance();
        assert_eq!(queue.running_task().unwrap().name(false), "v1");

        queue.remove_task(0).unwrap();
        assert_eq!(queue.position(), Some(0));
        assert_eq!(queue.running_task().unwrap().name(false), "v1");

        queue.remove_task(1).unwrap();
        assert_eq!(queue.running_task().unwrap().name(false), "v1");
    }

    #[test]
    fn test_remove_at_position_advances_onto_follower() {
        let mut queue = queue(&[1.0, 2.0, 3.0]);
        queue.advance();
        queue.remove_task(0).unwrap();

        assert_eq!(queue.position(), None);
        assert_eq!(queue.advance(), Some(0));
        assert_eq!(queue.running_task().unwrap().name(false), "v1");
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut queue = queue(&[1.0]);
        assert!(matches!(
            queue.remove_task(3),
            Err(Error::IndexOutOfRange { index: 3, len: 1 })
        ));
    }

    #[test]
    fn test_update_options_rearms_task() {
        let mut queue = queue(&[1.0]);
        queue.set_task_status(0, TaskStatus::Done).unwrap();

        let other = TargetProfile::new("WEBM", "webm").preset("Fast", ["-c:v", "libvpx"]);
        queue.update_task_options(0, other, "Fast").unwrap();

        let task = queue.get(0).unwrap();
        assert_eq!(task.status(), TaskStatus::ToConvert);
        assert_eq!(task.profile().name, "WEBM");
        assert_eq!(task.quality(), "Fast");
    }

    #[test]
    fn test_status_predicates() {
        let mut queue = queue(&[1.0, 2.0]);
        assert!(!queue.all_done());
        assert!(!queue.any_stopped());

        let changed = queue.set_status_where(TaskStatus::Stopped, |t| t.status() != TaskStatus::Done);
        assert_eq!(changed, vec![0, 1]);
        assert!(queue.all_stopped());

        queue.set_status_where(TaskStatus::Done, |_| true);
        assert!(queue.all_done());
    }

    #[test]
    fn test_duration_after() {
        let mut queue = queue(&[10.0, 20.0, 30.0]);
        queue.set_task_status(2, TaskStatus::Done).unwrap();
        assert_eq!(queue.duration_after(0), 20.0);
        assert_eq!(queue.duration_after(2), 0.0);
    }

    #[test]
    fn test_command_fails_for_missing_source() {
        let queue = queue(&[10.0]);
        let options = ConversionOptions {
            output_dir: Path::new("/tmp"),
            tagged: false,
            subtitle: false,
            threads: 1,
        };
        let result = queue.build_conversion_command(0, Path::new("ffmpeg"), options);
        assert!(matches!(result, Err(Error::SourceMissing { .. })));
    }
}
