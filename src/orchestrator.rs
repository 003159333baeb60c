use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::{ProgressClock, format_duration};
use crate::config::QueueConfig;
use crate::error::Error;
use crate::event::{FailureKind, QueueEvent, RunOutcome};
use crate::parser::OutputParser;
use crate::queue::TaskQueue;
use crate::runner::{ProcessFailure, ProcessRunner, RunnerEvent};
use crate::task::{TargetProfile, Task, TaskStatus};

/// Where the control loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    /// Task `index` is being encoded by process run `run`.
    Running { index: usize, run: u64 },
    /// A stop was requested for task `index`; waiting for its process to finish.
    Stopping { index: usize, run: u64 },
}

/// Drives a [`TaskQueue`] through the encoder, one task at a time.
///
/// The orchestrator does not own an event loop. Whoever owns it feeds it intents
/// and the [`RunnerEvent`]s of its runner, in order; notifications go out on the
/// `notify` channel.
#[derive(Debug)]
pub struct Orchestrator {
    encoder: PathBuf,
    config: QueueConfig,
    queue: TaskQueue,
    clock: ProgressClock,
    parser: OutputParser,
    runner: ProcessRunner,
    notify: mpsc::UnboundedSender<QueueEvent>,
    state: OrchestratorState,
    /// Duration the queue progress of the current run is measured against.
    run_duration: f64,
    latched_error: Option<String>,
    first_error: Option<String>,
    stop_all_requested: bool,
    bitrate: Option<String>,
}

impl Orchestrator {
    pub fn new(
        encoder: impl Into<PathBuf>,
        config: QueueConfig,
        runner_events: mpsc::UnboundedSender<RunnerEvent>,
        notify: mpsc::UnboundedSender<QueueEvent>,
    ) -> Self {
        let runner = ProcessRunner::new(runner_events).with_grace_period(config.stop_grace_period());
        Self {
            encoder: encoder.into(),
            config,
            queue: TaskQueue::new(),
            clock: ProgressClock::new(),
            parser: OutputParser::new(),
            runner,
            notify,
            state: OrchestratorState::Idle,
            run_duration: 0.0,
            latched_error: None,
            first_error: None,
            stop_all_requested: false,
            bitrate: None,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn clock(&self) -> &ProgressClock {
        &self.clock
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Encoded seconds the queue progress of the current run is measured against.
    pub fn run_duration(&self) -> f64 {
        self.run_duration
    }

    pub fn is_active(&self) -> bool {
        self.state != OrchestratorState::Idle
    }

    pub(crate) fn notify(&self, event: QueueEvent) {
        // a front-end that went away must not stall the queue
        let _ = self.notify.send(event);
    }

    fn set_status(&mut self, index: usize, status: TaskStatus) {
        if self.queue.set_task_status(index, status).is_ok() {
            self.notify(QueueEvent::TaskStatusChanged { index, status });
        }
    }

    fn current_index(&self) -> Option<usize> {
        match self.state {
            OrchestratorState::Running { index, .. } | OrchestratorState::Stopping { index, .. } => {
                Some(index)
            }
            OrchestratorState::Idle => None,
        }
    }

    /// Adds an already probed task to the end of the queue.
    pub fn accept_task(&mut self, task: Task) -> Result<usize, Error> {
        let path = task.source().to_path_buf();
        let duration = task.duration();
        let index = self.queue.add_task(task)?;
        if self.is_active() {
            self.run_duration += duration;
        }
        self.notify(QueueEvent::TaskAdded { index, path });
        Ok(index)
    }

    /// Removes a task. The task being converted can not be removed.
    pub fn remove_task(&mut self, index: usize) -> Result<(), Error> {
        if self.current_index() == Some(index) {
            return Err(Error::TaskRunning { index });
        }
        let task = self.queue.remove_task(index)?;
        match self.state {
            OrchestratorState::Running { index: current, run } if index < current => {
                self.state = OrchestratorState::Running { index: current - 1, run };
            }
            OrchestratorState::Stopping { index: current, run } if index < current => {
                self.state = OrchestratorState::Stopping { index: current - 1, run };
            }
            OrchestratorState::Running { .. } | OrchestratorState::Stopping { .. }
                if task.status() != TaskStatus::Done =>
            {
                self.run_duration = (self.run_duration - task.duration()).max(0.0);
            }
            _ => {}
        }
        info!(path = %task.source().display(), "task removed");
        self.notify(QueueEvent::TaskRemoved { index });
        Ok(())
    }

    pub fn clear_queue(&mut self) -> Result<(), Error> {
        if self.is_active() {
            return Err(Error::QueueBusy);
        }
        self.queue.clear();
        self.run_duration = 0.0;
        self.notify(QueueEvent::QueueCleared);
        Ok(())
    }

    /// Changes the target of one task, which then has to be converted again.
    pub fn update_task_options(
        &mut self,
        index: usize,
        profile: TargetProfile,
        quality: impl Into<String>,
    ) -> Result<(), Error> {
        if self.current_index() == Some(index) {
            return Err(Error::TaskRunning { index });
        }
        let was_done = self.queue.get(index).map(|t| t.status() == TaskStatus::Done);
        self.queue.update_task_options(index, profile, quality)?;
        if was_done == Some(true) && self.current_index().is_some_and(|current| index > current) {
            self.run_duration += self.queue.get(index).map_or(0.0, Task::duration);
        }
        self.notify(QueueEvent::TaskStatusChanged {
            index,
            status: TaskStatus::ToConvert,
        });
        Ok(())
    }

    /// Changes the target of every task. Only allowed while idle.
    pub fn update_all_options(&mut self, profile: TargetProfile, quality: impl Into<String>) -> Result<(), Error> {
        if self.is_active() {
            return Err(Error::QueueBusy);
        }
        let quality = quality.into();
        for index in 0..self.queue.len() {
            self.queue.update_task_options(index, profile.clone(), quality.clone())?;
            self.notify(QueueEvent::TaskStatusChanged {
                index,
                status: TaskStatus::ToConvert,
            });
        }
        self.run_duration = self.queue.total_duration();
        Ok(())
    }

    /// Starts converting the queue from the top. Does nothing if a run is active.
    ///
    /// Stopped tasks are converted again; done tasks are skipped.
    pub fn start_queue(&mut self) {
        if self.is_active() || self.queue.is_empty() {
            return;
        }

        for index in self
            .queue
            .set_status_where(TaskStatus::ToConvert, |t| t.status() == TaskStatus::Stopped)
        {
            self.notify(QueueEvent::TaskStatusChanged {
                index,
                status: TaskStatus::ToConvert,
            });
        }

        self.queue.reset_position();
        self.clock.reset_progress_times();
        self.run_duration = self.queue.total_duration();
        self.first_error = None;
        self.stop_all_requested = false;
        info!(tasks = self.queue.len(), duration = self.run_duration, "queue run started");

        self.launch_next();
    }

    /// Starts the next task waiting for conversion, or ends the run.
    fn launch_next(&mut self) {
        loop {
            // tasks accepted after a stop-all wait for the next run
            if self.stop_all_requested {
                self.finish_run();
                return;
            }
            let Some(index) = self.queue.advance() else {
                self.finish_run();
                return;
            };

            self.clock.begin_operation();
            self.parser.reset();
            self.latched_error = None;
            self.bitrate = None;

            match self.spawn_task(index) {
                Ok(run) => {
                    self.state = OrchestratorState::Running { index, run };
                    if let Some(task) = self.queue.get(index) {
                        self.notify(QueueEvent::StatusLine(format!("Converting: {}", task.name(true))));
                    }
                    return;
                }
                Err(e) => {
                    warn!(index, error = %e, "could not start conversion");
                    self.fail_task(index, e);
                }
            }
        }
    }

    fn spawn_task(&mut self, index: usize) -> Result<u64, Error> {
        let command = self
            .queue
            .build_conversion_command(index, &self.encoder, self.config.conversion_options())?;
        debug!(index, args = ?command.args, "conversion command");
        self.runner.start(&command)
    }

    /// Marks a task stopped after an error and remembers the error for the run outcome.
    fn fail_task(&mut self, index: usize, error: Error) {
        let message = error.to_string();
        self.set_status(index, TaskStatus::Stopped);
        self.notify(QueueEvent::TaskFailed {
            index,
            kind: FailureKind::from(&error),
            message: message.clone(),
        });
        self.first_error.get_or_insert(message);
    }

    /// Feeds a notification of the runner into the control loop.
    ///
    /// Events of a process other than the current one are dropped.
    pub fn handle_runner_event(&mut self, event: RunnerEvent) {
        let current_run = match self.state {
            OrchestratorState::Running { run, .. } | OrchestratorState::Stopping { run, .. } => run,
            OrchestratorState::Idle => {
                debug!(run = event.run(), "runner event while idle");
                return;
            }
        };
        if event.run() != current_run {
            debug!(run = event.run(), current_run, "stale runner event");
            return;
        }

        match event {
            RunnerEvent::Output { bytes, .. } => self.on_output(&bytes),
            RunnerEvent::Finished { result, .. } => self.on_finished(result),
        }
    }

    fn on_output(&mut self, bytes: &[u8]) {
        let OrchestratorState::Running { index, .. } = self.state else {
            return;
        };

        let parsed = self.parser.parse(bytes);
        self.clock.init_process_start();
        self.clock.init_operation_start();

        if let Some(error) = parsed.error {
            // the encoder may still exit on its own; its exit status decides
            debug!(index, %error, "encoder error latched");
            self.latched_error.get_or_insert(error);
        }
        if let Some(bitrate) = parsed.bitrate {
            self.bitrate = Some(bitrate);
        }

        let Some(time_read) = parsed.time_read else {
            return;
        };
        self.clock.update_time(time_read);
        self.clock.update_cum_times();
        self.report_progress(index);
    }

    fn report_progress(&self, index: usize) {
        let Some(task) = self.queue.get(index) else {
            return;
        };
        let file_duration = task.duration();
        debug!(
            index,
            encoded = self.clock.process_cumulative_seconds(),
            eta = ?self.clock.process_remaining_time(self.run_duration),
            "progress"
        );

        self.notify(QueueEvent::OperationProgress(self.clock.operation_progress(file_duration)));
        self.notify(QueueEvent::QueueProgress(self.clock.process_progress(self.run_duration)));
        self.notify(QueueEvent::StatusLine(format!(
            "Converting: {}  At: {}  Operation Remaining Time: {}  Total Elapsed Time: {}",
            task.name(true),
            self.bitrate.as_deref().unwrap_or("N/A"),
            format_duration(self.clock.operation_remaining_time(file_duration)),
            format_duration(self.clock.process_elapsed()),
        )));
    }

    fn on_finished(&mut self, result: Result<ExitStatus, ProcessFailure>) {
        let (index, stopping) = match self.state {
            OrchestratorState::Running { index, .. } => (index, false),
            OrchestratorState::Stopping { index, .. } => (index, true),
            OrchestratorState::Idle => return,
        };

        let tail = self.parser.finish();
        if let Some(error) = tail.error {
            self.latched_error.get_or_insert(error);
        }

        let stopped = self.queue.get(index).map(Task::status) == Some(TaskStatus::Stopped);
        if !stopping && !stopped {
            if self.runner.exited_normally() {
                self.complete_task(index);
            } else {
                let message = self.latched_error.take().unwrap_or_else(|| describe_exit(&result));
                warn!(index, %message, "conversion failed");
                self.fail_task(index, Error::EncoderRuntime { message });
                self.queue
                    .delete_running_output(&self.config.output_dir, self.config.tagged);
            }
        }

        self.state = OrchestratorState::Idle;
        self.launch_next();
    }

    fn complete_task(&mut self, index: usize) {
        let duration = self.queue.get(index).map_or(0.0, Task::duration);
        info!(index, "conversion done");
        self.set_status(index, TaskStatus::Done);

        // credit the whole file, the last progress line rarely lands on the end
        self.clock.update_time(duration);
        self.clock.update_cum_times();
        self.notify(QueueEvent::OperationProgress(100));
        self.notify(QueueEvent::QueueProgress(self.clock.process_progress(self.run_duration)));

        if self.config.delete_input {
            self.queue.delete_running_input();
        }
    }

    fn finish_run(&mut self) {
        let outcome = if let Some(error) = self.first_error.take() {
            RunOutcome::Error(error)
        } else if self.stop_all_requested || self.queue.all_stopped() {
            RunOutcome::Stopped
        } else {
            RunOutcome::Done
        };
        info!(?outcome, "queue run finished");

        self.state = OrchestratorState::Idle;
        self.queue.reset_position();
        self.clock.reset_progress_times();
        self.run_duration = self.queue.total_duration();
        self.stop_all_requested = false;

        self.notify(QueueEvent::OperationProgress(0));
        self.notify(QueueEvent::QueueProgress(0));
        self.notify(QueueEvent::StatusLine("Ready".to_string()));
        self.notify(QueueEvent::RunFinished(outcome));
    }

    /// Stops the running task and goes on with the next one.
    ///
    /// The process is terminated before its partial output is deleted. Calling
    /// this again before the process has finished does nothing.
    pub async fn stop_current(&mut self) {
        let OrchestratorState::Running { index, run } = self.state else {
            return;
        };
        self.state = OrchestratorState::Stopping { index, run };
        self.terminate_running(index).await;

        self.set_status(index, TaskStatus::Stopped);
        self.clock.reset_progress_times();
        self.run_duration = self.queue.duration_after(index);
        self.notify(QueueEvent::OperationProgress(0));
    }

    /// Stops the running task and marks every unfinished task stopped.
    pub async fn stop_all(&mut self) {
        match self.state {
            OrchestratorState::Running { index, run } => {
                self.state = OrchestratorState::Stopping { index, run };
                self.terminate_running(index).await;
            }
            OrchestratorState::Stopping { .. } => {}
            OrchestratorState::Idle => return,
        }

        self.stop_all_requested = true;
        for index in self
            .queue
            .set_status_where(TaskStatus::Stopped, |t| t.status() != TaskStatus::Done)
        {
            self.notify(QueueEvent::TaskStatusChanged {
                index,
                status: TaskStatus::Stopped,
            });
        }
        self.clock.reset_progress_times();
        self.run_duration = 0.0;
        self.notify(QueueEvent::OperationProgress(0));
        self.notify(QueueEvent::QueueProgress(0));
    }

    async fn terminate_running(&mut self, index: usize) {
        info!(index, "stopping conversion");
        if let Err(e) = self.runner.stop().await {
            warn!(index, error = %e, "encoder did not stop cleanly");
        }
        self.queue
            .delete_running_output(&self.config.output_dir, self.config.tagged);
    }

    /// Kills any running encoder and removes its partial output. Used when the
    /// application goes away.
    pub async fn shutdown(&mut self) {
        if let Some(index) = self.current_index() {
            info!(index, "killing encoder on shutdown");
            if let Err(e) = self.runner.kill() {
                warn!(error = %e, "failed to kill encoder");
            }
            if !self.runner.wait_for_exit(self.config.stop_grace_period()).await {
                warn!(index, "encoder still alive after kill");
            }
            self.queue
                .delete_running_output(&self.config.output_dir, self.config.tagged);
            self.state = OrchestratorState::Idle;
            self.queue.reset_position();
        }
    }
}

fn describe_exit(result: &Result<ExitStatus, ProcessFailure>) -> String {
    match result {
        Ok(status) => match status.code() {
            Some(code) => format!("encoder exited with code {code}"),
            None => "encoder was terminated by a signal".to_string(),
        },
        Err(failure) => failure.message.clone(),
    }
}
