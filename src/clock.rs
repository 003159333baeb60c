use std::time::{Duration, Instant};

/// Percentage of `done` over `total`, rounded and clamped to `0..=100`.
/// A non-positive `total` yields `0`.
pub fn percent(done: f64, total: f64) -> u8 {
    if total <= 0.0 || !total.is_finite() || !done.is_finite() {
        return 0;
    }
    (100.0 * done / total).round().clamp(0.0, 100.0) as u8
}

/// Formats a duration as `HH:MM:SS`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Seconds to a `Duration`, saturating at `Duration::MAX` for huge or NaN values.
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Elapsed and encoded time bookkeeping for one queue run.
///
/// Two scopes are tracked: the *process* (the whole run over the queue) and the
/// *operation* (the file currently being encoded). Cumulative figures are in
/// encoded media seconds, so they compare directly against probed durations.
/// Wall-clock start points are only used for elapsed time and throughput.
#[derive(Debug, Default, Clone)]
pub struct ProgressClock {
    process_start: Option<Instant>,
    operation_start: Option<Instant>,
    op_time_read: f64,
    completed_seconds: f64,
    operation_cum: f64,
    process_cum: f64,
}

impl ProgressClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of the run. Later calls are ignored until a reset.
    pub fn init_process_start(&mut self) {
        self.init_process_start_at(Instant::now());
    }

    pub fn init_process_start_at(&mut self, now: Instant) {
        self.process_start.get_or_insert(now);
    }

    /// Marks the start of the current operation. Later calls are ignored until
    /// the next [`begin_operation`](Self::begin_operation).
    pub fn init_operation_start(&mut self) {
        self.init_operation_start_at(Instant::now());
    }

    pub fn init_operation_start_at(&mut self, now: Instant) {
        self.operation_start.get_or_insert(now);
    }

    /// Closes the previous operation and prepares for a new one.
    ///
    /// Whatever the previous operation encoded stays in the process total.
    pub fn begin_operation(&mut self) {
        self.completed_seconds = self.process_cum;
        self.operation_start = None;
        self.op_time_read = 0.0;
        self.operation_cum = 0.0;
    }

    /// Records the latest encoder-reported position into the current file.
    pub fn update_time(&mut self, op_time_read_secs: f64) {
        self.op_time_read = if op_time_read_secs.is_finite() {
            op_time_read_secs.max(0.0)
        } else {
            0.0
        };
    }

    /// Folds the last reported position into the operation and process totals.
    pub fn update_cum_times(&mut self) {
        self.operation_cum = self.op_time_read;
        self.process_cum = self.completed_seconds + self.operation_cum;
    }

    pub fn operation_cumulative_seconds(&self) -> f64 {
        self.operation_cum
    }

    pub fn process_cumulative_seconds(&self) -> f64 {
        self.process_cum
    }

    pub fn operation_progress(&self, file_duration: f64) -> u8 {
        percent(self.operation_cum, file_duration)
    }

    pub fn process_progress(&self, list_duration: f64) -> u8 {
        percent(self.process_cum, list_duration)
    }

    pub fn operation_remaining_time(&self, file_duration: f64) -> Duration {
        saturating_secs((file_duration - self.operation_cum).max(0.0))
    }

    /// Wall time since the run printed its first output.
    pub fn process_elapsed(&self) -> Duration {
        self.process_elapsed_at(Instant::now())
    }

    pub fn process_elapsed_at(&self, now: Instant) -> Duration {
        self.process_start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    pub fn operation_elapsed_at(&self, now: Instant) -> Duration {
        self.operation_start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    /// Estimates the wall time left for the whole run from the throughput so far.
    ///
    /// Returns `None` until something has been encoded.
    pub fn process_remaining_time(&self, list_duration: f64) -> Option<Duration> {
        self.process_remaining_time_at(list_duration, Instant::now())
    }

    pub fn process_remaining_time_at(&self, list_duration: f64, now: Instant) -> Option<Duration> {
        let elapsed = self.process_elapsed_at(now).as_secs_f64();
        if elapsed <= 0.0 || self.process_cum <= 0.0 {
            return None;
        }
        let speed = self.process_cum / elapsed;
        let left = (list_duration - self.process_cum).max(0.0);
        Some(saturating_secs(left / speed))
    }

    /// Zeroes every start point and total. Used when a run is interrupted or ends.
    pub fn reset_progress_times(&mut self) {
        *self = Self::default();
    }
}
