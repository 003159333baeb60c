use std::collections::VecDeque;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::Error;
use crate::event::QueueEvent;
use crate::orchestrator::Orchestrator;
use crate::probe::{IntakeEvent, Prober, Rejection, spawn_intake};
use crate::runner::RunnerEvent;
use crate::task::{TargetProfile, Task};

type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// A request from the front-end to the queue service.
#[derive(Debug)]
enum Intent {
    AddTasks {
        paths: Vec<PathBuf>,
        profile: TargetProfile,
        quality: String,
    },
    RemoveTask {
        index: usize,
        reply: Reply<()>,
    },
    ClearQueue {
        reply: Reply<()>,
    },
    UpdateTaskOptions {
        index: usize,
        profile: TargetProfile,
        quality: String,
        reply: Reply<()>,
    },
    UpdateAllOptions {
        profile: TargetProfile,
        quality: String,
        reply: Reply<()>,
    },
    Tasks {
        reply: Reply<Vec<Task>>,
    },
    StartQueue,
    StopCurrent,
    StopAll,
    Shutdown,
}

struct Batch {
    paths: Vec<PathBuf>,
    profile: TargetProfile,
    quality: String,
}

/// The event loop that owns the [`Orchestrator`].
///
/// It waits on three sources: intents from the [`QueueHandle`], output of the
/// encoder process, and results of the background intake worker.
struct QueueService {
    orchestrator: Orchestrator,
    prober: Arc<dyn Prober>,
    intents: mpsc::Receiver<Intent>,
    runner_events: mpsc::UnboundedReceiver<RunnerEvent>,
    intake: Option<mpsc::Receiver<IntakeEvent>>,
    pending_batches: VecDeque<Batch>,
    // outcome of the batch being probed
    accepted: usize,
    rejections: Vec<Rejection>,
}

async fn next_intake(intake: &mut Option<mpsc::Receiver<IntakeEvent>>) -> Option<IntakeEvent> {
    match intake {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl QueueService {
    async fn run(mut self) {
        loop {
            select! {
                intent = self.intents.recv() => match intent {
                    Some(Intent::Shutdown) | None => break,
                    Some(intent) => self.handle_intent(intent).await,
                },
                Some(event) = self.runner_events.recv() => {
                    self.orchestrator.handle_runner_event(event);
                },
                event = next_intake(&mut self.intake) => match event {
                    Some(event) => self.handle_intake(event),
                    None => {
                        warn!("intake worker ended before the batch settled");
                        self.settle_batch();
                    }
                },
            }
        }

        self.orchestrator.shutdown().await;
        info!("queue service stopped");
    }

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::AddTasks {
                paths,
                profile,
                quality,
            } => {
                self.pending_batches.push_back(Batch {
                    paths,
                    profile,
                    quality,
                });
                self.start_next_batch();
            }
            Intent::RemoveTask { index, reply } => {
                let _ = reply.send(self.orchestrator.remove_task(index));
            }
            Intent::ClearQueue { reply } => {
                let _ = reply.send(self.orchestrator.clear_queue());
            }
            Intent::UpdateTaskOptions {
                index,
                profile,
                quality,
                reply,
            } => {
                let _ = reply.send(self.orchestrator.update_task_options(index, profile, quality));
            }
            Intent::UpdateAllOptions {
                profile,
                quality,
                reply,
            } => {
                let _ = reply.send(self.orchestrator.update_all_options(profile, quality));
            }
            Intent::Tasks { reply } => {
                let _ = reply.send(Ok(self.orchestrator.queue().iter().cloned().collect()));
            }
            Intent::StartQueue => self.orchestrator.start_queue(),
            Intent::StopCurrent => self.orchestrator.stop_current().await,
            Intent::StopAll => self.orchestrator.stop_all().await,
            Intent::Shutdown => {}
        }
    }

    /// Starts probing the next batch unless one is already being probed.
    fn start_next_batch(&mut self) {
        if self.intake.is_some() {
            return;
        }
        if let Some(batch) = self.pending_batches.pop_front() {
            debug!(files = batch.paths.len(), "probing batch");
            self.intake = Some(spawn_intake(
                Arc::clone(&self.prober),
                batch.paths,
                batch.profile,
                batch.quality,
            ));
        }
    }

    fn handle_intake(&mut self, event: IntakeEvent) {
        match event {
            IntakeEvent::Accepted(task) => {
                let path = task.source().to_path_buf();
                match self.orchestrator.accept_task(task) {
                    Ok(_) => self.accepted += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "probed file rejected by the queue");
                        self.rejections.push(Rejection {
                            path,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            IntakeEvent::Rejected(rejection) => self.rejections.push(rejection),
            IntakeEvent::Settled { .. } => self.settle_batch(),
        }
    }

    /// Reports the current batch and moves on to the next one.
    fn settle_batch(&mut self) {
        let rejections = std::mem::take(&mut self.rejections);
        let accepted = std::mem::take(&mut self.accepted);
        let rejected = rejections.len();
        if !rejections.is_empty() {
            self.orchestrator.notify(QueueEvent::TasksRejected(rejections));
        }
        self.orchestrator
            .notify(QueueEvent::IntakeSettled { accepted, rejected });
        self.intake = None;
        self.start_next_batch();
    }
}

/// A handle to a running queue service.
///
/// Methods send intents to the service; notifications come back through
/// [`events`](Self::events) or [`next_event`](Self::next_event).
#[derive(Debug)]
pub struct QueueHandle {
    intents: mpsc::Sender<Intent>,
    events: mpsc::UnboundedReceiver<QueueEvent>,
    service: JoinHandle<()>,
}

impl QueueHandle {
    /// Spawns the queue service on the current tokio runtime.
    pub fn spawn(encoder: impl Into<PathBuf>, config: QueueConfig, prober: Arc<dyn Prober>) -> Self {
        let (intent_tx, intent_rx) = mpsc::channel(64);
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let service = QueueService {
            orchestrator: Orchestrator::new(encoder, config, runner_tx, event_tx),
            prober,
            intents: intent_rx,
            runner_events: runner_rx,
            intake: None,
            pending_batches: VecDeque::new(),
            accepted: 0,
            rejections: Vec::new(),
        };

        Self {
            intents: intent_tx,
            events: event_rx,
            service: tokio::spawn(service.run()),
        }
    }

    async fn send(&self, intent: Intent) -> Result<(), Error> {
        self.intents.send(intent).await.map_err(|_| Error::ServiceClosed)
    }

    async fn request<T>(&self, intent: impl FnOnce(Reply<T>) -> Intent) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.send(intent(reply)).await?;
        response.await.map_err(|_| Error::ServiceClosed)?
    }

    /// Probes `paths` in the background and queues every valid file.
    ///
    /// Outcomes arrive as `TaskAdded`, `TasksRejected` and finally `IntakeSettled` events.
    pub async fn add_tasks<I, P>(&self, paths: I, profile: TargetProfile, quality: impl Into<String>) -> Result<(), Error>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.send(Intent::AddTasks {
            paths: paths.into_iter().map(Into::into).collect(),
            profile,
            quality: quality.into(),
        })
        .await
    }

    pub async fn remove_task(&self, index: usize) -> Result<(), Error> {
        self.request(|reply| Intent::RemoveTask { index, reply }).await
    }

    pub async fn clear_queue(&self) -> Result<(), Error> {
        self.request(|reply| Intent::ClearQueue { reply }).await
    }

    pub async fn update_task_options(
        &self,
        index: usize,
        profile: TargetProfile,
        quality: impl Into<String>,
    ) -> Result<(), Error> {
        let quality = quality.into();
        self.request(|reply| Intent::UpdateTaskOptions {
            index,
            profile,
            quality,
            reply,
        })
        .await
    }

    pub async fn update_all_options(&self, profile: TargetProfile, quality: impl Into<String>) -> Result<(), Error> {
        let quality = quality.into();
        self.request(|reply| Intent::UpdateAllOptions {
            profile,
            quality,
            reply,
        })
        .await
    }

    /// A snapshot of the queue.
    pub async fn tasks(&self) -> Result<Vec<Task>, Error> {
        self.request(|reply| Intent::Tasks { reply }).await
    }

    pub async fn start_queue(&self) -> Result<(), Error> {
        self.send(Intent::StartQueue).await
    }

    pub async fn stop_current(&self) -> Result<(), Error> {
        self.send(Intent::StopCurrent).await
    }

    pub async fn stop_all(&self) -> Result<(), Error> {
        self.send(Intent::StopAll).await
    }

    /// Waits for the next notification. Returns `None` once the service is gone.
    pub async fn next_event(&mut self) -> Option<QueueEvent> {
        self.events.recv().await
    }

    /// Returns an async stream of the service's notifications.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use encode_queue::{Encoder, QueueConfig, QueueEvent};
    /// # use futures::StreamExt;
    /// # use std::sync::Arc;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let encoder = Encoder::new().await?;
    /// let mut queue = encoder.queue(QueueConfig::new("/tmp"), Arc::new(encoder.prober()));
    /// queue.start_queue().await?;
    /// let mut events = queue.events();
    /// while let Some(event) = events.next().await {
    ///     match event {
    ///         QueueEvent::QueueProgress(p) => println!("Queue: {}%", p),
    ///         QueueEvent::RunFinished(_) => break,
    ///         _ => {}
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn events(&mut self) -> Pin<Box<impl Stream<Item = QueueEvent> + '_>> {
        let s = stream! {
            while let Some(event) = self.events.recv().await {
                yield event;
            }
        };
        Box::pin(s)
    }

    /// Kills any running conversion and waits for the service to end.
    pub async fn shutdown(self) -> Result<(), Error> {
        // a closed channel means the service is already gone
        let _ = self.intents.send(Intent::Shutdown).await;
        self.service.await.map_err(|_| Error::ServiceClosed)
    }
}
