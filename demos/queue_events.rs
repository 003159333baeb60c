use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use encode_queue::{Encoder, QueueConfig, QueueEvent, TargetProfile};
use futures::StreamExt;
use tracing::{error, info, warn};

/// Converts a few files to MP4 and logs the queue's notifications.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Files to convert.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Where converted files go.
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Append the profile name to output file names.
    #[arg(long)]
    tagged: bool,

    /// Burn in `<name>.srt` files found next to the inputs.
    #[arg(long)]
    subtitles: bool,
}

fn mp4_profile() -> TargetProfile {
    TargetProfile::new("MP4", "mp4")
        .preset("Fast", ["-c:v", "libx264", "-preset", "veryfast", "-c:a", "aac"])
        .preset("High", ["-c:v", "libx264", "-crf", "18", "-c:a", "aac"])
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    // Attempt to discover ffmpeg
    let encoder = match Encoder::new().await {
        Ok(encoder) => encoder,
        Err(e) => {
            error!("Error finding ffmpeg: {}", e);
            error!("Please ensure ffmpeg is installed and in your system PATH.");
            return;
        }
    };
    info!("Found ffmpeg: {}", encoder.version());

    let config = QueueConfig::new(cli.output_dir)
        .tagged(cli.tagged)
        .subtitle(cli.subtitles);
    let mut queue = encoder.queue(config, Arc::new(encoder.prober()));

    if let Err(e) = queue.add_tasks(cli.inputs, mp4_profile(), "Fast").await {
        error!("Failed to queue files: {}", e);
        return;
    }

    let mut events = queue.events();
    while let Some(event) = events.next().await {
        match event {
            QueueEvent::TasksRejected(rejections) => {
                for rejection in rejections {
                    warn!(path = ?rejection.path, reason = %rejection.reason, "File skipped");
                }
            }
            QueueEvent::IntakeSettled { accepted, .. } => {
                info!(accepted, "Files queued");
                break;
            }
            _ => {}
        }
    }
    drop(events);

    if let Err(e) = queue.start_queue().await {
        error!("Failed to start the queue: {}", e);
        return;
    }

    let mut events = queue.events();
    while let Some(event) = events.next().await {
        match event {
            QueueEvent::StatusLine(line) => info!("{}", line),
            QueueEvent::QueueProgress(p) => info!(progress = p, "Queue progress"),
            QueueEvent::TaskStatusChanged { index, status } => info!(index, %status, "Task status"),
            QueueEvent::TaskFailed { index, kind, message } => warn!(index, ?kind, %message, "Task failed"),
            QueueEvent::RunFinished(outcome) => {
                info!(?outcome, "Queue finished");
                break;
            }
            _ => {}
        }
    }
    drop(events);

    if let Err(e) = queue.shutdown().await {
        error!("Queue service did not shut down cleanly: {}", e);
    }
}
