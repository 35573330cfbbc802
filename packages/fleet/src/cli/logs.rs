use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use fleet_link::logs::{HttpLogSource, LogConsumer, LogRequest, LogView, StreamStatus, Tail};
use fleet_link::{LogConfig, TransportError};

/// Prints committed lines to stdout as they arrive.
pub struct StdoutView<W> {
    out: W,
}

impl<W: Write> StdoutView<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send + 'static> LogView for StdoutView<W> {
    fn render(&mut self, appended: &[String], _tail: Tail<'_>) {
        for line in appended {
            let _ = writeln!(self.out, "{line}");
        }
        let _ = self.out.flush();
    }

    // A terminal always follows its own output.
    fn scroll_to_bottom(&mut self) {}

    fn show_error(&mut self, error: &TransportError) {
        eprintln!("[fleet: log stream failed: {error}]");
    }
}

pub struct LogsOptions {
    pub request: LogRequest,
    /// Where to save the collected history once the stream stops.
    pub download: Option<PathBuf>,
}

/// Stream one task's logs until the body ends, the stream fails, or Ctrl-C.
pub async fn run(
    address: &str,
    options: LogsOptions,
    config: LogConfig,
) -> Result<StreamStatus> {
    let client = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let source = HttpLogSource::new(client, address);
    let consumer = LogConsumer::new(source, StdoutView::new(std::io::stdout()), config);

    info!(
        alloc = %options.request.alloc_id,
        task = %options.request.task,
        kind = %options.request.kind,
        follow = options.request.follow,
        "streaming logs"
    );
    consumer.start(options.request);

    let mut status = consumer.status();
    let finished = tokio::select! {
        done = status.wait_for(|s| matches!(s, StreamStatus::Ended | StreamStatus::Failed(_))) => {
            done.map(|s| s.clone()).unwrap_or(StreamStatus::Stopped)
        }
        _ = tokio::signal::ctrl_c() => {
            consumer.stop();
            StreamStatus::Stopped
        }
    };

    if let Some(path) = options.download {
        let lines = consumer
            .download(&path)
            .await
            .with_context(|| format!("Failed to write logs to {}", path.display()))?;
        eprintln!("[fleet: wrote {lines} lines to {}]", path.display());
    }

    consumer.shutdown();
    Ok(finished)
}
