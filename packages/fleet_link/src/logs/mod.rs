//! Chunked log stream consumer.
//!
//! A [`LogConsumer`] turns one cancellable byte stream into a bounded,
//! batched tail of lines for a [`LogView`], while keeping every line of the
//! session for export. Lines are committed on a short batch timer rather
//! than one by one, and scroll-to-bottom is throttled separately.
//!
//! Transport failures are shown inline and never retried; the caller
//! decides whether to `start` again.

pub mod buffer;
pub mod decoder;
pub mod source;

use bytes::Bytes;
use futures::StreamExt;
use std::future::pending;
use std::path::Path;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Sleep, sleep};
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::error::{LinkError, Result, TransportError};

pub use buffer::{AutoScroll, LogBuffer, Tail, Viewport};
pub use decoder::{LineDecoder, Utf8StreamDecoder};
pub use source::{ChunkStream, HttpLogSource, LogKind, LogRequest, LogSource, Origin};

/// Rendering side of a consumer.
pub trait LogView: Send + 'static {
    /// Called after each flush. `appended` holds the lines committed by this
    /// flush; `tail` is the full visible suffix.
    fn render(&mut self, appended: &[String], tail: Tail<'_>);

    fn scroll_to_bottom(&mut self);

    fn show_error(&mut self, error: &TransportError);

    fn cleared(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamStatus {
    #[default]
    Idle,
    Streaming,
    /// The server finished the body.
    Ended,
    Stopped,
    Failed(String),
}

enum LogCommand {
    Start(LogRequest),
    Stop,
    Clear,
    Append(String),
    Flush,
    SetAutoScroll(bool),
    Scroll(Viewport),
    History {
        respond_to: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

/// Handle to a running consumer. Dropping it cancels the stream and every
/// timer.
pub struct LogConsumer {
    sender: mpsc::UnboundedSender<LogCommand>,
    status: watch::Receiver<StreamStatus>,
}

impl LogConsumer {
    pub fn new<S, V>(source: S, view: V, config: LogConfig) -> Self
    where
        S: LogSource,
        V: LogView,
    {
        let config = config.normalized();
        let (sender, commands) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(StreamStatus::Idle);

        let actor = LogActor {
            source,
            view,
            buffer: LogBuffer::new(&config),
            auto_scroll: AutoScroll::new(f64::from(config.near_bottom_px)),
            decoder: LineDecoder::new(),
            stream: None,
            batch: None,
            scroll: None,
            status: status_tx,
            config,
        };
        tokio::spawn(actor.run(commands));

        Self { sender, status }
    }

    /// Open a stream, cancelling any stream already running.
    pub fn start(&self, request: LogRequest) {
        let _ = self.sender.send(LogCommand::Start(request));
    }

    /// Cancel the stream. Buffers are kept.
    pub fn stop(&self) {
        let _ = self.sender.send(LogCommand::Stop);
    }

    /// Empty the pending queue, display buffer and history.
    pub fn clear(&self) {
        let _ = self.sender.send(LogCommand::Clear);
    }

    pub fn append(&self, line: impl Into<String>) {
        let _ = self.sender.send(LogCommand::Append(line.into()));
    }

    /// Commit pending lines now instead of waiting for the batch timer.
    pub fn flush(&self) {
        let _ = self.sender.send(LogCommand::Flush);
    }

    pub fn set_auto_scroll(&self, enabled: bool) {
        let _ = self.sender.send(LogCommand::SetAutoScroll(enabled));
    }

    /// Report the view's scroll geometry after the user scrolls.
    pub fn on_scroll(&self, viewport: Viewport) {
        let _ = self.sender.send(LogCommand::Scroll(viewport));
    }

    /// Every line of the session, pending lines included.
    pub async fn history(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LogCommand::History { respond_to: tx })
            .map_err(|_| LinkError::ActorGone)?;
        rx.await.map_err(|_| LinkError::ActorGone)
    }

    /// Write the full history to `path`, one line per `\n`. Returns the
    /// number of lines written.
    pub async fn download(&self, path: impl AsRef<Path>) -> Result<usize> {
        let lines = self.history().await?;
        let mut contents = lines.join("\n");
        if !lines.is_empty() {
            contents.push('\n');
        }
        tokio::fs::write(path.as_ref(), contents).await?;
        info!(path = %path.as_ref().display(), lines = lines.len(), "log history written");
        Ok(lines.len())
    }

    pub fn status(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(LogCommand::Shutdown);
    }
}

impl Drop for LogConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LogActor<S, V> {
    source: S,
    view: V,
    config: LogConfig,
    buffer: LogBuffer,
    auto_scroll: AutoScroll,
    decoder: LineDecoder,
    stream: Option<ChunkStream>,
    batch: Option<Pin<Box<Sleep>>>,
    scroll: Option<Pin<Box<Sleep>>>,
    status: watch::Sender<StreamStatus>,
}

impl<S: LogSource, V: LogView> LogActor<S, V> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<LogCommand>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(LogCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                chunk = next_chunk(&mut self.stream) => self.on_chunk(chunk),
                () = wait(&mut self.batch) => {
                    self.batch = None;
                    self.flush();
                }
                () = wait(&mut self.scroll) => {
                    self.scroll = None;
                    if self.auto_scroll.enabled() {
                        self.view.scroll_to_bottom();
                    }
                }
            }
        }

        // Dropping the stream cancels the request.
        self.stream = None;
        self.batch = None;
        self.scroll = None;
        debug!("log consumer stopped");
    }

    fn handle_command(&mut self, cmd: LogCommand) {
        match cmd {
            LogCommand::Start(request) => self.start(request),
            LogCommand::Stop => {
                if self.stream.take().is_some() {
                    info!("log stream stopped");
                    self.finish_decoder();
                    self.decoder.reset();
                    self.status.send_replace(StreamStatus::Stopped);
                }
                self.flush();
            }
            LogCommand::Clear => {
                self.buffer.clear();
                self.batch = None;
                self.view.cleared();
            }
            LogCommand::Append(line) => self.append(line),
            LogCommand::Flush => self.flush(),
            LogCommand::SetAutoScroll(enabled) => {
                self.auto_scroll.set(enabled);
                if enabled {
                    self.arm_scroll();
                }
            }
            LogCommand::Scroll(viewport) => {
                if !self.auto_scroll.on_scroll(viewport) {
                    self.scroll = None;
                }
            }
            LogCommand::History { respond_to } => {
                self.flush();
                let _ = respond_to.send(self.buffer.history().to_vec());
            }
            LogCommand::Shutdown => {}
        }
    }

    fn start(&mut self, request: LogRequest) {
        if self.stream.take().is_some() {
            debug!("cancelling previous log stream");
        }
        self.decoder.reset();
        info!(
            alloc = %request.alloc_id,
            task = %request.task,
            kind = %request.kind,
            follow = request.follow,
            "opening log stream"
        );
        self.stream = Some(self.source.open(&request));
        self.status.send_replace(StreamStatus::Streaming);
    }

    fn on_chunk(&mut self, chunk: Option<std::result::Result<Bytes, TransportError>>) {
        match chunk {
            Some(Ok(bytes)) => {
                let lines = self.decoder.feed(&bytes);
                self.append_lines(lines);
            }
            Some(Err(e)) => {
                warn!(error = %e, "log stream failed");
                self.stream = None;
                self.finish_decoder();
                self.flush();
                self.view.show_error(&e);
                self.status.send_replace(StreamStatus::Failed(e.to_string()));
            }
            None => {
                debug!("log stream ended");
                self.stream = None;
                self.finish_decoder();
                self.flush();
                self.status.send_replace(StreamStatus::Ended);
            }
        }
    }

    /// Emit whatever fragment the decoder is still carrying.
    fn finish_decoder(&mut self) {
        let lines = self.decoder.finish();
        self.append_lines(lines);
    }

    fn append_lines(&mut self, lines: Vec<String>) {
        for line in lines {
            self.append(line);
        }
    }

    fn append(&mut self, line: String) {
        self.buffer.push_pending(line);
        if self.batch.is_none() {
            self.batch = Some(Box::pin(sleep(self.config.batch_interval())));
        }
    }

    fn flush(&mut self) {
        self.batch = None;
        if !self.buffer.has_pending() {
            return;
        }
        let start = self.buffer.commit();
        self.view.render(self.buffer.since(start), self.buffer.tail());
        self.arm_scroll();
    }

    fn arm_scroll(&mut self) {
        if self.auto_scroll.enabled() && self.scroll.is_none() {
            self.scroll = Some(Box::pin(sleep(self.config.scroll_throttle())));
        }
    }
}

async fn next_chunk(
    stream: &mut Option<ChunkStream>,
) -> Option<std::result::Result<Bytes, TransportError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn wait(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as chunk_mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type ChunkSender = chunk_mpsc::UnboundedSender<std::result::Result<Bytes, TransportError>>;

    #[derive(Clone, Default)]
    struct FakeSource {
        opened: Arc<Mutex<Vec<(LogRequest, ChunkSender)>>>,
    }

    impl FakeSource {
        fn sender(&self, index: usize) -> ChunkSender {
            self.opened.lock().unwrap()[index].1.clone()
        }

        fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    impl LogSource for FakeSource {
        fn open(&self, request: &LogRequest) -> ChunkStream {
            let (tx, rx) = chunk_mpsc::unbounded();
            self.opened.lock().unwrap().push((request.clone(), tx));
            rx.boxed()
        }
    }

    #[derive(Default)]
    struct Recorded {
        renders: Vec<(Vec<String>, Vec<String>)>,
        scrolls: usize,
        errors: Vec<String>,
        cleared: usize,
    }

    #[derive(Clone, Default)]
    struct RecordingView(Arc<Mutex<Recorded>>);

    impl RecordingView {
        fn appended(&self) -> Vec<String> {
            let rec = self.0.lock().unwrap();
            rec.renders.iter().flat_map(|(a, _)| a.clone()).collect()
        }

        fn render_count(&self) -> usize {
            self.0.lock().unwrap().renders.len()
        }

        fn last_tail(&self) -> Vec<String> {
            let rec = self.0.lock().unwrap();
            rec.renders.last().map(|(_, t)| t.clone()).unwrap_or_default()
        }

        fn scrolls(&self) -> usize {
            self.0.lock().unwrap().scrolls
        }
    }

    impl LogView for RecordingView {
        fn render(&mut self, appended: &[String], tail: Tail<'_>) {
            self.0
                .lock()
                .unwrap()
                .renders
                .push((appended.to_vec(), tail.cloned().collect()));
        }

        fn scroll_to_bottom(&mut self) {
            self.0.lock().unwrap().scrolls += 1;
        }

        fn show_error(&mut self, error: &TransportError) {
            self.0.lock().unwrap().errors.push(error.to_string());
        }

        fn cleared(&mut self) {
            self.0.lock().unwrap().cleared += 1;
        }
    }

    fn chunk(text: &str) -> std::result::Result<Bytes, TransportError> {
        Ok(Bytes::copy_from_slice(text.as_bytes()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn consumer(config: LogConfig) -> (LogConsumer, FakeSource, RecordingView) {
        let source = FakeSource::default();
        let view = RecordingView::default();
        let consumer = LogConsumer::new(source.clone(), view.clone(), config);
        (consumer, source, view)
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_are_batched_into_one_render() {
        let (consumer, source, view) = consumer(LogConfig::default());
        consumer.start(LogRequest::new("a1", "web"));
        settle().await;
        assert_eq!(*consumer.status().borrow(), StreamStatus::Streaming);

        let tx = source.sender(0);
        tx.unbounded_send(chunk("line1\nline2\nparti")).unwrap();
        tx.unbounded_send(chunk("al\nline4\n")).unwrap();
        settle().await;
        assert_eq!(view.render_count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(view.render_count(), 1);
        assert_eq!(view.appended(), ["line1", "line2", "partial", "line4"]);
        assert_eq!(view.scrolls(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(view.scrolls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scroll_is_throttled_across_flushes() {
        let (consumer, _source, view) = consumer(LogConfig::default());
        for i in 0..5 {
            consumer.append(format!("l{i}"));
            consumer.flush();
            settle().await;
        }
        assert_eq!(view.render_count(), 5);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(view.scrolls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_and_tail_stay_bounded_while_history_is_complete() {
        let config = LogConfig {
            max_log_lines: 10,
            max_display_lines: 4,
            ..Default::default()
        };
        let (consumer, _source, view) = consumer(config);
        for i in 0..25 {
            consumer.append(format!("line {i}"));
            if i % 6 == 0 {
                consumer.flush();
            }
            settle().await;
            assert!(view.last_tail().len() <= 4);
        }
        consumer.flush();
        settle().await;
        assert_eq!(view.last_tail(), ["line 21", "line 22", "line 23", "line 24"]);

        let history = consumer.history().await.unwrap();
        assert_eq!(history.len(), 25);
        assert_eq!(history[0], "line 0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_writes_full_history() {
        let config = LogConfig {
            max_log_lines: 3,
            max_display_lines: 2,
            ..Default::default()
        };
        let (consumer, source, _view) = consumer(config);
        consumer.start(LogRequest::new("a1", "web"));
        settle().await;
        source
            .sender(0)
            .unbounded_send(chunk("data: \"one\\ntwo\"\ndata: three\ndata: four\ndata: five\n"))
            .unwrap();
        settle().await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        // Pending lines are included even before the batch timer fires.
        let written = consumer.download(&path).await.unwrap();
        assert_eq!(written, 5);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "one\ntwo\nthree\nfour\nfive\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_scroll_disables_auto_scroll_until_toggled() {
        let (consumer, _source, view) = consumer(LogConfig::default());
        let bottom = Viewport {
            scroll_top: 950.0,
            scroll_height: 1000.0,
            client_height: 50.0,
        };
        let reading = Viewport {
            scroll_top: 200.0,
            ..bottom
        };

        consumer.on_scroll(reading);
        consumer.append("a");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(view.render_count(), 1);
        assert_eq!(view.scrolls(), 0);

        consumer.on_scroll(bottom);
        consumer.append("b");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(view.scrolls(), 0);

        consumer.set_auto_scroll(true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(view.scrolls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cancels_previous_stream() {
        let (consumer, source, view) = consumer(LogConfig::default());
        consumer.start(LogRequest::new("a1", "web"));
        settle().await;
        let first = source.sender(0);

        let second_request = LogRequest {
            kind: LogKind::Stderr,
            ..LogRequest::new("a1", "web")
        };
        consumer.start(second_request.clone());
        settle().await;
        assert!(first.is_closed());
        assert_eq!(source.open_count(), 2);
        assert_eq!(source.opened.lock().unwrap()[1].0, second_request);

        source.sender(1).unbounded_send(chunk("err\n")).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(view.appended(), ["err"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_shown_and_not_retried() {
        let (consumer, source, view) = consumer(LogConfig::default());
        consumer.start(LogRequest::new("a1", "web"));
        settle().await;
        let tx = source.sender(0);
        tx.unbounded_send(chunk("ok\nhalf")).unwrap();
        tx.unbounded_send(Err(TransportError::Http(500))).unwrap();
        settle().await;

        // The carried fragment is kept and flushed right away.
        assert_eq!(view.appended(), ["ok", "half"]);
        assert_eq!(
            view.0.lock().unwrap().errors,
            vec!["server responded with HTTP 500".to_string()]
        );
        assert!(matches!(*consumer.status().borrow(), StreamStatus::Failed(_)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_buffers_and_flushes_pending() {
        let (consumer, source, view) = consumer(LogConfig::default());
        consumer.start(LogRequest::new("a1", "web"));
        settle().await;
        let tx = source.sender(0);
        tx.unbounded_send(chunk("a\nb\n")).unwrap();
        settle().await;

        consumer.stop();
        consumer.stop();
        settle().await;
        assert!(tx.is_closed());
        assert_eq!(*consumer.status().borrow(), StreamStatus::Stopped);
        assert_eq!(view.appended(), ["a", "b"]);
        assert_eq!(consumer.history().await.unwrap(), ["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_empties_all_buffers() {
        let (consumer, _source, view) = consumer(LogConfig::default());
        consumer.append("a");
        consumer.flush();
        consumer.append("pending");
        consumer.clear();
        settle().await;
        assert_eq!(view.0.lock().unwrap().cleared, 1);
        assert!(consumer.history().await.unwrap().is_empty());

        // The cleared pending line must not surface on the next flush.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(view.render_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_emits_carried_fragment() {
        let (consumer, source, view) = consumer(LogConfig::default());
        consumer.start(LogRequest {
            follow: false,
            ..LogRequest::new("a1", "web")
        });
        settle().await;
        let tx = source.sender(0);
        tx.unbounded_send(chunk("x\nno newline")).unwrap();
        drop(tx);
        source.opened.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(view.appended(), ["x", "no newline"]);
        assert_eq!(*consumer.status().borrow(), StreamStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_stream() {
        let (consumer, source, _view) = consumer(LogConfig::default());
        consumer.start(LogRequest::new("a1", "web"));
        settle().await;
        let tx = source.sender(0);
        drop(consumer);
        settle().await;
        assert!(tx.is_closed());
    }
}
