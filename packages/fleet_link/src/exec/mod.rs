//! Interactive exec channel.
//!
//! One [`ExecSession`] drives one remote process over its own socket:
//! `Connecting → Open → ClosedNormal | ClosedAbnormal`. A session is never
//! reconnected; once it reaches a closed state the caller has to open a new
//! one.
//!
//! Teardown sets a flag shared between the handle and the session task.
//! The task checks it before acting on any socket event, so output that was
//! already in flight when the user closed the terminal is discarded.

pub mod protocol;
pub mod registry;

use std::future::pending;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Sleep, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecConfig;
use crate::error::{ApplicationError, LinkError, TransportError};
use crate::socket::{Connector, NORMAL_CLOSURE, SocketEvent, SocketLink};

pub use protocol::{ClientFrame, ExecRequest, Geometry, ServerFrame, SessionKey};
pub use registry::SessionRegistry;

/// Where remote output is written.
pub trait TerminalSurface: Send + 'static {
    fn write_stdout(&mut self, data: &str);
    /// Diagnostic output; implementations should make it look different.
    fn write_stderr(&mut self, data: &str);
    fn write_notice(&mut self, text: &str);
    fn write_error(&mut self, text: &str);
}

/// Writes to any byte sink, colouring stderr and errors with ANSI escapes.
pub struct AnsiSurface<W> {
    out: W,
}

impl<W: Write> AnsiSurface<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()) {
            debug!(error = %e, "terminal write failed");
        }
    }
}

impl<W: Write + Send + 'static> TerminalSurface for AnsiSurface<W> {
    fn write_stdout(&mut self, data: &str) {
        self.emit(data);
    }

    fn write_stderr(&mut self, data: &str) {
        self.emit(&format!("\x1b[31m{data}\x1b[0m"));
    }

    fn write_notice(&mut self, text: &str) {
        self.emit(&format!("\r\n\x1b[2m{text}\x1b[0m\r\n"));
    }

    fn write_error(&mut self, text: &str) {
        self.emit(&format!("\r\n\x1b[1;31m{text}\x1b[0m\r\n"));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    /// The process exited, or the user closed the session.
    ClosedNormal {
        exit_code: Option<i32>,
        /// Last `error` frame the server sent, if any.
        remote_error: Option<String>,
    },
    ClosedAbnormal {
        error: TransportError,
    },
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClosedNormal { .. } | Self::ClosedAbnormal { .. })
    }

    /// Exit code of a clean run, or why the run was not clean.
    pub fn into_result(self) -> Result<i32, LinkError> {
        match self {
            Self::ClosedNormal {
                exit_code: Some(code),
                ..
            } if code != 0 => Err(ApplicationError::NonZeroExit(code).into()),
            Self::ClosedNormal {
                exit_code: None,
                remote_error: Some(msg),
            } => Err(ApplicationError::Remote(msg).into()),
            Self::ClosedNormal { exit_code, .. } => Ok(exit_code.unwrap_or(0)),
            Self::ClosedAbnormal { error } => Err(error.into()),
            Self::Connecting | Self::Open => Err(LinkError::Cancelled),
        }
    }
}

enum SessionCommand {
    Input(String),
    Resize(Geometry),
    Close,
}

/// Handle to one exec session. Dropping it closes the session.
pub struct ExecSession {
    id: Uuid,
    key: SessionKey,
    sender: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    torn_down: Arc<AtomicBool>,
}

impl ExecSession {
    pub fn open<C, T>(
        connector: Arc<C>,
        ws_base: &str,
        request: ExecRequest,
        geometry: Geometry,
        surface: T,
        config: &ExecConfig,
    ) -> Self
    where
        C: Connector,
        T: TerminalSurface,
    {
        let id = Uuid::new_v4();
        let key = request.key();
        let torn_down = Arc::new(AtomicBool::new(false));
        let (sender, commands) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Connecting);

        info!(
            session = %id,
            alloc = %request.alloc_id,
            task = %request.task,
            command = ?request.command,
            "opening exec session"
        );

        let actor = SessionActor {
            id,
            connector,
            url: request.url(ws_base),
            surface,
            link: None,
            connecting: None,
            settle: None,
            settle_delay: config.settle_delay(),
            geometry,
            remote_error: None,
            close_sent: false,
            torn_down: torn_down.clone(),
            state: state_tx,
        };
        tokio::spawn(actor.run(commands));

        Self {
            id,
            key,
            sender,
            state,
            torn_down,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Keystrokes for the remote process. Dropped unless the session is Open.
    pub fn send_input(&self, data: impl Into<String>) {
        let _ = self.sender.send(SessionCommand::Input(data.into()));
    }

    /// Before the settle resize has gone out only the latest geometry is kept.
    pub fn resize(&self, geometry: Geometry) {
        let _ = self.sender.send(SessionCommand::Resize(geometry));
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches a closed state.
    pub async fn closed(&self) -> SessionState {
        let mut state = self.state.clone();
        if let Ok(closed) = state.wait_for(SessionState::is_closed).await {
            return closed.clone();
        }
        let last = state.borrow().clone();
        last
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Tear the session down. Only the first call has any effect.
    pub fn close(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = %self.id, "closing exec session");
        let _ = self.sender.send(SessionCommand::Close);
    }
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionActor<C, T> {
    id: Uuid,
    connector: Arc<C>,
    url: Result<reqwest::Url, TransportError>,
    surface: T,
    link: Option<SocketLink>,
    connecting: Option<JoinHandle<Result<SocketLink, TransportError>>>,
    settle: Option<Pin<Box<Sleep>>>,
    settle_delay: Duration,
    geometry: Geometry,
    remote_error: Option<String>,
    close_sent: bool,
    torn_down: Arc<AtomicBool>,
    state: watch::Sender<SessionState>,
}

impl<C: Connector, T: TerminalSurface> SessionActor<C, T> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        match self.url.clone() {
            Ok(url) => {
                let connector = self.connector.clone();
                self.connecting = Some(tokio::spawn(async move {
                    connector.connect(url.as_str()).await
                }));
            }
            Err(e) => self.fail(e),
        }

        while !self.is_closed() {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Input(data)) => self.send_input(data),
                    Some(SessionCommand::Resize(geometry)) => self.resize(geometry),
                    Some(SessionCommand::Close) | None => self.teardown(),
                },
                result = join_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect(result);
                }
                event = next_event(&mut self.link) => self.on_event(event),
                () = wait(&mut self.settle) => {
                    self.settle = None;
                    self.send_resize();
                }
            }
        }

        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
        self.settle = None;
        self.link = None;
        let final_state = self.state.borrow().clone();
        debug!(session = %self.id, state = ?final_state, "exec session ended");
    }

    fn is_closed(&self) -> bool {
        self.state.borrow().is_closed()
    }

    fn is_open(&self) -> bool {
        *self.state.borrow() == SessionState::Open
    }

    fn torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn on_connect(&mut self, result: Result<SocketLink, TransportError>) {
        if self.torn_down() {
            if let Ok(link) = result {
                link.close();
            }
            return;
        }
        match result {
            Ok(link) => {
                info!(session = %self.id, "exec session open");
                self.link = Some(link);
                self.state.send_replace(SessionState::Open);
                self.settle = Some(Box::pin(sleep(self.settle_delay)));
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_event(&mut self, event: Option<SocketEvent>) {
        if self.torn_down() {
            if !matches!(event, Some(SocketEvent::Text(_))) {
                self.link = None;
            }
            return;
        }
        match event {
            Some(SocketEvent::Text(text)) => self.on_frame(&text),
            Some(SocketEvent::Closed {
                code: Some(NORMAL_CLOSURE),
                ..
            }) => {
                self.link = None;
                self.finish(None);
            }
            Some(SocketEvent::Closed { code, reason }) => {
                self.link = None;
                self.fail(TransportError::Closed { code, reason });
            }
            Some(SocketEvent::Error(e)) => {
                self.link = None;
                self.fail(TransportError::Stream(e));
            }
            None => {
                self.link = None;
                self.fail(TransportError::Closed {
                    code: None,
                    reason: "connection lost".to_string(),
                });
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        match protocol::parse_server_frame(text) {
            Ok(ServerFrame::Stdout { data }) => self.surface.write_stdout(&data),
            Ok(ServerFrame::Stderr { data }) => self.surface.write_stderr(&data),
            Ok(ServerFrame::Exit { exit_code }) => {
                info!(session = %self.id, exit_code, "remote process exited");
                self.surface
                    .write_notice(&format!("process exited with code {exit_code}"));
                self.finish(Some(exit_code));
            }
            Ok(ServerFrame::Error { error }) => {
                warn!(session = %self.id, %error, "remote reported an error");
                self.surface.write_error(&error);
                self.remote_error = Some(error);
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "unparseable exec frame");
                self.surface.write_stdout(text);
            }
        }
    }

    fn send_input(&mut self, data: String) {
        if !self.is_open() || self.torn_down() {
            debug!(session = %self.id, "input dropped, session not open");
            return;
        }
        self.send(ClientFrame::Stdin { data });
    }

    fn resize(&mut self, geometry: Geometry) {
        self.geometry = geometry;
        // Before Open, or while the settle timer runs, the timer sends it.
        if self.is_open() && self.settle.is_none() {
            self.send_resize();
        }
    }

    fn send_resize(&mut self) {
        if !self.is_open() || self.torn_down() {
            return;
        }
        self.send(ClientFrame::Resize {
            data: self.geometry,
        });
    }

    fn send(&self, frame: ClientFrame) {
        if let Some(link) = &self.link {
            link.send_text(frame.to_json());
        }
    }

    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            if !self.close_sent {
                self.close_sent = true;
                link.close();
            }
        }
    }

    /// → ClosedNormal.
    fn finish(&mut self, exit_code: Option<i32>) {
        self.close_link();
        self.settle = None;
        self.state.send_replace(SessionState::ClosedNormal {
            exit_code,
            remote_error: self.remote_error.take(),
        });
    }

    /// → ClosedAbnormal, with a visible error line.
    fn fail(&mut self, error: TransportError) {
        warn!(session = %self.id, error = %error, "exec session failed");
        self.surface.write_error(&error.to_string());
        self.close_link();
        self.settle = None;
        self.state.send_replace(SessionState::ClosedAbnormal { error });
    }

    /// Explicit close from the handle.
    fn teardown(&mut self) {
        if self.is_closed() {
            return;
        }
        self.finish(None);
    }
}

async fn join_connect(
    handle: &mut Option<JoinHandle<Result<SocketLink, TransportError>>>,
) -> Result<SocketLink, TransportError> {
    match handle {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::Connect(e.to_string())),
        },
        None => pending().await,
    }
}

async fn next_event(link: &mut Option<SocketLink>) -> Option<SocketEvent> {
    match link {
        Some(link) => link.inbound.recv().await,
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
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Written {
        Stdout(String),
        Stderr(String),
        Notice(String),
        Error(String),
    }

    #[derive(Clone, Default)]
    pub struct RecordingSurface(pub Arc<Mutex<Vec<Written>>>);

    impl RecordingSurface {
        pub fn written(&self) -> Vec<Written> {
            self.0.lock().unwrap().clone()
        }
    }

    impl TerminalSurface for RecordingSurface {
        fn write_stdout(&mut self, data: &str) {
            self.0.lock().unwrap().push(Written::Stdout(data.into()));
        }
        fn write_stderr(&mut self, data: &str) {
            self.0.lock().unwrap().push(Written::Stderr(data.into()));
        }
        fn write_notice(&mut self, text: &str) {
            self.0.lock().unwrap().push(Written::Notice(text.into()));
        }
        fn write_error(&mut self, text: &str) {
            self.0.lock().unwrap().push(Written::Error(text.into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingSurface, Written};
    use super::*;
    use crate::socket::Outbound;
    use crate::socket::testing::{FakeConnector, ServerEnd, settle};
    use serde_json::{Value, json};

    fn request() -> ExecRequest {
        ExecRequest::new("a1", "web", vec!["/bin/sh".into()])
    }

    fn open(
        connector: &FakeConnector,
        surface: &RecordingSurface,
    ) -> ExecSession {
        ExecSession::open(
            Arc::new(connector.clone()),
            "ws://127.0.0.1:4646",
            request(),
            Geometry::new(80, 24),
            surface.clone(),
            &ExecConfig::default(),
        )
    }

    async fn accept(accepted: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
        settle().await;
        accepted.try_recv().expect("session should have connected")
    }

    fn json_frames(server: &mut ServerEnd) -> Vec<Value> {
        server.drain_json()
    }

    fn close_count(frames: &[Outbound]) -> usize {
        frames.iter().filter(|f| **f == Outbound::Close).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_sent_after_settle_with_latest_geometry() {
        let (connector, mut accepted) = FakeConnector::new();
        let surface = RecordingSurface::default();
        let session = open(&connector, &surface);
        session.resize(Geometry::new(100, 30));
        session.resize(Geometry::new(132, 43));

        let mut server = accept(&mut accepted).await;
        assert_eq!(session.state(), SessionState::Open);
        assert!(json_frames(&mut server).is_empty());

        session.resize(Geometry::new(140, 50));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            json_frames(&mut server),
            vec![json!({"type": "resize", "data": {"width": 140, "height": 50}})]
        );

        // After settle, resizes go out immediately.
        session.resize(Geometry::new(90, 20));
        settle().await;
        assert_eq!(
            json_frames(&mut server),
            vec![json!({"type": "resize", "data": {"width": 90, "height": 20}})]
        );
        assert_eq!(
            connector.urls(),
            vec![
                "ws://127.0.0.1:4646/v1/client/allocation/a1/exec?task=web&command=%5B%22%2Fbin%2Fsh%22%5D&tty=true"
                    .to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_is_demultiplexed() {
        let (connector, mut accepted) = FakeConnector::new();
        let surface = RecordingSurface::default();
        let session = open(&connector, &surface);
        let mut server = accept(&mut accepted).await;

        session.send_input("ls\r");
        server.send_text(r#"{"type":"stdout","data":"file\r\n"}"#);
        server.send_text(r#"{"type":"stderr","data":"warn\r\n"}"#);
        server.send_text("not a frame");
        server.send_text(r#"{"type":"error","error":"tty lost"}"#);
        settle().await;

        assert_eq!(
            json_frames(&mut server),
            vec![json!({"type": "stdin", "data": "ls\r"})]
        );
        assert_eq!(
            surface.written(),
            vec![
                Written::Stdout("file\r\n".into()),
                Written::Stderr("warn\r\n".into()),
                Written::Stdout("not a frame".into()),
                Written::Error("tty lost".into()),
            ]
        );
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_frame_closes_normally_once() {
        let (connector, mut accepted) = FakeConnector::new();
        let surface = RecordingSurface::default();
        let session = open(&connector, &surface);
        let mut server = accept(&mut accepted).await;

        server.send_text(r#"{"type":"exit","exitCode":3}"#);
        let state = session.closed().await;
        assert_eq!(
            state,
            SessionState::ClosedNormal {
                exit_code: Some(3),
                remote_error: None
            }
        );
        assert!(matches!(
            state.into_result(),
            Err(LinkError::Application(ApplicationError::NonZeroExit(3)))
        ));
        assert_eq!(
            surface.written(),
            vec![Written::Notice("process exited with code 3".into())]
        );

        session.close();
        session.close();
        settle().await;
        assert_eq!(close_count(&server.drain()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_twice_sends_one_close_signal() {
        let (connector, mut accepted) = FakeConnector::new();
        let surface = RecordingSurface::default();
        let session = open(&connector, &surface);
        let mut server = accept(&mut accepted).await;

        session.close();
        session.close();
        drop(session);
        settle().await;
        assert_eq!(server.drain(), vec![Outbound::Close]);
        assert!(surface.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_output_after_close_is_ignored() {
        let (connector, mut accepted) = FakeConnector::new();
        let surface = RecordingSurface::default();
        let session = open(&connector, &surface);
        let server = accept(&mut accepted).await;

        server.send_text(r#"{"type":"stdout","data":"late"}"#);
        server.close_with(1006);
        session.close();
        settle().await;

        assert!(surface.written().is_empty());
        assert_eq!(
            session.state(),
            SessionState::ClosedNormal {
                exit_code: None,
                remote_error: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_shows_error_and_never_reconnects() {
        let (connector, mut accepted) = FakeConnector::new();
        let surface = RecordingSurface::default();
        let session = open(&connector, &surface);
        let server = accept(&mut accepted).await;

        server.close_with(1011);
        let state = session.closed().await;
        assert!(matches!(
            state,
            SessionState::ClosedAbnormal {
                error: TransportError::Closed {
                    code: Some(1011),
                    ..
                }
            }
        ));
        assert!(matches!(surface.written().as_slice(), [Written::Error(_)]));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_without_exit_frame() {
        let (connector, mut accepted) = FakeConnector::new();
        let surface = RecordingSurface::default();
        let session = open(&connector, &surface);
        let server = accept(&mut accepted).await;

        server.send_text(r#"{"type":"error","error":"task not running"}"#);
        server.close_with(NORMAL_CLOSURE);
        let state = session.closed().await;
        assert!(matches!(
            state.into_result(),
            Err(LinkError::Application(ApplicationError::Remote(msg))) if msg == "task not running"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_is_abnormal() {
        let (connector, _accepted) = FakeConnector::new();
        connector.set_failing(true);
        let surface = RecordingSurface::default();
        let session = open(&connector, &surface);
        session.resize(Geometry::new(1, 1));

        let state = session.closed().await;
        assert!(matches!(
            state,
            SessionState::ClosedAbnormal {
                error: TransportError::Connect(_)
            }
        ));
        assert_eq!(
            surface.written(),
            vec![Written::Error("connection failed: connection refused".into())]
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_before_open_is_dropped() {
        let (connector, mut accepted) = FakeConnector::new();
        let surface = RecordingSurface::default();
        let session = open(&connector, &surface);
        session.send_input("early");
        let mut server = accept(&mut accepted).await;
        session.send_input("late");
        settle().await;
        assert_eq!(
            json_frames(&mut server),
            vec![json!({"type": "stdin", "data": "late"})]
        );
    }

    #[test]
    fn ansi_surface_colours_diagnostics() {
        let mut surface = AnsiSurface::new(Vec::new());
        surface.write_stdout("out");
        surface.write_stderr("err");
        surface.write_error("boom");
        let written = String::from_utf8(surface.into_inner()).unwrap();
        assert_eq!(
            written,
            "out\x1b[31merr\x1b[0m\r\n\x1b[1;31mboom\x1b[0m\r\n"
        );
    }

    #[test]
    fn clean_exit_is_ok() {
        let state = SessionState::ClosedNormal {
            exit_code: Some(0),
            remote_error: None,
        };
        assert_eq!(state.into_result().unwrap(), 0);
        assert!(matches!(
            SessionState::Open.into_result(),
            Err(LinkError::Cancelled)
        ));
    }
}
