//! Subscription multiplexer.
//!
//! Many logical subscriptions share one persistent socket. A single actor
//! task owns the socket, the subscriber map and the reconnect timer; the
//! [`Multiplexer`] handle and every [`Subscription`] talk to it over an
//! unbounded command channel so that unsubscribing from `Drop` never blocks.
//!
//! The server keeps no subscription state across connections, so every
//! successful (re)connect replays a SUBSCRIBE for each tracked key.

pub mod protocol;

use serde_json::Value;
use std::collections::HashMap;
use std::future::pending;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::MuxConfig;
use crate::error::TransportError;
use crate::socket::{ConnectionState, Connector, NORMAL_CLOSURE, SocketEvent, SocketLink};

pub use protocol::{ControlFrame, DataFrame, SubscriptionKey, parse_server_frame};

pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Observable connection health. Subscribers are not notified when retries
/// run out; callers that care watch `retry_exhausted` here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxStatus {
    /// `None` until the first connect is attempted.
    pub connection: Option<ConnectionState>,
    pub reconnect_attempts: u32,
    pub retry_exhausted: bool,
    /// Number of distinct keys currently tracked.
    pub subscriptions: usize,
}

enum MuxCommand {
    Subscribe {
        key: SubscriptionKey,
        id: u64,
        callback: Callback,
    },
    Unsubscribe {
        key: SubscriptionKey,
        id: u64,
    },
    Reconnect,
    Close {
        respond_to: Option<oneshot::Sender<()>>,
    },
}

/// Handle to a running multiplexer. Dropping it closes the connection.
pub struct Multiplexer {
    sender: mpsc::UnboundedSender<MuxCommand>,
    status: watch::Receiver<MuxStatus>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Multiplexer {
    /// Spawn the actor. No connection is made until the first subscribe.
    pub fn new<C: Connector>(connector: C, url: impl Into<String>, config: MuxConfig) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(MuxStatus::default());

        let actor = MuxActor {
            connector: Arc::new(connector),
            url: url.into(),
            backoff: config.backoff(),
            subscribers: HashMap::new(),
            link: None,
            connecting: None,
            retry: None,
            state: None,
            attempts: 0,
            exhausted: false,
            status: status_tx,
        };
        tokio::spawn(actor.run(commands));

        Self {
            sender,
            status,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Register `callback` for `(target_id, subject_id)`. The returned
    /// handle unsubscribes when dropped.
    pub fn subscribe<F>(
        &self,
        target_id: impl Into<String>,
        subject_id: impl Into<String>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let key = SubscriptionKey::new(target_id, subject_id);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(MuxCommand::Subscribe {
            key: key.clone(),
            id,
            callback: Arc::new(callback),
        });
        Subscription {
            sender: self.sender.clone(),
            key,
            id,
            done: AtomicBool::new(false),
        }
    }

    /// Reset the attempt counter and connect now if not already connected.
    pub fn reconnect(&self) {
        let _ = self.sender.send(MuxCommand::Reconnect);
    }

    /// Cancel any pending reconnect, close the socket and forget every
    /// subscriber. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(MuxCommand::Close {
                respond_to: Some(tx),
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> watch::Receiver<MuxStatus> {
        self.status.clone()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.sender.send(MuxCommand::Close { respond_to: None });
        }
    }
}

/// One registered callback. Unsubscribes on drop.
pub struct Subscription {
    sender: mpsc::UnboundedSender<MuxCommand>,
    key: SubscriptionKey,
    id: u64,
    done: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Idempotent.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.send(MuxCommand::Unsubscribe {
            key: self.key.clone(),
            id: self.id,
        });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct Subscriber {
    id: u64,
    callback: Callback,
}

struct MuxActor<C> {
    connector: Arc<C>,
    url: String,
    backoff: Backoff,
    subscribers: HashMap<SubscriptionKey, Vec<Subscriber>>,
    link: Option<SocketLink>,
    connecting: Option<JoinHandle<Result<SocketLink, TransportError>>>,
    retry: Option<Pin<Box<Sleep>>>,
    state: Option<ConnectionState>,
    attempts: u32,
    exhausted: bool,
    status: watch::Sender<MuxStatus>,
}

impl<C: Connector> MuxActor<C> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<MuxCommand>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(MuxCommand::Close { respond_to }) => {
                        self.shutdown();
                        if let Some(tx) = respond_to {
                            let _ = tx.send(());
                        }
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                result = join_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result);
                }
                event = next_event(&mut self.link) => self.on_socket_event(event),
                () = wait_retry(&mut self.retry) => {
                    self.retry = None;
                    self.start_connect();
                }
            }
            self.publish_status();
        }
        self.publish_status();
        debug!(url = %self.url, "multiplexer stopped");
    }

    fn handle_command(&mut self, cmd: MuxCommand) {
        match cmd {
            MuxCommand::Subscribe { key, id, callback } => {
                let subscribers = self.subscribers.entry(key.clone()).or_default();
                let first = subscribers.is_empty();
                subscribers.push(Subscriber { id, callback });
                if first {
                    debug!(%key, "tracking new subscription");
                    self.send_control(ControlFrame::subscribe(&key));
                }
                if self.is_idle() {
                    self.attempts = 0;
                    self.exhausted = false;
                    self.start_connect();
                }
            }
            MuxCommand::Unsubscribe { key, id } => {
                let Some(subscribers) = self.subscribers.get_mut(&key) else {
                    return;
                };
                subscribers.retain(|s| s.id != id);
                if subscribers.is_empty() {
                    self.subscribers.remove(&key);
                    debug!(%key, "last subscriber left");
                    self.send_control(ControlFrame::unsubscribe(&key));
                }
            }
            MuxCommand::Reconnect => {
                self.retry = None;
                self.attempts = 0;
                self.exhausted = false;
                if self.link.is_none() && self.connecting.is_none() {
                    self.start_connect();
                }
            }
            // Handled by the run loop.
            MuxCommand::Close { .. } => {}
        }
    }

    /// No socket, no connect in flight, and no reconnect pending.
    fn is_idle(&self) -> bool {
        self.link.is_none() && self.connecting.is_none() && self.retry.is_none()
    }

    fn start_connect(&mut self) {
        info!(url = %self.url, attempt = self.attempts, "connecting multiplexer");
        self.state = Some(ConnectionState::Connecting);
        let connector = self.connector.clone();
        let url = self.url.clone();
        self.connecting = Some(tokio::spawn(async move { connector.connect(&url).await }));
    }

    fn on_connect_result(&mut self, result: Result<SocketLink, TransportError>) {
        match result {
            Ok(link) => {
                info!(url = %self.url, keys = self.subscribers.len(), "multiplexer connected");
                self.link = Some(link);
                self.state = Some(ConnectionState::Open);
                self.attempts = 0;
                self.exhausted = false;
                let keys: Vec<SubscriptionKey> = self.subscribers.keys().cloned().collect();
                for key in &keys {
                    self.send_control(ControlFrame::subscribe(key));
                }
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "multiplexer connect failed");
                self.state = Some(ConnectionState::ClosedAbnormal);
                self.schedule_reconnect();
            }
        }
    }

    fn on_socket_event(&mut self, event: Option<SocketEvent>) {
        match event {
            Some(SocketEvent::Text(text)) => self.dispatch(&text),
            Some(SocketEvent::Closed { code, reason }) => {
                let state = if code == Some(NORMAL_CLOSURE) {
                    ConnectionState::ClosedNormal
                } else {
                    ConnectionState::ClosedAbnormal
                };
                info!(?code, %reason, "multiplexer connection closed");
                self.link = None;
                self.state = Some(state);
                self.schedule_reconnect();
            }
            Some(SocketEvent::Error(e)) => {
                warn!(error = %e, "multiplexer socket error");
                self.link = None;
                self.state = Some(ConnectionState::ClosedAbnormal);
                self.schedule_reconnect();
            }
            None => {
                warn!("multiplexer socket pump ended");
                self.link = None;
                self.state = Some(ConnectionState::ClosedAbnormal);
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.attempts >= self.backoff.max_attempts() {
            warn!(
                attempts = self.attempts,
                "multiplexer reconnect attempts exhausted"
            );
            self.exhausted = true;
            return;
        }
        self.attempts += 1;
        let delay = self.backoff.delay_for(self.attempts);
        info!(attempt = self.attempts, ?delay, "scheduling multiplexer reconnect");
        self.retry = Some(Box::pin(sleep(delay)));
    }

    fn dispatch(&self, text: &str) {
        let frame = match parse_server_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping multiplexer frame");
                return;
            }
        };
        let key = frame.key();
        let Some(subscribers) = self.subscribers.get(&key) else {
            debug!(%key, "no subscribers for frame");
            return;
        };
        for subscriber in subscribers {
            let callback = &subscriber.callback;
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&frame.data))).is_err() {
                warn!(%key, subscriber = subscriber.id, "subscriber callback panicked");
            }
        }
    }

    /// Control frames are only written while Open; the replay on the next
    /// Open covers anything skipped here.
    fn send_control(&self, frame: ControlFrame) {
        if self.state != Some(ConnectionState::Open) {
            return;
        }
        if let Some(link) = &self.link {
            link.send_text(frame.to_json());
        }
    }

    fn shutdown(&mut self) {
        self.retry = None;
        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.subscribers.clear();
        self.state = Some(ConnectionState::ClosedNormal);
        info!(url = %self.url, "multiplexer closed");
    }

    fn publish_status(&self) {
        self.status.send_replace(MuxStatus {
            connection: self.state,
            reconnect_attempts: self.attempts,
            retry_exhausted: self.exhausted,
            subscriptions: self.subscribers.len(),
        });
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

async fn wait_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
