use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{ExecRequest, ExecSession, Geometry, SessionKey, TerminalSurface};
use crate::config::ExecConfig;
use crate::socket::Connector;

/// Keeps at most one session per (target, task) so two processes never
/// write to the same terminal.
pub struct SessionRegistry<C> {
    connector: Arc<C>,
    ws_base: String,
    config: ExecConfig,
    sessions: HashMap<SessionKey, ExecSession>,
}

impl<C: Connector> SessionRegistry<C> {
    pub fn new(connector: C, ws_base: impl Into<String>, config: ExecConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            ws_base: ws_base.into(),
            config,
            sessions: HashMap::new(),
        }
    }

    /// Open a session, tearing down any earlier one for the same key first.
    pub fn open<T: TerminalSurface>(
        &mut self,
        request: ExecRequest,
        geometry: Geometry,
        surface: T,
    ) -> &ExecSession {
        let key = request.key();
        if let Some(previous) = self.sessions.remove(&key) {
            info!(
                alloc = %key.target,
                task = %key.task,
                session = %previous.id(),
                "replacing exec session"
            );
            previous.close();
        }
        let session = ExecSession::open(
            self.connector.clone(),
            &self.ws_base,
            request,
            geometry,
            surface,
            &self.config,
        );
        self.sessions.entry(key).insert_entry(session).into_mut()
    }

    pub fn get(&self, key: &SessionKey) -> Option<&ExecSession> {
        self.sessions.get(key)
    }

    /// Returns false if no session was registered for `key`.
    pub fn close(&mut self, key: &SessionKey) -> bool {
        match self.sessions.remove(key) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
