//! Registry of live sessions.
//!
//! Sessions are indexed by session id and by pane id. Both maps, the creation
//! order and the default session live behind one mutex and always change
//! together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use protocol::{NewSession, SessionTarget};

use super::hub::OutputHub;
use super::instance::Session;
use super::pty::{generate_id, PaneId, SessionError, SessionId, SpawnRequest};
use super::reader;
use crate::config::{Config, SessionConfig};

/// Per-request overrides for a new session; unset fields use the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cwd: Option<PathBuf>,
    pub term: Option<String>,
    pub shell: Option<String>,
    /// Program and arguments to run instead of the shell.
    pub command: Option<Vec<String>>,
}

impl From<&NewSession> for SessionOptions {
    fn from(request: &NewSession) -> Self {
        Self {
            cols: request.cols.filter(|c| *c > 0),
            rows: request.rows.filter(|r| *r > 0),
            cwd: request.cwd.as_ref().filter(|c| !c.is_empty()).map(PathBuf::from),
            term: request.term.clone().filter(|t| !t.is_empty()),
            shell: None,
            command: None,
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    panes: HashMap<PaneId, Arc<Session>>,
    order: Vec<SessionId>,
    default_id: Option<SessionId>,
}

impl Registry {
    fn insert(&mut self, session: Arc<Session>) {
        let id = session.id().to_string();
        self.panes.insert(session.pane_id().to_string(), Arc::clone(&session));
        self.sessions.insert(id.clone(), session);
        self.order.push(id.clone());
        if self.default_id.is_none() {
            self.default_id = Some(id);
        }
    }

    fn remove(&mut self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.remove(session_id)?;
        self.panes.remove(session.pane_id());
        self.order.retain(|id| id != session_id);
        if self.default_id.as_deref() == Some(session_id) {
            self.default_id = self.order.first().cloned();
        }
        Some(session)
    }

    fn default_session(&self) -> Option<Arc<Session>> {
        self.default_id
            .as_ref()
            .and_then(|id| self.sessions.get(id))
            .cloned()
    }
}

/// Owns every live session and the defaults used to create new ones.
pub struct SessionRegistry {
    inner: Mutex<Registry>,
    hub: Arc<OutputHub>,
    defaults: SessionConfig,
    poll_interval: Duration,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(config: &Config, hub: Arc<OutputHub>) -> Arc<Self> {
        Arc::new_cyclic(|this| SessionRegistry {
            inner: Mutex::new(Registry::default()),
            hub,
            defaults: config.session.clone(),
            poll_interval: Duration::from_millis(config.transport.poll_interval_ms),
            this: this.clone(),
        })
    }

    pub fn hub(&self) -> &Arc<OutputHub> {
        &self.hub
    }

    /// Spawns a session and registers it.
    ///
    /// The first session registered becomes the default.
    pub fn create(&self, options: SessionOptions) -> Result<Arc<Session>, SessionError> {
        let request = SpawnRequest {
            session_id: generate_id(),
            pane_id: generate_id(),
            shell: options
                .shell
                .unwrap_or_else(|| self.defaults.default_shell.clone()),
            command: options.command,
            cwd: options.cwd.or_else(|| self.defaults.default_cwd.clone()),
            term: options
                .term
                .unwrap_or_else(|| self.defaults.default_term.clone()),
            cols: options.cols.unwrap_or(self.defaults.cols),
            rows: options.rows.unwrap_or(self.defaults.rows),
        };

        let session = Session::spawn(&request, self.defaults.scrollback, Arc::clone(&self.hub))?;
        self.lock().insert(Arc::clone(&session));

        if let Err(e) = reader::start(Arc::clone(&session), self.this.clone(), self.poll_interval) {
            self.close(session.id());
            return Err(e);
        }

        tracing::info!(
            session_id = %session.id(),
            pane_id = %session.pane_id(),
            pid = session.pid(),
            cols = request.cols,
            rows = request.rows,
            "Session created"
        );
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn get_by_pane(&self, pane_id: &str) -> Option<Arc<Session>> {
        self.lock().panes.get(pane_id).cloned()
    }

    pub fn default_session(&self) -> Option<Arc<Session>> {
        self.lock().default_session()
    }

    pub fn default_id(&self) -> Option<SessionId> {
        self.lock().default_id.clone()
    }

    /// Picks the session a request applies to.
    ///
    /// Tries, in order: explicit pane id, explicit session id, the
    /// connection's attached session, the daemon default. Unknown ids fall
    /// through to the next candidate.
    pub fn resolve(&self, target: &SessionTarget, attached: Option<&str>) -> Option<Arc<Session>> {
        let inner = self.lock();

        target
            .pane_id
            .as_deref()
            .and_then(|id| inner.panes.get(id))
            .or_else(|| {
                target
                    .session_id
                    .as_deref()
                    .and_then(|id| inner.sessions.get(id))
            })
            .or_else(|| attached.and_then(|id| inner.sessions.get(id)))
            .cloned()
            .or_else(|| inner.default_session())
    }

    /// All sessions in creation order.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregisters a session, stops its reader thread and reaps its child.
    ///
    /// Blocks until teardown completes. Returns `None` for unknown ids.
    pub fn close(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = {
            let mut inner = self.lock();
            let session = inner.remove(session_id)?;
            session.begin_close();
            session
        };

        session.shutdown();
        tracing::info!(session_id = %session_id, "Session closed");
        Some(session)
    }

    /// Closes every session.
    pub fn close_all(&self) {
        let ids: Vec<SessionId> = self.lock().order.clone();
        for id in ids {
            self.close(&id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
