//! Event fan-out to connected clients.
//!
//! Every connection registers one [`EventSink`] with the [`OutputHub`]. Session
//! events are delivered to every ready sink in registration order, whichever
//! session the connection happens to be attached to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use protocol::{encode_payload, ServerMessage};

/// Opaque handle returned by [`OutputHub::add`].
pub type SinkId = u64;

/// The session a broadcast event originates from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionRef {
    pub session_id: String,
    pub pane_id: String,
}

/// A transport-specific consumer of session events.
///
/// Implementations must not block: a sink that cannot keep up drops events
/// locally instead of stalling the session that produced them.
pub trait EventSink: Send + Sync {
    /// Whether the connection has completed `hello` and wants events.
    fn is_ready(&self) -> bool;

    /// Queue one server-pushed event.
    fn send_event(&self, event: ServerMessage);

    fn send_output(&self, session: &SessionRef, data: &[u8]) {
        self.send_event(ServerMessage::Output {
            session_id: session.session_id.clone(),
            pane_id: session.pane_id.clone(),
            data: encode_payload(data),
        });
    }

    fn send_exit(&self, session: &SessionRef, exit_code: i32) {
        self.send_event(ServerMessage::PaneExited {
            session_id: session.session_id.clone(),
            pane_id: session.pane_id.clone(),
            exit_code,
        });
    }

    fn send_title(&self, session: &SessionRef, title: &str) {
        self.send_event(ServerMessage::TitleUpdate {
            session_id: session.session_id.clone(),
            pane_id: session.pane_id.clone(),
            title: title.to_string(),
        });
    }

    fn send_cwd(&self, session: &SessionRef, cwd: &str) {
        self.send_event(ServerMessage::CwdUpdate {
            session_id: session.session_id.clone(),
            pane_id: session.pane_id.clone(),
            cwd: cwd.to_string(),
        });
    }

    fn send_notify(&self, session: &SessionRef, title: &str, body: &str) {
        self.send_event(ServerMessage::Notify {
            session_id: session.session_id.clone(),
            pane_id: session.pane_id.clone(),
            title: title.to_string(),
            body: body.to_string(),
        });
    }
}

/// Registry of sinks plus the broadcast operations sessions call.
#[derive(Default)]
pub struct OutputHub {
    sinks: Mutex<Vec<(SinkId, Arc<dyn EventSink>)>>,
    next_id: AtomicU64,
}

impl OutputHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink and returns its handle.
    pub fn add(&self, sink: Arc<dyn EventSink>) -> SinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, sink));
        tracing::debug!(sink_id = id, "Registered event sink");
        id
    }

    /// Removes a sink. Returns `false` if it was not registered.
    pub fn remove(&self, id: SinkId) -> bool {
        let mut sinks = self.lock();
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        let removed = sinks.len() != before;
        if removed {
            tracing::debug!(sink_id = id, "Removed event sink");
        }
        removed
    }

    /// Number of registered sinks, ready or not.
    pub fn sink_count(&self) -> usize {
        self.lock().len()
    }

    pub fn send_output(&self, session: &SessionRef, data: &[u8]) {
        self.for_each_ready(|sink| sink.send_output(session, data));
    }

    pub fn send_exit(&self, session: &SessionRef, exit_code: i32) {
        self.for_each_ready(|sink| sink.send_exit(session, exit_code));
    }

    pub fn send_title(&self, session: &SessionRef, title: &str) {
        self.for_each_ready(|sink| sink.send_title(session, title));
    }

    pub fn send_cwd(&self, session: &SessionRef, cwd: &str) {
        self.for_each_ready(|sink| sink.send_cwd(session, cwd));
    }

    pub fn send_notify(&self, session: &SessionRef, title: &str, body: &str) {
        self.for_each_ready(|sink| sink.send_notify(session, title, body));
    }

    fn for_each_ready(&self, mut deliver: impl FnMut(&dyn EventSink)) {
        for (_, sink) in self.lock().iter() {
            if sink.is_ready() {
                deliver(sink.as_ref());
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SinkId, Arc<dyn EventSink>)>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
