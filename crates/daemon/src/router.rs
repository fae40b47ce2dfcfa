//! Message router for dispatching client requests.
//!
//! Every transport hands decoded JSON text to the same [`MessageRouter`],
//! together with the per-connection [`ConnectionContext`] that remembers which
//! session the connection is attached to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use protocol::{
    capability_list, decode_payload, ClientMessage, NewSession, PaneEntry, ServerMessage,
    SessionEntry, SessionTarget,
};
use tracing::{debug, info, warn};

use crate::session::{
    Session, SessionError, SessionId, SessionInfo, SessionOptions, SessionRegistry,
};

/// Result type for router operations.
pub type RouterResult = Result<Option<ServerMessage>, RouterError>;

/// Errors that are reported back to the requesting client.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The request named a session that does not exist.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Convert the error to a protocol `error` reply for `request`.
    pub fn to_error_message(&self, request: &str) -> ServerMessage {
        ServerMessage::Error {
            request: request.to_string(),
            message: self.to_string(),
        }
    }
}

/// Per-connection routing state.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    attached_session_id: Option<SessionId>,
    ready: Arc<AtomicBool>,
}

impl ConnectionContext {
    /// Creates a context whose readiness is shared with the connection's sink.
    pub fn new(ready: Arc<AtomicBool>) -> Self {
        Self {
            attached_session_id: None,
            ready,
        }
    }

    pub fn attached_session_id(&self) -> Option<&str> {
        self.attached_session_id.as_deref()
    }

    /// Whether `hello` has been handled on this connection.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn attach(&mut self, session: &Session) {
        self.attached_session_id = Some(session.id().to_string());
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }
}

/// Interprets the JSON protocol against the session registry.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Parses and routes one line or text frame.
    ///
    /// Malformed or unknown messages are dropped; routing errors become an
    /// `error` reply naming the request.
    pub async fn dispatch_text(
        &self,
        text: &str,
        ctx: &mut ConnectionContext,
    ) -> Option<ServerMessage> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let message = match ClientMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable message");
                return None;
            }
        };

        let request = message.request_name();
        match self.route(message, ctx).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(request, error = %e, "Request failed");
                Some(e.to_error_message(request))
            }
        }
    }

    /// Routes a decoded message and returns the reply, if any.
    pub async fn route(&self, message: ClientMessage, ctx: &mut ConnectionContext) -> RouterResult {
        debug!(
            request = message.request_name(),
            attached = ?ctx.attached_session_id(),
            "Routing message"
        );

        match message {
            ClientMessage::Hello(target) => self.handle_hello(&target, ctx).await,
            ClientMessage::Capabilities => Ok(Some(ServerMessage::capabilities())),
            ClientMessage::ListSessions => Ok(Some(self.handle_list_sessions())),
            ClientMessage::AttachSession { session_id } => {
                self.handle_attach(session_id.as_deref(), ctx)
            }
            ClientMessage::NewSession(req) => {
                let session = self.create_session(&req, ctx).await?;
                let (cols, rows) = session.size();
                Ok(Some(ServerMessage::SessionCreated {
                    session_id: session.id().to_string(),
                    pane_id: session.pane_id().to_string(),
                    cols,
                    rows,
                }))
            }
            ClientMessage::NewPane(req) => {
                let session = self.create_session(&req, ctx).await?;
                let (cols, rows) = session.size();
                Ok(Some(ServerMessage::PaneCreated {
                    session_id: session.id().to_string(),
                    pane_id: session.pane_id().to_string(),
                    cols,
                    rows,
                }))
            }
            ClientMessage::SnapshotRequest(target) => Ok(self.handle_snapshot(&target, ctx)),
            ClientMessage::Input { .. } => self.handle_input(message, ctx).await,
            ClientMessage::Resize { cols, rows, .. } => {
                self.handle_resize(&message.target(), cols, rows, ctx);
                Ok(None)
            }
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
            ClientMessage::ClosePane(target) => self.handle_close_pane(&target, ctx).await,
            ClientMessage::ListPanes { session_id } => {
                Ok(Some(self.handle_list_panes(session_id.as_deref())))
            }
            ClientMessage::ListSessionPanes { session_id } => {
                Ok(self.handle_list_session_panes(session_id.as_deref()))
            }
        }
    }

    async fn handle_hello(&self, target: &SessionTarget, ctx: &mut ConnectionContext) -> RouterResult {
        let session = match self.registry.resolve(target, ctx.attached_session_id()) {
            Some(session) => session,
            None => {
                info!("No live session for hello, creating one");
                self.spawn_session(SessionOptions::default()).await?
            }
        };

        ctx.attach(&session);
        ctx.mark_ready();

        Ok(Some(ServerMessage::Welcome {
            session_id: session.id().to_string(),
            pane_id: session.pane_id().to_string(),
            capabilities: capability_list(),
        }))
    }

    fn handle_list_sessions(&self) -> ServerMessage {
        let sessions = self
            .registry
            .list()
            .iter()
            .map(|session| {
                let info = session.info();
                SessionEntry {
                    id: info.session_id,
                    pane_id: info.pane_id,
                    title: info.title,
                    cwd: info.cwd,
                }
            })
            .collect();
        ServerMessage::Sessions { sessions }
    }

    fn handle_attach(&self, session_id: Option<&str>, ctx: &mut ConnectionContext) -> RouterResult {
        let session_id = session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RouterError::InvalidRequest("missing session_id".to_string()))?;

        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| RouterError::UnknownSession(session_id.to_string()))?;

        ctx.attach(&session);
        debug!(session_id = %session.id(), "Connection attached");

        Ok(Some(ServerMessage::SessionAttached {
            session_id: session.id().to_string(),
            pane_id: session.pane_id().to_string(),
        }))
    }

    async fn create_session(
        &self,
        req: &NewSession,
        ctx: &mut ConnectionContext,
    ) -> Result<Arc<Session>, RouterError> {
        let session = self.spawn_session(SessionOptions::from(req)).await?;
        ctx.attach(&session);
        Ok(session)
    }

    async fn spawn_session(&self, options: SessionOptions) -> Result<Arc<Session>, RouterError> {
        let registry = Arc::clone(&self.registry);
        let session = tokio::task::spawn_blocking(move || registry.create(options))
            .await
            .map_err(|e| RouterError::Internal(e.to_string()))??;
        Ok(session)
    }

    fn handle_snapshot(&self, target: &SessionTarget, ctx: &ConnectionContext) -> Option<ServerMessage> {
        let session = self.registry.resolve(target, ctx.attached_session_id())?;
        let snapshot = session.snapshot();
        Some(ServerMessage::Snapshot {
            session_id: session.id().to_string(),
            pane_id: session.pane_id().to_string(),
            cols: snapshot.cols,
            rows: snapshot.rows,
            data: protocol::encode_payload(&snapshot.data),
        })
    }

    async fn handle_input(&self, message: ClientMessage, ctx: &ConnectionContext) -> RouterResult {
        let ClientMessage::Input { ref data, .. } = message else {
            return Ok(None);
        };
        let Some(session) = self.registry.resolve(&message.target(), ctx.attached_session_id())
        else {
            debug!("Dropping input: no session");
            return Ok(None);
        };

        let bytes = match decode_payload(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "Dropping input with invalid payload");
                return Ok(None);
            }
        };

        let result = tokio::task::spawn_blocking(move || session.write_input(&bytes)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Input write failed"),
            Err(e) => warn!(error = %e, "Input task failed"),
        }
        Ok(None)
    }

    fn handle_resize(&self, target: &SessionTarget, cols: u16, rows: u16, ctx: &ConnectionContext) {
        if cols == 0 || rows == 0 {
            debug!(cols, rows, "Ignoring resize to empty geometry");
            return;
        }
        if let Some(session) = self.registry.resolve(target, ctx.attached_session_id()) {
            session.resize(cols, rows);
        }
    }

    async fn handle_close_pane(
        &self,
        target: &SessionTarget,
        ctx: &mut ConnectionContext,
    ) -> RouterResult {
        let Some(session) = self.registry.resolve(target, ctx.attached_session_id()) else {
            return Ok(None);
        };
        let session_id = session.id().to_string();
        let pane_id = session.pane_id().to_string();
        drop(session);

        let registry = Arc::clone(&self.registry);
        let id = session_id.clone();
        tokio::task::spawn_blocking(move || registry.close(&id))
            .await
            .map_err(|e| RouterError::Internal(e.to_string()))?;

        if ctx.attached_session_id() == Some(session_id.as_str()) {
            ctx.attached_session_id = None;
        }

        Ok(Some(ServerMessage::PaneClosed {
            session_id,
            pane_id,
        }))
    }

    fn handle_list_panes(&self, session_id: Option<&str>) -> ServerMessage {
        let panes = self
            .registry
            .list()
            .iter()
            .map(|session| session.info())
            .filter(|info| session_id.map_or(true, |id| info.session_id == id))
            .map(pane_entry)
            .collect();
        ServerMessage::Panes { panes }
    }

    fn handle_list_session_panes(&self, session_id: Option<&str>) -> Option<ServerMessage> {
        let session = self.registry.get(session_id?)?;
        Some(ServerMessage::Panes {
            panes: vec![pane_entry(session.info())],
        })
    }
}

fn pane_entry(info: SessionInfo) -> PaneEntry {
    PaneEntry {
        pane_id: info.pane_id,
        session_id: info.session_id,
        cols: info.cols,
        rows: info.rows,
        title: info.title,
        cwd: info.cwd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::OutputHub;
    use serial_test::serial;
    use std::time::Duration;

    fn router() -> MessageRouter {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config.transport.poll_interval_ms = 10;
        let registry = SessionRegistry::new(&config, Arc::new(OutputHub::new()));
        MessageRouter::new(registry)
    }

    async fn send(router: &MessageRouter, ctx: &mut ConnectionContext, json: &str) -> Option<ServerMessage> {
        router.dispatch_text(json, ctx).await
    }

    fn close_all(router: &MessageRouter) {
        router.registry().close_all();
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let router = router();
        let mut ctx = ConnectionContext::default();
        assert_eq!(send(&router, &mut ctx, r#"{"type":"ping"}"#).await, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_capabilities() {
        let router = router();
        let mut ctx = ConnectionContext::default();
        let reply = send(&router, &mut ctx, r#"{"type":"capabilities"}"#).await;
        assert_eq!(reply, Some(ServerMessage::capabilities()));
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_ignored() {
        let router = router();
        let mut ctx = ConnectionContext::default();
        assert_eq!(send(&router, &mut ctx, "not json").await, None);
        assert_eq!(send(&router, &mut ctx, r#"{"type":"reboot"}"#).await, None);
        assert_eq!(send(&router, &mut ctx, "   ").await, None);
    }

    #[tokio::test]
    async fn test_attach_missing_id_is_error() {
        let router = router();
        let mut ctx = ConnectionContext::default();
        let reply = send(&router, &mut ctx, r#"{"type":"attach_session"}"#).await;
        assert!(matches!(
            reply,
            Some(ServerMessage::Error { ref request, .. }) if request == "attach_session"
        ));
    }

    #[tokio::test]
    async fn test_requests_without_sessions_are_silent() {
        let router = router();
        let mut ctx = ConnectionContext::default();
        assert_eq!(send(&router, &mut ctx, r#"{"type":"snapshot_request"}"#).await, None);
        assert_eq!(send(&router, &mut ctx, r#"{"type":"input","data":"eA=="}"#).await, None);
        assert_eq!(
            send(&router, &mut ctx, r#"{"type":"resize","cols":10,"rows":10}"#).await,
            None
        );
        assert_eq!(send(&router, &mut ctx, r#"{"type":"close_pane"}"#).await, None);
        assert_eq!(
            send(&router, &mut ctx, r#"{"type":"list_session_panes","session_id":"x"}"#).await,
            None
        );
        assert_eq!(
            send(&router, &mut ctx, r#"{"type":"list_sessions"}"#).await,
            Some(ServerMessage::Sessions { sessions: vec![] })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_hello_creates_session_and_marks_ready() {
        let router = router();
        let mut ctx = ConnectionContext::default();
        assert!(!ctx.is_ready());

        let reply = send(&router, &mut ctx, r#"{"type":"hello"}"#).await;
        let Some(ServerMessage::Welcome { session_id, pane_id, capabilities }) = reply else {
            panic!("expected welcome");
        };
        assert!(ctx.is_ready());
        assert_eq!(ctx.attached_session_id(), Some(session_id.as_str()));
        assert_eq!(router.registry().default_id(), Some(session_id.clone()));
        assert_eq!(pane_id.len(), 32);
        assert!(capabilities.contains(&"snapshot".to_string()));

        // A second hello reuses the attached session.
        let reply = send(&router, &mut ctx, r#"{"type":"hello"}"#).await;
        assert!(matches!(reply, Some(ServerMessage::Welcome { session_id: ref id, .. }) if *id == session_id));
        assert_eq!(router.registry().len(), 1);

        close_all(&router);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_new_session_and_pane_rebind() {
        let router = router();
        let mut ctx = ConnectionContext::default();

        let reply = send(&router, &mut ctx, r#"{"type":"new_session","cols":100,"rows":40}"#).await;
        let Some(ServerMessage::SessionCreated { session_id, cols, rows, .. }) = reply else {
            panic!("expected session_created");
        };
        assert_eq!((cols, rows), (100, 40));
        assert_eq!(ctx.attached_session_id(), Some(session_id.as_str()));

        let reply = send(&router, &mut ctx, r#"{"type":"new_pane"}"#).await;
        let Some(ServerMessage::PaneCreated { session_id: pane_session, cols, rows, .. }) = reply
        else {
            panic!("expected pane_created");
        };
        assert_eq!((cols, rows), (80, 24));
        assert_ne!(pane_session, session_id);
        assert_eq!(ctx.attached_session_id(), Some(pane_session.as_str()));

        let reply = send(&router, &mut ctx, r#"{"type":"snapshot_request"}"#).await;
        assert!(matches!(
            reply,
            Some(ServerMessage::Snapshot { ref session_id, cols: 80, rows: 24, .. }) if *session_id == pane_session
        ));

        close_all(&router);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_attach_unknown_keeps_binding() {
        let router = router();
        let mut ctx = ConnectionContext::default();
        send(&router, &mut ctx, r#"{"type":"hello"}"#).await;
        let attached = ctx.attached_session_id().map(str::to_string);

        let reply = send(
            &router,
            &mut ctx,
            r#"{"type":"attach_session","session_id":"00000000000000000000000000000000"}"#,
        )
        .await;
        let Some(ServerMessage::Error { request, message }) = reply else {
            panic!("expected error reply");
        };
        assert_eq!(request, "attach_session");
        assert!(message.contains("unknown session"));
        assert_eq!(ctx.attached_session_id().map(str::to_string), attached);

        close_all(&router);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_attach_rebinds() {
        let router = router();
        let mut a = ConnectionContext::default();
        let mut b = ConnectionContext::default();
        send(&router, &mut a, r#"{"type":"new_session"}"#).await;
        let target = a.attached_session_id().unwrap().to_string();

        let reply = send(
            &router,
            &mut b,
            &format!(r#"{{"type":"attach_session","session_id":"{}"}}"#, target),
        )
        .await;
        assert!(matches!(reply, Some(ServerMessage::SessionAttached { ref session_id, .. }) if *session_id == target));
        assert_eq!(b.attached_session_id(), Some(target.as_str()));

        close_all(&router);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_list_panes_and_close() {
        let router = router();
        let mut ctx = ConnectionContext::default();
        send(&router, &mut ctx, r#"{"type":"new_session"}"#).await;
        send(&router, &mut ctx, r#"{"type":"new_session","cols":90,"rows":30}"#).await;
        let second = ctx.attached_session_id().unwrap().to_string();

        let Some(ServerMessage::Panes { panes }) =
            send(&router, &mut ctx, r#"{"type":"list_panes"}"#).await
        else {
            panic!("expected panes");
        };
        assert_eq!(panes.len(), 2);

        let filtered = send(
            &router,
            &mut ctx,
            &format!(r#"{{"type":"list_session_panes","session_id":"{}"}}"#, second),
        )
        .await;
        let Some(ServerMessage::Panes { panes }) = filtered else {
            panic!("expected panes");
        };
        assert_eq!(panes.len(), 1);
        assert_eq!((panes[0].cols, panes[0].rows), (90, 30));

        let reply = send(&router, &mut ctx, r#"{"type":"close_pane"}"#).await;
        assert!(matches!(reply, Some(ServerMessage::PaneClosed { ref session_id, .. }) if *session_id == second));
        assert_eq!(ctx.attached_session_id(), None);
        assert_eq!(router.registry().len(), 1);

        close_all(&router);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_input_and_resize_reach_session() {
        let router = router();
        let mut ctx = ConnectionContext::default();
        send(&router, &mut ctx, r#"{"type":"hello"}"#).await;

        // "echo-me\n"
        send(&router, &mut ctx, r#"{"type":"input","data":"ZWNoby1tZQo="}"#).await;
        send(&router, &mut ctx, r#"{"type":"input","data":"%%%"}"#).await;
        send(&router, &mut ctx, r#"{"type":"resize","cols":0,"rows":5}"#).await;
        send(&router, &mut ctx, r#"{"type":"resize","cols":132,"rows":43}"#).await;

        let session = router.registry().default_session().unwrap();
        assert_eq!(session.size(), (132, 43));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let snap = session.snapshot();
            if String::from_utf8_lossy(&snap.data).contains("echo-me") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "input never echoed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(session);
        close_all(&router);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_new_session_spawn_failure_replies_error() {
        let router = router();
        let mut ctx = ConnectionContext::default();

        let reply = send(
            &router,
            &mut ctx,
            r#"{"type":"new_session","cwd":"/nonexistent/cmuxd-test"}"#,
        )
        .await;
        match reply {
            Some(ServerMessage::Error { request, message }) => {
                assert_eq!(request, "new_session");
                assert!(message.contains("/nonexistent/cmuxd-test"), "{}", message);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(ctx.attached_session_id(), None);
        assert!(router.registry().is_empty());
        assert!(router.registry().list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_new_pane_missing_shell_replies_error() {
        let mut config = Config::default();
        config.session.default_shell = "/nonexistent/cmuxd-shell".to_string();
        let router = MessageRouter::new(SessionRegistry::new(&config, Arc::new(OutputHub::new())));
        let mut ctx = ConnectionContext::default();

        let reply = send(&router, &mut ctx, r#"{"type":"new_pane"}"#).await;
        assert!(
            matches!(&reply, Some(ServerMessage::Error { request, .. }) if request == "new_pane"),
            "unexpected reply {:?}",
            reply
        );
        assert_eq!(ctx.attached_session_id(), None);
        assert!(router.registry().is_empty());
    }
}
