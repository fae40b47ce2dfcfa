//! A live PTY session.
//!
//! A session owns one PTY, the child running on it, a terminal emulator fed by
//! its reader thread, and the metadata (title, cwd, colors, cursor style)
//! derived from the output stream.

use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{MasterPty, PtySize};

use super::hub::{OutputHub, SessionRef};
use super::pty::{self, SessionError, SpawnRequest};
use super::snapshot;
use super::terminal::{ColorOperation, TerminalSignal, TerminalState};

/// A replayable copy of the screen at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub cols: u16,
    pub rows: u16,
    pub data: Vec<u8>,
}

/// Directory information about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub pane_id: String,
    pub title: Option<String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub pid: i32,
}

pub struct Session {
    session_ref: SessionRef,
    pid: i32,
    master: Mutex<Box<dyn MasterPty + Send>>,
    master_fd: RawFd,
    writer: Mutex<Box<dyn Write + Send>>,
    state: Mutex<TerminalState>,
    closing: AtomicBool,
    reaped: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    hub: Arc<OutputHub>,
}

impl Session {
    /// Opens a PTY, starts the child and builds an emulator of the same size.
    ///
    /// The reader thread is started separately, once the session is
    /// registered and can be found by its own exit handling.
    pub(crate) fn spawn(
        request: &SpawnRequest,
        scrollback: usize,
        hub: Arc<OutputHub>,
    ) -> Result<Arc<Self>, SessionError> {
        let spawned = pty::spawn(request)?;

        Ok(Arc::new(Session {
            session_ref: SessionRef {
                session_id: request.session_id.clone(),
                pane_id: request.pane_id.clone(),
            },
            pid: spawned.pid,
            master: Mutex::new(spawned.master),
            master_fd: spawned.master_fd,
            writer: Mutex::new(spawned.writer),
            state: Mutex::new(TerminalState::new(request.cols, request.rows, scrollback)),
            closing: AtomicBool::new(false),
            reaped: AtomicBool::new(false),
            reader: Mutex::new(None),
            hub,
        }))
    }

    pub fn id(&self) -> &str {
        &self.session_ref.session_id
    }

    pub fn pane_id(&self) -> &str {
        &self.session_ref.pane_id
    }

    pub fn session_ref(&self) -> &SessionRef {
        &self.session_ref
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Current geometry as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        self.lock_state().size()
    }

    pub fn title(&self) -> Option<String> {
        self.lock_state().title().map(str::to_string)
    }

    pub fn cwd(&self) -> Option<String> {
        self.lock_state().cwd().map(str::to_string)
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.lock_state();
        let (cols, rows) = state.size();
        SessionInfo {
            session_id: self.session_ref.session_id.clone(),
            pane_id: self.session_ref.pane_id.clone(),
            title: state.title().map(str::to_string),
            cwd: state.cwd().map(str::to_string),
            cols,
            rows,
            pid: self.pid,
        }
    }

    /// Writes raw input to the PTY.
    ///
    /// The whole buffer is written under the writer lock; there is no
    /// flow control towards the client.
    pub fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.is_closing() {
            return Err(SessionError::Closing(self.id().to_string()));
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Resizes the PTY and the emulator grid.
    ///
    /// Failures are logged and otherwise ignored.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }

        let result = self
            .master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        if let Err(e) = result {
            tracing::warn!(
                session_id = %self.id(),
                error = %SessionError::ResizeFailed(e.to_string()),
                "Ignoring resize failure"
            );
        }

        self.lock_state().resize(cols, rows);
        tracing::debug!(session_id = %self.id(), cols, rows, "Resized session");
    }

    /// Feeds PTY output through the emulator and broadcasts any title, cwd
    /// or notification it carried.
    pub fn process_output(&self, data: &[u8]) {
        let signals = self.lock_state().process(data);

        for signal in signals {
            match signal {
                TerminalSignal::Title(title) => self.update_title(&title),
                TerminalSignal::Cwd(cwd) => self.update_cwd(&cwd),
                TerminalSignal::Notify { title, body } => self.emit_notify(&title, &body),
            }
        }
    }

    /// Captures the screen as a replayable escape-sequence stream.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock_state();
        let (cols, rows) = state.size();
        Snapshot {
            cols,
            rows,
            data: snapshot::render(&state),
        }
    }

    /// Stores and broadcasts a new title; repeated titles are not re-sent.
    pub fn update_title(&self, title: &str) {
        if self.is_closing() {
            return;
        }
        if self.lock_state().set_title(title) {
            self.hub.send_title(&self.session_ref, title);
        }
    }

    /// Stores and broadcasts a new working directory; repeats are not re-sent.
    pub fn update_cwd(&self, cwd: &str) {
        if self.is_closing() {
            return;
        }
        if self.lock_state().set_cwd(cwd) {
            self.hub.send_cwd(&self.session_ref, cwd);
        }
    }

    pub fn emit_notify(&self, title: &str, body: &str) {
        if self.is_closing() {
            return;
        }
        self.hub.send_notify(&self.session_ref, title, body);
    }

    pub fn apply_color_operation(&self, op: ColorOperation) {
        self.lock_state().apply_color_operation(op);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Marks the session as closing. Returns `false` if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn hub(&self) -> &OutputHub {
        &self.hub
    }

    pub(crate) fn master_fd(&self) -> RawFd {
        self.master_fd
    }

    pub(crate) fn clone_reader(&self) -> Result<Box<dyn Read + Send>, SessionError> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))
    }

    pub(crate) fn set_reader(&self, handle: JoinHandle<()>) {
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Reaps the child if it has exited.
    pub(crate) fn try_reap(&self) -> Option<i32> {
        if self.reaped.load(Ordering::Acquire) {
            return None;
        }
        let code = pty::try_reap(self.pid);
        if code.is_some() {
            self.reaped.store(true, Ordering::Release);
        }
        code
    }

    /// Stops the child and the reader thread.
    ///
    /// Must be called after [`begin_close`](Self::begin_close). Blocks until
    /// the reader thread has exited and the child has been reaped.
    pub(crate) fn shutdown(&self) {
        if !self.reaped.load(Ordering::Acquire) {
            let _ = kill(Pid::from_raw(self.pid), Signal::SIGHUP);
        }

        let handle = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                tracing::warn!(session_id = %self.id(), "Reader thread cannot join itself");
            } else if handle.join().is_err() {
                tracing::warn!(session_id = %self.id(), "Reader thread panicked");
            }
        }

        if self.try_reap().is_none() && !self.reaped.load(Ordering::Acquire) {
            let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
            if pty::reap_blocking(self.pid).is_some() {
                self.reaped.store(true, Ordering::Release);
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TerminalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_ref.session_id)
            .field("pane_id", &self.session_ref.pane_id)
            .field("pid", &self.pid)
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::hub::testing::RecordingSink;
    use crate::session::pty::generate_id;
    use crate::session::terminal::DynamicColor;
    use protocol::ServerMessage;
    use serial_test::serial;

    fn spawn_cat(hub: Arc<OutputHub>) -> Arc<Session> {
        let request = SpawnRequest {
            session_id: generate_id(),
            pane_id: generate_id(),
            shell: "/bin/sh".to_string(),
            command: Some(vec!["/bin/cat".to_string()]),
            cwd: None,
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        };
        Session::spawn(&request, 100, hub).unwrap()
    }

    fn close(session: &Session) {
        session.begin_close();
        session.shutdown();
    }

    #[test]
    #[serial]
    fn test_update_title_deduplicates() {
        let hub = Arc::new(OutputHub::new());
        let sink = RecordingSink::ready();
        hub.add(sink.clone());
        let session = spawn_cat(hub);

        session.update_title("x");
        session.update_title("x");

        let titles: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, ServerMessage::TitleUpdate { .. }))
            .collect();
        assert_eq!(titles.len(), 1);
        assert_eq!(session.title().as_deref(), Some("x"));
        close(&session);
    }

    #[test]
    #[serial]
    fn test_repeated_notifications_all_delivered() {
        let hub = Arc::new(OutputHub::new());
        let sink = RecordingSink::ready();
        hub.add(sink.clone());
        let session = spawn_cat(hub);

        session.process_output(b"\x1b]9;done\x07");
        session.process_output(b"\x1b]9;done\x07");

        let bodies: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ServerMessage::Notify { body, .. } => Some(body),
                _ => None,
            })
            .collect();
        assert_eq!(bodies, vec!["done".to_string(), "done".to_string()]);
        close(&session);
    }

    #[test]
    #[serial]
    fn test_process_output_broadcasts_metadata() {
        let hub = Arc::new(OutputHub::new());
        let sink = RecordingSink::ready();
        hub.add(sink.clone());
        let session = spawn_cat(hub);

        session.process_output(b"\x1b]2;build\x07\x1b]7;file:///srv/app\x07\x1b]9;done\x07");
        session.process_output(b"\x1b]7;file:///srv/app\x07");

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ServerMessage::TitleUpdate { title, .. } if title == "build"));
        assert!(matches!(&events[1], ServerMessage::CwdUpdate { cwd, .. } if cwd == "/srv/app"));
        assert!(matches!(&events[2], ServerMessage::Notify { body, .. } if body == "done"));
        assert_eq!(session.info().cwd.as_deref(), Some("/srv/app"));
        close(&session);
    }

    #[test]
    #[serial]
    fn test_closing_session_is_silent() {
        let hub = Arc::new(OutputHub::new());
        let sink = RecordingSink::ready();
        hub.add(sink.clone());
        let session = spawn_cat(hub);

        assert!(session.begin_close());
        assert!(!session.begin_close());
        session.update_title("late");
        session.emit_notify("late", "late");
        assert!(sink.events().is_empty());
        assert!(matches!(
            session.write_input(b"x"),
            Err(SessionError::Closing(_))
        ));
        session.shutdown();
    }

    #[test]
    #[serial]
    fn test_resize_same_size_keeps_geometry() {
        let session = spawn_cat(Arc::new(OutputHub::new()));
        let (cols, rows) = session.size();
        session.resize(cols, rows);
        assert_eq!(session.size(), (cols, rows));

        session.resize(120, 40);
        assert_eq!(session.snapshot().cols, 120);
        assert_eq!(session.snapshot().rows, 40);

        session.resize(0, 10);
        assert_eq!(session.size(), (120, 40));
        close(&session);
    }

    #[test]
    #[serial]
    fn test_color_operation_reaches_snapshot() {
        let session = spawn_cat(Arc::new(OutputHub::new()));
        session.apply_color_operation(ColorOperation::SetDynamic {
            target: DynamicColor::Background,
            spec: "#202020".to_string(),
        });
        let snap = session.snapshot();
        assert!(String::from_utf8_lossy(&snap.data).contains("\x1b]11;#202020\x07"));
        close(&session);
    }

    #[test]
    #[serial]
    fn test_shutdown_reaps_child() {
        let session = spawn_cat(Arc::new(OutputHub::new()));
        let pid = session.pid();
        close(&session);
        // The pid is gone once reaped.
        assert!(kill(Pid::from_raw(pid), None).is_err());
    }
}
