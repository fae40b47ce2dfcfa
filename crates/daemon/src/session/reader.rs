//! Per-session PTY reader thread.
//!
//! The thread polls the master side with a bounded timeout, feeds every chunk
//! through the session's emulator before broadcasting it, and turns PTY
//! hangup or child exit into a `pane_exited` event followed by session close.

use std::io::{self, Read};
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::instance::Session;
use super::manager::SessionRegistry;
use super::pty::SessionError;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Starts the reader thread for a registered session.
pub(crate) fn start(
    session: Arc<Session>,
    registry: Weak<SessionRegistry>,
    poll_interval: Duration,
) -> Result<(), SessionError> {
    let reader = session.clone_reader()?;
    let name = format!("cmuxd-reader-{}", &session.id()[..8.min(session.id().len())]);

    let worker = Arc::clone(&session);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || run(worker, reader, registry, poll_interval))?;

    session.set_reader(handle);
    Ok(())
}

enum Wake {
    Readable,
    Idle,
}

fn run(
    session: Arc<Session>,
    mut reader: Box<dyn Read + Send>,
    registry: Weak<SessionRegistry>,
    poll_interval: Duration,
) {
    let timeout = PollTimeout::from(u16::try_from(poll_interval.as_millis()).unwrap_or(u16::MAX));
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    tracing::debug!(session_id = %session.id(), "Reader thread started");

    let exit_code = loop {
        if session.is_closing() {
            break None;
        }

        match wait_readable(&session, timeout) {
            Ok(Wake::Readable) => {}
            Ok(Wake::Idle) => {
                if let Some(code) = session.try_reap() {
                    break Some(code);
                }
                continue;
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "PTY poll failed");
                break wait_for_exit(&session, poll_interval);
            }
        }

        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_id = %session.id(), "PTY EOF");
                break wait_for_exit(&session, poll_interval);
            }
            Ok(n) => {
                if session.is_closing() {
                    break None;
                }
                let data = &buffer[..n];
                session.process_output(data);
                session.hub().send_output(session.session_ref(), data);
            }
            Err(e) if is_retriable(&e) => continue,
            Err(e) => {
                if !is_hangup(&e) {
                    tracing::warn!(session_id = %session.id(), error = %e, "Error reading from PTY");
                }
                break wait_for_exit(&session, poll_interval);
            }
        }
    };

    let Some(exit_code) = exit_code else {
        tracing::debug!(session_id = %session.id(), "Reader thread stopping: session closing");
        return;
    };

    if session.is_closing() {
        return;
    }

    tracing::info!(session_id = %session.id(), exit_code, "Session process exited");
    session.hub().send_exit(session.session_ref(), exit_code);
    request_close(&session, registry);
}

fn wait_readable(session: &Session, timeout: PollTimeout) -> Result<Wake, Errno> {
    // SAFETY: the descriptor belongs to the session's master PTY, which lives
    // as long as the session this thread holds a reference to.
    let fd = unsafe { BorrowedFd::borrow_raw(session.master_fd()) };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let ready = poll(&mut fds, timeout)?;
    Ok(if ready > 0 { Wake::Readable } else { Wake::Idle })
}

/// Waits for the child after the PTY hung up or reached EOF, giving up if the
/// session is closed meanwhile.
fn wait_for_exit(session: &Session, interval: Duration) -> Option<i32> {
    loop {
        if let Some(code) = session.try_reap() {
            return Some(code);
        }
        if session.is_closing() {
            return None;
        }
        thread::sleep(interval);
    }
}

/// Closes the session from a detached thread; the reader cannot join itself.
fn request_close(session: &Session, registry: Weak<SessionRegistry>) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let session_id = session.id().to_string();

    let spawned = thread::Builder::new()
        .name("cmuxd-close".to_string())
        .spawn(move || {
            registry.close(&session_id);
        });
    if let Err(e) = spawned {
        tracing::error!(session_id = %session.id(), error = %e, "Failed to spawn close thread");
    }
}

fn is_retriable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

fn is_hangup(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == Errno::EIO as i32
            || code == Errno::EPIPE as i32
            || code == Errno::EBADF as i32
    )
}
