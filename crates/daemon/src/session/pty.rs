//! PTY allocation and shell spawning.
//!
//! A spawned PTY is the raw material of a [`Session`](super::Session): the
//! master handle, a writer for input, the master's raw descriptor (polled by
//! the reader thread) and the child pid (reaped with `waitpid`).

use std::io::Write;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{Pid, User};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

/// Unique identifier for a session.
pub type SessionId = String;

/// Unique identifier for a pane.
pub type PaneId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session is shutting down and accepts no more work.
    #[error("session is closing: {0}")]
    Closing(SessionId),

    /// Failed to open the PTY or spawn the child.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generates a session or pane identifier: 16 random bytes as lowercase hex.
pub fn generate_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Everything needed to start a shell on a fresh PTY.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: SessionId,
    pub pane_id: PaneId,
    pub shell: String,
    /// Explicit program and arguments; replaces the shell when set.
    pub command: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

/// A running child attached to the master side of a PTY.
pub struct SpawnedPty {
    pub master: Box<dyn MasterPty + Send>,
    pub writer: Box<dyn Write + Send>,
    pub master_fd: RawFd,
    pub pid: i32,
}

/// Opens a PTY sized to the request and starts the child on its slave side.
///
/// The slave handle is released before returning so the master sees EOF once
/// the child and its descendants close the terminal.
///
/// A requested working directory that does not exist fails the spawn rather
/// than starting the shell somewhere else.
pub fn spawn(request: &SpawnRequest) -> Result<SpawnedPty, SessionError> {
    if let Some(dir) = &request.cwd {
        if !dir.is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory {} is not a directory",
                dir.display()
            )));
        }
    }

    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    let cmd = build_command(request);

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
    drop(pair.slave);

    let pid = child
        .process_id()
        .and_then(|pid| i32::try_from(pid).ok())
        .ok_or_else(|| SessionError::SpawnFailed("child has no process id".to_string()))?;
    // The child is reaped by pid through waitpid; the handle itself is not needed.
    drop(child);

    let master_fd = pair
        .master
        .as_raw_fd()
        .ok_or_else(|| SessionError::SpawnFailed("PTY master has no descriptor".to_string()))?;

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    tracing::debug!(
        session_id = %request.session_id,
        pid,
        shell = %request.shell,
        cols = request.cols,
        rows = request.rows,
        "Spawned PTY child"
    );

    Ok(SpawnedPty {
        master: pair.master,
        writer,
        master_fd,
        pid,
    })
}

/// Builds the child command line and environment.
fn build_command(request: &SpawnRequest) -> CommandBuilder {
    let user = User::from_uid(nix::unistd::getuid()).ok().flatten();

    let mut cmd = match &request.command {
        Some(argv) if !argv.is_empty() => {
            let mut cmd = CommandBuilder::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
        _ => shell_command(&request.shell, user.as_ref()),
    };

    let home = user
        .as_ref()
        .map(|u| u.dir.clone())
        .or_else(dirs::home_dir);

    let cwd = request.cwd.clone().or_else(|| home.clone());

    if let Some(dir) = &cwd {
        cmd.cwd(dir);
        cmd.env("PWD", dir);
    }

    cmd.env("SHELL", &request.shell);
    cmd.env("TERM", &request.term);
    cmd.env("COLORTERM", "truecolor");
    cmd.env("TERM_PROGRAM", "cmuxd");
    cmd.env("TERM_PROGRAM_VERSION", env!("CARGO_PKG_VERSION"));
    cmd.env("CMUXD_SESSION_ID", &request.session_id);
    cmd.env("CMUXD_PANE_ID", &request.pane_id);

    if let Some(user) = &user {
        cmd.env("USER", &user.name);
        cmd.env("LOGNAME", &user.name);
    }
    if let Some(home) = &home {
        cmd.env("HOME", home);
    }

    cmd
}

/// Returns the command that starts the user's shell.
///
/// On macOS a known user is logged in through `/usr/bin/login -flp` so the
/// shell gets a proper login session. Elsewhere the shell is exec'd directly:
/// Linux `login -f` only skips authentication when run as root, so an
/// unprivileged daemon would hang on a password prompt.
fn shell_command(shell: &str, user: Option<&User>) -> CommandBuilder {
    const LOGIN: &str = "/usr/bin/login";

    if cfg!(target_os = "macos") && Path::new(LOGIN).exists() {
        if let Some(user) = user {
            let mut cmd = CommandBuilder::new(LOGIN);
            cmd.args(["-flp", user.name.as_str(), shell]);
            return cmd;
        }
    }

    CommandBuilder::new(shell)
}

/// Converts a wait status into a POSIX exit code.
///
/// Returns `None` while the child is still running.
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Reaps the child if it has exited, without blocking.
///
/// A child that was already reaped elsewhere reports `None`.
pub fn try_reap(pid: i32) -> Option<i32> {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::trace!(pid, error = %e, "waitpid failed");
            None
        }
    }
}

/// Blocks until the child exits and returns its exit code.
pub fn reap_blocking(pid: i32) -> Option<i32> {
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    return Some(code);
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return None,
        }
    }
}
