//! Session management module.
//!
//! This module provides PTY spawning, the per-session terminal emulator and
//! reader thread, the session registry, and event fan-out to clients.

pub mod hub;
pub mod instance;
pub mod manager;
pub mod pty;
mod reader;
pub mod snapshot;
pub mod terminal;

pub use hub::{EventSink, OutputHub, SessionRef, SinkId};
pub use instance::{Session, SessionInfo, Snapshot};
pub use manager::{SessionOptions, SessionRegistry};
pub use pty::{generate_id, PaneId, SessionError, SessionId};
pub use terminal::{ColorOperation, CursorStyle, DynamicColor, TerminalSignal, TerminalState};
