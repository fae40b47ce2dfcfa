//! # cmuxd Daemon Library
//!
//! A headless terminal-session daemon. It hosts shells in pseudo-terminals
//! and lets any number of clients drive them over a shared JSON protocol.
//!
//! ## Overview
//!
//! - **Sessions**: each session owns a PTY, its child process, a terminal
//!   emulator used for snapshots, and title/cwd metadata parsed from OSC
//!   sequences
//! - **Output Hub**: fans PTY output and session events out to every ready
//!   client connection
//! - **Transports**: standard I/O, a Unix domain socket, and a WebSocket
//!   listener, all speaking the same messages
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                   Daemon Orchestrator                     │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌──────────┐   ┌───────────────────────┐  │
//! │  │  stdio   │   │   unix   │   │       websocket       │  │
//! │  └────┬─────┘   └────┬─────┘   └───────────┬───────────┘  │
//! │       └──────────────┼─────────────────────┘              │
//! │               ┌──────┴────────┐                           │
//! │               │Message Router │                           │
//! │               └──────┬────────┘                           │
//! │  ┌───────────────────┴──────────┐   ┌──────────────────┐  │
//! │  │       Session Registry       │──▶│    Output Hub    │  │
//! │  │ (PTY + emulator + reader)    │   │ (per-client sink)│  │
//! │  └──────────────────────────────┘   └──────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cmuxd::{Config, DaemonOrchestrator, Transports};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let orchestrator = DaemonOrchestrator::new(config)?;
//!
//!     let transports = Transports {
//!         unix: Some("/tmp/cmuxd.sock".into()),
//!         ..Default::default()
//!     };
//!     orchestrator
//!         .run(transports, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions, terminal state, and the output hub
//! - [`router`]: Protocol message dispatch
//! - [`transport`]: stdio, Unix socket, and WebSocket transports
//! - [`orchestrator`]: Startup and shutdown

pub mod config;
pub mod orchestrator;
pub mod router;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use orchestrator::{DaemonOrchestrator, OrchestratorState, Transports};
pub use router::{ConnectionContext, MessageRouter, RouterError, RouterResult};
pub use session::{
    EventSink, OutputHub, Session, SessionError, SessionId, SessionOptions, SessionRegistry,
};
pub use transport::{TransportError, TransportKind, UnixServer, WsServer};
