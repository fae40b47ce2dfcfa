//! Protocol message definitions for cmuxd.
//!
//! Every logical message is one JSON object keyed by `type`. Stdio and Unix
//! socket clients send one object per line; WebSocket clients send one object
//! per text frame. PTY bytes travel base64-encoded inside the JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Static capability list announced in `welcome` and `capabilities` replies.
pub const CAPABILITIES: &[&str] = &[
    "sessions", "panes", "snapshot", "input", "resize", "title", "cwd", "notify", "ping",
];

/// Encode raw PTY bytes for transport inside JSON.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 PTY payload.
pub fn decode_payload(data: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(data)?)
}

/// Optional explicit session/pane selection carried by a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
}

/// Parameters for `new_session` / `new_pane`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
}

/// Requests sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Resolve a session for this connection and start receiving events.
    Hello(SessionTarget),
    /// Ask for the static capability list.
    Capabilities,
    /// Ask for the session directory.
    ListSessions,
    /// Rebind the connection to another session.
    AttachSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Create a session and attach to it.
    NewSession(NewSession),
    /// Alias of `new_session` answered with `pane_created`.
    NewPane(NewSession),
    /// Ask for a replayable screen snapshot.
    SnapshotRequest(SessionTarget),
    /// Raw keyboard input, base64-encoded.
    Input {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pane_id: Option<String>,
    },
    /// New terminal geometry.
    Resize {
        cols: u16,
        rows: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pane_id: Option<String>,
    },
    /// Keepalive.
    Ping,
    /// Close the resolved pane and its session.
    ClosePane(SessionTarget),
    /// Pane directory, optionally filtered to one session.
    ListPanes {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// The pane belonging to one session.
    ListSessionPanes {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ClientMessage {
    /// Parse one message from a line or text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text.trim())?)
    }

    /// The wire `type` of this request.
    pub fn request_name(&self) -> &'static str {
        match self {
            ClientMessage::Hello(_) => "hello",
            ClientMessage::Capabilities => "capabilities",
            ClientMessage::ListSessions => "list_sessions",
            ClientMessage::AttachSession { .. } => "attach_session",
            ClientMessage::NewSession(_) => "new_session",
            ClientMessage::NewPane(_) => "new_pane",
            ClientMessage::SnapshotRequest(_) => "snapshot_request",
            ClientMessage::Input { .. } => "input",
            ClientMessage::Resize { .. } => "resize",
            ClientMessage::Ping => "ping",
            ClientMessage::ClosePane(_) => "close_pane",
            ClientMessage::ListPanes { .. } => "list_panes",
            ClientMessage::ListSessionPanes { .. } => "list_session_panes",
        }
    }

    /// The explicit session/pane selection carried by this request, if any.
    pub fn target(&self) -> SessionTarget {
        match self {
            ClientMessage::Hello(target)
            | ClientMessage::SnapshotRequest(target)
            | ClientMessage::ClosePane(target) => target.clone(),
            ClientMessage::Input {
                session_id,
                pane_id,
                ..
            }
            | ClientMessage::Resize {
                session_id,
                pane_id,
                ..
            } => SessionTarget {
                session_id: session_id.clone(),
                pane_id: pane_id.clone(),
            },
            _ => SessionTarget::default(),
        }
    }
}

/// One row of the `sessions` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: String,
    pub pane_id: String,
    pub title: Option<String>,
    pub cwd: Option<String>,
}

/// One row of the `panes` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneEntry {
    pub pane_id: String,
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
    pub title: Option<String>,
    pub cwd: Option<String>,
}

/// Replies and pushed events sent by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Replies
    Welcome {
        session_id: String,
        pane_id: String,
        capabilities: Vec<String>,
    },
    Capabilities {
        capabilities: Vec<String>,
    },
    Sessions {
        sessions: Vec<SessionEntry>,
    },
    SessionAttached {
        session_id: String,
        pane_id: String,
    },
    SessionCreated {
        session_id: String,
        pane_id: String,
        cols: u16,
        rows: u16,
    },
    PaneCreated {
        session_id: String,
        pane_id: String,
        cols: u16,
        rows: u16,
    },
    Snapshot {
        session_id: String,
        pane_id: String,
        cols: u16,
        rows: u16,
        data: String,
    },
    Pong,
    PaneClosed {
        session_id: String,
        pane_id: String,
    },
    Panes {
        panes: Vec<PaneEntry>,
    },
    Error {
        request: String,
        message: String,
    },

    // Pushed events
    Output {
        session_id: String,
        pane_id: String,
        data: String,
    },
    PaneExited {
        session_id: String,
        pane_id: String,
        exit_code: i32,
    },
    TitleUpdate {
        session_id: String,
        pane_id: String,
        title: String,
    },
    CwdUpdate {
        session_id: String,
        pane_id: String,
        cwd: String,
    },
    Notify {
        session_id: String,
        pane_id: String,
        title: String,
        body: String,
    },
}

impl ServerMessage {
    /// Serialize to a single-line JSON object (no trailing newline).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Build the reply listing [`CAPABILITIES`].
    pub fn capabilities() -> Self {
        ServerMessage::Capabilities {
            capabilities: capability_list(),
        }
    }
}

/// [`CAPABILITIES`] as owned strings.
pub fn capability_list() -> Vec<String> {
    CAPABILITIES.iter().map(|c| (*c).to_string()).collect()
}
