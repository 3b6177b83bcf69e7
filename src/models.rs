use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sandbox backends a channel can name. Only one of them is wired into a
/// given deployment; the others fail fast when a connection selects them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SandboxProviderKind {
    Cmux,
    E2b,
    Daytona,
}

impl SandboxProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxProviderKind::Cmux => "cmux",
            SandboxProviderKind::E2b => "e2b",
            SandboxProviderKind::Daytona => "daytona",
        }
    }
}

impl fmt::Display for SandboxProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "cmux" => Ok(SandboxProviderKind::Cmux),
            "e2b" => Ok(SandboxProviderKind::E2b),
            "daytona" => Ok(SandboxProviderKind::Daytona),
            other => Err(format!("unknown sandbox provider '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Initial,
    Initializing,
    Connecting,
    Reconnecting,
    Connected,
    Disconnected,
    Error,
}

/// What the client is told about its terminal. `pid` is only set while
/// `status` is `Connected` and a PTY exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalState {
    pub status: TerminalStatus,
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TerminalState {
    pub fn new(status: TerminalStatus) -> Self {
        Self {
            status,
            pid: None,
            error: None,
        }
    }

    pub fn connected(pid: Option<u32>) -> Self {
        Self {
            status: TerminalStatus::Connected,
            pid,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Error,
            pid: None,
            error: Some(message.into()),
        }
    }
}

impl Default for TerminalState {
    fn default() -> Self {
        Self::new(TerminalStatus::Initial)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl PtySize {
    /// Zero or missing dimensions fall back to the 80x24 default.
    pub fn or_default(cols: Option<u16>, rows: Option<u16>) -> Self {
        Self {
            cols: cols.filter(|c| *c > 0).unwrap_or(crate::DEFAULT_COLS),
            rows: rows.filter(|r| *r > 0).unwrap_or(crate::DEFAULT_ROWS),
        }
    }

    /// Both dimensions present and non-zero, otherwise `None`.
    pub fn explicit(cols: Option<u16>, rows: Option<u16>) -> Option<Self> {
        match (cols, rows) {
            (Some(cols), Some(rows)) if cols > 0 && rows > 0 => Some(Self { cols, rows }),
            _ => None,
        }
    }
}

impl Default for PtySize {
    fn default() -> Self {
        Self {
            cols: crate::DEFAULT_COLS,
            rows: crate::DEFAULT_ROWS,
        }
    }
}

/// Messages a terminal tab sends over its WebSocket.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    PtyConnect {
        sandbox_id: String,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    PtyInput {
        sandbox_id: String,
        pid: u32,
        input: String,
    },
    PtyResize {
        sandbox_id: String,
        pid: u32,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
}

impl ClientMessage {
    pub fn sandbox_id(&self) -> &str {
        match self {
            ClientMessage::PtyConnect { sandbox_id, .. }
            | ClientMessage::PtyInput { sandbox_id, .. }
            | ClientMessage::PtyResize { sandbox_id, .. } => sandbox_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::PtyConnect { .. } => "pty-connect",
            ClientMessage::PtyInput { .. } => "pty-input",
            ClientMessage::PtyResize { .. } => "pty-resize",
        }
    }
}

/// Messages the relay sends back. State updates omit `ptyData`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub sandbox_id: String,
    pub state: TerminalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pty_data: Option<String>,
}

impl ServerMessage {
    pub fn state(sandbox_id: &str, state: TerminalState) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            state,
            pty_data: None,
        }
    }

    pub fn pty_data(sandbox_id: &str, state: TerminalState, data: String) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            state,
            pty_data: Some(data),
        }
    }
}

/// Body shared by the keepalive and environment-variable thread API calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadTarget {
    pub sandbox_id: String,
    pub thread_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVariablesResponse {
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_client_messages() {
        let message: ClientMessage = serde_json::from_value(json!({
            "type": "pty-input",
            "sandboxId": "sbx-1",
            "pid": 42,
            "input": "ls\n"
        }))
        .unwrap();
        assert_eq!(
            message,
            ClientMessage::PtyInput {
                sandbox_id: "sbx-1".into(),
                pid: 42,
                input: "ls\n".into()
            }
        );

        let message: ClientMessage = serde_json::from_value(json!({
            "type": "pty-connect",
            "sandboxId": "sbx-1"
        }))
        .unwrap();
        assert_eq!(message.kind(), "pty-connect");
        assert_eq!(message.sandbox_id(), "sbx-1");
    }

    #[test]
    fn rejects_unknown_message_types() {
        let result = serde_json::from_value::<ClientMessage>(json!({
            "type": "pty-destroy",
            "sandboxId": "sbx-1"
        }));
        assert!(result.is_err());

        let result = serde_json::from_value::<ClientMessage>(json!({
            "type": "pty-input",
            "sandboxId": "sbx-1",
            "input": "missing pid"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn state_update_wire_format() {
        let message = ServerMessage::state("sbx-1", TerminalState::new(TerminalStatus::Initializing));
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "sandboxId": "sbx-1",
                "state": { "status": "initializing", "pid": null }
            })
        );

        let message = ServerMessage::pty_data("sbx-1", TerminalState::connected(Some(7)), "hi".into());
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "sandboxId": "sbx-1",
                "state": { "status": "connected", "pid": 7 },
                "ptyData": "hi"
            })
        );
    }

    #[test]
    fn pty_size_defaults_on_zero() {
        assert_eq!(PtySize::or_default(Some(0), None), PtySize { cols: 80, rows: 24 });
        assert_eq!(PtySize::or_default(Some(120), Some(40)), PtySize { cols: 120, rows: 40 });
        assert_eq!(PtySize::explicit(Some(100), Some(0)), None);
        assert_eq!(PtySize::explicit(None, Some(10)), None);
    }
}
