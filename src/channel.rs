//! Routing key for a terminal connection.
//!
//! A connection is opened against a room such as
//! `sandbox:cmux:sbx_123:thread_456`. Only sandbox rooms are served here;
//! anything else is rejected before the WebSocket upgrade.

use std::fmt;

use crate::errors::{RelayError, RelayResult};
use crate::models::{SandboxProviderKind, ThreadTarget};

const SANDBOX_ROOM_PREFIX: &str = "sandbox";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    pub sandbox_id: String,
    pub sandbox_provider: SandboxProviderKind,
    pub thread_id: String,
}

impl Channel {
    pub fn parse(room: &str) -> RelayResult<Self> {
        let mut parts = room.splitn(4, ':');
        let kind = parts.next().unwrap_or_default();
        if kind != SANDBOX_ROOM_PREFIX {
            return Err(RelayError::InvalidChannel(format!(
                "expected a sandbox channel, got '{kind}'"
            )));
        }

        let (Some(provider), Some(sandbox_id), Some(thread_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RelayError::InvalidChannel(format!(
                "sandbox channel '{room}' must be sandbox:<provider>:<sandbox>:<thread>"
            )));
        };

        if sandbox_id.is_empty() || thread_id.is_empty() {
            return Err(RelayError::InvalidChannel(format!(
                "sandbox channel '{room}' has an empty component"
            )));
        }

        let sandbox_provider = provider
            .parse::<SandboxProviderKind>()
            .map_err(RelayError::InvalidChannel)?;

        Ok(Self {
            sandbox_id: sandbox_id.to_string(),
            sandbox_provider,
            thread_id: thread_id.to_string(),
        })
    }

    pub fn thread_target(&self) -> ThreadTarget {
        ThreadTarget {
            sandbox_id: self.sandbox_id.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SANDBOX_ROOM_PREFIX}:{}:{}:{}",
            self.sandbox_provider, self.sandbox_id, self.thread_id
        )
    }
}
