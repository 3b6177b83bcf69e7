use std::time::Duration;

use crate::models::SandboxProviderKind;
use crate::{DEFAULT_EXTEND_TIMEOUT_SECS, DEFAULT_KEEPALIVE_WINDOW_SECS};

/// Bounded per-connection queue between the socket reader and the handler.
pub const INBOUND_QUEUE_SIZE: usize = 256;

/// Per-connection queue between the handler and the socket writer. A client
/// that lets it fill up is disconnected.
pub const OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Runtime knobs shared by every connection.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Window of the mark-active and extend-timeout debouncers.
    pub keepalive_window: Duration,
    /// Duration passed to the provider's extend-timeout call.
    pub extend_timeout: Duration,
    pub inbound_queue_size: usize,
    pub outbound_queue_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keepalive_window: Duration::from_secs(DEFAULT_KEEPALIVE_WINDOW_SECS),
            extend_timeout: Duration::from_secs(DEFAULT_EXTEND_TIMEOUT_SECS),
            inbound_queue_size: INBOUND_QUEUE_SIZE,
            outbound_queue_size: OUTBOUND_QUEUE_SIZE,
        }
    }
}

/// Which provider this deployment wires in, and how to reach it.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub kind: SandboxProviderKind,
    pub url: Option<String>,
    pub api_key: Option<String>,
}
