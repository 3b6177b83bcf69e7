pub mod api;
pub mod channel;
pub mod config;
pub mod connection;
pub mod debounce;
pub mod errors;
pub mod lifecycle;
pub mod models;
pub mod provider;
pub mod service;
pub mod thread_api;

pub use api::build_router;
pub use config::RelayConfig;
pub use service::AppState;

pub const DEFAULT_HTTP_PORT: u16 = 46840;

/// Window for both the mark-active and extend-timeout debouncers.
pub const DEFAULT_KEEPALIVE_WINDOW_SECS: u64 = 60;

/// Duration requested from the provider on every extend-timeout call.
pub const DEFAULT_EXTEND_TIMEOUT_SECS: u64 = 5 * 60;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
