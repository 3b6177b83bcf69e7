use async_trait::async_trait;
use clap::Parser;
use cmux_relay::config::ProviderSettings;
use cmux_relay::errors::{RelayError, RelayResult};
use cmux_relay::models::{SandboxProviderKind, ThreadTarget};
use cmux_relay::provider::ProviderRegistry;
use cmux_relay::thread_api::{HttpThreadApi, ThreadApi};
use cmux_relay::{build_router, AppState, RelayConfig, DEFAULT_HTTP_PORT};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cmux-relayd", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "CMUX_RELAY_PORT")]
    port: u16,
    /// Directory used for logs
    #[arg(long, default_value = "/var/log/cmux", env = "CMUX_RELAY_LOG_DIR")]
    log_dir: PathBuf,
    /// Sandbox provider served by this relay
    #[arg(long, value_enum, default_value_t = SandboxProviderKind::Cmux, env = "CMUX_RELAY_PROVIDER")]
    provider: SandboxProviderKind,
    /// Base URL of the provider control plane
    #[arg(long, env = "CMUX_RELAY_PROVIDER_URL")]
    provider_url: Option<String>,
    /// API key sent as a bearer token to the provider
    #[arg(long, env = "CMUX_RELAY_PROVIDER_API_KEY", hide_env_values = true)]
    provider_api_key: Option<String>,
    /// Base URL of the backend serving keepalive and environment lookups
    #[arg(long, env = "CMUX_RELAY_THREAD_API_URL")]
    thread_api_url: Option<String>,
    /// Debounce window for keepalive and timeout extension calls
    #[arg(long, default_value_t = cmux_relay::DEFAULT_KEEPALIVE_WINDOW_SECS)]
    keepalive_window_secs: u64,
    /// Sandbox timeout requested on every extension
    #[arg(long, default_value_t = cmux_relay::DEFAULT_EXTEND_TIMEOUT_SECS)]
    extend_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(&options.log_dir);

    run_server(options).await;

    Ok(())
}

fn init_tracing(log_dir: &PathBuf) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "cmux-relayd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
}

async fn run_server(options: Options) {
    let bind_ip = parse_bind_ip(&options.bind);

    let providers = ProviderRegistry::from_settings(&ProviderSettings {
        kind: options.provider,
        url: options.provider_url.clone(),
        api_key: options.provider_api_key.clone(),
    });
    let config = RelayConfig {
        keepalive_window: Duration::from_secs(options.keepalive_window_secs),
        extend_timeout: Duration::from_secs(options.extend_timeout_secs),
        ..RelayConfig::default()
    };
    let state = AppState::new(providers, build_thread_api(&options), config);
    let app = build_router(state);

    let addr = SocketAddr::new(bind_ip, options.port);
    let retry_delay = Duration::from_secs(5);

    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(
                    provider = %options.provider,
                    "cmux-relayd listening on http://{}",
                    addr
                );

                match axum::serve(listener, app.clone())
                    .with_graceful_shutdown(shutdown_signal())
                    .await
                {
                    Ok(()) => {
                        tracing::info!("server shut down gracefully");
                        break;
                    }
                    Err(error) => {
                        tracing::error!(?error, "server error; restarting");
                    }
                }
            }
            Err(error) => {
                tracing::error!(?error, %addr, "failed to bind listener");
            }
        }

        tracing::info!(
            "retrying server startup in {} seconds",
            retry_delay.as_secs()
        );
        sleep(retry_delay).await;
    }
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

fn build_thread_api(options: &Options) -> Arc<dyn ThreadApi> {
    let Some(url) = options.thread_api_url.as_deref() else {
        tracing::error!("--thread-api-url is not set; running in degraded mode");
        return Arc::new(UnavailableThreadApi::new("thread api url is not set".into()));
    };
    match HttpThreadApi::new(url) {
        Ok(api) => Arc::new(api),
        Err(error) => {
            tracing::error!(?error, "failed to initialize thread api; running in degraded mode");
            Arc::new(UnavailableThreadApi::new(error.to_string()))
        }
    }
}

#[derive(Clone)]
struct UnavailableThreadApi {
    reason: String,
}

impl UnavailableThreadApi {
    fn new(reason: String) -> Self {
        Self { reason }
    }

    fn error(&self, operation: &str) -> RelayError {
        RelayError::ThreadApi(format!("{operation} unavailable: {}", self.reason))
    }
}

#[async_trait]
impl ThreadApi for UnavailableThreadApi {
    async fn mark_active(&self, _target: &ThreadTarget, _token: Option<&str>) -> RelayResult<()> {
        Err(self.error("keepalive"))
    }

    async fn environment_variables(
        &self,
        _target: &ThreadTarget,
        _token: Option<&str>,
    ) -> RelayResult<HashMap<String, String>> {
        Err(self.error("environment variables"))
    }
}
