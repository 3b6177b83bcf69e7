//! Sandbox session providers.
//!
//! A provider resumes a remote sandbox and hands back a session through which
//! PTYs are created and driven. Exactly one provider kind is wired into a
//! deployment; channels naming any other kind fail fast.

pub mod cmux;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ProviderSettings;
use crate::errors::{ProviderError, ProviderResult};
use crate::models::{PtySize, SandboxProviderKind};

pub use cmux::CmuxProvider;

/// Receives raw PTY output, chunk by chunk, for as long as the PTY lives.
pub type PtyDataCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

pub struct CreatePtyRequest {
    pub size: PtySize,
    pub envs: HashMap<String, String>,
    pub on_data: PtyDataCallback,
}

/// Handle to a resumed sandbox. Owned by exactly one connection.
#[async_trait]
pub trait SandboxSession: Send + Sync + 'static {
    fn sandbox_id(&self) -> &str;
    async fn extend_timeout(&self, duration: Duration) -> ProviderResult<()>;
    /// Returns the pid of the new PTY.
    async fn create_pty(&self, request: CreatePtyRequest) -> ProviderResult<u32>;
    async fn send_input(&self, pid: u32, data: &[u8]) -> ProviderResult<()>;
    async fn resize(&self, pid: u32, size: PtySize) -> ProviderResult<()>;
    async fn kill(&self, pid: u32) -> ProviderResult<()>;
}

#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    async fn resume(&self, sandbox_id: &str) -> ProviderResult<Arc<dyn SandboxSession>>;
}

/// The provider wired into this deployment.
#[derive(Clone)]
pub struct ProviderRegistry {
    kind: SandboxProviderKind,
    provider: Arc<dyn SessionProvider>,
}

impl ProviderRegistry {
    pub fn new(kind: SandboxProviderKind, provider: Arc<dyn SessionProvider>) -> Self {
        Self { kind, provider }
    }

    /// Build the configured provider. A provider that cannot start is
    /// replaced by one that rejects every resume, so the relay still serves
    /// health checks and reports a clean error state to clients.
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let provider: Arc<dyn SessionProvider> = match settings.kind {
            SandboxProviderKind::Cmux => match settings.url.as_deref() {
                Some(url) => match CmuxProvider::new(url, settings.api_key.clone()) {
                    Ok(provider) => Arc::new(provider),
                    Err(error) => {
                        tracing::error!(?error, "failed to initialize cmux provider");
                        Arc::new(UnavailableProvider::new(error.to_string()))
                    }
                },
                None => {
                    tracing::error!("cmux provider selected without --provider-url");
                    Arc::new(UnavailableProvider::new("provider url is not set"))
                }
            },
            kind => {
                tracing::error!(provider = %kind, "no implementation for provider");
                Arc::new(UnavailableProvider::new(format!(
                    "provider '{kind}' has no implementation"
                )))
            }
        };
        Self::new(settings.kind, provider)
    }

    pub fn kind(&self) -> SandboxProviderKind {
        self.kind
    }

    pub fn resolve(&self, kind: SandboxProviderKind) -> ProviderResult<Arc<dyn SessionProvider>> {
        if kind != self.kind {
            return Err(ProviderError::Unsupported(kind));
        }
        Ok(Arc::clone(&self.provider))
    }
}

#[derive(Clone)]
pub struct UnavailableProvider {
    reason: String,
}

impl UnavailableProvider {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SessionProvider for UnavailableProvider {
    async fn resume(&self, _sandbox_id: &str) -> ProviderResult<Arc<dyn SandboxSession>> {
        Err(ProviderError::Misconfigured(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_rejects_other_kinds() {
        let registry = ProviderRegistry::new(
            SandboxProviderKind::Cmux,
            Arc::new(UnavailableProvider::new("test")),
        );
        assert!(registry.resolve(SandboxProviderKind::Cmux).is_ok());
        let error = registry.resolve(SandboxProviderKind::Daytona).err().unwrap();
        assert!(matches!(
            error,
            ProviderError::Unsupported(SandboxProviderKind::Daytona)
        ));
        assert!(error.is_configuration());
    }

    #[tokio::test]
    async fn missing_url_degrades_to_unavailable() {
        let registry = ProviderRegistry::from_settings(&ProviderSettings {
            kind: SandboxProviderKind::Cmux,
            url: None,
            api_key: None,
        });
        let provider = registry.resolve(SandboxProviderKind::Cmux).unwrap();
        let error = provider.resume("sbx").await.err().unwrap();
        assert!(matches!(error, ProviderError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn unimplemented_kind_degrades_to_unavailable() {
        let registry = ProviderRegistry::from_settings(&ProviderSettings {
            kind: SandboxProviderKind::E2b,
            url: Some("http://localhost:1".into()),
            api_key: None,
        });
        assert_eq!(registry.kind(), SandboxProviderKind::E2b);
        let provider = registry.resolve(SandboxProviderKind::E2b).unwrap();
        assert!(provider.resume("sbx").await.err().unwrap().is_configuration());
    }
}
