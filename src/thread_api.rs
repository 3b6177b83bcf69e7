//! Calls into the product backend that owns threads and their sandboxes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::errors::{RelayError, RelayResult};
use crate::models::{EnvironmentVariablesResponse, ThreadTarget};

const KEEPALIVE_PATH: &str = "api/sandbox/keepalive";
const ENVIRONMENT_PATH: &str = "api/sandbox/env";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ThreadApi: Send + Sync + 'static {
    /// Tell the backend the sandbox behind this thread is in active use.
    async fn mark_active(&self, target: &ThreadTarget, token: Option<&str>) -> RelayResult<()>;

    /// Environment variables to inject into a new PTY.
    async fn environment_variables(
        &self,
        target: &ThreadTarget,
        token: Option<&str>,
    ) -> RelayResult<HashMap<String, String>>;
}

pub struct HttpThreadApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpThreadApi {
    pub fn new(base_url: &str) -> RelayResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| RelayError::ThreadApi(format!("invalid thread api url: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, base_url })
    }

    fn post(&self, path: &str, target: &ThreadTarget, token: Option<&str>) -> RelayResult<reqwest::RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| RelayError::ThreadApi(e.to_string()))?;
        debug!(%url, sandbox_id = %target.sandbox_id, "thread api request");
        let mut request = self.client.post(url).json(target);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }
}

#[async_trait]
impl ThreadApi for HttpThreadApi {
    async fn mark_active(&self, target: &ThreadTarget, token: Option<&str>) -> RelayResult<()> {
        let response = self.post(KEEPALIVE_PATH, target, token)?.send().await?;
        if !response.status().is_success() {
            return Err(RelayError::ThreadApi(format!(
                "keepalive returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn environment_variables(
        &self,
        target: &ThreadTarget,
        token: Option<&str>,
    ) -> RelayResult<HashMap<String, String>> {
        let response = self.post(ENVIRONMENT_PATH, target, token)?.send().await?;
        if response.status() != StatusCode::OK {
            return Err(RelayError::ThreadApi(format!(
                "environment variables returned {}",
                response.status()
            )));
        }
        let body: EnvironmentVariablesResponse = response.json().await?;
        Ok(body.environment_variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    type Seen = Arc<Mutex<Vec<(String, Option<String>, ThreadTarget)>>>;

    async fn spawn_backend(env_status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let keepalive_seen = Arc::clone(&seen);
        let env_seen = Arc::clone(&seen);

        let app = Router::new()
            .route(
                "/base/api/sandbox/keepalive",
                post(move |headers: HeaderMap, Json(target): Json<ThreadTarget>| async move {
                    keepalive_seen
                        .lock()
                        .push(("keepalive".into(), bearer(&headers), target));
                    StatusCode::NO_CONTENT
                }),
            )
            .route(
                "/base/api/sandbox/env",
                post(move |headers: HeaderMap, Json(target): Json<ThreadTarget>| async move {
                    env_seen.lock().push(("env".into(), bearer(&headers), target));
                    (
                        env_status,
                        Json(json!({ "environmentVariables": { "GITHUB_TOKEN": "gh-123" } })),
                    )
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/base"), seen)
    }

    fn bearer(headers: &HeaderMap) -> Option<String> {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn target() -> ThreadTarget {
        ThreadTarget {
            sandbox_id: "sbx-1".into(),
            thread_id: "thread-1".into(),
        }
    }

    #[tokio::test]
    async fn keepalive_forwards_token_and_body() {
        let (base, seen) = spawn_backend(StatusCode::OK).await;
        let api = HttpThreadApi::new(&base).unwrap();

        api.mark_active(&target(), Some("user-token")).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "keepalive");
        assert_eq!(seen[0].1.as_deref(), Some("Bearer user-token"));
        assert_eq!(seen[0].2, target());
    }

    #[tokio::test]
    async fn environment_variables_parses_map() {
        let (base, _seen) = spawn_backend(StatusCode::OK).await;
        let api = HttpThreadApi::new(&base).unwrap();

        let envs = api.environment_variables(&target(), None).await.unwrap();
        assert_eq!(envs.get("GITHUB_TOKEN").map(String::as_str), Some("gh-123"));
    }

    #[tokio::test]
    async fn environment_variables_requires_ok_status() {
        let (base, _seen) = spawn_backend(StatusCode::ACCEPTED).await;
        let api = HttpThreadApi::new(&base).unwrap();

        let error = api.environment_variables(&target(), None).await.unwrap_err();
        assert!(matches!(error, RelayError::ThreadApi(_)));
    }
}
