//! Provider backed by a cmux sandbox daemon.
//!
//! The daemon fronts each sandbox's PTY server under
//! `/sandboxes/{id}/pty/...`; output is streamed over the per-session attach
//! WebSocket while input and resizes go through plain HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::{CreatePtyRequest, PtyDataCallback, SandboxSession, SessionProvider};
use crate::errors::{ProviderError, ProviderResult};
use crate::models::PtySize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type AttachStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// HTTP client plus credentials for one daemon.
struct Endpoint {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl Endpoint {
    fn url(&self, segments: &[&str]) -> ProviderResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ProviderError::Misconfigured(format!(
                    "provider url '{}' cannot be used as a base",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> ProviderResult<RequestBuilder> {
        let url = self.url(segments)?;
        debug!(%method, %url, "provider request");
        let mut request = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        Ok(request)
    }

    async fn send(&self, request: RequestBuilder) -> ProviderResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn attach_request(
        &self,
        segments: &[&str],
    ) -> ProviderResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut url = self.url(segments)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| {
            ProviderError::Misconfigured(format!("cannot derive websocket url from '{url}'"))
        })?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| ProviderError::Misconfigured(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

pub struct CmuxProvider {
    endpoint: Arc<Endpoint>,
}

impl CmuxProvider {
    pub fn new(base_url: &str, api_key: Option<String>) -> ProviderResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            ProviderError::Misconfigured(format!("invalid provider url '{base_url}': {e}"))
        })?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Misconfigured(e.to_string()))?;

        Ok(Self {
            endpoint: Arc::new(Endpoint {
                client,
                base_url,
                api_key,
            }),
        })
    }
}

#[async_trait]
impl SessionProvider for CmuxProvider {
    async fn resume(&self, sandbox_id: &str) -> ProviderResult<Arc<dyn SandboxSession>> {
        let request = self
            .endpoint
            .request(Method::POST, &["sandboxes", sandbox_id, "resume"])?;
        match self.endpoint.send(request).await {
            Ok(_) => {}
            Err(ProviderError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                return Err(ProviderError::NotFound(sandbox_id.to_string()));
            }
            Err(error) => return Err(error),
        }

        info!(sandbox_id, "resumed sandbox");
        Ok(Arc::new(CmuxSession {
            sandbox_id: sandbox_id.to_string(),
            endpoint: Arc::clone(&self.endpoint),
            ptys: Mutex::new(HashMap::new()),
        }))
    }
}

struct PtyHandle {
    session_id: String,
    reader: JoinHandle<()>,
}

pub struct CmuxSession {
    sandbox_id: String,
    endpoint: Arc<Endpoint>,
    ptys: Mutex<HashMap<u32, PtyHandle>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtendTimeoutBody {
    timeout_ms: u64,
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    cols: u16,
    rows: u16,
    env: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct SessionInfo {
    id: String,
    pid: u32,
}

#[derive(Serialize)]
struct InputBody {
    data: String,
}

impl CmuxSession {
    fn session_id(&self, pid: u32) -> ProviderResult<String> {
        self.ptys
            .lock()
            .get(&pid)
            .map(|handle| handle.session_id.clone())
            .ok_or(ProviderError::PtyNotFound(pid))
    }

    async fn attach(&self, session_id: &str) -> ProviderResult<AttachStream> {
        let request = self.endpoint.attach_request(&[
            "sandboxes",
            &self.sandbox_id,
            "pty",
            "sessions",
            session_id,
            "attach",
        ])?;
        let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| ProviderError::Timeout(format!("attach to pty session {session_id}")))?
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(stream)
    }

    async fn delete_session(&self, session_id: &str) -> ProviderResult<()> {
        let request = self.endpoint.request(
            Method::DELETE,
            &["sandboxes", &self.sandbox_id, "pty", "sessions", session_id],
        )?;
        match self.endpoint.send(request).await {
            Ok(_) => Ok(()),
            // Already exited on the sandbox side.
            Err(ProviderError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl SandboxSession for CmuxSession {
    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    async fn extend_timeout(&self, duration: Duration) -> ProviderResult<()> {
        let body = ExtendTimeoutBody {
            timeout_ms: duration.as_millis() as u64,
        };
        let request = self
            .endpoint
            .request(Method::POST, &["sandboxes", &self.sandbox_id, "timeout"])?
            .json(&body);
        self.endpoint.send(request).await?;
        Ok(())
    }

    async fn create_pty(&self, request: CreatePtyRequest) -> ProviderResult<u32> {
        let CreatePtyRequest {
            size,
            envs,
            on_data,
        } = request;

        let body = CreateSessionBody {
            cols: size.cols,
            rows: size.rows,
            env: &envs,
        };
        let http = self
            .endpoint
            .request(
                Method::POST,
                &["sandboxes", &self.sandbox_id, "pty", "sessions"],
            )?
            .json(&body);
        let info: SessionInfo = self.endpoint.send(http).await?.json().await?;

        let stream = match self.attach(&info.id).await {
            Ok(stream) => stream,
            Err(error) => {
                if let Err(cleanup) = self.delete_session(&info.id).await {
                    warn!(
                        sandbox_id = %self.sandbox_id,
                        session_id = %info.id,
                        error = %cleanup,
                        "failed to delete unattached pty session"
                    );
                }
                return Err(error);
            }
        };

        let reader = tokio::spawn(forward_output(
            self.sandbox_id.clone(),
            info.pid,
            stream,
            on_data,
        ));
        self.ptys.lock().insert(
            info.pid,
            PtyHandle {
                session_id: info.id.clone(),
                reader,
            },
        );

        info!(
            sandbox_id = %self.sandbox_id,
            session_id = %info.id,
            pid = info.pid,
            cols = size.cols,
            rows = size.rows,
            "created pty"
        );
        Ok(info.pid)
    }

    async fn send_input(&self, pid: u32, data: &[u8]) -> ProviderResult<()> {
        let session_id = self.session_id(pid)?;
        let body = InputBody {
            data: String::from_utf8_lossy(data).into_owned(),
        };
        let request = self
            .endpoint
            .request(
                Method::POST,
                &["sandboxes", &self.sandbox_id, "pty", "sessions", &session_id, "input"],
            )?
            .json(&body);
        self.endpoint.send(request).await?;
        Ok(())
    }

    async fn resize(&self, pid: u32, size: PtySize) -> ProviderResult<()> {
        let session_id = self.session_id(pid)?;
        let request = self
            .endpoint
            .request(
                Method::POST,
                &["sandboxes", &self.sandbox_id, "pty", "sessions", &session_id, "resize"],
            )?
            .json(&size);
        self.endpoint.send(request).await?;
        Ok(())
    }

    async fn kill(&self, pid: u32) -> ProviderResult<()> {
        let handle = self
            .ptys
            .lock()
            .remove(&pid)
            .ok_or(ProviderError::PtyNotFound(pid))?;
        handle.reader.abort();
        self.delete_session(&handle.session_id).await?;
        info!(sandbox_id = %self.sandbox_id, pid, "killed pty");
        Ok(())
    }
}

impl Drop for CmuxSession {
    fn drop(&mut self) {
        for (_, handle) in self.ptys.get_mut().drain() {
            handle.reader.abort();
        }
    }
}

/// Pump attach-socket frames into the output callback until the socket
/// closes. Frames starting with NUL are control messages (e.g. exit
/// notifications) and are not terminal output.
async fn forward_output(
    sandbox_id: String,
    pid: u32,
    mut stream: AttachStream,
    mut on_data: PtyDataCallback,
) {
    let mut chunks = 0usize;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                if data.first() == Some(&0) {
                    debug!(%sandbox_id, pid, "skipping control frame");
                    continue;
                }
                chunks += 1;
                on_data(&data[..]);
            }
            Ok(Message::Text(text)) => {
                if text.starts_with('\0') {
                    debug!(%sandbox_id, pid, "skipping control frame");
                    continue;
                }
                chunks += 1;
                on_data(text.as_bytes());
            }
            Ok(Message::Close(reason)) => {
                debug!(%sandbox_id, pid, ?reason, "attach socket closed");
                break;
            }
            Ok(_) => continue,
            Err(error) => {
                warn!(%sandbox_id, pid, %error, "attach socket error");
                break;
            }
        }
    }
    info!(%sandbox_id, pid, chunks, "pty output stream finished");
}
