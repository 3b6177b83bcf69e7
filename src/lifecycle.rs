//! Per-connection terminal lifecycle: sandbox session and PTY acquisition,
//! guarded PTY actions with a single reconnecting retry, keepalive triggers
//! and teardown.

use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::RelayConfig;
use crate::connection::{ConnectionId, ConnectionInfo, ConnectionStore, Outbound, SharedConnection};
use crate::errors::{RelayError, RelayResult, CONNECT_FAILED_MESSAGE, TIMED_OUT_MESSAGE};
use crate::models::{ClientMessage, PtySize, TerminalState, TerminalStatus, ThreadTarget};
use crate::provider::{CreatePtyRequest, ProviderRegistry, PtyDataCallback, SandboxSession};
use crate::thread_api::ThreadApi;

/// A guarded action gets one retry after its handles are discarded.
const GUARDED_ACTION_ATTEMPTS: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PtyAction {
    Input(Vec<u8>),
    Resize(PtySize),
}

#[derive(Clone)]
pub struct LifecycleController {
    providers: ProviderRegistry,
    thread_api: Arc<dyn ThreadApi>,
    config: RelayConfig,
}

impl LifecycleController {
    pub fn new(
        providers: ProviderRegistry,
        thread_api: Arc<dyn ThreadApi>,
        config: RelayConfig,
    ) -> Self {
        Self {
            providers,
            thread_api,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register a new connection and announce it as initializing.
    pub fn open_connection(
        &self,
        store: &ConnectionStore,
        channel: Channel,
        token: Option<String>,
        outbound: Outbound,
    ) -> (ConnectionId, SharedConnection) {
        let id = Uuid::new_v4();
        let mut info = ConnectionInfo::new(id, channel, token, outbound, &self.config);
        info.set_state(TerminalState::new(TerminalStatus::Initializing));
        (id, store.insert(info))
    }

    /// Kill the PTY if there is one and forget the connection. Safe to call
    /// more than once and on connections that never got a sandbox.
    pub async fn close_connection(&self, store: &ConnectionStore, id: ConnectionId) {
        let Some(connection) = store.get(&id) else {
            return;
        };
        {
            let mut info = connection.lock().await;
            info.mark_active.cancel();
            info.extend_timeout.cancel();

            let sandbox = info.sandbox.take();
            let pty = info.pty_pid();
            info.set_pty(None);
            if let (Some(session), Some(pid)) = (sandbox, pty) {
                match session.kill(pid).await {
                    Ok(()) => debug!(connection_id = %id, pid, "killed pty on close"),
                    Err(error) => warn!(
                        connection_id = %id,
                        sandbox_id = %info.channel.sandbox_id,
                        pid,
                        %error,
                        "failed to kill pty on close"
                    ),
                }
            }
        }
        store.remove(&id);
    }

    /// Dispatch one validated client message. Errors end up in the
    /// connection state, never in the caller.
    pub async fn handle_message(&self, info: &mut ConnectionInfo, message: ClientMessage) {
        let kind = message.kind();
        let result = match message {
            ClientMessage::PtyConnect { cols, rows, .. } => self
                .ensure_pty(info, PtySize::or_default(cols, rows))
                .await
                .map(|_| ()),
            ClientMessage::PtyInput { pid, input, .. } => {
                self.guarded_action(info, pid, PtyAction::Input(input.into_bytes()))
                    .await
            }
            ClientMessage::PtyResize {
                pid, cols, rows, ..
            } => match PtySize::explicit(cols, rows) {
                Some(size) => self.guarded_action(info, pid, PtyAction::Resize(size)).await,
                None => Ok(()),
            },
        };

        if let Err(error) = result {
            error!(
                connection_id = %info.id,
                sandbox_id = %info.channel.sandbox_id,
                kind,
                %error,
                "terminal message failed"
            );
            info.set_state(TerminalState::error(error.user_message()));
        }
    }

    /// Return the connection's session, resuming one if it has none.
    pub async fn ensure_session(
        &self,
        info: &mut ConnectionInfo,
    ) -> RelayResult<Arc<dyn SandboxSession>> {
        if let Some(session) = &info.sandbox {
            return Ok(Arc::clone(session));
        }

        let next = if info.state().status == TerminalStatus::Initializing {
            TerminalStatus::Connecting
        } else {
            TerminalStatus::Reconnecting
        };
        info.set_state(TerminalState::new(next));
        self.trigger_mark_active(info);

        let provider = self.providers.resolve(info.channel.sandbox_provider)?;
        let session = match provider.resume(&info.channel.sandbox_id).await {
            Ok(session) => session,
            Err(error) if error.is_configuration() => return Err(error.into()),
            Err(error) => {
                error!(
                    connection_id = %info.id,
                    sandbox_id = %info.channel.sandbox_id,
                    provider = %info.channel.sandbox_provider,
                    %error,
                    "failed to resume sandbox"
                );
                return Err(RelayError::user_facing(CONNECT_FAILED_MESSAGE));
            }
        };

        info.sandbox = Some(Arc::clone(&session));
        info.set_state(TerminalState::connected(info.pty_pid()));
        self.trigger_extend_timeout(info, &session);
        Ok(session)
    }

    /// Return the connection's PTY pid, creating the PTY if there is none.
    pub async fn ensure_pty(&self, info: &mut ConnectionInfo, size: PtySize) -> RelayResult<u32> {
        if let Some(pid) = info.pty_pid() {
            return Ok(pid);
        }

        let session = self.ensure_session(info).await?;
        let envs = self
            .thread_api
            .environment_variables(&info.channel.thread_target(), info.token.as_deref())
            .await?;
        let source = Arc::new(OnceLock::new());
        let on_data = self.output_callback(info, &session, Arc::clone(&source));
        let pid = session
            .create_pty(CreatePtyRequest {
                size,
                envs,
                on_data,
            })
            .await?;

        let _ = source.set(pid);
        info.set_pty(Some(pid));
        info.pty_cols = size.cols;
        info.pty_rows = size.rows;
        info.set_state(TerminalState::connected(Some(pid)));
        info!(
            connection_id = %info.id,
            sandbox_id = %info.channel.sandbox_id,
            pid,
            cols = size.cols,
            rows = size.rows,
            "pty ready"
        );
        Ok(pid)
    }

    /// Run `action` against `pid`, reconnecting once if it fails.
    pub async fn guarded_action(
        &self,
        info: &mut ConnectionInfo,
        pid: u32,
        action: PtyAction,
    ) -> RelayResult<()> {
        if info.state().status != TerminalStatus::Connected {
            debug!(
                connection_id = %info.id,
                status = ?info.state().status,
                "dropping pty action while not connected"
            );
            return Ok(());
        }

        let mut attempt = 1;
        loop {
            let error = match self.try_action(info, pid, &action).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            warn!(
                connection_id = %info.id,
                sandbox_id = %info.channel.sandbox_id,
                pid,
                attempt,
                %error,
                "pty action failed"
            );
            if error.is_timeout() {
                info.set_state(TerminalState::error(TIMED_OUT_MESSAGE));
            }
            self.discard_pty(info).await;

            if error.is_configuration() || attempt >= GUARDED_ACTION_ATTEMPTS {
                return Err(error);
            }
            attempt += 1;
        }
    }

    /// Forget the session and PTY after a failed action. The PTY is killed on
    /// a best-effort basis so it does not outlive the connection's interest.
    async fn discard_pty(&self, info: &mut ConnectionInfo) {
        let sandbox = info.sandbox.take();
        let pty = info.pty_pid();
        info.set_pty(None);
        let (Some(session), Some(pid)) = (sandbox, pty) else {
            return;
        };
        if let Err(error) = session.kill(pid).await {
            warn!(
                connection_id = %info.id,
                sandbox_id = %info.channel.sandbox_id,
                pid,
                %error,
                "failed to kill replaced pty"
            );
        }
    }

    async fn try_action(
        &self,
        info: &mut ConnectionInfo,
        pid: u32,
        action: &PtyAction,
    ) -> RelayResult<()> {
        let session = self.ensure_session(info).await?;
        let size = PtySize {
            cols: info.pty_cols,
            rows: info.pty_rows,
        };
        let current = self.ensure_pty(info, size).await?;
        if current != pid {
            debug!(
                connection_id = %info.id,
                target = pid,
                current,
                "dropping action for replaced pty"
            );
            return Ok(());
        }

        match action {
            PtyAction::Input(data) => session.send_input(pid, data).await?,
            PtyAction::Resize(size) => {
                session.resize(pid, *size).await?;
                info.pty_cols = size.cols;
                info.pty_rows = size.rows;
            }
        }

        self.trigger_mark_active(info);
        self.trigger_extend_timeout(info, &session);
        Ok(())
    }

    fn trigger_mark_active(&self, info: &ConnectionInfo) {
        info.mark_active.trigger(mark_active(
            Arc::clone(&self.thread_api),
            info.channel.thread_target(),
            info.token.clone(),
        ));
    }

    fn trigger_extend_timeout(&self, info: &ConnectionInfo, session: &Arc<dyn SandboxSession>) {
        info.extend_timeout
            .trigger(extend_timeout(Arc::clone(session), self.config.extend_timeout));
    }

    /// Output sink for a new PTY. Holds the session weakly: the session owns
    /// the output stream that owns this callback. `source` is filled with the
    /// PTY's pid once it is known; after that, output is forwarded only while
    /// that PTY is the connection's live one.
    fn output_callback(
        &self,
        info: &ConnectionInfo,
        session: &Arc<dyn SandboxSession>,
        source: Arc<OnceLock<u32>>,
    ) -> PtyDataCallback {
        let outbound = info.outbound().clone();
        let mark_active_debouncer = info.mark_active.clone();
        let extend_debouncer = info.extend_timeout.clone();
        let thread_api = Arc::clone(&self.thread_api);
        let target = info.channel.thread_target();
        let token = info.token.clone();
        let session: Weak<dyn SandboxSession> = Arc::downgrade(session);
        let extend_for = self.config.extend_timeout;
        let mut decoder = Utf8Decoder::default();

        Box::new(move |bytes: &[u8]| {
            let pid = source.get().copied();
            if !outbound.accepts(pid) {
                return;
            }
            let text = decoder.decode(bytes);
            if !text.is_empty() {
                outbound.send_pty_data(pid, text);
            }

            mark_active_debouncer.trigger(mark_active(
                Arc::clone(&thread_api),
                target.clone(),
                token.clone(),
            ));
            if let Some(session) = session.upgrade() {
                extend_debouncer.trigger(extend_timeout(session, extend_for));
            }
        })
    }
}

fn mark_active(
    thread_api: Arc<dyn ThreadApi>,
    target: ThreadTarget,
    token: Option<String>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if let Err(error) = thread_api.mark_active(&target, token.as_deref()).await {
            warn!(sandbox_id = %target.sandbox_id, %error, "failed to mark sandbox active");
        }
    }
}

fn extend_timeout(
    session: Arc<dyn SandboxSession>,
    duration: Duration,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if let Err(error) = session.extend_timeout(duration).await {
            warn!(sandbox_id = %session.sandbox_id(), %error, "failed to extend sandbox timeout");
        }
    }
}

/// Turns a byte stream into text without splitting multi-byte characters
/// across chunks. An incomplete sequence at the end of a chunk is held back
/// until the next one arrives.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let end = complete_prefix_len(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..end]).into_owned();
        self.pending.drain(..end);
        text
    }
}

/// Length of the prefix of `bytes` that does not end in a truncated UTF-8
/// sequence.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let index = len - back;
        let byte = bytes[index];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if back < width { index } else { len };
    }
    len
}
