//! Per-connection records and the store that indexes them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::RelayConfig;
use crate::debounce::Debouncer;
use crate::models::{ServerMessage, TerminalState};
use crate::provider::SandboxSession;

pub type ConnectionId = Uuid;

/// Ordered queue of messages headed to one client. State updates and PTY
/// output share the queue so the client sees them in emission order.
///
/// The queue is bounded. A client that stops reading fills it, and the first
/// message that does not fit cancels `closed`; nothing is queued after that,
/// so the client never sees a gap in the stream.
#[derive(Clone)]
pub struct Outbound {
    sandbox_id: Arc<str>,
    tx: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
    view: Arc<Mutex<ClientView>>,
}

/// What the client has been told: the last published state and the PTY
/// whose output it is receiving.
#[derive(Default)]
struct ClientView {
    state: TerminalState,
    live_pty: Option<u32>,
}

impl ClientView {
    fn forwards(&self, source: Option<u32>) -> bool {
        source.map_or(true, |pid| self.live_pty == Some(pid))
    }
}

impl Outbound {
    pub fn new(
        sandbox_id: &str,
        tx: mpsc::Sender<ServerMessage>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            sandbox_id: Arc::from(sandbox_id),
            tx,
            closed,
            view: Arc::new(Mutex::new(ClientView::default())),
        }
    }

    pub fn publish_state(&self, state: TerminalState) {
        let mut view = self.view.lock();
        view.state = state.clone();
        self.enqueue(ServerMessage::state(&self.sandbox_id, state));
    }

    /// Forward output read from `source`. Output from a PTY other than the
    /// live one is dropped; `None` means the producer's pid is not known yet.
    pub fn send_pty_data(&self, source: Option<u32>, data: String) -> bool {
        let view = self.view.lock();
        if !view.forwards(source) {
            return false;
        }
        self.enqueue(ServerMessage::pty_data(
            &self.sandbox_id,
            view.state.clone(),
            data,
        ))
    }

    /// Whether output from `source` would currently reach the client.
    pub fn accepts(&self, source: Option<u32>) -> bool {
        self.view.lock().forwards(source)
    }

    pub fn set_live_pty(&self, pid: Option<u32>) {
        self.view.lock().live_pty = pid;
    }

    pub fn current_state(&self) -> TerminalState {
        self.view.lock().state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn enqueue(&self, message: ServerMessage) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(sandbox_id = %self.sandbox_id, "client is not reading; closing terminal");
                self.closed.cancel();
                false
            }
            // A closed receiver means the socket is gone; teardown follows.
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.cancel();
                false
            }
        }
    }
}

/// Everything one terminal connection owns. Only that connection's handler
/// touches it; sessions and PTYs are never shared between connections.
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub channel: Channel,
    /// Bearer token forwarded from the upgrade request.
    pub token: Option<String>,
    pub sandbox: Option<Arc<dyn SandboxSession>>,
    pty_pid: Option<u32>,
    pub pty_cols: u16,
    pub pty_rows: u16,
    state: TerminalState,
    outbound: Outbound,
    pub mark_active: Debouncer,
    pub extend_timeout: Debouncer,
}

impl ConnectionInfo {
    pub fn new(
        id: ConnectionId,
        channel: Channel,
        token: Option<String>,
        outbound: Outbound,
        config: &RelayConfig,
    ) -> Self {
        Self {
            id,
            channel,
            token,
            sandbox: None,
            pty_pid: None,
            pty_cols: crate::DEFAULT_COLS,
            pty_rows: crate::DEFAULT_ROWS,
            state: TerminalState::default(),
            outbound,
            mark_active: Debouncer::new("mark-active", config.keepalive_window),
            extend_timeout: Debouncer::new("extend-timeout", config.keepalive_window),
        }
    }

    pub fn state(&self) -> &TerminalState {
        &self.state
    }

    /// Every mutation is echoed to the client.
    pub fn set_state(&mut self, state: TerminalState) {
        self.state = state.clone();
        self.outbound.publish_state(state);
    }

    pub fn pty_pid(&self) -> Option<u32> {
        self.pty_pid
    }

    /// Record the PTY this connection drives. Output from any other PTY is
    /// no longer forwarded.
    pub fn set_pty(&mut self, pid: Option<u32>) {
        self.pty_pid = pid;
        self.outbound.set_live_pty(pid);
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }
}

pub type SharedConnection = Arc<tokio::sync::Mutex<ConnectionInfo>>;

#[derive(Clone, Default)]
pub struct ConnectionStore {
    connections: Arc<RwLock<HashMap<ConnectionId, SharedConnection>>>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ConnectionInfo) -> SharedConnection {
        let id = info.id;
        let shared = Arc::new(tokio::sync::Mutex::new(info));
        self.connections.write().insert(id, Arc::clone(&shared));
        shared
    }

    pub fn get(&self, id: &ConnectionId) -> Option<SharedConnection> {
        self.connections.read().get(id).cloned()
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<SharedConnection> {
        self.connections.write().remove(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TerminalStatus;

    fn channel() -> Channel {
        Channel::parse("sandbox:cmux:sbx-1:thread-1").unwrap()
    }

    #[tokio::test]
    async fn set_state_is_echoed_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let outbound = Outbound::new("sbx-1", tx, CancellationToken::new());
        let mut info = ConnectionInfo::new(
            Uuid::new_v4(),
            channel(),
            None,
            outbound.clone(),
            &RelayConfig::default(),
        );

        info.set_state(TerminalState::new(TerminalStatus::Initializing));
        outbound.send_pty_data(None, "hello".into());
        info.set_state(TerminalState::connected(Some(3)));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.state.status, TerminalStatus::Initializing);
        assert_eq!(first.pty_data, None);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.state.status, TerminalStatus::Initializing);
        assert_eq!(second.pty_data.as_deref(), Some("hello"));

        let third = rx.recv().await.unwrap();
        assert_eq!(third.state, TerminalState::connected(Some(3)));
        assert_eq!(outbound.current_state(), TerminalState::connected(Some(3)));
    }

    #[tokio::test]
    async fn store_tracks_connections() {
        let store = ConnectionStore::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = Uuid::new_v4();
        store.insert(ConnectionInfo::new(
            id,
            channel(),
            None,
            Outbound::new("sbx-1", tx, CancellationToken::new()),
            &RelayConfig::default(),
        ));

        assert!(store.contains(&id));
        assert_eq!(store.len(), 1);
        assert!(store.remove(&id).is_some());
        assert!(store.remove(&id).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn stalled_client_closes_the_connection() {
        let (tx, mut rx) = mpsc::channel(2);
        let closed = CancellationToken::new();
        let outbound = Outbound::new("sbx-1", tx, closed.clone());

        assert!(outbound.send_pty_data(None, "a".into()));
        assert!(outbound.send_pty_data(None, "b".into()));
        assert!(!closed.is_cancelled());

        assert!(!outbound.send_pty_data(None, "c".into()));
        assert!(closed.is_cancelled());
        assert!(outbound.is_closed());

        // Room frees up, but the stream already has a hole in it.
        assert_eq!(rx.recv().await.unwrap().pty_data.as_deref(), Some("a"));
        assert!(!outbound.send_pty_data(None, "d".into()));
        outbound.publish_state(TerminalState::new(TerminalStatus::Connected));

        assert_eq!(rx.recv().await.unwrap().pty_data.as_deref(), Some("b"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_closes_the_connection() {
        let (tx, rx) = mpsc::channel(2);
        let closed = CancellationToken::new();
        let outbound = Outbound::new("sbx-1", tx, closed.clone());
        drop(rx);

        outbound.publish_state(TerminalState::new(TerminalStatus::Initializing));
        assert!(closed.is_cancelled());
    }

    #[tokio::test]
    async fn output_from_other_ptys_is_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let outbound = Outbound::new("sbx-1", tx, CancellationToken::new());
        let mut info = ConnectionInfo::new(
            Uuid::new_v4(),
            channel(),
            None,
            outbound.clone(),
            &RelayConfig::default(),
        );

        info.set_pty(Some(101));
        assert!(outbound.send_pty_data(Some(101), "old".into()));
        info.set_pty(Some(102));
        assert!(!outbound.send_pty_data(Some(101), "stale".into()));
        assert!(outbound.send_pty_data(Some(102), "new".into()));
        assert!(outbound.send_pty_data(None, "early".into()));

        let forwarded: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|message| message.pty_data)
            .collect();
        assert_eq!(forwarded, vec!["old", "new", "early"]);
    }
}
