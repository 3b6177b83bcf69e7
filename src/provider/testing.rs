//! In-process provider and thread API doubles that record every call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CreatePtyRequest, PtyDataCallback, SandboxSession, SessionProvider};
use crate::errors::{ProviderError, ProviderResult, RelayError, RelayResult};
use crate::models::{PtySize, ThreadTarget};
use crate::thread_api::ThreadApi;

#[derive(Default)]
pub(crate) struct MockCalls {
    pub resumes: usize,
    pub create_ptys: Vec<PtySize>,
    pub envs: Vec<HashMap<String, String>>,
    pub inputs: Vec<(u32, Vec<u8>)>,
    pub resizes: Vec<(u32, PtySize)>,
    pub kills: Vec<u32>,
    pub extends: Vec<Duration>,
}

/// Scripted failures. Queued errors are consumed one per call.
#[derive(Default)]
pub(crate) struct MockScript {
    pub resume_errors: VecDeque<ProviderError>,
    pub create_pty_errors: VecDeque<ProviderError>,
    pub fail_inputs: bool,
    pub fail_kills: bool,
}

#[derive(Default)]
struct MockInner {
    calls: Mutex<MockCalls>,
    script: Mutex<MockScript>,
    outputs: Mutex<HashMap<u32, PtyDataCallback>>,
    next_pid: Mutex<u32>,
}

#[derive(Clone, Default)]
pub(crate) struct MockProvider {
    inner: Arc<MockInner>,
}

impl MockProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        *provider.inner.next_pid.lock() = 100;
        provider
    }

    pub fn calls(&self) -> parking_lot::MutexGuard<'_, MockCalls> {
        self.inner.calls.lock()
    }

    pub fn script(&self) -> parking_lot::MutexGuard<'_, MockScript> {
        self.inner.script.lock()
    }

    /// Push a chunk through the output callback registered for `pid`.
    pub fn emit(&self, pid: u32, data: &[u8]) {
        if let Some(callback) = self.inner.outputs.lock().get_mut(&pid) {
            callback(data);
        }
    }
}

#[async_trait]
impl SessionProvider for MockProvider {
    async fn resume(&self, sandbox_id: &str) -> ProviderResult<Arc<dyn SandboxSession>> {
        self.inner.calls.lock().resumes += 1;
        if let Some(error) = self.inner.script.lock().resume_errors.pop_front() {
            return Err(error);
        }
        Ok(Arc::new(MockSession {
            sandbox_id: sandbox_id.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockSession {
    sandbox_id: String,
    inner: Arc<MockInner>,
}

#[async_trait]
impl SandboxSession for MockSession {
    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    async fn extend_timeout(&self, duration: Duration) -> ProviderResult<()> {
        self.inner.calls.lock().extends.push(duration);
        Ok(())
    }

    async fn create_pty(&self, request: CreatePtyRequest) -> ProviderResult<u32> {
        {
            let mut calls = self.inner.calls.lock();
            calls.create_ptys.push(request.size);
            calls.envs.push(request.envs.clone());
        }
        if let Some(error) = self.inner.script.lock().create_pty_errors.pop_front() {
            return Err(error);
        }
        let pid = {
            let mut next = self.inner.next_pid.lock();
            *next += 1;
            *next
        };
        self.inner.outputs.lock().insert(pid, request.on_data);
        Ok(pid)
    }

    async fn send_input(&self, pid: u32, data: &[u8]) -> ProviderResult<()> {
        self.inner.calls.lock().inputs.push((pid, data.to_vec()));
        if self.inner.script.lock().fail_inputs {
            return Err(ProviderError::Transport("input rejected".into()));
        }
        Ok(())
    }

    async fn resize(&self, pid: u32, size: PtySize) -> ProviderResult<()> {
        self.inner.calls.lock().resizes.push((pid, size));
        Ok(())
    }

    async fn kill(&self, pid: u32) -> ProviderResult<()> {
        self.inner.calls.lock().kills.push(pid);
        // A rejected kill leaves the PTY, and its output, running.
        if self.inner.script.lock().fail_kills {
            return Err(ProviderError::Transport("kill rejected".into()));
        }
        self.inner.outputs.lock().remove(&pid);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockThreadApi {
    pub keepalives: Arc<Mutex<Vec<(ThreadTarget, Option<String>)>>>,
    pub env_requests: Arc<Mutex<Vec<ThreadTarget>>>,
    pub envs: Arc<Mutex<HashMap<String, String>>>,
    pub fail_env: Arc<Mutex<bool>>,
}

#[async_trait]
impl ThreadApi for MockThreadApi {
    async fn mark_active(&self, target: &ThreadTarget, token: Option<&str>) -> RelayResult<()> {
        self.keepalives
            .lock()
            .push((target.clone(), token.map(str::to_string)));
        Ok(())
    }

    async fn environment_variables(
        &self,
        target: &ThreadTarget,
        _token: Option<&str>,
    ) -> RelayResult<HashMap<String, String>> {
        self.env_requests.lock().push(target.clone());
        if *self.fail_env.lock() {
            return Err(RelayError::ThreadApi("status 500".into()));
        }
        Ok(self.envs.lock().clone())
    }
}
