//! Leading + trailing edge debouncing for per-connection side effects.
//!
//! The first trigger runs immediately and opens a window. Triggers that land
//! inside the window only replace the pending action; when the window closes
//! the most recent pending action runs and a new window opens. A window that
//! closes with nothing pending leaves the debouncer idle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

struct Inner {
    name: &'static str,
    window: Duration,
    state: Mutex<DebounceState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct DebounceState {
    window_open: bool,
    pending: Option<BoxFuture<'static, ()>>,
}

impl Debouncer {
    pub fn new(name: &'static str, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                window,
                state: Mutex::new(DebounceState::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Schedule `action`. It runs now if no window is open, otherwise it
    /// becomes the trailing call for the current window. The action is
    /// responsible for logging its own failures.
    pub fn trigger<F>(&self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return;
        }

        {
            let mut state = self.inner.state.lock();
            if state.window_open {
                state.pending = Some(Box::pin(action));
                return;
            }
            state.window_open = true;
        }

        debug!(debouncer = self.inner.name, "leading edge");
        tokio::spawn(action);
        self.spawn_window();
    }

    /// Drop any pending trailing call and stop the window timer.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.lock();
        state.pending = None;
        state.window_open = false;
    }

    pub fn is_idle(&self) -> bool {
        !self.inner.state.lock().window_open
    }

    fn spawn_window(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(inner.window) => {}
                }

                let pending = {
                    let mut state = inner.state.lock();
                    match state.pending.take() {
                        Some(action) => action,
                        None => {
                            state.window_open = false;
                            return;
                        }
                    }
                };

                debug!(debouncer = inner.name, "trailing edge");
                tokio::spawn(pending);
            }
        });
    }
}
