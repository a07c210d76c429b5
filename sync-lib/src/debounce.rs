use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Trailing-edge debouncer: calls within a window are collapsed into a single
/// emission of the latest value at the end of the window.
///
/// Cheap to clone; clones share the window state.
pub struct Debouncer<T> {
    inner: Arc<Inner<T>>,
}

/// Latest value and whether a window timer is currently running. Kept behind
/// one mutex so arming a window and draining it at expiry are both single
/// critical sections; a call landing during expiry either hands its value to
/// the expiring timer or owns a fresh window, never both.
struct WindowState<T> {
    pending: Option<T>,
    armed: bool,
}

struct Inner<T> {
    window: Duration,
    state: Mutex<WindowState<T>>,
    emit: Box<dyn Fn(T) + Send + Sync>,
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(window: Duration, emit: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                window,
                state: Mutex::new(WindowState {
                    pending: None,
                    armed: false,
                }),
                emit: Box::new(emit),
            }),
        }
    }

    /// Record `value` as the latest candidate and arm the window timer if it
    /// is not already running. Must be called from within a tokio runtime.
    pub fn call(&self, value: T) {
        {
            let mut state = self.inner.state.lock();
            state.pending = Some(value);
            if state.armed {
                return;
            }
            state.armed = true;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            let expired = {
                let mut state = inner.state.lock();
                state.armed = false;
                state.pending.take()
            };
            if let Some(value) = expired {
                (inner.emit)(value);
            }
        });
    }
}
