//! Server state and the shutdown signal observed by background workers.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Coarse server state checked at the start of every operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Serving reads and writes.
    Normal,
    /// Refusing non-replication writes.
    ReadOnly,
    /// Shutting down; refusing everything.
    Shutdown,
}

impl ServerState {
    fn as_u8(self) -> u8 {
        match self {
            ServerState::Normal => 0,
            ServerState::ReadOnly => 1,
            ServerState::Shutdown => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServerState::Normal,
            1 => ServerState::ReadOnly,
            _ => ServerState::Shutdown,
        }
    }
}

/// Atomic holder of a [`ServerState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Creates a cell in the given state.
    pub fn new(state: ServerState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    /// Current state.
    pub fn get(&self) -> ServerState {
        ServerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves to `state`. Shutdown is terminal.
    pub fn set(&self, state: ServerState) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                if cur == ServerState::Shutdown.as_u8() {
                    None
                } else {
                    Some(state.as_u8())
                }
            });
    }
}

/// A cooperative shutdown signal backed by `Condvar` so that waiters wake
/// as soon as shutdown is requested.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    /// Create a new signal in the non-shutdown state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Signal shutdown. Wakes all waiters immediately.
    pub fn shutdown(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Check if shutdown has been requested (non-blocking).
    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on shutdown. Returns true
    /// if shutdown was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _timeout) = self
            .inner
            .condvar
            .wait_timeout(guard, duration)
            .unwrap_or_else(|e| e.into_inner());
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new(ServerState::Normal);
        cell.set(ServerState::ReadOnly);
        assert_eq!(cell.get(), ServerState::ReadOnly);
        cell.set(ServerState::Shutdown);
        cell.set(ServerState::Normal);
        assert_eq!(cell.get(), ServerState::Shutdown);
    }

    #[test]
    fn test_wait_timeout_wakes_on_shutdown() {
        let sig = ShutdownSignal::new();
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            let result = sig2.wait_timeout(Duration::from_secs(10));
            (result, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.shutdown();
        let (result, elapsed) = handle.join().unwrap();
        assert!(result);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_timeout_expires_normally() {
        let sig = ShutdownSignal::new();
        assert!(!sig.wait_timeout(Duration::from_millis(10)));
        assert!(!sig.is_shutdown());
    }
}
