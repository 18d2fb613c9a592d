//! Process-wide "ready" notification.
//!
//! Batch mode waits here until a session has received both inputs. The
//! signal is armed when a listening cycle starts, set when a session reaches
//! ready, and cancelled on shutdown to release any waiter.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::session::ReceivedFiles;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ReadyState {
    #[default]
    Armed,
    Ready(ReceivedFiles),
    Cancelled,
}

#[derive(Clone, Debug, Default)]
pub struct ReadySignal {
    inner: Arc<(Mutex<ReadyState>, Condvar)>,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to armed for a new listening cycle. A cancelled signal stays cancelled.
    pub fn arm(&self) {
        let mut state = self.lock();
        if *state != ReadyState::Cancelled {
            *state = ReadyState::Armed;
        }
    }

    /// Mark ready and wake waiters. Returns false if the signal was not armed.
    pub fn notify(&self, files: ReceivedFiles) -> bool {
        let (_, cvar) = &*self.inner;
        let mut state = self.lock();
        if *state != ReadyState::Armed {
            return false;
        }
        *state = ReadyState::Ready(files);
        cvar.notify_all();
        true
    }

    pub fn cancel(&self) {
        let (_, cvar) = &*self.inner;
        *self.lock() = ReadyState::Cancelled;
        cvar.notify_all();
    }

    pub fn state(&self) -> ReadyState {
        self.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.lock(), ReadyState::Ready(_))
    }

    /// Block until ready (`Some`) or cancelled (`None`).
    pub fn wait(&self) -> Option<ReceivedFiles> {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let state = cvar
            .wait_while(guard, |state| *state == ReadyState::Armed)
            .unwrap_or_else(PoisonError::into_inner);
        match &*state {
            ReadyState::Ready(files) => Some(files.clone()),
            _ => None,
        }
    }

    /// Like `wait`, giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ReceivedFiles> {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *state == ReadyState::Armed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = cvar
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        match &*state {
            ReadyState::Ready(files) => Some(files.clone()),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReadyState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
