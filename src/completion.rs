//! Asynchronous completion signals.

use parking_lot::Mutex;
use std::sync::Arc;

type Callback = Box<dyn FnOnce() + Send>;

/// A one-shot completion signal.
///
/// Listeners return a `Completion` from delivery callbacks to report that
/// processing finishes later; the stream uses it to gate the deframer and to
/// suppress flow-control credit until the application catches up.
///
/// `complete` fires at most once. Callbacks registered after completion run
/// inline on the registering thread; callbacks registered before completion
/// run inline on the completing thread.
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    done: bool,
    callbacks: Vec<Callback>,
}

impl Completion {
    /// Create a pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the signal has resolved.
    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    /// Resolve the signal, running registered callbacks. Idempotent.
    pub fn complete(&self) {
        let callbacks = {
            let mut state = self.inner.lock();
            if state.done {
                return;
            }
            state.done = true;
            std::mem::take(&mut state.callbacks)
        };
        // Callbacks run outside the lock so they may register further
        // callbacks or re-inspect the signal.
        for callback in callbacks {
            callback();
        }
    }

    /// Register a callback to run when the signal resolves.
    pub fn on_complete(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.lock();
            if !state.done {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_starts_pending() {
        let signal = Completion::new();
        assert!(!signal.is_done());
    }

    #[test]
    fn test_complete_fires_callback() {
        let signal = Completion::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        signal.on_complete(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        signal.complete();
        assert!(signal.is_done());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_after_completion_runs_inline() {
        let signal = Completion::new();
        signal.complete();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        signal.on_complete(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_is_idempotent() {
        let signal = Completion::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        signal.on_complete(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        signal.complete();
        signal.complete();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let signal = Completion::new();
        let clone = signal.clone();
        signal.complete();
        assert!(clone.is_done());
    }
}
