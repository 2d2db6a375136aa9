//! Cooperative cancellation and out-of-band progress signals
//!
//! Interactive actions receive an [`ActionContext`]. They check its
//! [`CancelToken`] at every round boundary and push progress through its
//! [`SignalSink`] while the action itself is still running.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::node::Data;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token for the next request
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Receiver of intermediate signals emitted by a running action
pub trait SignalSink: Send + Sync {
    fn signal(&self, name: &str, body: Data);
}

impl<F> SignalSink for F
where
    F: Fn(&str, Data) + Send + Sync,
{
    fn signal(&self, name: &str, body: Data) {
        self(name, body)
    }
}

/// Per-request handles passed down to every action
#[derive(Clone)]
pub struct ActionContext {
    pub cancel: CancelToken,
    pub signals: Arc<dyn SignalSink>,
}

impl ActionContext {
    pub fn new(cancel: CancelToken, signals: Arc<dyn SignalSink>) -> Self {
        Self { cancel, signals }
    }

    /// Context with a fresh token whose signals go nowhere
    pub fn detached() -> Self {
        Self::new(CancelToken::new(), Arc::new(|_: &str, _: Data| {}))
    }

    pub fn signal(&self, name: &str, body: Data) {
        self.signals.signal(name, body);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());

        token.cancel();
        assert!(other.is_cancelled());

        other.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_closure_sink_receives_signals() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |name: &str, body: Data| seen.lock().push((name.to_string(), body))
        };
        let ctx = ActionContext::new(CancelToken::new(), Arc::new(sink));

        let mut body = Data::new();
        body.insert("remaining".to_string(), 3.into());
        ctx.signal("capture", body);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "capture");
        assert_eq!(seen[0].1["remaining"], 3);
    }
}
