//! Request-scoped cancellation.
//!
//! Every in-flight request owns a [`CancelSource`]; the worker holds the
//! matching [`CancelToken`]. Operator cancel/abort flips the flag and every
//! suspension point in the dispatch path observes it. Completed subroutes
//! stay recorded: cancellation stops future work, it does not rewrite
//! history.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
}

impl CancelSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires. Never resolves if the source is
    /// dropped without cancelling; callers always race this against work.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Source dropped without cancelling; park forever.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }

    /// A token that never cancels (detached maintenance work).
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        Self { rx }
    }
}

/// Live requests by id, for operator cancel/abort.
#[derive(Default)]
pub struct ActiveRequests {
    inner: Mutex<HashMap<Uuid, CancelSource>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: Uuid) -> CancelToken {
        let (source, token) = cancel_pair();
        self.inner
            .lock()
            .expect("active requests lock poisoned")
            .insert(request_id, source);
        token
    }

    pub fn finish(&self, request_id: Uuid) {
        self.inner
            .lock()
            .expect("active requests lock poisoned")
            .remove(&request_id);
    }

    /// Cancel a live request. Returns false when the request is not in
    /// flight (already finished, or never seen by this instance).
    pub fn cancel(&self, request_id: Uuid) -> bool {
        let g = self.inner.lock().expect("active requests lock poisoned");
        match g.get(&request_id) {
            Some(source) => {
                source.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().expect("active requests lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_flips_the_token() {
        let (source, token) = cancel_pair();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await; // must resolve immediately
    }

    #[tokio::test]
    async fn active_requests_cancel_by_id() {
        let active = ActiveRequests::new();
        let id = Uuid::new_v4();
        let token = active.register(id);

        assert_eq!(active.in_flight(), 1);
        assert!(active.cancel(id));
        assert!(token.is_cancelled());

        active.finish(id);
        assert!(!active.cancel(id), "finished request is not cancellable");
        assert_eq!(active.in_flight(), 0);
    }
}
