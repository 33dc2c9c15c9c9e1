//! Cooperative cancellation shared between a front-end and a running copy.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cloneable handle to one cancellation request slot.
///
/// The requesting side (a Ctrl+C handler, a button) calls [`request`]; the
/// supervisor polls with [`take`], which clears the request in the same
/// atomic step. A request therefore results in at most one interrupt signal
/// to the child, no matter how often it is polled afterwards.
///
/// [`request`]: CancelToken::request
/// [`take`]: CancelToken::take
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    requested: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the current copy to stop.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Returns `true` exactly once per request and resets the slot.
    pub fn take(&self) -> bool {
        self.requested
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Peeks without clearing.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn take_clears_the_request() {
        let token = CancelToken::new();
        assert!(!token.take());

        token.request();
        assert!(token.is_requested());
        assert!(token.take());
        assert!(!token.take());
        assert!(!token.is_requested());
    }

    #[test]
    fn concurrent_takers_see_one_request_once() {
        let token = CancelToken::new();
        token.request();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = token.clone();
                thread::spawn(move || t.take())
            })
            .collect();
        let taken = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|taken| *taken)
            .count();

        assert_eq!(taken, 1);
    }
}
