//! Thread-safe token usage accumulator.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::Context;
use crate::model::{AfterModelCallback, Request, Response, Usage};

/// Accumulated usage since the last snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    /// Prompt tokens
    pub prompt_tokens: u64,
    /// Completion tokens
    pub completion_tokens: u64,
    /// Total tokens
    pub total_tokens: u64,
    /// Number of recorded calls
    pub calls: u64,
}

/// Sums token usage across model calls.
#[derive(Debug, Default)]
pub struct TokenTracker {
    inner: Mutex<TokenUsage>,
}

impl TokenTracker {
    /// New tracker, zeroed
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TokenUsage> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add one call's usage.
    pub fn record(&self, usage: &Usage) {
        let mut acc = self.lock();
        acc.prompt_tokens += usage.prompt_tokens;
        acc.completion_tokens += usage.completion_tokens;
        acc.total_tokens += usage.total_tokens;
        acc.calls += 1;
    }

    /// Read and reset.
    pub fn snapshot(&self) -> TokenUsage {
        std::mem::take(&mut *self.lock())
    }

    /// Read without resetting.
    pub fn peek(&self) -> TokenUsage {
        *self.lock()
    }

    /// After-model callback that records the usage of every response carrying one.
    pub fn after_model_callback(self: &Arc<Self>) -> AfterModelCallback {
        let tracker = Arc::clone(self);
        Arc::new(move |_ctx: &Context, _req: &Request, rsp: &Response| {
            if let Some(usage) = &rsp.usage {
                tracker.record(usage);
            }
            Ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(p: u64, c: u64) -> Usage {
        Usage { prompt_tokens: p, completion_tokens: c, total_tokens: p + c }
    }

    #[test]
    fn snapshot_resets_peek_does_not() {
        let tracker = TokenTracker::new();
        tracker.record(&usage(10, 5));
        tracker.record(&usage(1, 2));

        let peeked = tracker.peek();
        assert_eq!(peeked.total_tokens, 18);
        assert_eq!(peeked.calls, 2);

        let snap = tracker.snapshot();
        assert_eq!(snap, peeked);
        assert_eq!(tracker.peek(), TokenUsage::default());
    }

    #[test]
    fn callback_records_usage() {
        let tracker = Arc::new(TokenTracker::new());
        let cb = tracker.after_model_callback();
        let mut rsp = Response::default();
        rsp.usage = Some(usage(3, 4));
        assert!(cb(&Context::new(), &Request::default(), &rsp).unwrap().is_none());
        cb(&Context::new(), &Request::default(), &Response::default()).unwrap();
        assert_eq!(tracker.peek().calls, 1);
        assert_eq!(tracker.peek().completion_tokens, 4);
    }

    #[test]
    fn concurrent_records() {
        let tracker = Arc::new(TokenTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        t.record(&usage(1, 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.peek().calls, 800);
        assert_eq!(tracker.peek().total_tokens, 1600);
    }
}
