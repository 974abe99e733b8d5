//! Invocation context
//!
//! Passed into every public entry point. Carries cooperative cancellation
//! and, when known, the invocation scope the call belongs to.

use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifies the (app, user, session) an invocation runs for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InvocationScope {
    /// Application name
    pub app_name: String,
    /// User identifier
    pub user_id: String,
    /// Session identifier
    pub session_id: String,
}

/// Cancellation-aware context for runtime calls.
#[derive(Clone)]
pub struct Context {
    trace_id: String,
    cancellation: CancellationToken,
    scope: Option<InvocationScope>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("trace_id", &self.trace_id)
            .field("cancelled", &self.is_cancelled())
            .field("scope", &self.scope)
            .finish()
    }
}

impl Context {
    /// Create a root context with a fresh trace id.
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
            scope: None,
        }
    }

    /// Attach an invocation scope.
    pub fn with_scope(mut self, scope: InvocationScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Child context: cancelled when the parent is, may be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            cancellation: self.cancellation.child_token(),
            scope: self.scope.clone(),
        }
    }

    /// Context that keeps trace and scope but no longer observes the
    /// parent's cancellation. Background workers run jobs under this.
    pub fn detached(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            cancellation: CancellationToken::new(),
            scope: self.scope.clone(),
        }
    }

    /// Trace identifier
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Invocation scope, if any
    pub fn scope(&self) -> Option<&InvocationScope> {
        self.scope.as_ref()
    }

    /// Cancel this context and all children.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Underlying token, for `tokio::select!` in callers.
    pub fn token(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_observes_parent_cancellation() {
        let parent = Context::new();
        let child = parent.child();
        assert_eq!(parent.trace_id(), child.trace_id());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn detached_ignores_parent_cancellation() {
        let parent = Context::new().with_scope(InvocationScope {
            app_name: "app".into(),
            user_id: "u".into(),
            session_id: "s".into(),
        });
        let detached = parent.detached();
        parent.cancel();
        assert!(!detached.is_cancelled());
        assert_eq!(detached.scope().map(|s| s.app_name.as_str()), Some("app"));
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let ctx = Context::new();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        ctx.cancel();
        handle.await.unwrap();
    }
}
