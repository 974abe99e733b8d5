//! Middleware chains around `append_event` and `get_session`.
//!
//! Hooks run in registration order. Each hook receives the mutable call
//! context and a `next` handle; calling `next.run(..)` continues the chain
//! and eventually reaches the store's base operation.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::warn;

use trellis_core::{Context, CoreError, Event, Result};

use crate::session::{GetOptions, Key, Session};

/// Call context of `append_event`
pub struct AppendEventContext<'a> {
    /// Caller context
    pub context: &'a Context,
    /// Session being appended to
    pub session: &'a mut Session,
    /// Event being appended
    pub event: &'a mut Event,
    /// Session key
    pub key: Key,
}

/// Call context of `get_session`
pub struct GetSessionContext<'a> {
    /// Caller context
    pub context: &'a Context,
    /// Requested session
    pub key: Key,
    /// Read options
    pub options: GetOptions,
}

/// Middleware around `append_event`.
#[async_trait]
pub trait AppendEventHook: Send + Sync {
    /// Handle the call; invoke `next.run(hctx)` to continue.
    async fn handle(&self, hctx: &mut AppendEventContext<'_>, next: AppendEventNext<'_>) -> Result<()>;
}

/// Middleware around `get_session`.
#[async_trait]
pub trait GetSessionHook: Send + Sync {
    /// Handle the call; invoke `next.run(hctx)` to continue.
    async fn handle(&self, hctx: &mut GetSessionContext<'_>, next: GetSessionNext<'_>) -> Result<Option<Session>>;
}

/// Terminal operation of an append chain.
#[async_trait]
pub trait AppendEventBase: Send + Sync {
    /// Perform the append
    async fn append(&self, hctx: &mut AppendEventContext<'_>) -> Result<()>;
}

/// Terminal operation of a get chain.
#[async_trait]
pub trait GetSessionBase: Send + Sync {
    /// Perform the read
    async fn get(&self, hctx: &mut GetSessionContext<'_>) -> Result<Option<Session>>;
}

/// Remainder of an append chain
pub struct AppendEventNext<'a> {
    hooks: &'a [Arc<dyn AppendEventHook>],
    base: &'a dyn AppendEventBase,
    outcome: &'a BaseOutcome<()>,
}

impl<'a> AppendEventNext<'a> {
    /// Continue with the next hook, or the base operation.
    pub async fn run(self, hctx: &mut AppendEventContext<'_>) -> Result<()> {
        match self.hooks.split_first() {
            Some((hook, rest)) => {
                let next = AppendEventNext { hooks: rest, base: self.base, outcome: self.outcome };
                hook.handle(hctx, next).await
            }
            None => {
                let result = self.base.append(hctx).await;
                self.outcome.record(&result);
                result
            }
        }
    }
}

/// Remainder of a get chain
pub struct GetSessionNext<'a> {
    hooks: &'a [Arc<dyn GetSessionHook>],
    base: &'a dyn GetSessionBase,
    outcome: &'a BaseOutcome<Option<Session>>,
}

impl<'a> GetSessionNext<'a> {
    /// Continue with the next hook, or the base operation.
    pub async fn run(self, hctx: &mut GetSessionContext<'_>) -> Result<Option<Session>> {
        match self.hooks.split_first() {
            Some((hook, rest)) => {
                let next = GetSessionNext { hooks: rest, base: self.base, outcome: self.outcome };
                hook.handle(hctx, next).await
            }
            None => {
                let result = self.base.get(hctx).await;
                self.outcome.record(&result);
                result
            }
        }
    }
}

/// What the base operation returned, if the chain reached it.
///
/// Lets the runner tell a store error from a hook error once the chain
/// has unwound.
struct BaseOutcome<T> {
    slot: Mutex<Option<std::result::Result<T, CoreError>>>,
}

impl<T: Clone> BaseOutcome<T> {
    fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    fn record(&self, result: &Result<T>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(result.clone());
        }
    }

    fn take(&self) -> Option<Result<T>> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Registered hooks plus the error policy.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Append middleware, in order
    pub append_event: Vec<Arc<dyn AppendEventHook>>,
    /// Get middleware, in order
    pub get_session: Vec<Arc<dyn GetSessionHook>>,
    /// Log hook errors and still run the base operation
    pub ignore_errors: bool,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("append_event", &self.append_event.len())
            .field("get_session", &self.get_session.len())
            .field("ignore_errors", &self.ignore_errors)
            .finish()
    }
}

impl Hooks {
    /// Run the append chain ending in `base`.
    ///
    /// With `ignore_errors`, a hook error is logged and the base still runs
    /// exactly once. Errors from the base itself always propagate.
    pub async fn run_append_event(&self, hctx: &mut AppendEventContext<'_>, base: &dyn AppendEventBase) -> Result<()> {
        let outcome = BaseOutcome::new();
        let next = AppendEventNext { hooks: &self.append_event, base, outcome: &outcome };
        let chain = next.run(hctx).await;
        match (chain, outcome.take()) {
            (Ok(()), _) => Ok(()),
            (Err(e), Some(Err(_))) => Err(e),
            (Err(e), base_result) if self.ignore_errors => {
                warn!(session_id = %hctx.key.session_id, error = %e, "append_event hook failed, continuing");
                match base_result {
                    Some(result) => result,
                    None => base.append(hctx).await,
                }
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Run the get chain ending in `base`.
    ///
    /// Same error policy as [`Hooks::run_append_event`]. When a hook fails
    /// after the base read, the base's session is returned without a
    /// second read.
    pub async fn run_get_session(
        &self,
        hctx: &mut GetSessionContext<'_>,
        base: &dyn GetSessionBase,
    ) -> Result<Option<Session>> {
        let outcome = BaseOutcome::new();
        let next = GetSessionNext { hooks: &self.get_session, base, outcome: &outcome };
        let chain = next.run(hctx).await;
        match (chain, outcome.take()) {
            (Ok(session), _) => Ok(session),
            (Err(e), Some(Err(_))) => Err(e),
            (Err(e), base_result) if self.ignore_errors => {
                warn!(session_id = %hctx.key.session_id, error = %e, "get_session hook failed, continuing");
                match base_result {
                    Some(result) => result,
                    None => base.get(hctx).await,
                }
            }
            (Err(e), _) => Err(e),
        }
    }
}
