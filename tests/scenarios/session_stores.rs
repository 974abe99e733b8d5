//! The same session scenarios against every store.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trellis_core::{Context, CoreError, Event, Message, Result, Role, StateMap, AUTHOR_SYSTEM};
use trellis_session::{
    insert_placeholder, AppendEventContext, AppendEventHook, AppendEventNext, GetOptions, GetSessionContext,
    GetSessionHook, GetSessionNext, Key, Session, SessionServiceConfig, SessionSummarizer, INTERRUPTED_PLACEHOLDER,
};
use trellis_tests::{init_test_tracing, service, Backend, Wiring};

fn key() -> Key {
    Key::new("app", "user", "s1")
}

fn contents(session: &Session) -> Vec<String> {
    session.events.iter().map(|e| e.content().to_string()).collect()
}

#[tokio::test]
async fn create_append_get() -> Result<()> {
    init_test_tracing();
    for backend in Backend::ALL {
        let service = service(backend, SessionServiceConfig::default(), Wiring::default()).await?;
        let ctx = Context::new();

        let mut session = service.create_session(&ctx, key(), StateMap::new()).await?;
        service.append_event(&ctx, &mut session, Event::user_text("inv", "hello")).await?;
        service
            .append_event(&ctx, &mut session, Event::from_message("inv", "agent", Message::assistant("hi there")))
            .await?;

        let got = service.get_session(&ctx, key(), GetOptions::default()).await?.unwrap();
        assert_eq!(contents(&got), vec!["hello", "hi there"], "{:?}", backend);
        assert!(got.events[0].is_user_message());
        service.close().await?;
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reads_refresh_the_ttl() -> Result<()> {
    let config = SessionServiceConfig { session_ttl_secs: 10, ..Default::default() };
    let service = service(Backend::InMemory, config, Wiring::default()).await?;
    let ctx = Context::new();
    let mut session = service.create_session(&ctx, key(), StateMap::new()).await?;
    service.append_event(&ctx, &mut session, Event::user_text("inv", "hello")).await?;

    tokio::time::advance(Duration::from_secs(8)).await;
    assert!(service.get_session(&ctx, key(), GetOptions::default()).await?.is_some());
    tokio::time::advance(Duration::from_secs(8)).await;
    assert!(service.get_session(&ctx, key(), GetOptions::default()).await?.is_some());
    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(service.get_session(&ctx, key(), GetOptions::default()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn placeholder_between_user_turns() -> Result<()> {
    for backend in Backend::ALL {
        let wiring = Wiring { consecutive: Some(Arc::new(insert_placeholder)), ..Default::default() };
        let service = service(backend, SessionServiceConfig::default(), wiring).await?;
        let ctx = Context::new();
        let mut session = service.create_session(&ctx, key(), StateMap::new()).await?;

        let t0 = Utc::now();
        service
            .append_event(&ctx, &mut session, Event::user_text("inv-1", "first").with_timestamp(t0))
            .await?;
        service
            .append_event(
                &ctx,
                &mut session,
                Event::user_text("inv-2", "second").with_timestamp(t0 + ChronoDuration::seconds(1)),
            )
            .await?;

        let got = service.get_session(&ctx, key(), GetOptions::default()).await?.unwrap();
        assert_eq!(contents(&got), vec!["first", INTERRUPTED_PLACEHOLDER, "second"], "{:?}", backend);
        let placeholder = got.events[1].first_message().unwrap();
        assert_eq!(placeholder.role, Role::Assistant);
        assert_eq!(got.events[1].author, AUTHOR_SYSTEM);
        service.close().await?;
    }
    Ok(())
}

#[tokio::test]
async fn event_limit_keeps_the_newest() -> Result<()> {
    for backend in Backend::ALL {
        let config = SessionServiceConfig { session_event_limit: 3, ..Default::default() };
        let service = service(backend, config, Wiring::default()).await?;
        let ctx = Context::new();
        let mut session = service.create_session(&ctx, key(), StateMap::new()).await?;

        let t0 = Utc::now();
        for i in 0..5 {
            let event = Event::user_text("inv", format!("m{}", i)).with_timestamp(t0 + ChronoDuration::seconds(i));
            service.append_event(&ctx, &mut session, event).await?;
        }
        let got = service.get_session(&ctx, key(), GetOptions::default()).await?.unwrap();
        assert_eq!(contents(&got), vec!["m2", "m3", "m4"], "{:?}", backend);
        service.close().await?;
    }
    Ok(())
}

/// Summary text names the newest event it saw.
struct UpTo;

#[async_trait]
impl SessionSummarizer for UpTo {
    fn should_summarize(&self, session: &Session) -> bool {
        !session.events.is_empty()
    }

    async fn summarize(&self, _ctx: &Context, session: &mut Session) -> Result<String> {
        let last = session.events.last().map(|e| e.content().to_string()).unwrap_or_default();
        Ok(format!("up to {}", last))
    }

    fn metadata(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }
}

#[tokio::test]
async fn concurrent_summary_jobs_keep_the_newest() -> Result<()> {
    for backend in Backend::ALL {
        let wiring = Wiring { summarizer: Some(Arc::new(UpTo)), ..Default::default() };
        let service = service(backend, SessionServiceConfig::default(), wiring).await?;
        let ctx = Context::new();
        let mut session = service.create_session(&ctx, key(), StateMap::new()).await?;
        let t0 = Utc::now();
        for i in 0..4 {
            let event = Event::user_text("inv", format!("m{}", i)).with_timestamp(t0 + ChronoDuration::seconds(i));
            service.append_event(&ctx, &mut session, event).await?;
        }

        let mut older = session.clone();
        older.events.truncate(2);
        let mut tasks = Vec::new();
        for snapshot in [older, session.clone()] {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                service.enqueue_summary_job(&Context::new(), &snapshot, "", false).await
            }));
        }
        for task in tasks {
            task.await.map_err(|e| CoreError::Internal(e.to_string()))??;
        }
        service.close().await?;

        let text = service.get_session_summary_text(&ctx, &session, "").await?;
        assert_eq!(text.as_deref(), Some("up to m3"), "{:?}", backend);
    }
    Ok(())
}

fn ignoring_hook_errors() -> SessionServiceConfig {
    SessionServiceConfig { ignore_hook_errors: true, ..Default::default() }
}

#[tokio::test]
async fn append_to_deleted_session_fails_even_when_hook_errors_are_ignored() -> Result<()> {
    for backend in Backend::ALL {
        let service = service(backend, ignoring_hook_errors(), Wiring::default()).await?;
        let ctx = Context::new();
        let mut session = service.create_session(&ctx, key(), StateMap::new()).await?;
        service.delete_session(&ctx, key()).await?;

        let result = service.append_event(&ctx, &mut session, Event::user_text("inv", "lost?")).await;
        assert!(result.is_err(), "{:?}", backend);
        assert!(session.events.is_empty(), "{:?}", backend);
        service.close().await?;
    }
    Ok(())
}

/// Lets the chain continue, then fails.
struct FailAfter;

#[async_trait]
impl AppendEventHook for FailAfter {
    async fn handle(&self, hctx: &mut AppendEventContext<'_>, next: AppendEventNext<'_>) -> Result<()> {
        next.run(hctx).await?;
        Err(CoreError::Other("audit sink down".into()))
    }
}

#[async_trait]
impl GetSessionHook for FailAfter {
    async fn handle(&self, hctx: &mut GetSessionContext<'_>, next: GetSessionNext<'_>) -> Result<Option<Session>> {
        next.run(hctx).await?;
        Err(CoreError::Other("audit sink down".into()))
    }
}

/// Fails without calling `next`.
struct FailBefore;

#[async_trait]
impl GetSessionHook for FailBefore {
    async fn handle(&self, _hctx: &mut GetSessionContext<'_>, _next: GetSessionNext<'_>) -> Result<Option<Session>> {
        Err(CoreError::Other("auth check unavailable".into()))
    }
}

/// Counts calls that reach it.
#[derive(Default)]
struct Counting(AtomicUsize);

#[async_trait]
impl GetSessionHook for Counting {
    async fn handle(&self, hctx: &mut GetSessionContext<'_>, next: GetSessionNext<'_>) -> Result<Option<Session>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        next.run(hctx).await
    }
}

fn append_hook(hook: impl AppendEventHook + 'static) -> Arc<dyn AppendEventHook> {
    Arc::new(hook)
}

fn get_hook(hook: impl GetSessionHook + 'static) -> Arc<dyn GetSessionHook> {
    Arc::new(hook)
}

#[tokio::test]
async fn failing_hook_after_the_store_keeps_a_single_write() -> Result<()> {
    for backend in Backend::ALL {
        let wiring = Wiring { append_hooks: vec![append_hook(FailAfter)], ..Default::default() };
        let service = service(backend, ignoring_hook_errors(), wiring).await?;
        let ctx = Context::new();
        let mut session = service.create_session(&ctx, key(), StateMap::new()).await?;

        service.append_event(&ctx, &mut session, Event::user_text("inv", "hello")).await?;
        let got = service.get_session(&ctx, key(), GetOptions::default()).await?.unwrap();
        assert_eq!(contents(&got), vec!["hello"], "{:?}", backend);
        service.close().await?;
    }
    Ok(())
}

#[tokio::test]
async fn failing_get_hooks_still_return_the_session() -> Result<()> {
    let ctx = Context::new();
    for backend in Backend::ALL {
        let counting = Arc::new(Counting::default());
        let inner: Arc<dyn GetSessionHook> = counting.clone();
        let wiring = Wiring { get_hooks: vec![get_hook(FailAfter), inner], ..Default::default() };
        let after = service(backend, ignoring_hook_errors(), wiring).await?;
        after.create_session(&ctx, key(), StateMap::new()).await?;

        let got = after.get_session(&ctx, key(), GetOptions::default()).await?;
        assert_eq!(got.map(|s| s.id), Some("s1".to_string()), "{:?}", backend);
        assert_eq!(counting.0.load(Ordering::SeqCst), 1, "{:?}", backend);
        assert!(after.get_session(&ctx, Key::new("app", "user", "nope"), GetOptions::default()).await?.is_none());
        after.close().await?;

        let wiring = Wiring { get_hooks: vec![get_hook(FailBefore)], ..Default::default() };
        let before = service(backend, ignoring_hook_errors(), wiring).await?;
        before.create_session(&ctx, key(), StateMap::new()).await?;
        assert!(before.get_session(&ctx, key(), GetOptions::default()).await?.is_some(), "{:?}", backend);
        before.close().await?;

        let wiring = Wiring { get_hooks: vec![get_hook(FailBefore)], ..Default::default() };
        let strict = service(backend, SessionServiceConfig::default(), wiring).await?;
        strict.create_session(&ctx, key(), StateMap::new()).await?;
        assert!(strict.get_session(&ctx, key(), GetOptions::default()).await.is_err(), "{:?}", backend);
        strict.close().await?;
    }
    Ok(())
}

/// Numbers each pass so overwrites are visible.
#[derive(Default)]
struct Passes(AtomicUsize);

#[async_trait]
impl SessionSummarizer for Passes {
    fn should_summarize(&self, _session: &Session) -> bool {
        true
    }

    async fn summarize(&self, _ctx: &Context, _session: &mut Session) -> Result<String> {
        Ok(format!("pass {}", self.0.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn metadata(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }
}

#[tokio::test]
async fn resummarizing_without_new_events_keeps_the_stored_summary() -> Result<()> {
    for backend in Backend::ALL {
        let passes = Arc::new(Passes::default());
        let summarizer: Arc<dyn SessionSummarizer> = passes.clone();
        let wiring = Wiring { summarizer: Some(summarizer), ..Default::default() };
        let service = service(backend, SessionServiceConfig::default(), wiring).await?;
        let ctx = Context::new();
        let mut session = service.create_session(&ctx, key(), StateMap::new()).await?;
        service.append_event(&ctx, &mut session, Event::user_text("inv", "hello")).await?;

        service.create_session_summary(&ctx, &session, "", false).await?;
        // forced, but nothing new: the result carries the same timestamp
        service.create_session_summary(&ctx, &session, "", true).await?;
        assert_eq!(passes.0.load(Ordering::SeqCst), 2, "{:?}", backend);

        let text = service.get_session_summary_text(&ctx, &session, "").await?;
        assert_eq!(text.as_deref(), Some("pass 1"), "{:?}", backend);
        service.close().await?;
    }
    Ok(())
}
