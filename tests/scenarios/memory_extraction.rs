//! Memory extraction fed from a session store.

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_test::assert_ok;

use trellis_core::{Context, Event, Message, Result, StateMap};
use trellis_memory::{InMemoryMemoryService, LlmExtractor, MemoryExtractor, MemoryService, Operation, UserKey};
use trellis_session::{GetOptions, Key, SessionServiceConfig};
use trellis_tests::{service, tool_calls, Backend, ScriptedModel, Wiring};

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn tool_names(model: &ScriptedModel) -> Vec<Vec<String>> {
    model.requests().iter().map(|r| r.tools.keys().cloned().collect()).collect()
}

#[tokio::test]
async fn extractor_offers_only_enabled_write_tools() {
    let model = ScriptedModel::new(vec![tool_calls(&[("memory_add", json!({"memory": "User has a cat"}))])]);
    let ops = LlmExtractor::new(model.clone())
        .extract(&Context::new(), &[Message::user("I have a cat")], &[], &names(&["memory_add", "memory_search"]))
        .await
        .unwrap();

    assert_eq!(ops, vec![Operation::Add { memory: "User has a cat".into(), topics: vec![] }]);
    assert_eq!(tool_names(&model), vec![vec!["memory_add".to_string()]]);
}

#[tokio::test]
async fn stored_conversation_becomes_memories() -> Result<()> {
    for backend in Backend::ALL {
        let sessions = service(backend, SessionServiceConfig::default(), Wiring::default()).await?;
        let ctx = Context::new();
        let key = Key::new("app", "u", "chat");
        let mut session = sessions.create_session(&ctx, key.clone(), StateMap::new()).await?;
        let t0 = Utc::now();
        sessions
            .append_event(&ctx, &mut session, Event::user_text("inv", "I just adopted a dog named Rex").with_timestamp(t0))
            .await?;
        let reply = Event::from_message("inv", "agent", Message::assistant("Congratulations!"))
            .with_timestamp(t0 + chrono::Duration::seconds(1));
        sessions.append_event(&ctx, &mut session, reply).await?;
        let mut loaded = sessions.get_session(&ctx, key, GetOptions::default()).await?.unwrap();
        assert_eq!(loaded.events.len(), session.events.len());

        let model = ScriptedModel::new(vec![tool_calls(&[
            ("memory_add", json!({"memory": "User has a dog named Rex", "topics": ["pets"]})),
            ("memory_delete", json!({"memory_id": "anything"})),
        ])]);
        let memories = InMemoryMemoryService::builder()
            .with_extractor(Arc::new(LlmExtractor::new(model.clone())))
            .with_tool_enabled("memory_delete", false)
            .build();

        assert_ok!(memories.enqueue_auto_memory_job(&ctx, &mut loaded).await);
        memories.close().await?;

        let stored = memories.read_memories(&ctx, &UserKey::new("app", "u"), 0).await?;
        assert_eq!(stored.len(), 1, "{:?}", backend);
        assert_eq!(stored[0].memory.memory, "User has a dog named Rex");
        assert_eq!(stored[0].memory.topics, vec!["pets".to_string()]);

        let offered = tool_names(&model);
        assert_eq!(offered, vec![vec!["memory_add".to_string(), "memory_update".to_string()]]);
        let conversation: Vec<String> =
            model.requests()[0].messages.iter().skip(1).map(|m| m.content.clone()).collect();
        assert_eq!(conversation, vec!["I just adopted a dog named Rex", "Congratulations!"]);
        sessions.close().await?;
    }
    Ok(())
}

#[tokio::test]
async fn echoed_clear_is_not_applied_when_disabled() -> Result<()> {
    let model = ScriptedModel::new(vec![tool_calls(&[("memory_clear", json!({}))])]);
    let memories = InMemoryMemoryService::builder()
        .with_extractor(Arc::new(LlmExtractor::new(model.clone())))
        .with_tool_enabled("memory_update", false)
        .with_tool_enabled("memory_delete", false)
        .build();
    let ctx = Context::new();
    let user = UserKey::new("app", "u");
    memories.add_memory(&ctx, &user, "User lives in Oslo", vec![]).await?;

    let sessions = service(Backend::InMemory, SessionServiceConfig::default(), Wiring::default()).await?;
    let mut session = sessions.create_session(&ctx, Key::new("app", "u", "chat"), StateMap::new()).await?;
    sessions.append_event(&ctx, &mut session, Event::user_text("inv", "forget everything")).await?;

    assert_ok!(memories.enqueue_auto_memory_job(&ctx, &mut session).await);
    memories.close().await?;

    assert_eq!(tool_names(&model), vec![vec!["memory_add".to_string()]]);
    let left = memories.read_memories(&ctx, &user, 0).await?;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].memory.memory, "User lives in Oslo");
    Ok(())
}
