use super::*;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;

use trellis_core::{Request, Response};

use crate::entry::{Memory, UserKey};
use crate::testing::{calls, scripted, MockLlm};

fn enabled(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn entry(id: &str, text: &str) -> Entry {
    Entry {
        id: id.into(),
        app_name: "app".into(),
        user_id: "u".into(),
        memory: Memory { memory: text.into(), topics: vec![], last_updated: None },
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn missing_model_is_an_error() {
    let err = LlmExtractor::default()
        .extract(&Context::new(), &[Message::user("hi")], &[], &BTreeSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ConfigurationError(_)));
}

#[tokio::test]
async fn no_messages_skips_the_model() {
    let extractor = LlmExtractor::new(Arc::new(MockLlm::new()));
    let ops = extractor.extract(&Context::new(), &[], &[], &BTreeSet::new()).await.unwrap();
    assert!(ops.is_empty());
}

#[tokio::test]
async fn request_offers_only_enabled_tools() {
    let (model, seen) = scripted(vec![calls(&[("memory_add", json!({"memory": "User has a cat"}))])]);
    let extractor = LlmExtractor::new(model);
    let ops = extractor
        .extract(
            &Context::new(),
            &[Message::user("I have a cat")],
            &[entry("m1", "User lives in Oslo")],
            &enabled(&["memory_add", "memory_search"]),
        )
        .await
        .unwrap();
    assert_eq!(ops, vec![Operation::Add { memory: "User has a cat".into(), topics: vec![] }]);

    let requests = seen.lock().unwrap();
    let request = &requests[0];
    assert_eq!(request.tools.keys().cloned().collect::<Vec<_>>(), vec!["memory_add".to_string()]);
    assert_eq!(request.messages.len(), 2);
    let system = &request.messages[0].content;
    assert!(system.starts_with(DEFAULT_PROMPT));
    assert!(system.contains("<available_actions>\n- memory_add: Add a new memory (only if genuinely new information).\n</available_actions>\n"));
    assert!(system.ends_with("\n<existing_memories>\n- [m1] User lives in Oslo\n</existing_memories>\n"));
    assert_eq!(request.messages[1].content, "I have a cat");
}

#[test]
fn prompt_without_actions() {
    let extractor = LlmExtractor::default().with_prompt("Custom.");
    let prompt = extractor.system_prompt(&[], &enabled(&["memory_search"]));
    assert_eq!(prompt, "Custom.\n<available_actions>\nNo actions available.\n</available_actions>\n");
}

#[tokio::test]
async fn operations_accumulate_across_chunks() {
    let (model, _) = scripted(vec![
        calls(&[("memory_update", json!({"memory_id": "m1", "memory": "User lives in Bergen"}))]),
        calls(&[("memory_delete", json!({"memory_id": "m2"})), ("memory_unknown", json!({}))]),
        Response::from_message(Message::assistant("done")),
    ]);
    let ops = LlmExtractor::new(model)
        .extract(&Context::new(), &[Message::user("I moved to Bergen")], &[], &BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(
        ops,
        vec![
            Operation::Update { memory_id: "m1".into(), memory: "User lives in Bergen".into(), topics: vec![] },
            Operation::Delete { memory_id: "m2".into() },
        ]
    );
}

#[tokio::test]
async fn response_error_ends_extraction_unless_replaced() {
    let (model, _) = scripted(vec![Response::from_error("api_error", "boom")]);
    let extractor = LlmExtractor::new(model.clone());
    let err = extractor
        .extract(&Context::new(), &[Message::user("hi")], &[], &BTreeSet::new())
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::UpstreamError("model error: boom".into()));

    let rescued = LlmExtractor::new(model).with_model_callbacks(ModelCallbacks::new().register_after(Arc::new(
        |_: &Context, _: &Request, rsp: &Response| {
            Ok(rsp.error.as_ref().map(|_| calls(&[("memory_clear", json!({}))])))
        },
    )));
    let ops = rescued.extract(&Context::new(), &[Message::user("forget all")], &[], &BTreeSet::new()).await.unwrap();
    assert_eq!(ops, vec![Operation::Clear]);
}

#[tokio::test]
async fn before_callback_short_circuits_the_model() {
    let extractor = LlmExtractor::new(Arc::new(MockLlm::new())).with_model_callbacks(
        ModelCallbacks::new()
            .register_before(Arc::new(|_: &Context, _: &mut Request| Ok(Some(calls(&[("memory_add", json!({"memory": "canned"}))]))))),
    );
    let ops = extractor.extract(&Context::new(), &[Message::user("hi")], &[], &BTreeSet::new()).await.unwrap();
    assert_eq!(ops, vec![Operation::Add { memory: "canned".into(), topics: vec![] }]);
}

#[test]
fn checkers_and_metadata() {
    let ctx = ExtractionContext {
        user_key: UserKey::new("app", "u"),
        messages: vec![Message::user("a"), Message::user("b")],
        last_extract_at: Some(Utc::now()),
    };
    assert!(LlmExtractor::default().should_extract(&ctx));

    let strict = LlmExtractor::default()
        .with_checker(check_message_threshold(1))
        .with_checker(check_time_interval(Duration::from_secs(3600)));
    assert!(!strict.should_extract(&ctx));

    let lenient = strict.with_checkers_any(vec![check_message_threshold(1), check_time_interval(Duration::from_secs(3600))]);
    assert!(lenient.should_extract(&ctx));

    let meta = lenient.metadata();
    assert_eq!(meta["model_available"], json!(false));
    assert_eq!(meta["model_name"], json!(""));
}
