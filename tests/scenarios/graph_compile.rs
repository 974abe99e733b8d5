//! Graph documents compiled and run against a session.

use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use std::sync::Arc;
use tokio::sync::mpsc;

use trellis_core::{Context, Event, Message, Response, Result, StateMap};
use trellis_dsl::{error_codes, Compiler, DslError, Executor, StaticModelProvider};
use trellis_session::{GetOptions, Key, SessionServiceConfig};
use trellis_tests::{service, Backend, ScriptedModel, Wiring};

fn compiler(model: Arc<ScriptedModel>) -> Compiler {
    Compiler::builder()
        .with_model_provider(Arc::new(StaticModelProvider::new().with_fallback(model)))
        .build()
}

#[test]
fn fractional_max_tokens_names_node_and_field() {
    let yaml = r#"
version: "1"
name: writer
nodes:
  - id: start
    node_type: builtin.start
  - id: draft
    node_type: builtin.llm
    config:
      model_spec: { provider: openai, model_name: gpt-4o-mini }
      instruction: Write a haiku.
      max_tokens: 1.5
  - id: end
    node_type: builtin.end
edges:
  - { source: start, target: draft }
  - { source: draft, target: end }
"#;
    let model = ScriptedModel::new(vec![]);
    let err = match compiler(model).compile_yaml(yaml) {
        Err(DslError::ValidationError(err)) => err,
        other => panic!("expected a validation error, got {:?}", other.map(|_| ())),
    };
    assert_eq!(err.code, error_codes::INVALID_CONFIG);
    assert_eq!(err.node_id.as_deref(), Some("draft"));
    assert_eq!(err.field.as_deref(), Some("max_tokens"));
}

#[tokio::test]
async fn graph_reply_lands_in_the_session() -> Result<()> {
    let doc = json!({
        "version": "1",
        "name": "greeter",
        "nodes": [
            {"id": "start", "node_type": "builtin.start"},
            {"id": "greet", "node_type": "builtin.llm", "config": {
                "model_spec": {"provider": "openai", "model_name": "gpt-4o-mini"},
                "instruction": "Greet the user.",
                "max_tokens": 64
            }},
            {"id": "end", "node_type": "builtin.end"}
        ],
        "edges": [
            {"source": "start", "target": "greet"},
            {"source": "greet", "target": "end"}
        ]
    });

    for backend in Backend::ALL {
        let model = ScriptedModel::new(vec![Response::from_message(Message::assistant("Hello, Ada!"))]);
        let graph = compiler(model.clone()).compile_value(doc.clone()).expect("graph compiles");
        let (tx, mut rx) = mpsc::channel(8);
        let executor = Executor::new(Arc::new(graph)).with_event_sender(tx);

        let sessions = service(backend, SessionServiceConfig::default(), Wiring::default()).await?;
        let ctx = Context::new();
        let key = Key::new("app", "ada", "greeting");
        let mut session = sessions.create_session(&ctx, key.clone(), StateMap::new()).await?;
        sessions.append_event(&ctx, &mut session, Event::user_text("inv", "hi, I'm Ada")).await?;

        let mut input = Map::new();
        input.insert("user_input".into(), json!("hi, I'm Ada"));
        let outcome = executor.run(&ctx, "greeting", input).await.expect("graph runs");
        assert!(outcome.interrupt().is_none());
        assert_eq!(outcome.state()["node_responses"]["greet"], json!("Hello, Ada!"));
        drop(executor);

        while let Some(event) = rx.recv().await {
            sessions.append_event(&ctx, &mut session, event).await?;
        }

        let got = sessions.get_session(&ctx, key, GetOptions::default()).await?.unwrap();
        let contents: Vec<String> = got.events.iter().map(|e| e.content().to_string()).collect();
        assert_eq!(contents, vec!["hi, I'm Ada", "Hello, Ada!"], "{:?}", backend);
        assert_eq!(got.events[1].author, "greet");

        let request = &model.requests()[0];
        assert_eq!(request.generation_config.max_tokens, Some(64));
        sessions.close().await?;
    }
    Ok(())
}
