//! Webhook in, GitHub issue out, over the real HTTP adapters and SQLite.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use threadwatch::{
    config::AppConfig,
    connectors::{GitHubTracker, HttpLlm},
    db,
    models::{ThreadId, ThreadState},
    pipeline::{CycleOutcome, Pipeline, PipelineParts, PipelineSettings, TriggerReceiver},
    repositories::{IssueRecordRepository, IssueRecordStore},
    server::{AppState, create_app},
};

struct Stack {
    app: axum::Router,
    pipeline: Pipeline,
    triggers: TriggerReceiver,
    store: Arc<IssueRecordRepository>,
}

async fn stack(llm: &MockServer, github: &MockServer) -> Stack {
    let mut config = AppConfig {
        database_url: "sqlite::memory:".to_string(),
        ..AppConfig::default()
    };
    config.chat.channels = vec!["support".to_string()];
    config.chat.bot_user_id = Some("bot-user".to_string());
    config.chat.webhook_token = Some("hook-token".to_string());
    config.llm.api_base = Some(llm.uri());
    config.llm.api_key = Some("sk-test".to_string());
    config.tracker.api_base = github.uri();
    config.tracker.token = Some("ghp-test".to_string());
    config.tracker.owner = Some("acme".to_string());
    config.tracker.repo = Some("shop".to_string());
    config.tracker.default_labels = vec!["from-chat".to_string()];

    let db = db::init_pool(&config).await.unwrap();
    db::run_migrations(&db).await.unwrap();
    let store = Arc::new(IssueRecordRepository::new(Arc::new(db.clone())));

    let (pipeline, triggers) = Pipeline::new(PipelineParts {
        settings: PipelineSettings::from_config(&config),
        llm: Arc::new(HttpLlm::new(&config.llm).unwrap()),
        tracker: Arc::new(GitHubTracker::new(&config.tracker).unwrap()),
        store: store.clone(),
        monitor: None,
        replier: None,
    })
    .unwrap();

    let app = create_app(AppState {
        db,
        pipeline: pipeline.clone(),
        webhook_token: Some("hook-token".into()),
    });
    Stack {
        app,
        pipeline,
        triggers,
        store,
    }
}

fn completion(content: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": content.to_string()}}]
    }))
}

async fn mount_llm(server: &MockServer, actionable: bool) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("JSON schema (classification)"))
        .respond_with(completion(json!({
            "actionable": actionable,
            "confidence": if actionable { 0.95 } else { 0.9 },
            "reason": "checkout outage reported"
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("JSON schema (issue_extraction)"))
        .respond_with(completion(json!({
            "title": "Checkout fails on card payment",
            "description": "Paying by card at checkout returns a 500 error.",
            "issue_type": "bug",
            "severity": "high",
            "component": "checkout",
            "service": "payments-api",
            "steps_to_reproduce": ["Add an item to the cart", "Pay with a credit card"],
            "expected_behavior": "Order is confirmed",
            "actual_behavior": "500 error page",
            "labels": ["checkout"]
        })))
        .mount(server)
        .await;
}

fn mention(text: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/chat")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "token": "hook-token",
                "channel_id": "ch1",
                "channel_name": "support",
                "timestamp": 1_772_359_200_000_i64,
                "user_id": "u1",
                "user_name": "alice",
                "post_id": "p1",
                "text": text
            })
            .to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn mention_files_issue_and_persists_record() {
    let llm = MockServer::start().await;
    let github = MockServer::start().await;
    mount_llm(&llm, true).await;

    Mock::given(method("GET"))
        .and(path("/search/issues"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total_count": 0, "items": []})))
        .mount(&github)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/shop/labels"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"name": "bug"}])))
        .mount(&github)
        .await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/shop/issues"))
        .and(body_string_contains("threadwatch:thread=ch1/p1"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "number": 17,
            "html_url": "https://github.com/acme/shop/issues/17"
        })))
        .expect(1)
        .mount(&github)
        .await;

    let mut stack = stack(&llm, &github).await;
    let response = stack
        .app
        .clone()
        .oneshot(mention("@threadwatch checkout returns 500 when paying by card"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let trigger = stack.triggers.recv().await.unwrap();
    let outcome = stack.pipeline.process_trigger(trigger).await;
    let CycleOutcome::Created { record } = outcome else {
        panic!("expected a created issue, got {:?}", outcome);
    };
    assert_eq!(record.external_id, "17");

    let thread = ThreadId::new("ch1", "p1");
    let stored = stack.store.find_by_thread(&thread).await.unwrap().unwrap();
    assert_eq!(stored.external_id, "17");
    assert_eq!(
        stored.external_url.as_deref(),
        Some("https://github.com/acme/shop/issues/17")
    );
    assert_eq!(
        stack.pipeline.thread_state(&thread).await,
        Some(ThreadState::Linked)
    );

    // One marker lookup plus one similar-issue search
    let searches: Vec<String> = github
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.url.path() == "/search/issues")
        .filter_map(|request| request.url.query().map(str::to_string))
        .collect();
    assert_eq!(searches.len(), 2);
    assert!(searches.iter().any(|query| query.contains("sort=updated")));
}

#[tokio::test]
async fn chatter_never_reaches_the_tracker() {
    let llm = MockServer::start().await;
    let github = MockServer::start().await;
    mount_llm(&llm, false).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&github)
        .await;

    let mut stack = stack(&llm, &github).await;
    stack
        .app
        .clone()
        .oneshot(mention("@threadwatch anyone up for lunch?"))
        .await
        .unwrap();

    let trigger = stack.triggers.recv().await.unwrap();
    assert_eq!(
        stack.pipeline.process_trigger(trigger).await,
        CycleOutcome::NotActionable
    );
    assert!(
        stack
            .store
            .find_by_thread(&ThreadId::new("ch1", "p1"))
            .await
            .unwrap()
            .is_none()
    );
}
