//! End-to-end HTTP surface tests: spin up a real daemon on a free port
//! (dev-bypass auth, fresh tempdir) and drive it with `reqwest`, the same
//! "start a real daemon, hit it over the wire" shape as
//! `tests/integration_test.rs`.

use std::sync::Arc;

use agentrelay::config::DaemonConfig;
use agentrelay::AppContext;
use serde_json::{json, Value};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Boots a daemon (REST router only — no bridge listener, no background
/// loops) on a random port with `dev_bypass` so tests don't need to mint
/// API keys, and returns its base URL plus the live `AppContext`.
async fn start_test_daemon() -> (String, Arc<AppContext>) {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let rest_port = free_port();
    let bridge_port = free_port();

    let config = DaemonConfig::new(
        Some(rest_port),
        Some(bridge_port),
        Some(data_dir),
        Some("warn".to_string()),
        None,
        true,
    );

    let ctx = AppContext::new(config).await.expect("daemon init");
    let router = agentrelay::rest::router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{rest_port}"))
        .await
        .unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    (format!("http://127.0.0.1:{rest_port}"), ctx)
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (base, _ctx) = start_test_daemon().await;
    let client = reqwest::Client::new();
    let resp = client.get(format!("{base}/api/v1/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["mailboxCount"], 0);
}

#[tokio::test]
async fn autonomous_pair_auto_approves_and_dispatches() {
    // Scenario 1 (§8): two autonomous agents, registered by default
    // seeding — a send between them is auto-approved without any
    // `requireApproval` override.
    let (base, _ctx) = start_test_daemon().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/send"))
        .json(&json!({"from": "cursor/dev", "to": "replit/main", "task": "deploy"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "approved");
    assert!(body["messageId"].is_string());
}

#[tokio::test]
async fn conversational_destination_holds_for_approval() {
    // Scenario 2 (§8): a message to a conversational agent is held
    // pending until an explicit approve call.
    let (base, _ctx) = start_test_daemon().await;
    let client = reqwest::Client::new();

    let send = client
        .post(format!("{base}/api/send"))
        .json(&json!({"from": "replit/dev", "to": "claude/web", "task": "review"}))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(send["status"], "pending");
    let id = send["id"].as_str().unwrap();

    let approved = client
        .post(format!("{base}/api/approve/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(approved.status(), 200);
    let approved: Value = approved.json().await.unwrap();
    assert_eq!(approved["status"], "approved");

    // A ping wake-up message lands in the same inbox per §2's data flow.
    let inbox = client
        .get(format!("{base}/api/inbox/claude/web"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    let messages = inbox["messages"].as_array().unwrap();
    assert!(messages.iter().any(|m| m["task"].as_str().unwrap_or("").starts_with("🔔")));
}

#[tokio::test]
async fn reply_auto_completes_parent_and_shares_thread_id() {
    // Scenario 3 (§8).
    let (base, _ctx) = start_test_daemon().await;
    let client = reqwest::Client::new();

    let root = client
        .post(format!("{base}/api/send"))
        .json(&json!({"from": "cursor/dev", "to": "replit/main", "task": "build the thing"}))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    let root_id = root["id"].as_str().unwrap().to_string();

    let reply = client
        .post(format!("{base}/api/send"))
        .json(&json!({
            "from": "replit/main",
            "to": "cursor/dev",
            "task": "done",
            "replyTo": root_id,
        }))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(reply["threadId"], root_id);

    let parent = client
        .get(format!("{base}/api/message/{root_id}"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(parent["status"], "completed");
    assert_eq!(parent["replyCount"], 1);
}

#[tokio::test]
async fn control_message_ends_thread() {
    // Scenario 4 (§8).
    let (base, _ctx) = start_test_daemon().await;
    let client = reqwest::Client::new();

    let msg = client
        .post(format!("{base}/api/send"))
        .json(&json!({"from": "cursor/dev", "to": "replit/main", "task": "  conversation_end  "}))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(msg["isControlMessage"], true);
    assert_eq!(msg["controlType"], "CONVERSATION_END");
    assert_eq!(msg["threadStatus"], "completed");
}

#[tokio::test]
async fn unknown_status_transition_is_rejected() {
    let (base, _ctx) = start_test_daemon().await;
    let client = reqwest::Client::new();

    let msg = client
        .post(format!("{base}/api/send"))
        .json(&json!({"from": "cursor/dev", "to": "replit/main", "task": "ship it"}))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    let id = msg["id"].as_str().unwrap();

    // approved -> completed is not in the transition table (§4.A); only
    // in_progress or failed are reachable from approved.
    let resp = client
        .post(format!("{base}/api/status/{id}"))
        .json(&json!({"status": "completed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn flight_recorder_resumption_prompt_contains_checkpoint_and_error() {
    // Scenario 6 (§8).
    let (base, _ctx) = start_test_daemon().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/api/v1/agent/checkpoint"))
        .json(&json!({
            "agentId": "claude-web",
            "content": "checkpointing",
            "contextSnapshot": {"currentTask": "auth flow", "blockingIssue": "jwt"},
        }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    client
        .post(format!("{base}/api/v1/agent/error"))
        .json(&json!({"agentId": "claude-web", "content": "RecursionDepthExceeded"}))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let ctx: Value = client
        .get(format!("{base}/api/v1/agent/context/agent/claude-web"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ctx["summaryText"]
        .as_str()
        .unwrap()
        .starts_with("Working on: auth flow"));
    assert!(ctx["immediateGoal"]
        .as_str()
        .unwrap()
        .starts_with("Fix error: RecursionDepthExceeded"));

    let script: Value = client
        .get(format!("{base}/api/v1/agent/script/claude-web?include_context=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let prompt = script["script"].as_str().unwrap();
    assert!(prompt.contains("RECENT LOGS"));
}

#[tokio::test]
async fn bridge_relay_approves_immediately() {
    let (base, _ctx) = start_test_daemon().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!(
            "{base}/bridge/relay?from=cursor/dev&to=replit/main&task=ship"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "approved");
}
