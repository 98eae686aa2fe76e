mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{text_result, tool_error, FakeToolServer, ToolAction, TEST_TOKEN};
use ponos_core::{FileUpdate, PonosError};
use ponos_mcp::{passthrough, JsonRpcRequest, ToolClient};
use serde_json::json;

#[tokio::test]
async fn handshake_precedes_first_tool_call() {
    let server = FakeToolServer::start(|_, _, _| ToolAction::Reply(json!({"content": []}))).await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let session = client.connect().await.unwrap();
    assert_eq!(session.session_id(), Some("session-1"));
    assert_eq!(session.protocol_version, "2024-11-05");
    assert_eq!(session.server.as_ref().unwrap().name, "fake-tools");

    client.call_tool("list_branches", json!(null)).await.unwrap();

    assert_eq!(
        server.methods(),
        vec!["initialize", "notifications/initialized", "tools/call"]
    );
    assert_eq!(server.calls()[0].1, json!({}));
    assert!(server
        .auth_headers()
        .iter()
        .all(|h| h == &format!("Bearer {}", TEST_TOKEN)));
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn push_files_returns_commit_sha() {
    let server = FakeToolServer::start(|name, _, _| match name {
        "push_files" => ToolAction::Reply(json!({"content": [{"text": "{\"sha\":\"deadbeef\"}"}]})),
        _ => ToolAction::Ignore,
    })
    .await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let files = vec![
        FileUpdate::new("polkadot/values.yaml", "image: parity/polkadot:v1.2.0\n"),
        FileUpdate::new("polkadot/archive.yaml", "image: parity/polkadot:v1.2.0\n"),
    ];
    let sha = client
        .push_files("blockops", "infra", "upgrade-1", "Upgrade polkadot", &files)
        .await
        .unwrap();
    assert_eq!(sha, "deadbeef");

    let (name, args) = &server.calls()[0];
    assert_eq!(name, "push_files");
    assert_eq!(args["files"][1]["path"], "polkadot/archive.yaml");
    assert_eq!(args["branch"], "upgrade-1");
}

#[tokio::test]
async fn get_file_contents_and_pull_request() {
    let server = FakeToolServer::start(|name, args, _| match name {
        "get_file_contents" => {
            assert_eq!(args["ref"], "main");
            ToolAction::Reply(json!({"content": [
                {"type": "text", "text": "successfully downloaded text file"},
                {"type": "resource", "resource": {"uri": "repo://blockops/infra/values.yaml", "text": "image: a:1\n"}}
            ]}))
        }
        "create_pull_request" => ToolAction::Reply(text_result(json!({
            "number": 12,
            "html_url": "https://github.com/blockops/infra/pull/12",
            "url": "https://api.github.com/repos/blockops/infra/pulls/12"
        }))),
        _ => ToolAction::Ignore,
    })
    .await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let content = client
        .get_file_contents("blockops", "infra", "values.yaml", Some("main"))
        .await
        .unwrap();
    assert_eq!(content, "image: a:1\n");

    let url = client
        .create_pull_request("blockops", "infra", "upgrade-1", "main", "Upgrade", "body")
        .await
        .unwrap();
    assert_eq!(url, "https://github.com/blockops/infra/pull/12");
}

#[tokio::test]
async fn create_branch_twice_succeeds() {
    let server = FakeToolServer::start(|name, _, index| match (name, index) {
        ("create_branch", 0) => ToolAction::Reply(text_result(json!({"ref": "refs/heads/upgrade-1"}))),
        ("create_branch", _) => ToolAction::Reply(tool_error(
            "failed to create branch: POST https://api.github.com/repos/blockops/infra/git/refs: 422 Reference already exists []",
        )),
        _ => ToolAction::Ignore,
    })
    .await;
    let client = ToolClient::new(server.client_config()).unwrap();

    client
        .create_branch("blockops", "infra", "upgrade-1", Some("main"))
        .await
        .unwrap();
    client
        .create_branch("blockops", "infra", "upgrade-1", Some("main"))
        .await
        .unwrap();
    assert_eq!(server.calls().len(), 2);
}

#[tokio::test]
async fn structured_already_exists_error_is_success() {
    let server = FakeToolServer::start(|_, _, _| ToolAction::Error {
        code: -32000,
        message: "Validation Failed".to_string(),
        data: Some(json!({"status": 422, "errors": [{"code": "already_exists"}]})),
    })
    .await;
    let client = ToolClient::new(server.client_config()).unwrap();

    client
        .create_branch("blockops", "infra", "upgrade-1", None)
        .await
        .unwrap();
    // Remote errors are not transport failures, so nothing was retried.
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn missing_field_is_a_shape_error() {
    let server =
        FakeToolServer::start(|_, _, _| ToolAction::Reply(text_result(json!({"ok": true})))).await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let err = client
        .create_pull_request("blockops", "infra", "h", "main", "t", "")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PonosError::UnexpectedShape { operation: "create_pull_request", field: "html_url" }
    ));
}

#[tokio::test]
async fn concurrent_calls_are_matched_by_id() {
    let server = FakeToolServer::start(|_, args, _| {
        let n = args["n"].as_u64().unwrap();
        // Later requests are answered first.
        let delay = Duration::from_millis(200 - n * 20);
        ToolAction::ReplyAfter(delay, json!({"echo": n}))
    })
    .await;
    let client = Arc::new(ToolClient::new(server.client_config()).unwrap());
    client.connect().await.unwrap();

    let mut handles = Vec::new();
    for n in 0..8u64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let result = client.call_tool("echo", json!({"n": n})).await.unwrap();
            (n, result)
        }));
    }
    for handle in handles {
        let (n, result) = handle.await.unwrap();
        assert_eq!(result["echo"], n);
    }
    assert_eq!(client.session().correlator().pending_count(), 0);
}

#[tokio::test]
async fn stream_close_unblocks_every_outstanding_request() {
    let server = FakeToolServer::start(|_, _, _| ToolAction::Ignore).await;
    let client = Arc::new(ToolClient::new(server.client_config()).unwrap());
    client.connect().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let request = JsonRpcRequest::new("tools/call", Some(json!({"name": "slow", "arguments": {}})));
            client.session().request(request).await
        }));
    }
    while client.session().correlator().pending_count() < 4 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.close_streams();

    for handle in handles {
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("caller stayed blocked after the stream closed")
            .unwrap();
        assert!(matches!(result, Err(PonosError::StreamClosed(_))));
    }
    assert_eq!(client.session().state_name(), "disconnected");
}

#[tokio::test]
async fn dropped_stream_is_retried_once_on_a_new_session() {
    let server = FakeToolServer::start(|_, _, index| match index {
        0 => ToolAction::CloseStream,
        _ => ToolAction::Reply(text_result(json!({"object": {"sha": "cafe"}}))),
    })
    .await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let sha = client
        .push_files("blockops", "infra", "b", "m", &[FileUpdate::new("a.yaml", "x")])
        .await
        .unwrap();
    assert_eq!(sha, "cafe");
    assert_eq!(server.connections(), 2);
    assert_eq!(server.calls().len(), 2);
}

#[tokio::test]
async fn expired_session_reconnects() {
    let server = FakeToolServer::start(|_, _, _| ToolAction::Reply(json!({"content": []}))).await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let first = client.connect().await.unwrap();
    server.expire_sessions();

    client.call_tool("anything", json!({})).await.unwrap();
    let current = client.session().current().unwrap();
    assert!(current.generation > first.generation);
    assert_eq!(current.session_id(), Some("session-2"));
}

#[tokio::test]
async fn request_on_replaced_generation_fails_fast() {
    let server = FakeToolServer::start(|_, _, _| ToolAction::Reply(json!({"content": []}))).await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let first = client.connect().await.unwrap();
    let second = client.session().reconnect().await.unwrap();
    assert!(second.generation > first.generation);

    let request = JsonRpcRequest::new("tools/call", Some(json!({"name": "late", "arguments": {}})));
    let result = tokio::time::timeout(Duration::from_secs(1), client.session().request_on(&first, request))
        .await
        .expect("request on a replaced generation waited for the request timeout");

    let err = result.unwrap_err();
    assert!(matches!(err, PonosError::StreamClosed(_)));
    assert!(err.is_retryable());
    assert!(server.calls().is_empty());
    assert_eq!(client.session().correlator().pending_count(), 0);
}

#[tokio::test]
async fn dropping_the_client_closes_its_stream() {
    let server = FakeToolServer::start(|_, _, _| ToolAction::Reply(json!({"content": []}))).await;
    let client = ToolClient::new(server.client_config()).unwrap();
    client.connect().await.unwrap();
    assert_eq!(server.live_streams(), 1);

    drop(client);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.live_streams() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "stream stayed open after the client was dropped"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn second_failure_is_surfaced() {
    let server = FakeToolServer::start(|_, _, _| ToolAction::CloseStream).await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let err = client.call_tool("flaky", json!({})).await.unwrap_err();
    assert!(matches!(err, PonosError::StreamClosed(_)));
    assert_eq!(server.calls().len(), 2);
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn missing_endpoint_times_out() {
    let server = FakeToolServer::start(|_, _, _| ToolAction::Ignore).await;
    server.set_announce_endpoint(false);

    let mut config = server.client_config();
    config.connect_timeout = Duration::from_millis(200);
    let client = ToolClient::new(config).unwrap();

    let err = client.call_tool("anything", json!({})).await.unwrap_err();
    assert!(matches!(err, PonosError::ConnectTimeout { timeout_ms: 200, .. }));
    // The first attempt and the forced reconnect.
    assert_eq!(server.connections(), 2);
    assert!(server.calls().is_empty());
}

#[tokio::test]
async fn passthrough_returns_raw_result() {
    let server =
        FakeToolServer::start(|_, _, _| ToolAction::Reply(text_result(json!({"sha": "abc"})))).await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let body = json!({
        "jsonrpc": "2.0",
        "id": 42,
        "method": "tools/call",
        "params": {"name": "get_commit", "arguments": "not-an-object"}
    });
    let (status, response) = passthrough::handle(Some(&client), body.to_string().as_bytes()).await;

    assert_eq!(status, 200);
    assert_eq!(response.id, json!(42));
    assert_eq!(response.result.unwrap(), text_result(json!({"sha": "abc"})));
    assert_eq!(server.calls()[0].1, json!({}));
}

#[tokio::test]
async fn passthrough_reports_tool_failures() {
    let server = FakeToolServer::start(|_, _, _| ToolAction::Error {
        code: -32602,
        message: "unknown tool".to_string(),
        data: None,
    })
    .await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let body = json!({"id": "x", "method": "tools/call", "params": {"name": "nope"}});
    let (status, response) = passthrough::handle(Some(&client), body.to_string().as_bytes()).await;

    assert_eq!(status, 200);
    let error = response.error.unwrap();
    assert_eq!(error.code, -32000);
    assert!(error.message.starts_with("Tool execution failed: "));
    assert!(error.message.contains("unknown tool"));
}

#[tokio::test]
async fn create_or_update_file_returns_commit_sha() {
    let server = FakeToolServer::start(|_, args, _| {
        assert_eq!(args["sha"], "0d5a690c8fad5e605a6e8766295d9d459d65de42");
        ToolAction::Reply(text_result(json!({
            "content": {"path": "polkadot/values.yaml", "sha": "95b966ae1c166bd92f8ae7d1c313e738c731dfc3"},
            "commit": {"sha": "7638417db6d59f3c431d3e1f261cc637155684cd"}
        })))
    })
    .await;
    let client = ToolClient::new(server.client_config()).unwrap();

    let sha = client
        .create_or_update_file(
            "blockops",
            "infra",
            "polkadot/values.yaml",
            "image: parity/polkadot:v1.2.0\n",
            "Upgrade polkadot",
            "upgrade-1",
            Some("0d5a690c8fad5e605a6e8766295d9d459d65de42"),
        )
        .await
        .unwrap();
    assert_eq!(sha, "7638417db6d59f3c431d3e1f261cc637155684cd");
    assert_eq!(server.calls()[0].0, "create_or_update_file");
}
