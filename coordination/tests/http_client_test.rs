//! `CloudAgentsClient` against a scripted local HTTP responder.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arena_coordination::agent::{AgentTransport, LaunchRequest};
use arena_coordination::{ArenaError, CloudAgentsClient, EngineSettings, RetryPolicy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A request as the responder saw it.
#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    authorization: Option<String>,
    body: String,
}

struct Responder {
    base_url: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

/// Serve `responses` in order, one connection per request. Status `0`
/// reads the request and closes the socket without answering.
async fn serve(responses: Vec<(u16, &'static str)>) -> Responder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(Mutex::new(VecDeque::from(responses)));

    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let request = read_request(&mut socket).await;
            log.lock().unwrap().push(request);
            let (status, body) = queue.lock().unwrap().pop_front().unwrap_or((500, "{}"));
            if status == 0 {
                drop(socket);
                continue;
            }
            let response = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    Responder {
        base_url: format!("http://{addr}/v0"),
        seen,
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Seen {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if n == 0 {
            break buf.len();
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();

    let mut content_length = 0;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "authorization" => authorization = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    Seen {
        method,
        path,
        authorization,
        body,
    }
}

fn client(base_url: &str) -> CloudAgentsClient {
    let settings = EngineSettings {
        api_base_url: base_url.to_string(),
        request_timeout_secs: 5,
        ..EngineSettings::default()
    };
    CloudAgentsClient::new("test-key", &settings)
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        })
}

// ── Requests ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_launch_sends_prompt_source_and_model() {
    let server = serve(vec![(
        200,
        r#"{"id": "bc-42", "target": {"branchName": "cursor/arena-a"}}"#,
    )])
    .await;
    let client = client(&server.base_url);

    let launched = client
        .launch(&LaunchRequest {
            prompt: "You are agent_a.".into(),
            repository: "octo/widgets".into(),
            base_ref: "main".into(),
            model: Some("claude-4.6-opus-high-thinking".into()),
        })
        .await
        .unwrap();
    assert_eq!(launched.handle, "bc-42");
    assert_eq!(launched.branch_hint.as_deref(), Some("cursor/arena-a"));

    let seen = server.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path, "/v0/agents");
    assert_eq!(seen[0].authorization.as_deref(), Some("Basic dGVzdC1rZXk6"));

    let body: serde_json::Value = serde_json::from_str(&seen[0].body).unwrap();
    assert_eq!(body["prompt"]["text"], "You are agent_a.");
    assert_eq!(body["source"]["repository"], "https://github.com/octo/widgets");
    assert_eq!(body["source"]["ref"], "main");
    assert_eq!(body["model"], "claude-4.6-opus-high-thinking");
}

#[tokio::test]
async fn test_status_and_conversation_parsing() {
    let server = serve(vec![
        (
            200,
            r#"{"status": "RUNNING", "target": {"branchName": "cursor/x"}, "summary": "halfway"}"#,
        ),
        (
            200,
            r#"{"messages": [
                {"id": "m1", "type": "user_message", "text": "go"},
                {"id": "m2", "type": "assistant_message", "text": "done", "usage": {"total_tokens": 321}}
            ]}"#,
        ),
    ])
    .await;
    let client = client(&server.base_url);

    let snapshot = client.status("bc-7").await.unwrap();
    assert_eq!(snapshot.status, "RUNNING");
    assert_eq!(snapshot.branch_name.as_deref(), Some("cursor/x"));
    assert_eq!(snapshot.summary.as_deref(), Some("halfway"));

    let messages = client.conversation("bc-7").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(!messages[0].is_agent_authored());
    assert!(messages[1].is_agent_authored());
    assert_eq!(messages[1].body(), "done");
    assert_eq!(messages[1].total_tokens(), 321);

    let seen = server.seen.lock().unwrap().clone();
    assert_eq!(seen[0].path, "/v0/agents/bc-7");
    assert_eq!(seen[1].path, "/v0/agents/bc-7/conversation");
}

// ── Retries ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = serve(vec![
        (503, "unavailable"),
        (429, "slow down"),
        (200, r#"{"id": "bc-1"}"#),
    ])
    .await;
    let client = client(&server.base_url);

    client.follow_up("bc-1", "Revise.").await.unwrap();

    let seen = server.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|s| s.path == "/v0/agents/bc-1/followup"));
    let body: serde_json::Value = serde_json::from_str(&seen[2].body).unwrap();
    assert_eq!(body["prompt"]["text"], "Revise.");
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = serve(vec![(400, "bad model"), (200, "{}")]).await;
    let client = client(&server.base_url);

    let err = client.follow_up("bc-1", "Revise.").await.unwrap_err();
    match err {
        ArenaError::Http { status, body, .. } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad model");
        }
        other => panic!("expected Http 400, got {other:?}"),
    }
    assert_eq!(server.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let server = serve(vec![(502, "a"), (502, "b"), (502, "c"), (502, "d"), (504, "e")]).await;
    let client = client(&server.base_url);

    let err = client.status("bc-1").await.unwrap_err();
    assert!(matches!(err, ArenaError::Http { status: 504, .. }));
    assert_eq!(server.seen.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn test_connection_refused_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{addr}/v0"))
        .status("bc-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ArenaError::Connection { .. }), "{err:?}");
}

#[tokio::test]
async fn test_dropped_connection_is_retried() {
    let server = serve(vec![(0, ""), (0, ""), (200, r#"{"status": "FINISHED"}"#)]).await;
    let client = client(&server.base_url);

    let snapshot = client.status("bc-1").await.unwrap();
    assert_eq!(snapshot.status, "FINISHED");
    assert_eq!(server.seen.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_dropped_connections_exhaust_retry_budget() {
    let server = serve(vec![(0, ""); 5]).await;
    let client = client(&server.base_url);

    let err = client.status("bc-1").await.unwrap_err();
    assert!(matches!(err, ArenaError::Connection { .. }), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(server.seen.lock().unwrap().len(), 5);
}
