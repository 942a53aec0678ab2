//! OpenAI backend tests against a mock HTTP server.

use jobline_core::{CallError, ChatMessage, CompletionBackend, CompletionRequest, JobFailure};
use jobline_inference::openai::{OpenAIBackend, OpenAIConfig};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(base_url: String) -> OpenAIBackend {
    OpenAIBackend::new(OpenAIConfig {
        base_url,
        api_key: Some("test-key".to_string()),
        model: "test-gen".to_string(),
        timeout_seconds: 5,
        skip_tls_verify: false,
    })
    .expect("Failed to create backend")
}

fn request() -> CompletionRequest {
    CompletionRequest {
        model: "test-gen".to_string(),
        messages: vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("hi"),
        ],
        max_tokens: 128,
        temperature: 0.7,
        priority: 5,
        user: Some("42".to_string()),
    }
}

#[tokio::test]
async fn test_completion_success_sends_contract_fields() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "test-gen",
            "max_tokens": 128,
            "priority": 5,
            "user": "42",
            "messages": [
                {"role": "system", "content": "You are a helpful assistant."},
                {"role": "user", "content": "hi"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-123",
            "model": "test-gen",
            "created": 1700000000,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let completion = backend(mock_server.uri())
        .complete(&request())
        .await
        .expect("completion should succeed");

    assert_eq!(completion.content, "Hello there");
    assert_eq!(completion.finish_reason, "stop");
    assert_eq!(completion.id.as_deref(), Some("chatcmpl-123"));
    assert_eq!(completion.usage.total_tokens, 15);
}

#[tokio::test]
async fn test_server_error_is_status_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"message": "upstream exploded", "type": "server_error", "code": null}
        })))
        .mount(&mock_server)
        .await;

    let err = backend(mock_server.uri())
        .complete(&request())
        .await
        .unwrap_err();

    match &err {
        CallError::Status { status, body } => {
            assert_eq!(*status, 500);
            assert_eq!(body, "upstream exploded");
        }
        other => panic!("expected status error, got {other:?}"),
    }
    assert!(err.is_retryable());
    assert_eq!(err.failure(), JobFailure::RemoteStatus(500));
}

#[tokio::test]
async fn test_gateway_timeout_classified_as_timeout() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(504).set_body_string("gateway timeout"))
        .mount(&mock_server)
        .await;

    let err = backend(mock_server.uri())
        .complete(&request())
        .await
        .unwrap_err();
    assert_eq!(err.failure(), JobFailure::TimedOut);
}

#[tokio::test]
async fn test_missing_choices_is_invalid_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "choices": [],
            "usage": {"prompt_tokens": 1, "completion_tokens": 0, "total_tokens": 1}
        })))
        .mount(&mock_server)
        .await;

    let err = backend(mock_server.uri())
        .complete(&request())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidResponse(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_non_json_body_is_invalid_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&mock_server)
        .await;

    let err = backend(mock_server.uri())
        .complete(&request())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_connection_refused_is_unreachable() {
    // Bind then drop a listener so the port is known to be closed.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let uri = format!("http://127.0.0.1:{port}");

    let err = backend(uri).complete(&request()).await.unwrap_err();
    assert!(
        matches!(err, CallError::Unreachable(_)),
        "expected unreachable, got {err:?}"
    );
    assert_eq!(err.failure().message(), "LLM service unreachable");
}

#[tokio::test]
async fn test_health_check() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&mock_server)
        .await;

    assert!(backend(mock_server.uri()).health_check().await);
}
