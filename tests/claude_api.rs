//! Anthropic Messages client against a mock HTTP server.

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use segretario::claude::{Client, Error, LanguageModel, Message};

fn client(server: &MockServer) -> Client {
    Client::new("sk-test".to_string(), "claude-test".to_string()).with_base_url(server.uri())
}

#[tokio::test]
async fn test_complete_sends_system_and_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-test",
            "system": "be terse",
            "temperature": 0.0,
            "max_tokens": 100,
            "messages": [{ "role": "user", "content": "ciao" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "content": [{ "type": "text", "text": "{\"intent\": \"unrelated\"}" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let text = client(&server)
        .complete("be terse", &[Message::user("ciao")], 100)
        .await
        .unwrap();
    assert_eq!(text, r#"{"intent": "unrelated"}"#);
}

#[tokio::test]
async fn test_api_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = client(&server).complete("s", &[Message::user("x")], 10).await.unwrap_err();
    assert!(matches!(err, Error::Api(ref msg) if msg.contains("overloaded")));
}

#[tokio::test]
async fn test_empty_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "content": [] })))
        .mount(&server)
        .await;

    let err = client(&server).complete("s", &[Message::user("x")], 10).await.unwrap_err();
    assert!(matches!(err, Error::Empty));
}

#[tokio::test]
async fn test_malformed_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
        .mount(&server)
        .await;

    let err = client(&server).complete("s", &[Message::user("x")], 10).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
}
