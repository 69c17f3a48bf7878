//! HTTP-level tests against a mock Gemini upstream.

use std::sync::Arc;
use std::time::Duration;

use llxprt_core::{
    ConfigAccessor, ContentBlock, EphemeralConfig, IContent, InMemorySettingsService,
    NormalizedGenerateChatOptions, Provider, RetryOptions, RuntimeContext, RuntimeMetadata,
    RuntimeServices, SettingsService, collect_stream,
};
use llxprt_gemini::{GeminiConfig, GeminiProvider};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_provider() -> GeminiProvider {
    GeminiProvider::new(
        GeminiConfig {
            retry: RetryOptions {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                ..Default::default()
            },
            ..Default::default()
        },
        RuntimeServices::new(),
    )
}

fn options_for(server_uri: &str, contents: Vec<IContent>) -> NormalizedGenerateChatOptions {
    let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
    let config = Arc::new(EphemeralConfig::new());
    config.set_ephemeral_setting("auth-key", json!("g-test"));
    config.set_ephemeral_setting("base-url", json!(server_uri));
    let runtime = Arc::new(RuntimeContext::new(
        settings,
        Some(config as Arc<dyn ConfigAccessor>),
        "integration-run",
        RuntimeMetadata::default(),
    ));
    NormalizedGenerateChatOptions::normalize(
        contents,
        vec![],
        runtime,
        "gemini",
        "gemini-2.0-flash",
        None,
    )
}

#[tokio::test]
async fn streaming_text_and_function_call_decoded() {
    let server = MockServer::start().await;
    let body = "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Checking \"}]}}]}\n\n\
data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"functionCall\":{\"name\":\"get_weather\",\"args\":{\"city\":\"Oslo\"}}}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":6,\"candidatesTokenCount\":3}}\n\n";
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash:streamGenerateContent"))
        .and(header("x-goog-api-key", "g-test"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = fast_provider();
    let options = options_for(&server.uri(), vec![IContent::human("weather?")]);
    let stream = provider.generate_chat_completion(options).await.unwrap();
    let items = collect_stream(stream).await.unwrap();

    assert_eq!(items[0].text().as_deref(), Some("Checking "));
    assert!(matches!(
        &items[1].blocks[0],
        ContentBlock::ToolCall { id, name, parameters }
            if id.starts_with("hist_tool_") && name == "get_weather" && parameters["city"] == "Oslo"
    ));
    let usage = items
        .iter()
        .find_map(|i| i.metadata.as_ref().and_then(|m| m.usage))
        .unwrap();
    assert_eq!(usage.total_tokens, 9);
}

#[tokio::test]
async fn empty_history_sends_placeholder() {
    let server = MockServer::start().await;
    let body = "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"hi\"}]},\"finishReason\":\"STOP\"}]}\n\n";
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = fast_provider();
    let options = options_for(&server.uri(), vec![]);
    let stream = provider.generate_chat_completion(options).await.unwrap();
    collect_stream(stream).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(sent["contents"][0]["role"], "user");
    assert_eq!(sent["contents"][0]["parts"][0]["text"], "Hello");
}

#[tokio::test]
async fn server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "ok" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 1, "candidatesTokenCount": 1 }
        })))
        .mount(&server)
        .await;

    let provider = fast_provider();
    let mut options = options_for(&server.uri(), vec![IContent::human("hi")]);
    options
        .settings
        .ephemeral
        .insert("streaming".into(), json!("disabled"));

    let stream = provider.generate_chat_completion(options).await.unwrap();
    let items = collect_stream(stream).await.unwrap();
    assert_eq!(items[0].text().as_deref(), Some("ok"));
}
