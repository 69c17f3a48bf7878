//! HTTP-level tests against a mock chat-completions upstream.

use std::sync::Arc;
use std::time::Duration;

use llxprt_core::{
    ConfigAccessor, ContentBlock, EphemeralConfig, IContent, InMemorySettingsService,
    NormalizedGenerateChatOptions, Provider, RetryOptions, RuntimeContext, RuntimeMetadata,
    RuntimeServices, SettingsService, collect_stream,
};
use llxprt_openai::{OpenAiConfig, OpenAiProvider};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_provider() -> OpenAiProvider {
    OpenAiProvider::new(
        OpenAiConfig {
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

fn options_for(server_uri: &str) -> NormalizedGenerateChatOptions {
    let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
    let config = Arc::new(EphemeralConfig::new());
    config.set_ephemeral_setting("auth-key", json!("sk-test"));
    config.set_ephemeral_setting("base-url", json!(server_uri));
    let runtime = Arc::new(RuntimeContext::new(
        settings,
        Some(config as Arc<dyn ConfigAccessor>),
        "integration-run",
        RuntimeMetadata::default(),
    ));
    NormalizedGenerateChatOptions::normalize(
        vec![IContent::human("hi")],
        vec![],
        runtime,
        "openai",
        "gpt-4o",
        None,
    )
}

#[tokio::test]
async fn streaming_text_and_usage_decoded() {
    let server = MockServer::start().await;
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n\
data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n\
data: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-4o", "stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = fast_provider();
    let stream = provider
        .generate_chat_completion(options_for(&server.uri()))
        .await
        .unwrap();
    let items = collect_stream(stream).await.unwrap();

    let text: String = items.iter().filter_map(IContent::text).collect();
    assert_eq!(text, "Hello");
    let usage = items
        .iter()
        .find_map(|i| i.metadata.as_ref().and_then(|m| m.usage))
        .unwrap();
    assert_eq!(usage.prompt_tokens, 5);
    assert_eq!(usage.completion_tokens, 2);
}

#[tokio::test]
async fn streaming_tool_call_assembled_across_chunks() {
    let server = MockServer::start().await;
    let body = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_w\",\"type\":\"function\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"\"}}]},\"finish_reason\":null}]}\n\n\
data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\":\\\"Oslo\\\"}\"}}]},\"finish_reason\":null}]}\n\n\
data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n\
data: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = fast_provider();
    let stream = provider
        .generate_chat_completion(options_for(&server.uri()))
        .await
        .unwrap();
    let items = collect_stream(stream).await.unwrap();

    assert_eq!(items.len(), 1);
    assert!(matches!(
        &items[0].blocks[0],
        ContentBlock::ToolCall { id, name, parameters }
            if id == "hist_tool_w" && name == "get_weather" && parameters["city"] == "Oslo"
    ));
}

#[tokio::test]
async fn non_streaming_path_reads_single_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "four", "tool_calls": null },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 8, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let provider = fast_provider();
    let mut options = options_for(&server.uri());
    options
        .settings
        .ephemeral
        .insert("streaming".into(), json!("disabled"));

    let stream = provider.generate_chat_completion(options).await.unwrap();
    let items = collect_stream(stream).await.unwrap();
    assert_eq!(items[0].text().as_deref(), Some("four"));
    assert_eq!(
        items[1].metadata.as_ref().unwrap().usage.unwrap().total_tokens,
        9
    );
}
