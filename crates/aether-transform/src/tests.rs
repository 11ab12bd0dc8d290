use serde_json::{Value, json};

use aether_protocol::parse_signature_key;

use crate::internal::{InternalStreamEvent, MessageRole, VideoStatus};
use crate::normalizer::Normalizer;
use crate::registry::ConversionRegistry;

fn sig(key: &str) -> aether_protocol::EndpointSignature {
    parse_signature_key(key).unwrap()
}

#[test]
fn openai_request_to_claude_and_back_preserves_semantics() {
    let registry = ConversionRegistry::new();
    let original = json!({
        "model": "gpt-4o",
        "messages": [
            {"role": "system", "content": "be terse"},
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
            {"role": "user", "content": [{"type": "text", "text": "again"}]},
        ],
        "max_tokens": 128,
        "temperature": 0.5,
        "stream": true,
    });

    let claude = registry
        .convert_chat_request(&original, sig("openai:chat"), sig("claude:chat"))
        .unwrap();
    assert_eq!(claude["system"], "be terse");
    assert_eq!(claude["messages"].as_array().unwrap().len(), 3);
    assert_eq!(claude["max_tokens"], 128);
    assert_eq!(claude["stream"], true);

    let back = registry
        .convert_chat_request(&claude, sig("claude:chat"), sig("openai:chat"))
        .unwrap();
    let internal = Normalizer::OpenAI.chat_request_to_internal(&back).unwrap();
    assert_eq!(internal.system.as_deref(), Some("be terse"));
    assert_eq!(internal.messages.len(), 3);
    assert_eq!(internal.messages[0].role, MessageRole::User);
    assert_eq!(internal.messages[0].text, "hi");
    assert_eq!(internal.messages[1].role, MessageRole::Assistant);
    assert_eq!(internal.messages[2].text, "again");
    assert_eq!(internal.max_tokens, Some(128));
}

#[test]
fn claude_request_to_gemini_keeps_roles_and_limits() {
    let registry = ConversionRegistry::new();
    let claude = json!({
        "model": "claude-sonnet-4",
        "system": "speak French",
        "messages": [
            {"role": "user", "content": "bonjour"},
            {"role": "assistant", "content": [{"type": "text", "text": "salut"}]},
        ],
        "max_tokens": 64,
    });

    let gemini = registry
        .convert_chat_request(&claude, sig("claude:chat"), sig("gemini:chat"))
        .unwrap();
    let contents = gemini["contents"].as_array().unwrap();
    assert_eq!(contents.len(), 2);
    assert_eq!(contents[0]["role"], "user");
    assert_eq!(contents[1]["role"], "model");
    assert_eq!(contents[1]["parts"][0]["text"], "salut");
    assert_eq!(
        gemini["systemInstruction"]["parts"][0]["text"],
        "speak French"
    );
    assert_eq!(gemini["generationConfig"]["maxOutputTokens"], 64);
}

#[test]
fn response_roundtrip_preserves_token_counts() {
    let registry = ConversionRegistry::new();
    let openai = json!({
        "id": "chatcmpl-1",
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "fine."},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
    });

    let claude = registry.convert_chat_response(&openai, sig("openai:chat"), sig("claude:chat"));
    assert_eq!(claude["type"], "message");
    assert_eq!(claude["content"][0]["text"], "fine.");
    assert_eq!(claude["usage"]["input_tokens"], 10);
    assert_eq!(claude["usage"]["output_tokens"], 5);

    let back = registry.convert_chat_response(&claude, sig("claude:chat"), sig("openai:chat"));
    assert_eq!(back["usage"]["prompt_tokens"], 10);
    assert_eq!(back["usage"]["completion_tokens"], 5);
    assert_eq!(back["choices"][0]["message"]["content"], "fine.");
}

#[test]
fn can_convert_full_matrix() {
    let registry = ConversionRegistry::new();
    assert!(registry.can_convert_full(sig("claude:chat"), sig("openai:chat"), true));
    assert!(registry.can_convert_full(sig("gemini:chat"), sig("claude:chat"), true));
    assert!(registry.can_convert_full(sig("claude:cli"), sig("claude:chat"), true));
    assert!(registry.can_convert_full(sig("gemini:video"), sig("openai:video"), false));
    assert!(!registry.can_convert_full(sig("gemini:video"), sig("openai:video"), true));
    assert!(!registry.can_convert_full(sig("openai:chat"), sig("openai:video"), false));
}

#[test]
fn openai_stream_converts_to_claude_frames() {
    let registry = ConversionRegistry::new();
    let mut converter = registry.stream_converter(sig("openai:chat"), sig("claude:chat"));

    let start = converter.convert_event(
        None,
        r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
    );
    assert!(start.iter().any(|f| f.contains("message_start")));
    assert!(start.iter().any(|f| f.contains("content_block_start")));

    let delta = converter.convert_event(
        None,
        r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"hel"},"finish_reason":null}]}"#,
    );
    assert_eq!(delta.len(), 1);
    assert!(delta[0].contains("content_block_delta"));
    assert!(delta[0].contains("hel"));

    converter.convert_event(
        None,
        r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
    );
    converter.convert_event(
        None,
        r#"{"id":"c1","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
    );

    let tail = converter.finish();
    let joined = tail.join("");
    assert!(joined.contains("message_delta"));
    assert!(joined.contains("\"output_tokens\":5"));
    assert!(joined.contains("\"input_tokens\":10"));
    assert!(joined.contains("message_stop"));
    assert_eq!(converter.usage().input_tokens, 10);
}

#[test]
fn claude_stream_converts_to_openai_frames() {
    let registry = ConversionRegistry::new();
    let mut converter = registry.stream_converter(sig("claude:chat"), sig("openai:chat"));

    converter.convert_event(
        Some("message_start"),
        r#"{"type":"message_start","message":{"id":"m1","model":"claude-sonnet-4","usage":{"input_tokens":7,"output_tokens":0}}}"#,
    );
    let delta = converter.convert_event(
        Some("content_block_delta"),
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"yo"}}"#,
    );
    assert!(delta[0].starts_with("data: "));
    assert!(delta[0].contains("\"content\":\"yo\""));

    converter.convert_event(
        Some("message_delta"),
        r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}"#,
    );
    converter.convert_event(Some("message_stop"), r#"{"type":"message_stop"}"#);

    let tail = converter.finish().join("");
    assert!(tail.contains("\"finish_reason\":\"stop\""));
    assert!(tail.contains("\"prompt_tokens\":7"));
    assert!(tail.contains("\"completion_tokens\":3"));
    assert!(tail.ends_with("data: [DONE]\n\n"));
}

#[test]
fn gemini_video_request_converts_to_sora_shape() {
    let registry = ConversionRegistry::new();
    let body = json!({
        "model": "veo-3.0-generate-001",
        "instances": [{"prompt": "a cat on a piano"}],
        "parameters": {"durationSeconds": 8, "resolution": "720p", "aspectRatio": "16:9"},
    });
    let converted = registry
        .convert_video_request(&body, sig("gemini:video"), sig("openai:video"))
        .unwrap();
    assert_eq!(converted["prompt"], "a cat on a piano");
    // Sora takes seconds as a string.
    assert_eq!(converted["seconds"], Value::String("8".to_string()));
    assert_eq!(converted["size"], "720p");
}

#[test]
fn gemini_operation_poll_maps_to_internal() {
    let done = json!({
        "name": "operations/abc",
        "done": true,
        "response": {
            "generateVideoResponse": {
                "generatedSamples": [{"video": {"uri": "https://files.example/v.mp4"}}],
                "durationSeconds": 8.0,
            }
        }
    });
    let result = Normalizer::Gemini.video_poll_to_internal(&done);
    assert_eq!(result.status, VideoStatus::Completed);
    assert_eq!(result.video_url.as_deref(), Some("https://files.example/v.mp4"));
    assert_eq!(result.video_duration_seconds, Some(8.0));

    let pending = json!({"name": "operations/abc", "done": false, "metadata": {"progressPercent": 40}});
    let result = Normalizer::Gemini.video_poll_to_internal(&pending);
    assert_eq!(result.status, VideoStatus::Processing);
    assert_eq!(result.progress_percent, 40);

    let failed = json!({"name": "operations/abc", "done": true, "error": {"code": 400, "message": "bad prompt"}});
    let result = Normalizer::Gemini.video_poll_to_internal(&failed);
    assert_eq!(result.status, VideoStatus::Failed);
    assert_eq!(result.error_code.as_deref(), Some("400"));
}

#[test]
fn error_detection_per_family() {
    assert!(Normalizer::Gemini.is_error_response(&json!({"error": {"code": 429, "message": "quota"}})));
    assert!(Normalizer::Claude.is_error_response(
        &json!({"type": "error", "error": {"type": "overloaded_error", "message": "busy"}})
    ));
    assert!(Normalizer::OpenAI.is_error_response(&json!({"error": {"message": "bad key"}})));
    assert!(!Normalizer::OpenAI.is_error_response(&json!({"choices": []})));

    let parsed = Normalizer::Gemini.parse_error(&json!({"error": {"code": 429, "message": "quota", "status": "RESOURCE_EXHAUSTED"}}), 200);
    assert_eq!(parsed.code, Some(429));
    assert_eq!(parsed.error_type.as_deref(), Some("429"));
    assert_eq!(parsed.message, "quota");
}

#[test]
fn stream_decode_emits_usage_events() {
    let chunk = json!({
        "candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "STOP"}],
        "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6},
    });
    let events = Normalizer::Gemini.decode_stream_chunk(None, &chunk);
    assert!(events.iter().any(|e| matches!(e, InternalStreamEvent::TextDelta(t) if t == "hi")));
    assert!(events.iter().any(|e| matches!(e, InternalStreamEvent::Usage(u) if u.input_tokens == 4)));
    assert!(events.iter().any(|e| matches!(e, InternalStreamEvent::Done { .. })));
}
