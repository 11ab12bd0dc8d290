use serde_json::{Map, Value, json};

use aether_protocol::gemini::{Operation, UsageMetadata};

use crate::internal::{
    InternalChatRequest, InternalChatResponse, InternalMessage, InternalStreamEvent,
    InternalUsage, InternalVideoPollResult, InternalVideoRequest, MessageRole, VideoStatus,
};
use crate::normalizer::{ParsedError, TransformError, TransformResult};

fn parts_text(parts: &Value) -> String {
    parts
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

pub fn chat_request_to_internal(body: &Value) -> TransformResult<InternalChatRequest> {
    let contents = body
        .get("contents")
        .and_then(Value::as_array)
        .ok_or(TransformError::MissingField("contents"))?;

    let system = body
        .get("systemInstruction")
        .or_else(|| body.get("system_instruction"))
        .map(|si| parts_text(si.get("parts").unwrap_or(&Value::Null)))
        .filter(|s| !s.is_empty());

    let messages = contents
        .iter()
        .map(|content| {
            let role = if content.get("role").and_then(Value::as_str) == Some("model") {
                MessageRole::Assistant
            } else {
                MessageRole::User
            };
            InternalMessage {
                role,
                text: parts_text(content.get("parts").unwrap_or(&Value::Null)),
            }
        })
        .collect();

    let generation = body.get("generationConfig").unwrap_or(&Value::Null);
    let stop = generation
        .get("stopSequences")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(InternalChatRequest {
        // The Gemini wire body has no model field; callers merge it from the path.
        model: body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        system,
        messages,
        max_tokens: generation.get("maxOutputTokens").and_then(Value::as_i64),
        temperature: generation.get("temperature").and_then(Value::as_f64),
        top_p: generation.get("topP").and_then(Value::as_f64),
        stop,
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        extra: Map::new(),
    })
}

pub fn chat_request_from_internal(req: &InternalChatRequest) -> Value {
    let contents: Vec<Value> = req
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
            };
            json!({"role": role, "parts": [{"text": message.text}]})
        })
        .collect();

    let mut out = Map::new();
    out.insert("contents".to_string(), Value::Array(contents));
    if let Some(system) = &req.system {
        out.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );
    }

    let mut generation = Map::new();
    if let Some(max_tokens) = req.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = req.temperature {
        generation.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = req.top_p {
        generation.insert("topP".to_string(), json!(top_p));
    }
    if !req.stop.is_empty() {
        generation.insert("stopSequences".to_string(), json!(req.stop));
    }
    if !generation.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(generation));
    }
    Value::Object(out)
}

pub fn chat_response_to_internal(body: &Value) -> InternalChatResponse {
    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    InternalChatResponse {
        id: body
            .get("responseId")
            .and_then(Value::as_str)
            .map(str::to_string),
        model: body
            .get("modelVersion")
            .and_then(Value::as_str)
            .map(str::to_string),
        text: candidate
            .and_then(|c| c.get("content"))
            .and_then(|content| content.get("parts"))
            .map(parts_text)
            .unwrap_or_default(),
        finish_reason: candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
            .map(str::to_string),
        usage: extract_usage(body).unwrap_or_default(),
    }
}

pub fn chat_response_from_internal(resp: &InternalChatResponse) -> Value {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": resp.text}]},
            "finishReason": map_finish_reason(resp.finish_reason.as_deref()),
            "index": 0,
        }],
        "usageMetadata": usage_from_internal(&resp.usage),
        "modelVersion": resp.model,
    })
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") | Some("max_tokens") | Some("MAX_TOKENS") => "MAX_TOKENS",
        _ => "STOP",
    }
}

pub fn usage_from_internal(usage: &InternalUsage) -> Value {
    let mut out = json!({
        "promptTokenCount": usage.input_tokens,
        "candidatesTokenCount": usage.output_tokens,
        "totalTokenCount": usage.input_tokens + usage.output_tokens,
    });
    if usage.cache_read_tokens > 0 {
        out["cachedContentTokenCount"] = json!(usage.cache_read_tokens);
    }
    out
}

pub fn extract_usage(body: &Value) -> Option<InternalUsage> {
    let raw = body.get("usageMetadata")?;
    let usage: UsageMetadata = serde_json::from_value(raw.clone()).ok()?;
    Some(InternalUsage {
        input_tokens: usage.prompt_token_count,
        output_tokens: usage.candidates_token_count,
        cache_read_tokens: usage.cached_content_token_count.unwrap_or(0),
        cache_creation_tokens: 0,
    })
}

pub fn extract_text(body: &Value) -> Option<String> {
    let candidate = body.get("candidates")?.as_array()?.first()?;
    let text = parts_text(candidate.get("content")?.get("parts")?);
    if text.is_empty() { None } else { Some(text) }
}

pub fn is_error_response(body: &Value) -> bool {
    body.get("error").is_some_and(|e| !e.is_null())
}

pub fn parse_error(body: &Value, status: u16) -> ParsedError {
    let error = body.get("error").cloned().unwrap_or_else(|| body.clone());
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .or(if status >= 400 { Some(status as i64) } else { None });
    ParsedError {
        error_type: code
            .map(|c| c.to_string())
            .or_else(|| {
                error
                    .get("status")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string(),
        code,
    }
}

pub fn decode_stream_chunk(chunk: &Value) -> Vec<InternalStreamEvent> {
    let mut out = Vec::new();
    if let Some(text) = extract_text(chunk) {
        out.push(InternalStreamEvent::TextDelta(text));
    }
    if let Some(reason) = chunk
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
    {
        out.push(InternalStreamEvent::Done {
            finish_reason: Some(reason.to_string()),
        });
    }
    if let Some(usage) = extract_usage(chunk) {
        out.push(InternalStreamEvent::Usage(usage));
    }
    out
}

// ---- Video (Veo-style long-running operations) ----

pub fn video_request_to_internal(body: &Value) -> TransformResult<InternalVideoRequest> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingField("model"))?
        .to_string();
    let instance = body
        .get("instances")
        .and_then(Value::as_array)
        .and_then(|i| i.first())
        .ok_or(TransformError::MissingField("instances"))?;
    let prompt = instance
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingField("instances[0].prompt"))?
        .to_string();

    let parameters = body.get("parameters").unwrap_or(&Value::Null);
    Ok(InternalVideoRequest {
        model,
        prompt,
        duration_seconds: parameters
            .get("durationSeconds")
            .and_then(Value::as_f64),
        resolution: parameters
            .get("resolution")
            .and_then(Value::as_str)
            .map(str::to_string),
        aspect_ratio: parameters
            .get("aspectRatio")
            .and_then(Value::as_str)
            .map(str::to_string),
        extra: Map::new(),
    })
}

pub fn video_request_from_internal(req: &InternalVideoRequest) -> Value {
    let mut parameters = Map::new();
    if let Some(duration) = req.duration_seconds {
        parameters.insert("durationSeconds".to_string(), json!(duration));
    }
    if let Some(resolution) = &req.resolution {
        parameters.insert("resolution".to_string(), Value::String(resolution.clone()));
    }
    if let Some(aspect_ratio) = &req.aspect_ratio {
        parameters.insert("aspectRatio".to_string(), Value::String(aspect_ratio.clone()));
    }
    json!({
        "instances": [{"prompt": req.prompt}],
        "parameters": Value::Object(parameters),
    })
}

pub fn video_poll_to_internal(body: &Value) -> InternalVideoPollResult {
    let operation: Operation = match serde_json::from_value(body.clone()) {
        Ok(op) => op,
        Err(_) => {
            return InternalVideoPollResult {
                status: VideoStatus::Failed,
                error_code: Some("invalid_poll_response".to_string()),
                error_message: Some("unparseable upstream operation payload".to_string()),
                raw_response: Some(body.clone()),
                ..Default::default()
            };
        }
    };

    if let Some(error) = operation.error {
        return InternalVideoPollResult {
            status: VideoStatus::Failed,
            error_code: Some(error.code.to_string()),
            error_message: Some(error.message),
            raw_response: Some(body.clone()),
            ..Default::default()
        };
    }

    if !operation.done {
        let progress = operation
            .metadata
            .as_ref()
            .and_then(|m| m.get("progressPercent"))
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        return InternalVideoPollResult {
            status: VideoStatus::Processing,
            progress_percent: progress,
            raw_response: Some(body.clone()),
            ..Default::default()
        };
    }

    let video_urls: Vec<String> = operation
        .response
        .as_ref()
        .and_then(|r| r.get("generateVideoResponse"))
        .and_then(|r| r.get("generatedSamples"))
        .and_then(Value::as_array)
        .map(|samples| {
            samples
                .iter()
                .filter_map(|sample| {
                    sample
                        .get("video")
                        .and_then(|v| v.get("uri"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default();

    if video_urls.is_empty() {
        return InternalVideoPollResult {
            status: VideoStatus::Failed,
            error_code: Some("missing_video_uri".to_string()),
            error_message: Some("operation completed without video output".to_string()),
            raw_response: Some(body.clone()),
            ..Default::default()
        };
    }

    InternalVideoPollResult {
        status: VideoStatus::Completed,
        progress_percent: 100,
        video_url: video_urls.first().cloned(),
        video_urls,
        expires_at: None,
        video_duration_seconds: operation
            .response
            .as_ref()
            .and_then(|r| r.get("generateVideoResponse"))
            .and_then(|r| r.get("durationSeconds"))
            .and_then(Value::as_f64),
        error_code: None,
        error_message: None,
        raw_response: Some(body.clone()),
    }
}
