use serde_json::Value;

use crate::headers::{Headers, header_get};
use crate::signature::{
    ApiFamily, AuthMethod, EndpointKind, EndpointSignature, EndpointType,
};

/// What the gateway knows about an inbound request before scheduling:
/// data format, functional category, auth method and the raw credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub endpoint: EndpointSignature,
    pub endpoint_type: EndpointType,
    pub auth_method: AuthMethod,
    pub credential: Option<String>,
}

fn detect_endpoint_type(path: &str) -> EndpointType {
    let normalized = path.to_ascii_lowercase();

    if normalized.starts_with("/upload/v1beta/files") || normalized.starts_with("/v1beta/files") {
        return EndpointType::Files;
    }
    if normalized.starts_with("/v1/videos")
        || (normalized.starts_with("/v1beta/") && normalized.contains("predictlongrunning"))
    {
        return EndpointType::Video;
    }
    // Gemini operations (video polling) also classify as video.
    if normalized.starts_with("/v1beta/operations") {
        return EndpointType::Video;
    }
    if normalized.starts_with("/v1/models") {
        return EndpointType::Models;
    }
    if normalized.contains("/embeddings") {
        return EndpointType::Embedding;
    }
    if normalized.contains("/images") {
        return EndpointType::Image;
    }
    if normalized.contains("/audio") {
        return EndpointType::Audio;
    }
    EndpointType::Chat
}

fn detect_data_format(
    path: &str,
    headers: &Headers,
    query: &[(String, String)],
) -> EndpointSignature {
    let normalized = path.to_ascii_lowercase();
    let endpoint_type = detect_endpoint_type(path);

    // Claude chat/cli share /v1/messages; the auth header separates them.
    if normalized.starts_with("/v1/messages") {
        let kind = match header_get(headers, "authorization") {
            Some(auth) if auth.len() >= 7 && auth[..7].eq_ignore_ascii_case("bearer ") => {
                EndpointKind::Cli
            }
            _ => EndpointKind::Chat,
        };
        return EndpointSignature::new(ApiFamily::Claude, kind);
    }

    if normalized.contains("/responses") {
        return EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Cli);
    }

    if normalized.starts_with("/v1beta/") || normalized.starts_with("/upload/v1beta/") {
        let kind = if endpoint_type == EndpointType::Video {
            EndpointKind::Video
        } else {
            EndpointKind::Chat
        };
        return EndpointSignature::new(ApiFamily::Gemini, kind);
    }

    if normalized.starts_with("/v1/videos") {
        return EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Video);
    }
    if normalized.starts_with("/v1/chat/completions") {
        return EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat);
    }

    // Fallback (mostly /v1/models): guess the family from auth material.
    let (sig, _credential) = detect_format_from_request(headers, query);
    sig
}

fn detect_auth_method(
    headers: &Headers,
    query: &[(String, String)],
) -> (AuthMethod, Option<String>) {
    if let Some((_, key)) = query.iter().find(|(k, _)| k == "key") {
        return (AuthMethod::QueryKey, Some(key.clone()));
    }
    if let Some(key) = header_get(headers, "x-goog-api-key") {
        return (AuthMethod::GoogApiKey, Some(key.to_string()));
    }
    if let Some(key) = header_get(headers, "x-api-key") {
        return (AuthMethod::ApiKey, Some(key.to_string()));
    }
    if let Some(auth) = header_get(headers, "authorization")
        && auth.len() >= 7
        && auth[..7].eq_ignore_ascii_case("bearer ")
    {
        return (AuthMethod::Bearer, Some(auth[7..].trim().to_string()));
    }
    (AuthMethod::Bearer, None)
}

/// Header-based family heuristic, used when the path is ambiguous.
///
/// Priority: `x-api-key` + `anthropic-version` => claude; `?key=` or
/// `x-goog-api-key` => gemini; bearer or a lone `x-api-key` => openai.
pub fn detect_format_from_request(
    headers: &Headers,
    query: &[(String, String)],
) -> (EndpointSignature, Option<String>) {
    if let Some(key) = header_get(headers, "x-api-key")
        && header_get(headers, "anthropic-version").is_some()
    {
        return (
            EndpointSignature::new(ApiFamily::Claude, EndpointKind::Chat),
            Some(key.to_string()),
        );
    }

    if let Some((_, key)) = query.iter().find(|(k, _)| k == "key") {
        return (
            EndpointSignature::new(ApiFamily::Gemini, EndpointKind::Chat),
            Some(key.clone()),
        );
    }
    if let Some(key) = header_get(headers, "x-goog-api-key") {
        return (
            EndpointSignature::new(ApiFamily::Gemini, EndpointKind::Chat),
            Some(key.to_string()),
        );
    }

    if let Some(auth) = header_get(headers, "authorization")
        && auth.len() >= 7
        && auth[..7].eq_ignore_ascii_case("bearer ")
    {
        return (
            EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat),
            Some(auth[7..].trim().to_string()),
        );
    }

    // Some clients carry an OpenAI token in x-api-key.
    let key = header_get(headers, "x-api-key").map(str::to_string);
    (
        EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat),
        key,
    )
}

/// Classify an inbound request. Headers must be lowercase-normalized.
pub fn detect_request_context(
    path: &str,
    headers: &Headers,
    query: &[(String, String)],
) -> RequestContext {
    let endpoint_type = detect_endpoint_type(path);
    let endpoint = detect_data_format(path, headers, query);
    let (auth_method, credential) = detect_auth_method(headers, query);
    RequestContext {
        endpoint,
        endpoint_type,
        auth_method,
        credential,
    }
}

/// Best-effort family sniffing on a response body.
pub fn detect_format_from_response(body: &Value) -> Option<EndpointSignature> {
    if body.get("type").and_then(Value::as_str) == Some("message") {
        return Some(EndpointSignature::new(ApiFamily::Claude, EndpointKind::Chat));
    }
    if let Some(content) = body.get("content").and_then(Value::as_array)
        && content
            .first()
            .and_then(|c| c.get("type"))
            .and_then(Value::as_str)
            .is_some_and(|t| t == "text" || t == "tool_use")
    {
        return Some(EndpointSignature::new(ApiFamily::Claude, EndpointKind::Chat));
    }
    if body.get("choices").is_some() {
        return Some(EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat));
    }
    if body.get("candidates").is_some() {
        return Some(EndpointSignature::new(ApiFamily::Gemini, EndpointKind::Chat));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn claude_messages_splits_on_auth_header() {
        let chat = detect_request_context(
            "/v1/messages",
            &headers(&[("x-api-key", "k"), ("anthropic-version", "2023-06-01")]),
            &[],
        );
        assert_eq!(chat.endpoint.key(), "claude:chat");
        assert_eq!(chat.auth_method, AuthMethod::ApiKey);

        let cli = detect_request_context(
            "/v1/messages",
            &headers(&[("authorization", "Bearer tok")]),
            &[],
        );
        assert_eq!(cli.endpoint.key(), "claude:cli");
    }

    #[test]
    fn video_paths_classify_as_video() {
        let sora = detect_request_context(
            "/v1/videos",
            &headers(&[("authorization", "Bearer tok")]),
            &[],
        );
        assert_eq!(sora.endpoint_type, EndpointType::Video);
        assert_eq!(sora.endpoint.key(), "openai:video");

        let veo = detect_request_context(
            "/v1beta/models/veo-3:predictLongRunning",
            &headers(&[]),
            &[("key".to_string(), "g".to_string())],
        );
        assert_eq!(veo.endpoint_type, EndpointType::Video);
        assert_eq!(veo.endpoint.key(), "gemini:video");
        assert_eq!(veo.auth_method, AuthMethod::QueryKey);

        let ops = detect_request_context("/v1beta/operations/abc", &headers(&[]), &[]);
        assert_eq!(ops.endpoint_type, EndpointType::Video);
    }

    #[test]
    fn openai_paths_detect() {
        let ctx = detect_request_context(
            "/v1/chat/completions",
            &headers(&[("authorization", "Bearer sk-1")]),
            &[],
        );
        assert_eq!(ctx.endpoint.key(), "openai:chat");
        assert_eq!(ctx.endpoint_type, EndpointType::Chat);

        let cli = detect_request_context(
            "/v1/responses",
            &headers(&[("authorization", "Bearer sk-1")]),
            &[],
        );
        assert_eq!(cli.endpoint.key(), "openai:cli");
    }

    #[test]
    fn models_path_falls_back_to_auth_heuristic() {
        let ctx = detect_request_context(
            "/v1/models",
            &headers(&[("x-goog-api-key", "g")]),
            &[],
        );
        assert_eq!(ctx.endpoint_type, EndpointType::Models);
        assert_eq!(ctx.endpoint.api_family, ApiFamily::Gemini);
    }

    #[test]
    fn response_sniffing_covers_families() {
        assert_eq!(
            detect_format_from_response(&json!({"type": "message"})).unwrap().key(),
            "claude:chat"
        );
        assert_eq!(
            detect_format_from_response(&json!({"choices": []})).unwrap().key(),
            "openai:chat"
        );
        assert_eq!(
            detect_format_from_response(&json!({"candidates": []})).unwrap().key(),
            "gemini:chat"
        );
        assert_eq!(detect_format_from_response(&json!({"ok": true})), None);
    }
}
