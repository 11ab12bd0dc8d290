use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use aether_common::{GatewayConfig, GatewayError, GatewayResult, sanitize_error_message};
use aether_protocol::{
    EndpointKind, EndpointSignature, Headers, build_auth_headers, header_set,
    resolve_endpoint_definition,
};
use aether_storage::Storage;
use aether_transform::ConversionRegistry;

use crate::cipher::SecretCipher;
use crate::scheduler::{CacheAwareScheduler, Candidate};
use crate::stream::{
    LineStream, SharedStreamContext, StreamContext, StreamProcessor, shared_context,
};
use crate::upstream_client::{
    HttpMethod, UpstreamBody, UpstreamClient, UpstreamHttpRequest, UpstreamHttpResponse,
};
use crate::usage::UsageService;

/// Authenticated caller identity attached to a dispatch.
#[derive(Debug, Clone, Copy)]
pub struct CallerIdentity {
    pub user_id: i64,
    pub api_key_id: i64,
}

pub enum DispatchBody {
    Bytes(Bytes),
    /// Streaming body; read it from the channel until it closes.
    Stream(mpsc::Receiver<Bytes>),
}

pub struct ChatDispatchOutcome {
    pub status: u16,
    pub content_type: &'static str,
    pub body: DispatchBody,
    pub ctx: SharedStreamContext,
}

/// Request dispatch: candidate selection, upstream call, per-attempt retry
/// with in-stream error recovery, and settlement.
pub struct DispatchEngine {
    storage: Arc<dyn Storage>,
    client: Arc<dyn UpstreamClient>,
    cipher: Arc<dyn SecretCipher>,
    config: GatewayConfig,
    scheduler: CacheAwareScheduler,
    registry: ConversionRegistry,
}

impl DispatchEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        client: Arc<dyn UpstreamClient>,
        cipher: Arc<dyn SecretCipher>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            storage,
            client,
            cipher,
            config,
            scheduler: CacheAwareScheduler::new(),
            registry: ConversionRegistry::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn UpstreamClient> {
        &self.client
    }

    pub fn cipher(&self) -> &Arc<dyn SecretCipher> {
        &self.cipher
    }

    pub async fn authenticate(&self, api_key: &str) -> Option<CallerIdentity> {
        let (user, key) = self.storage.find_user_key(api_key).await.ok().flatten()?;
        Some(CallerIdentity {
            user_id: user.id,
            api_key_id: key.id,
        })
    }

    /// Serve one chat/cli request, failing over across candidates until a
    /// healthy stream (or body) is produced.
    pub async fn dispatch_chat(
        &self,
        request_id: &str,
        caller: CallerIdentity,
        client_format: EndpointSignature,
        task_type: &str,
        body: Value,
        is_stream: bool,
    ) -> GatewayResult<ChatDispatchOutcome> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidRequest("missing model".to_string()))?
            .to_string();

        let bundles = self
            .storage
            .load_provider_bundles()
            .await
            .map_err(|e| GatewayError::Upstream(format!("provider load failed: {e}")))?;
        let candidates = self.scheduler.build_candidates(
            &bundles,
            client_format,
            &model,
            None,
            is_stream,
            self.config.enable_format_conversion,
        );
        if candidates.is_empty() {
            return Err(GatewayError::ProviderNotAvailable(format!(
                "no endpoint accepts {} for model {model}",
                client_format.key()
            )));
        }

        let started = Instant::now();
        let ctx = shared_context(StreamContext::new(model.clone(), client_format.key()));
        let mut last_error: Option<GatewayError> = None;

        for candidate in candidates.iter().take(self.config.max_candidates) {
            if let Ok(mut guard) = ctx.lock() {
                guard.reset_for_retry();
                guard.update_provider_info(
                    &candidate.provider_name,
                    candidate.provider_id,
                    candidate.endpoint.id,
                    candidate.key.id,
                    Some(candidate.provider_api_format.clone()),
                );
                guard.attempt_id = Some(uuid::Uuid::new_v4().to_string());
            }

            match self
                .attempt_chat(request_id, caller, client_format, task_type, &body, is_stream, candidate, &ctx, started)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        request_id,
                        provider = %candidate.provider_name,
                        endpoint_id = candidate.endpoint.id,
                        kind = err.kind(),
                        error = %err,
                        "attempt failed, trying next candidate"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::ProviderNotAvailable("all candidates exhausted".to_string())
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_chat(
        &self,
        request_id: &str,
        caller: CallerIdentity,
        client_format: EndpointSignature,
        task_type: &str,
        body: &Value,
        is_stream: bool,
        candidate: &Candidate,
        ctx: &SharedStreamContext,
        started: Instant,
    ) -> GatewayResult<ChatDispatchOutcome> {
        let provider_sig = candidate
            .endpoint_signature()
            .ok_or_else(|| GatewayError::ProviderNotAvailable("bad endpoint signature".into()))?;

        let mut upstream_body = if candidate.needs_conversion {
            let mut converted = self
                .registry
                .convert_chat_request(body, client_format, provider_sig)
                .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
            if is_stream && let Some(object) = converted.as_object_mut() {
                object.insert("stream".to_string(), Value::Bool(true));
            }
            converted
        } else {
            body.clone()
        };
        apply_body_rules(&mut upstream_body, candidate.endpoint.body_rules.as_ref());
        // Gemini carries the model in the URL; a model field in the body is
        // ours and must not reach the upstream.
        if provider_sig.api_family == aether_protocol::ApiFamily::Gemini
            && let Some(object) = upstream_body.as_object_mut()
        {
            object.remove("model");
        }

        let model = ctx
            .lock()
            .map(|guard| guard.model.clone())
            .unwrap_or_default();
        let url = build_chat_url(provider_sig, &candidate.endpoint.base_url, &model, is_stream);
        let headers = self.build_upstream_headers(candidate, provider_sig)?;
        if let Ok(mut guard) = ctx.lock() {
            guard.provider_request_headers = redact_auth(&headers);
            guard.provider_request_body = Some(upstream_body.clone());
        }

        let request = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(Bytes::from(serde_json::to_vec(&upstream_body).unwrap_or_default())),
            stream: is_stream,
            timeout: None,
        };

        let response = self.client.send(request).await?;
        if response.status >= 400 {
            let (status, text) = error_snippet(response).await;
            return Err(GatewayError::ProviderNotAvailable(format!(
                "upstream status {status}: {}",
                sanitize_error_message(&text)
            )));
        }

        if let Ok(mut guard) = ctx.lock() {
            guard.status_code = response.status;
            guard.response_headers = response.headers.clone();
        }

        if is_stream {
            self.stream_outcome(request_id, caller, client_format, task_type, candidate, response, ctx, started)
                .await
        } else {
            self.buffered_outcome(request_id, caller, client_format, task_type, candidate, response, ctx, started)
                .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn buffered_outcome(
        &self,
        request_id: &str,
        caller: CallerIdentity,
        client_format: EndpointSignature,
        task_type: &str,
        candidate: &Candidate,
        response: UpstreamHttpResponse,
        ctx: &SharedStreamContext,
        started: Instant,
    ) -> GatewayResult<ChatDispatchOutcome> {
        let provider_sig = candidate.endpoint_signature().expect("validated signature");
        let bytes = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(_) => Bytes::new(),
        };
        let parsed: Value = serde_json::from_slice(&bytes)
            .map_err(|_| GatewayError::ProviderNotAvailable("unparseable upstream body".into()))?;

        let parser = self.registry.normalizer_for(provider_sig);
        if parser.is_error_response(&parsed) {
            let error = parser.parse_error(&parsed, response.status);
            return Err(GatewayError::EmbeddedError {
                provider: candidate.provider_name.clone(),
                code: error.code,
                message: sanitize_error_message(&error.message),
                status: error.error_type,
            });
        }

        if let Some(usage) = parser.extract_usage(&parsed)
            && let Ok(mut guard) = ctx.lock()
        {
            guard.update_usage(usage);
            guard.has_completion = true;
            if let Some(text) = parser.extract_text(&parsed) {
                guard.collected_text = text;
            }
        }

        let out_body = if candidate.needs_conversion {
            let converted = self
                .registry
                .convert_chat_response(&parsed, provider_sig, client_format);
            Bytes::from(serde_json::to_vec(&converted).unwrap_or_default())
        } else {
            bytes
        };

        self.finalize(request_id, caller, task_type, ctx, started).await;

        Ok(ChatDispatchOutcome {
            status: 200,
            content_type: "application/json",
            body: DispatchBody::Bytes(out_body),
            ctx: ctx.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_outcome(
        &self,
        request_id: &str,
        caller: CallerIdentity,
        client_format: EndpointSignature,
        task_type: &str,
        candidate: &Candidate,
        response: UpstreamHttpResponse,
        ctx: &SharedStreamContext,
        started: Instant,
    ) -> GatewayResult<ChatDispatchOutcome> {
        let provider_sig = candidate.endpoint_signature().expect("validated signature");
        let UpstreamBody::Stream(byte_stream) = response.body else {
            return Err(GatewayError::ProviderNotAvailable(
                "upstream returned a buffered body for a stream request".into(),
            ));
        };

        let processor = StreamProcessor::new(request_id, client_format);
        let mut lines = LineStream::new(byte_stream);
        // Screen the first lines before anything reaches the client; errors
        // here bubble to the candidate loop and trigger failover.
        let prefetched = processor
            .prefetch_and_check_error(
                &mut lines,
                &candidate.provider_name,
                &candidate.endpoint.base_url,
                ctx,
                self.config.max_prefetch_lines,
            )
            .await?;

        let converter = candidate
            .needs_conversion
            .then(|| self.registry.stream_converter(provider_sig, client_format));

        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let ctx_task = ctx.clone();
        let storage = self.storage.clone();
        let config = self.config.clone();
        let request_id_owned = request_id.to_string();
        let task_type_owned = task_type.to_string();
        tokio::spawn(async move {
            processor
                .run_response_stream(ctx_task.clone(), lines, prefetched, converter, tx)
                .await;
            // Settlement happens after the stream closes, on this task; the
            // request path never holds a DB connection while streaming.
            let snapshot = match ctx_task.lock() {
                Ok(guard) => guard.clone(),
                Err(_) => return,
            };
            let elapsed = started.elapsed().as_millis() as i64;
            tracing::info!("{}", snapshot.log_summary(&request_id_owned, elapsed));
            let usage = UsageService::new(storage.as_ref(), &config);
            if let Err(err) = usage
                .finalize_chat(
                    &request_id_owned,
                    caller.user_id,
                    caller.api_key_id,
                    &task_type_owned,
                    &snapshot,
                    elapsed,
                )
                .await
            {
                tracing::warn!(request_id = %request_id_owned, error = %err, "usage finalize failed");
            }
        });

        Ok(ChatDispatchOutcome {
            status: 200,
            content_type: "text/event-stream",
            body: DispatchBody::Stream(rx),
            ctx: ctx.clone(),
        })
    }

    async fn finalize(
        &self,
        request_id: &str,
        caller: CallerIdentity,
        task_type: &str,
        ctx: &SharedStreamContext,
        started: Instant,
    ) {
        let snapshot = match ctx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        let elapsed = started.elapsed().as_millis() as i64;
        let usage = UsageService::new(self.storage.as_ref(), &self.config);
        if let Err(err) = usage
            .finalize_chat(
                request_id,
                caller.user_id,
                caller.api_key_id,
                task_type,
                &snapshot,
                elapsed,
            )
            .await
        {
            tracing::warn!(request_id, error = %err, "usage finalize failed");
        }
    }

    /// Auth + endpoint static headers + endpoint extra headers, with client
    /// override protection handled by construction (client headers are never
    /// forwarded to chat upstreams).
    fn build_upstream_headers(
        &self,
        candidate: &Candidate,
        provider_sig: EndpointSignature,
    ) -> GatewayResult<Headers> {
        let plaintext = self.cipher.decrypt(&candidate.key.api_key)?;
        let definition = resolve_endpoint_definition(provider_sig)
            .ok_or_else(|| GatewayError::ProviderNotAvailable("unknown endpoint".into()))?;

        let mut headers: Headers = vec![(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )];
        for (name, value) in build_auth_headers(definition.auth_method, &plaintext) {
            header_set(&mut headers, name, value);
        }
        for (name, value) in definition.extra_headers {
            header_set(&mut headers, *name, *value);
        }
        if let Some(extra) = candidate
            .endpoint
            .extra_headers
            .as_ref()
            .and_then(Value::as_object)
        {
            for (name, value) in extra {
                if let Some(value) = value.as_str() {
                    header_set(&mut headers, name.clone(), value.to_string());
                }
            }
        }
        Ok(headers)
    }
}

/// Upstream path per family; Gemini carries the model and verb in the path.
pub fn build_chat_url(
    sig: EndpointSignature,
    base_url: &str,
    model: &str,
    is_stream: bool,
) -> String {
    let base = base_url.trim_end_matches('/');
    match (sig.api_family, sig.endpoint_kind) {
        (aether_protocol::ApiFamily::Gemini, _) => {
            let base = base.strip_suffix("/v1beta").unwrap_or(base);
            if is_stream {
                format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
            } else {
                format!("{base}/v1beta/models/{model}:generateContent")
            }
        }
        (aether_protocol::ApiFamily::Claude, _) => {
            let base = base.strip_suffix("/v1").unwrap_or(base);
            format!("{base}/v1/messages")
        }
        (aether_protocol::ApiFamily::OpenAI, EndpointKind::Cli) => {
            let base = base.strip_suffix("/v1").unwrap_or(base);
            format!("{base}/v1/responses")
        }
        (aether_protocol::ApiFamily::OpenAI, _) => {
            let base = base.strip_suffix("/v1").unwrap_or(base);
            format!("{base}/v1/chat/completions")
        }
    }
}

/// Endpoint-level rewrite directives: `set` forces fields, `remove` drops
/// them. Applied after conversion, right before send.
fn apply_body_rules(body: &mut Value, rules: Option<&Value>) {
    let Some(rules) = rules.and_then(Value::as_object) else {
        return;
    };
    let Some(object) = body.as_object_mut() else {
        return;
    };
    if let Some(set) = rules.get("set").and_then(Value::as_object) {
        for (key, value) in set {
            object.insert(key.clone(), value.clone());
        }
    }
    if let Some(remove) = rules.get("remove").and_then(Value::as_array) {
        for key in remove.iter().filter_map(Value::as_str) {
            object.remove(key);
        }
    }
}

fn redact_auth(headers: &Headers) -> Headers {
    headers
        .iter()
        .map(|(name, value)| {
            if name.eq_ignore_ascii_case("authorization")
                || name.eq_ignore_ascii_case("x-api-key")
                || name.eq_ignore_ascii_case("x-goog-api-key")
            {
                (name.clone(), "[redacted]".to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Drain an error response into `(status, text)` without trusting it far.
async fn error_snippet(response: UpstreamHttpResponse) -> (u16, String) {
    let status = response.status;
    let text = match response.body {
        UpstreamBody::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        UpstreamBody::Stream(mut stream) => {
            use futures_util::StreamExt;
            let mut collected = String::new();
            while collected.len() < 2048 {
                match stream.next().await {
                    Some(Ok(chunk)) => collected.push_str(&String::from_utf8_lossy(&chunk)),
                    _ => break,
                }
            }
            collected
        }
    };
    let mut text = text;
    text.truncate(500);
    (status, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_protocol::parse_signature_key;
    use serde_json::json;

    #[test]
    fn body_rules_set_and_remove_fields() {
        let mut body = json!({"model": "gpt-4o", "temperature": 0.9});
        apply_body_rules(
            &mut body,
            Some(&json!({"set": {"temperature": 1.0}, "remove": ["logprobs"]})),
        );
        assert_eq!(body["temperature"], 1.0);

        let mut body = json!({"model": "gpt-4o", "logprobs": true});
        apply_body_rules(&mut body, Some(&json!({"remove": ["logprobs"]})));
        assert!(body.get("logprobs").is_none());

        let mut untouched = json!({"model": "gpt-4o"});
        apply_body_rules(&mut untouched, None);
        assert_eq!(untouched, json!({"model": "gpt-4o"}));
    }

    #[test]
    fn chat_urls_per_family() {
        let openai = parse_signature_key("openai:chat").unwrap();
        assert_eq!(
            build_chat_url(openai, "https://api.openai.com/v1", "gpt-4o", true),
            "https://api.openai.com/v1/chat/completions"
        );
        let claude = parse_signature_key("claude:chat").unwrap();
        assert_eq!(
            build_chat_url(claude, "https://api.anthropic.com", "claude-sonnet-4", false),
            "https://api.anthropic.com/v1/messages"
        );
        let gemini = parse_signature_key("gemini:chat").unwrap();
        assert_eq!(
            build_chat_url(gemini, "https://generativelanguage.googleapis.com/v1beta", "gemini-pro", true),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(
            build_chat_url(gemini, "https://generativelanguage.googleapis.com", "gemini-pro", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
        );
    }
}
