use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::{Map, Value, json};
use time::{Duration, OffsetDateTime};

use aether_billing::BillingRuleService;
use aether_common::{
    GatewayConfig, GatewayError, GatewayResult, new_short_id, sanitize_error_message,
};
use aether_protocol::gemini::normalize_operation_id;
use aether_protocol::{
    ApiFamily, EndpointSignature, Headers, build_auth_headers, header_get,
    resolve_endpoint_definition,
};
use aether_storage::entities::video_tasks;
use aether_storage::{Storage, StorageError};
use aether_transform::{
    ConversionRegistry, InternalVideoRequest, VideoStatus,
};

use crate::cipher::SecretCipher;
use crate::dispatch::CallerIdentity;
use crate::scheduler::{CacheAwareScheduler, Candidate};
use crate::upstream_client::{
    HttpMethod, UpstreamBody, UpstreamClient, UpstreamHttpRequest,
};
use crate::usage::{PendingUsageInput, UsageService};

/// Accept `models/{m}/operations/{short}`, `operations/{short}` or a bare id.
pub fn extract_short_id_from_operation(value: &str) -> &str {
    let trimmed = value.trim().trim_matches('/');
    match trimmed.rsplit_once("operations/") {
        Some((_, short)) => short,
        None => trimmed,
    }
}

/// Upstream submit URL per family.
fn build_submit_url(sig: EndpointSignature, base_url: &str, model: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match sig.api_family {
        ApiFamily::Gemini => {
            let base = base.strip_suffix("/v1beta").unwrap_or(base);
            format!("{base}/v1beta/models/{model}:predictLongRunning")
        }
        _ => {
            let base = base.strip_suffix("/v1").unwrap_or(base);
            format!("{base}/v1/videos")
        }
    }
}

pub enum DownloadOutcome {
    /// Task not terminal yet; body carries the current status label.
    Processing(String),
    Failed(String),
    Expired,
    NotAvailable,
    Ready {
        content_type: String,
        bytes: Bytes,
    },
}

/// Async video task surface: submit with failover, task views, cancel,
/// authenticated content download.
pub struct VideoService {
    storage: Arc<dyn Storage>,
    client: Arc<dyn UpstreamClient>,
    cipher: Arc<dyn SecretCipher>,
    config: GatewayConfig,
    scheduler: CacheAwareScheduler,
    registry: ConversionRegistry,
}

impl VideoService {
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

    /// Submit a generation job: convert, fail over across candidates, persist
    /// the task, and answer with a body that only ever names our short id.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        &self,
        request_id: &str,
        caller: CallerIdentity,
        client_format: EndpointSignature,
        body: Value,
        model_from_path: Option<&str>,
        original_headers: &Headers,
    ) -> GatewayResult<Value> {
        let started = Instant::now();
        let mut request_with_model = body.clone();
        if let Some(model) = model_from_path
            && let Some(object) = request_with_model.as_object_mut()
        {
            object.insert("model".to_string(), Value::String(model.to_string()));
        }

        let normalizer = self.registry.normalizer_for(client_format);
        let internal = normalizer
            .video_request_to_internal(&request_with_model)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        let usage = UsageService::new(self.storage.as_ref(), &self.config);
        if let Err(err) = usage
            .create_pending(PendingUsageInput {
                request_id: request_id.to_string(),
                user_id: caller.user_id,
                api_key_id: caller.api_key_id,
                model: internal.model.clone(),
                api_format: client_format.key(),
                request_type: "video".to_string(),
                is_stream: false,
            })
            .await
        {
            tracing::warn!(request_id, error = %err, "failed to create pending usage");
        }

        let bundles = self
            .storage
            .load_provider_bundles()
            .await
            .map_err(|e| GatewayError::Upstream(format!("provider load failed: {e}")))?;
        let candidates = self.scheduler.build_candidates(
            &bundles,
            client_format,
            &internal.model,
            None,
            false,
            self.config.enable_format_conversion,
        );
        if candidates.is_empty() {
            return Err(GatewayError::ProviderNotAvailable(format!(
                "no endpoint accepts {} for model {}",
                client_format.key(),
                internal.model
            )));
        }

        let mut last_error: Option<GatewayError> = None;
        for candidate in candidates.iter().take(self.config.max_candidates) {
            match self
                .attempt_submit(
                    request_id,
                    caller,
                    client_format,
                    &body,
                    &internal,
                    candidate,
                    original_headers,
                    started,
                )
                .await
            {
                Ok(response_body) => return Ok(response_body),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        request_id,
                        provider = %candidate.provider_name,
                        kind = err.kind(),
                        "video submit attempt failed, trying next candidate"
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
    async fn attempt_submit(
        &self,
        request_id: &str,
        caller: CallerIdentity,
        client_format: EndpointSignature,
        original_body: &Value,
        internal: &InternalVideoRequest,
        candidate: &Candidate,
        original_headers: &Headers,
        started: Instant,
    ) -> GatewayResult<Value> {
        let provider_sig = candidate
            .endpoint_signature()
            .ok_or_else(|| GatewayError::ProviderNotAvailable("bad endpoint signature".into()))?;
        let plaintext = self.cipher.decrypt(&candidate.key.api_key)?;

        // Conversion goes through the parsed internal request: the wire body
        // may carry the model in the path rather than the payload.
        let (upstream_body, converted_body) = if candidate.needs_conversion {
            let converted = self
                .registry
                .normalizer_for(provider_sig)
                .video_request_from_internal(internal)
                .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
            (converted.clone(), Some(converted))
        } else {
            (original_body.clone(), None)
        };

        let url = build_submit_url(provider_sig, &candidate.endpoint.base_url, &internal.model);
        let definition = resolve_endpoint_definition(provider_sig)
            .ok_or_else(|| GatewayError::ProviderNotAvailable("unknown endpoint".into()))?;
        let mut headers: Headers =
            vec![("Content-Type".to_string(), "application/json".to_string())];
        for (name, value) in build_auth_headers(definition.auth_method, &plaintext) {
            aether_protocol::header_set(&mut headers, name, value);
        }

        let response = self
            .client
            .send(UpstreamHttpRequest {
                method: HttpMethod::Post,
                url,
                headers,
                body: Some(Bytes::from(
                    serde_json::to_vec(&upstream_body).unwrap_or_default(),
                )),
                stream: false,
                timeout: None,
            })
            .await?;

        let status = response.status;
        let bytes = response.bytes();
        let payload: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        if status >= 400 {
            let parser = self.registry.normalizer_for(provider_sig);
            let parsed = parser.parse_error(&payload, status);
            return Err(GatewayError::ProviderNotAvailable(format!(
                "upstream status {status}: {}",
                sanitize_error_message(&parsed.message)
            )));
        }

        let parser = self.registry.normalizer_for(provider_sig);
        if payload.is_object() && parser.is_error_response(&payload) {
            let parsed = parser.parse_error(&payload, status);
            return Err(GatewayError::EmbeddedError {
                provider: candidate.provider_name.clone(),
                code: parsed.code,
                message: sanitize_error_message(&parsed.message),
                status: parsed.error_type,
            });
        }

        let external_task_id = extract_external_task_id(&payload)
            .ok_or(GatewayError::MissingExternalTaskId)?;

        // Freeze the billing rule so async settlement prices at submit-time
        // rates even if the model config changes mid-generation.
        let billing_rule_snapshot = BillingRuleService::find_rule(
            self.storage.as_ref(),
            &self.config,
            Some(candidate.provider_id),
            &internal.model,
            "video",
        )
        .await
        .map(|lookup| {
            json!({
                "rule_id": lookup.rule.id,
                "rule_name": lookup.rule.name,
                "scope": lookup.scope,
                "expression": lookup.rule.expression,
                "variables": lookup.rule.variables,
                "dimension_mappings": lookup.rule.dimension_mappings,
            })
        });

        let task = self.build_task_record(
            request_id,
            caller,
            client_format,
            candidate,
            &external_task_id,
            original_body,
            converted_body,
            internal,
            original_headers,
            billing_rule_snapshot,
        );
        let short_id = task.short_id.clone();
        let model = task.model.clone();

        match self.storage.insert_video_task(task).await {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => {
                return Err(GatewayError::Conflict("task already exists".to_string()));
            }
            Err(err) => {
                return Err(GatewayError::Upstream(format!("task persist failed: {err}")));
            }
        }

        let usage = UsageService::new(self.storage.as_ref(), &self.config);
        if let Err(err) = usage
            .finalize_submitted(
                request_id,
                &candidate.provider_name,
                candidate.provider_id,
                candidate.endpoint.id,
                candidate.key.id,
                &candidate.provider_api_format,
                status,
                started.elapsed().as_millis() as i64,
            )
            .await
        {
            tracing::warn!(request_id, error = %err, "failed to finalize submitted usage");
        }

        Ok(render_submit_response(client_format, &short_id, &model))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_task_record(
        &self,
        request_id: &str,
        caller: CallerIdentity,
        client_format: EndpointSignature,
        candidate: &Candidate,
        external_task_id: &str,
        original_body: &Value,
        converted_body: Option<Value>,
        internal: &InternalVideoRequest,
        original_headers: &Headers,
        billing_rule_snapshot: Option<Value>,
    ) -> video_tasks::Model {
        let now = OffsetDateTime::now_utc();
        let poll_interval = self.config.video_poll_interval_seconds as i64;

        let mut request_metadata = Map::new();
        request_metadata.insert(
            "selected_endpoint_id".to_string(),
            Value::from(candidate.endpoint.id),
        );
        request_metadata.insert("selected_key_id".to_string(), Value::from(candidate.key.id));
        request_metadata.insert("request_id".to_string(), Value::from(request_id));
        if let Some(snapshot) = billing_rule_snapshot {
            request_metadata.insert("billing_rule_snapshot".to_string(), snapshot);
        }
        // Request headers are kept for audit, minus anything credential-like.
        let safe_headers: Map<String, Value> = original_headers
            .iter()
            .filter(|(name, _)| {
                !matches!(
                    name.to_ascii_lowercase().as_str(),
                    "authorization" | "x-api-key" | "x-goog-api-key" | "cookie"
                )
            })
            .map(|(name, value)| (name.clone(), Value::from(value.clone())))
            .collect();
        request_metadata.insert("request_headers".to_string(), Value::Object(safe_headers));

        let format_converted = candidate.needs_conversion;
        video_tasks::Model {
            id: uuid::Uuid::new_v4().to_string(),
            short_id: new_short_id(),
            request_id: request_id.to_string(),
            external_task_id: Some(external_task_id.to_string()),
            user_id: caller.user_id,
            api_key_id: caller.api_key_id,
            provider_id: Some(candidate.provider_id),
            endpoint_id: Some(candidate.endpoint.id),
            key_id: Some(candidate.key.id),
            client_api_format: client_format.key(),
            provider_api_format: Some(candidate.provider_api_format.clone()),
            format_converted,
            model: internal.model.clone(),
            prompt: internal.prompt.clone(),
            original_request_body: Some(original_body.clone()),
            converted_request_body: converted_body.or_else(|| Some(original_body.clone())),
            duration_seconds: internal.duration_seconds,
            resolution: internal.resolution.clone(),
            aspect_ratio: internal.aspect_ratio.clone(),
            status: VideoStatus::Submitted.as_str().to_string(),
            progress_percent: 0,
            progress_message: None,
            poll_interval_seconds: poll_interval,
            next_poll_at: Some(now + Duration::seconds(poll_interval)),
            poll_count: 0,
            max_poll_count: self.config.video_max_poll_count,
            retry_count: 0,
            video_url: None,
            video_urls: None,
            video_expires_at: None,
            video_duration_seconds: None,
            error_code: None,
            error_message: None,
            request_metadata: Some(Value::Object(request_metadata)),
            created_at: now,
            updated_at: now,
            submitted_at: Some(now),
            completed_at: None,
        }
    }

    pub async fn task_by_operation(
        &self,
        user_id: i64,
        operation: &str,
    ) -> GatewayResult<video_tasks::Model> {
        let short_id = extract_short_id_from_operation(operation);
        self.storage
            .video_task_by_short_id(short_id, user_id)
            .await
            .map_err(|e| GatewayError::Upstream(format!("task lookup failed: {e}")))?
            .ok_or_else(|| GatewayError::NotFound("video task".to_string()))
    }

    pub fn render_task(&self, client_format: EndpointSignature, task: &video_tasks::Model) -> Value {
        render_task_view(client_format, task)
    }

    pub async fn list_tasks(
        &self,
        user_id: i64,
        client_format: EndpointSignature,
    ) -> GatewayResult<Value> {
        let tasks = self
            .storage
            .list_video_tasks(user_id, 100)
            .await
            .map_err(|e| GatewayError::Upstream(format!("task list failed: {e}")))?;
        let items: Vec<Value> = tasks
            .iter()
            .map(|task| render_task_view(client_format, task))
            .collect();
        if client_format.api_family == ApiFamily::Gemini {
            Ok(json!({"operations": items}))
        } else {
            Ok(json!({"data": items}))
        }
    }

    /// Flip a non-terminal task to cancelled; terminal tasks are left alone.
    pub async fn cancel(
        &self,
        user_id: i64,
        operation: &str,
    ) -> GatewayResult<video_tasks::Model> {
        let mut task = self.task_by_operation(user_id, operation).await?;
        let status = VideoStatus::parse(&task.status).unwrap_or(VideoStatus::Pending);
        if status.is_terminal() {
            return Err(GatewayError::InvalidRequest(format!(
                "task already {}",
                task.status
            )));
        }
        task.status = VideoStatus::Cancelled.as_str().to_string();
        task.completed_at = Some(OffsetDateTime::now_utc());
        task.updated_at = OffsetDateTime::now_utc();
        self.storage
            .update_video_task(task.clone())
            .await
            .map_err(|e| GatewayError::Upstream(format!("task update failed: {e}")))?;
        Ok(task)
    }

    /// Proxy the generated content with upstream auth injected; the upstream
    /// storage URL never reaches the client.
    pub async fn download_content(
        &self,
        user_id: i64,
        operation: &str,
    ) -> GatewayResult<DownloadOutcome> {
        let task = self.task_by_operation(user_id, operation).await?;
        let status = VideoStatus::parse(&task.status).unwrap_or(VideoStatus::Pending);

        let Some(video_url) = task.video_url.clone() else {
            return Ok(match status {
                VideoStatus::Pending
                | VideoStatus::Submitted
                | VideoStatus::Queued
                | VideoStatus::Processing => DownloadOutcome::Processing(task.status.clone()),
                VideoStatus::Failed => DownloadOutcome::Failed(
                    task.error_message
                        .as_deref()
                        .map(sanitize_error_message)
                        .unwrap_or_else(|| "unknown error".to_string()),
                ),
                _ => DownloadOutcome::NotAvailable,
            });
        };

        if let Some(expires_at) = task.video_expires_at
            && expires_at < OffsetDateTime::now_utc()
        {
            return Ok(DownloadOutcome::Expired);
        }

        let mut headers: Headers = Vec::new();
        if let (Some(endpoint_id), Some(key_id)) = (task.endpoint_id, task.key_id)
            && let (Ok(Some(endpoint)), Ok(Some(key))) = (
                self.storage.provider_endpoint(endpoint_id).await,
                self.storage.provider_api_key(key_id).await,
            )
        {
            match self.cipher.decrypt(&key.api_key) {
                Ok(plaintext) => {
                    let auth_method = crate::scheduler::endpoint_signature_of(&endpoint)
                        .and_then(resolve_endpoint_definition)
                        .map(|d| d.auth_method)
                        .unwrap_or(aether_protocol::AuthMethod::Bearer);
                    for (name, value) in build_auth_headers(auth_method, &plaintext) {
                        aether_protocol::header_set(&mut headers, name, value);
                    }
                }
                // Some URLs are pre-signed; try the download without auth.
                Err(err) => {
                    tracing::warn!(task_id = %task.id, error = %err, "download auth unavailable");
                }
            }
        }

        let response = self
            .client
            .send(UpstreamHttpRequest {
                method: HttpMethod::Get,
                url: video_url,
                headers,
                body: None,
                stream: false,
                timeout: Some(std::time::Duration::from_secs(300)),
            })
            .await
            .map_err(|e| GatewayError::Upstream(format!("video fetch failed: {e}")))?;

        if response.status >= 400 {
            return Err(GatewayError::Upstream(format!(
                "upstream returned {}",
                response.status
            )));
        }

        let content_type = header_get(&response.headers, "content-type")
            .unwrap_or("video/mp4")
            .to_string();
        let bytes = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(_) => Bytes::new(),
        };
        Ok(DownloadOutcome::Ready {
            content_type,
            bytes,
        })
    }
}

fn extract_external_task_id(payload: &Value) -> Option<String> {
    if let Some(name) = payload.get("name").and_then(Value::as_str) {
        if name.is_empty() {
            return None;
        }
        return Some(normalize_operation_id(name));
    }
    payload
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn render_submit_response(
    client_format: EndpointSignature,
    short_id: &str,
    model: &str,
) -> Value {
    if client_format.api_family == ApiFamily::Gemini {
        json!({
            "name": format!("models/{model}/operations/{short_id}"),
            "done": false,
        })
    } else {
        json!({
            "id": short_id,
            "object": "video",
            "model": model,
            "status": "queued",
            "progress": 0,
        })
    }
}

fn render_task_view(client_format: EndpointSignature, task: &video_tasks::Model) -> Value {
    let status = VideoStatus::parse(&task.status).unwrap_or(VideoStatus::Pending);
    if client_format.api_family == ApiFamily::Gemini {
        let name = format!("models/{}/operations/{}", task.model, task.short_id);
        if status == VideoStatus::Failed {
            return json!({
                "name": name,
                "done": true,
                "error": {
                    "code": 13,
                    "message": task.error_message.as_deref()
                        .map(sanitize_error_message)
                        .unwrap_or_else(|| "generation failed".to_string()),
                    "status": "INTERNAL",
                },
            });
        }
        if status == VideoStatus::Completed {
            // Clients download through the gateway; upstream URIs stay hidden.
            let uri = format!("/v1beta/files/{}:download", task.short_id);
            return json!({
                "name": name,
                "done": true,
                "response": {
                    "generateVideoResponse": {
                        "generatedSamples": [{"video": {"uri": uri}}],
                    },
                },
            });
        }
        json!({
            "name": name,
            "done": false,
            "metadata": {"progressPercent": task.progress_percent},
        })
    } else {
        let wire_status = match status {
            VideoStatus::Pending | VideoStatus::Submitted | VideoStatus::Queued => "queued",
            VideoStatus::Processing => "in_progress",
            VideoStatus::Completed => "completed",
            VideoStatus::Failed => "failed",
            VideoStatus::Cancelled => "cancelled",
        };
        let mut out = json!({
            "id": task.short_id,
            "object": "video",
            "model": task.model,
            "status": wire_status,
            "progress": task.progress_percent,
        });
        if let Some(seconds) = task.video_duration_seconds.or(task.duration_seconds) {
            out["seconds"] = json!(seconds.to_string());
        }
        if let Some(size) = &task.resolution {
            out["size"] = json!(size);
        }
        if status == VideoStatus::Failed {
            out["error"] = json!({
                "message": task.error_message.as_deref()
                    .map(sanitize_error_message)
                    .unwrap_or_else(|| "generation failed".to_string()),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_extraction_accepts_all_operation_forms() {
        assert_eq!(
            extract_short_id_from_operation("models/veo-3/operations/Abc123"),
            "Abc123"
        );
        assert_eq!(extract_short_id_from_operation("operations/Abc123"), "Abc123");
        assert_eq!(extract_short_id_from_operation("Abc123"), "Abc123");
    }

    #[test]
    fn external_id_extraction_prefers_operation_name() {
        assert_eq!(
            extract_external_task_id(&json!({"name": "operations/abc"})).as_deref(),
            Some("operations/abc")
        );
        assert_eq!(
            extract_external_task_id(&json!({"name": "v1beta/operations/abc"})).as_deref(),
            Some("operations/abc")
        );
        assert_eq!(
            extract_external_task_id(&json!({"id": "video_123"})).as_deref(),
            Some("video_123")
        );
        assert_eq!(extract_external_task_id(&json!({"ok": true})), None);
    }

    #[test]
    fn submit_response_never_leaks_external_id() {
        let sig = aether_protocol::parse_signature_key("gemini:video").unwrap();
        let body = render_submit_response(sig, "ShortId22", "veo-3");
        assert_eq!(body["name"], "models/veo-3/operations/ShortId22");
        assert!(body.get("external_task_id").is_none());
    }

    #[test]
    fn submit_urls_per_family() {
        let gemini = aether_protocol::parse_signature_key("gemini:video").unwrap();
        assert_eq!(
            build_submit_url(gemini, "https://generativelanguage.googleapis.com/v1beta", "veo-3"),
            "https://generativelanguage.googleapis.com/v1beta/models/veo-3:predictLongRunning"
        );
        let openai = aether_protocol::parse_signature_key("openai:video").unwrap();
        assert_eq!(
            build_submit_url(openai, "https://api.openai.com/v1", "sora-2"),
            "https://api.openai.com/v1/videos"
        );
    }
}
