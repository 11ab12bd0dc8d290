use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures_util::StreamExt;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use aether_common::{GatewayConfig, sanitize_error_message};
use aether_protocol::gemini::normalize_operation_id;
use aether_protocol::{Headers, build_auth_headers, resolve_endpoint_definition};
use aether_storage::Storage;
use aether_storage::entities::video_tasks;
use aether_transform::{InternalVideoPollResult, Normalizer, VideoStatus};

use crate::cipher::SecretCipher;
use crate::lock::LockStore;
use crate::scheduler::endpoint_signature_of;
use crate::upstream_client::{HttpMethod, UpstreamClient, UpstreamHttpRequest};
use crate::usage::UsageService;

pub const VIDEO_POLL_LOCK_KEY: &str = "task_poller:video:lock";
const LOCK_TTL: StdDuration = StdDuration::from_secs(60);
const MAX_BACKOFF_SECONDS: i64 = 300;
const STATUS_TIMEOUT: StdDuration = StdDuration::from_secs(30);

const PERMANENT_ERROR_INDICATORS: &[&str] = &[
    "not found",
    "404",
    "unauthorized",
    "401",
    "forbidden",
    "403",
    "invalid request",
    "invalid api key",
    "does not exist",
];

/// Everything phase 2 needs, captured in phase 1 so the HTTP call runs with
/// no DB connection in hand.
#[derive(Debug, Clone)]
pub struct VideoPollContext {
    pub task_id: String,
    pub external_task_id: String,
    pub provider_api_format: String,
    pub base_url: String,
    pub headers: Headers,
    pub poll_interval_seconds: i64,
    pub retry_count: i32,
}

#[derive(Debug)]
struct PollHttpError {
    status_code: Option<u16>,
    message: String,
}

impl PollHttpError {
    fn http(status_code: u16, message: String) -> Self {
        Self {
            status_code: Some(status_code),
            message: format!("HTTP {status_code}: {message}"),
        }
    }

    fn transport(message: String) -> Self {
        Self {
            status_code: None,
            message,
        }
    }

    /// 4xx except 429 is permanent; transport errors match known indicator
    /// strings.
    fn is_permanent(&self) -> bool {
        match self.status_code {
            Some(status) => (400..500).contains(&status) && status != 429,
            None => {
                let lowered = self.message.to_ascii_lowercase();
                PERMANENT_ERROR_INDICATORS
                    .iter()
                    .any(|indicator| lowered.contains(indicator))
            }
        }
    }
}

/// Three-phase video task poller: prepare (brief DB reads), HTTP (no DB),
/// update (fresh DB writes). A tick-level lock keeps one scanner per fleet.
pub struct VideoPoller {
    storage: Arc<dyn Storage>,
    client: Arc<dyn UpstreamClient>,
    cipher: Arc<dyn SecretCipher>,
    lock: Arc<dyn LockStore>,
    config: GatewayConfig,
}

impl VideoPoller {
    pub fn new(
        storage: Arc<dyn Storage>,
        client: Arc<dyn UpstreamClient>,
        cipher: Arc<dyn SecretCipher>,
        lock: Arc<dyn LockStore>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            storage,
            client,
            cipher,
            lock,
            config,
        }
    }

    pub fn interval(&self) -> StdDuration {
        StdDuration::from_secs(self.config.video_poll_interval_seconds.max(1))
    }

    /// One scheduler tick: scan due tasks under the distributed lock and poll
    /// them with bounded concurrency.
    pub async fn tick(&self) {
        let Some(token) = self.lock.acquire(VIDEO_POLL_LOCK_KEY, LOCK_TTL).await else {
            return;
        };

        let due = match self
            .storage
            .due_video_task_ids(
                OffsetDateTime::now_utc(),
                self.config.video_poll_batch_size as u64,
            )
            .await
        {
            Ok(due) => due,
            Err(err) => {
                tracing::warn!(error = %err, "due-task scan failed");
                self.lock.release(VIDEO_POLL_LOCK_KEY, token).await;
                return;
            }
        };

        if !due.is_empty() {
            tracing::debug!(count = due.len(), "polling due video tasks");
            futures_util::stream::iter(due)
                .for_each_concurrent(self.config.video_poll_concurrency.max(1), |task_id| async move {
                    self.poll_one(&task_id).await;
                })
                .await;
        }

        self.lock.release(VIDEO_POLL_LOCK_KEY, token).await;
    }

    pub async fn poll_one(&self, task_id: &str) {
        // Phase 1: short DB session to capture poll inputs.
        let task = match self.storage.video_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::warn!(task_id, "task disappeared before poll");
                return;
            }
            Err(err) => {
                tracing::warn!(task_id, error = %err, "task load failed");
                return;
            }
        };

        let (ctx, early_failure) = match self.prepare_poll_context(&task).await {
            Ok(ctx) => (Some(ctx), None),
            Err(failure) => (None, Some(failure)),
        };

        // Phase 2: upstream HTTP with no DB connection held.
        let outcome = match (&ctx, early_failure) {
            (Some(ctx), None) => self.poll_task_http(ctx).await,
            (_, Some(failure)) => Ok(failure),
            (None, None) => unreachable!("prepare yields ctx or failure"),
        };

        // Phase 3: fresh DB session to apply the outcome.
        self.update_task_after_poll(task_id, ctx.as_ref(), outcome)
            .await;
    }

    /// Phase 1. Failures come back as terminal poll results (config faults
    /// are not retryable).
    async fn prepare_poll_context(
        &self,
        task: &video_tasks::Model,
    ) -> Result<VideoPollContext, InternalVideoPollResult> {
        let failure = |code: &str, message: &str| InternalVideoPollResult {
            status: VideoStatus::Failed,
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
            ..Default::default()
        };

        let (Some(endpoint_id), Some(key_id)) = (task.endpoint_id, task.key_id) else {
            return Err(failure(
                "missing_provider_info",
                "task missing endpoint_id or key_id",
            ));
        };
        let endpoint = match self.storage.provider_endpoint(endpoint_id).await {
            Ok(Some(endpoint)) => endpoint,
            _ => return Err(failure("missing_provider_info", "provider endpoint not found")),
        };
        let key = match self.storage.provider_api_key(key_id).await {
            Ok(Some(key)) => key,
            _ => return Err(failure("missing_provider_info", "provider key not found")),
        };
        if key.api_key.is_empty() {
            return Err(failure(
                "provider_config_error",
                "provider key not properly configured",
            ));
        }

        let plaintext = match self.cipher.decrypt(&key.api_key) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                tracing::warn!(task_id = %task.id, "failed to decrypt provider key");
                return Err(failure("decryption_error", "failed to decrypt provider key"));
            }
        };

        let provider_format = task
            .provider_api_format
            .clone()
            .filter(|f| !f.trim().is_empty())
            .or_else(|| endpoint_signature_of(&endpoint).map(|sig| sig.key()))
            .unwrap_or_default();

        let auth_method = aether_protocol::parse_signature_key(&provider_format)
            .ok()
            .and_then(resolve_endpoint_definition)
            .map(|d| d.auth_method)
            .unwrap_or(aether_protocol::AuthMethod::Bearer);
        let mut headers: Headers = Vec::new();
        for (name, value) in build_auth_headers(auth_method, &plaintext) {
            aether_protocol::header_set(&mut headers, name, value);
        }
        if let Some(extra) = endpoint.extra_headers.as_ref().and_then(Value::as_object) {
            for (name, value) in extra {
                if let Some(value) = value.as_str() {
                    aether_protocol::header_set(&mut headers, name.clone(), value.to_string());
                }
            }
        }

        Ok(VideoPollContext {
            task_id: task.id.clone(),
            external_task_id: task.external_task_id.clone().unwrap_or_default(),
            provider_api_format: provider_format,
            base_url: endpoint.base_url.clone(),
            headers,
            poll_interval_seconds: task.poll_interval_seconds,
            retry_count: task.retry_count,
        })
    }

    /// Phase 2.
    async fn poll_task_http(
        &self,
        ctx: &VideoPollContext,
    ) -> Result<InternalVideoPollResult, PollHttpError> {
        if ctx.external_task_id.is_empty() {
            return Ok(InternalVideoPollResult {
                status: VideoStatus::Failed,
                error_code: Some("missing_external_task_id".to_string()),
                error_message: Some("task missing external_task_id".to_string()),
                ..Default::default()
            });
        }

        let is_gemini = ctx.provider_api_format.starts_with("gemini:");
        let url = if is_gemini {
            build_gemini_status_url(&ctx.base_url, &ctx.external_task_id)
        } else {
            build_openai_status_url(&ctx.base_url, &ctx.external_task_id)
        };
        tracing::debug!(task_id = %ctx.task_id, url = %url, "polling upstream");

        let response = self
            .client
            .send(UpstreamHttpRequest {
                method: HttpMethod::Get,
                url,
                headers: ctx.headers.clone(),
                body: None,
                stream: false,
                timeout: Some(STATUS_TIMEOUT),
            })
            .await
            .map_err(|err| PollHttpError::transport(sanitize_error_message(&err.to_string())))?;

        if response.status >= 400 {
            let bytes = response.bytes();
            let message = extract_error_message(&bytes, response.status);
            return Err(PollHttpError::http(response.status, message));
        }

        let payload: Value = serde_json::from_slice(&response.bytes()).unwrap_or(Value::Null);
        let normalizer = if is_gemini {
            Normalizer::Gemini
        } else {
            Normalizer::OpenAI
        };
        let mut result = normalizer.video_poll_to_internal(&payload);

        // The OpenAI surface downloads via the jobs API rather than a direct
        // URI; synthesize the content URL for the download proxy.
        if !is_gemini && result.status == VideoStatus::Completed && result.video_url.is_none() {
            let url = format!(
                "{}/content",
                build_openai_status_url(&ctx.base_url, &ctx.external_task_id)
            );
            result.video_url = Some(url.clone());
            result.video_urls = vec![url];
        }
        Ok(result)
    }

    /// Phase 3. Reloads the task so concurrent terminality stays idempotent.
    async fn update_task_after_poll(
        &self,
        task_id: &str,
        ctx: Option<&VideoPollContext>,
        outcome: Result<InternalVideoPollResult, PollHttpError>,
    ) {
        let mut task = match self.storage.video_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::warn!(task_id, "task disappeared during poll update");
                return;
            }
            Err(err) => {
                tracing::warn!(task_id, error = %err, "task reload failed");
                return;
            }
        };
        if VideoStatus::parse(&task.status).is_some_and(VideoStatus::is_terminal) {
            return;
        }

        let now = OffsetDateTime::now_utc();
        match outcome {
            Ok(result) => match result.status {
                VideoStatus::Completed => {
                    task.status = VideoStatus::Completed.as_str().to_string();
                    task.video_url = result.video_url.clone();
                    if !result.video_urls.is_empty() {
                        task.video_urls = serde_json::to_value(&result.video_urls).ok();
                    }
                    task.video_expires_at = result.expires_at;
                    if result.video_duration_seconds.is_some() {
                        task.video_duration_seconds = result.video_duration_seconds;
                    }
                    task.progress_percent = 100;
                    task.completed_at = Some(now);
                    attach_poll_raw_response(&mut task, &result);
                }
                VideoStatus::Failed => {
                    task.status = VideoStatus::Failed.as_str().to_string();
                    task.error_code = result.error_code.clone();
                    task.error_message = result
                        .error_message
                        .as_deref()
                        .map(sanitize_error_message);
                    task.completed_at = Some(now);
                    attach_poll_raw_response(&mut task, &result);
                }
                _ => {
                    task.poll_count += 1;
                    task.progress_percent = result.progress_percent;
                    task.next_poll_at =
                        Some(now + Duration::seconds(task.poll_interval_seconds.max(1)));
                }
            },
            Err(err) => {
                task.poll_count += 1;
                let message = sanitize_error_message(&err.message);
                tracing::warn!(task_id, error = %message, "poll error");
                task.progress_message = Some(format!("Poll error: {message}"));
                if err.is_permanent() {
                    task.status = VideoStatus::Failed.as_str().to_string();
                    task.error_code = Some("poll_permanent_error".to_string());
                    task.error_message = Some(message);
                    task.completed_at = Some(now);
                } else {
                    let retry_count = ctx.map(|c| c.retry_count).unwrap_or(task.retry_count);
                    let interval = ctx
                        .map(|c| c.poll_interval_seconds)
                        .unwrap_or(task.poll_interval_seconds)
                        .max(1);
                    let backoff =
                        (interval << retry_count.clamp(0, 5) as u32).min(MAX_BACKOFF_SECONDS);
                    task.retry_count += 1;
                    task.next_poll_at = Some(now + Duration::seconds(backoff));
                }
            }
        }

        task.updated_at = now;
        // Poll budget exhausted without reaching a terminal state.
        if task.poll_count >= task.max_poll_count
            && !VideoStatus::parse(&task.status).is_some_and(VideoStatus::is_terminal)
        {
            task.status = VideoStatus::Failed.as_str().to_string();
            task.error_code = Some("poll_timeout".to_string());
            task.error_message = Some(format!("task timed out after {} polls", task.poll_count));
            task.completed_at = Some(now);
        }

        let terminal = matches!(task.status.as_str(), "completed" | "failed");
        if terminal {
            let usage = UsageService::new(self.storage.as_ref(), &self.config);
            if let Err(err) = usage.finalize_video_task(&task).await {
                tracing::warn!(
                    task_id = %task.id,
                    error = %sanitize_error_message(&err.to_string()),
                    "failed to record video usage"
                );
            }
        }

        if let Err(err) = self.storage.update_video_task(task).await {
            tracing::warn!(task_id, error = %err, "task update failed");
        }
    }
}

fn attach_poll_raw_response(task: &mut video_tasks::Model, result: &InternalVideoPollResult) {
    let Some(raw) = &result.raw_response else {
        return;
    };
    // Reassign the whole map so the change is visible to the row update.
    let mut metadata = task
        .request_metadata
        .take()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    metadata.insert("poll_raw_response".to_string(), raw.clone());
    task.request_metadata = Some(Value::Object(metadata));
}

fn build_openai_status_url(base_url: &str, task_id: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/videos/{task_id}")
    } else {
        format!("{base}/v1/videos/{task_id}")
    }
}

fn build_gemini_status_url(base_url: &str, external_task_id: &str) -> String {
    let operation = normalize_operation_id(external_task_id);
    let base = base_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1beta").unwrap_or(base);
    format!("{base}/v1beta/{operation}")
}

fn extract_error_message(body: &[u8], status: u16) -> String {
    if body.is_empty() {
        return format!("request failed with status {status}");
    }
    if let Ok(data) = serde_json::from_slice::<Value>(body) {
        if let Some(error) = data.get("error").and_then(Value::as_object) {
            if let Some(message) = error
                .get("message")
                .or_else(|| error.get("detail"))
                .and_then(Value::as_str)
            {
                return sanitize_error_message(message);
            }
        }
        if let Some(message) = data.get("message").and_then(Value::as_str) {
            return sanitize_error_message(message);
        }
    }
    let text = String::from_utf8_lossy(body);
    sanitize_error_message(&text[..text.len().min(500)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_urls_handle_versioned_bases() {
        assert_eq!(
            build_openai_status_url("https://api.openai.com/v1", "video_1"),
            "https://api.openai.com/v1/videos/video_1"
        );
        assert_eq!(
            build_openai_status_url("https://relay.example", "video_1"),
            "https://relay.example/v1/videos/video_1"
        );
        assert_eq!(
            build_gemini_status_url(
                "https://generativelanguage.googleapis.com/v1beta",
                "operations/abc"
            ),
            "https://generativelanguage.googleapis.com/v1beta/operations/abc"
        );
        assert_eq!(
            build_gemini_status_url("https://generativelanguage.googleapis.com", "abc"),
            "https://generativelanguage.googleapis.com/v1beta/operations/abc"
        );
    }

    #[test]
    fn permanent_error_classification() {
        assert!(PollHttpError::http(404, "missing".into()).is_permanent());
        assert!(PollHttpError::http(401, "no".into()).is_permanent());
        assert!(!PollHttpError::http(429, "slow down".into()).is_permanent());
        assert!(!PollHttpError::http(500, "boom".into()).is_permanent());
        assert!(PollHttpError::transport("key does not exist".into()).is_permanent());
        assert!(!PollHttpError::transport("connection reset".into()).is_permanent());
    }

    #[test]
    fn error_message_extraction_prefers_structured_shapes() {
        assert_eq!(
            extract_error_message(br#"{"error":{"message":"bad key"}}"#, 401),
            "bad key"
        );
        assert_eq!(
            extract_error_message(br#"{"message":"nope"}"#, 400),
            "nope"
        );
        assert_eq!(
            extract_error_message(b"", 502),
            "request failed with status 502"
        );
    }
}
