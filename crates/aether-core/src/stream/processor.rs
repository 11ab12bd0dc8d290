use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use aether_common::{GatewayError, GatewayResult, sanitize_error_message};
use aether_protocol::{EndpointSignature, SseParser, parse_signature_key};
use aether_transform::registry::StreamConverter;
use aether_transform::{ConversionRegistry, Normalizer};

use crate::stream::SharedStreamContext;
use crate::upstream_client::ByteStream;

/// Incremental splitter from byte chunks to lines (newline stripped, any
/// trailing `\r` kept for the caller to normalize).
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: String,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            lines.push(line);
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Owns the upstream byte stream for the duration of a streaming call;
/// dropping it releases the upstream response on every exit path.
pub struct LineStream {
    inner: Option<ByteStream>,
    decoder: LineDecoder,
    pending: VecDeque<String>,
}

impl LineStream {
    pub fn new(inner: ByteStream) -> Self {
        Self {
            inner: Some(inner),
            decoder: LineDecoder::default(),
            pending: VecDeque::new(),
        }
    }

    pub async fn next_line(&mut self) -> GatewayResult<Option<String>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            let Some(inner) = self.inner.as_mut() else {
                return Ok(None);
            };
            match inner.next().await {
                Some(Ok(chunk)) => {
                    for line in self.decoder.push(&chunk) {
                        self.pending.push_back(line);
                    }
                }
                Some(Err(err)) => {
                    self.inner = None;
                    return Err(err);
                }
                None => {
                    self.inner = None;
                    if let Some(tail) = self.decoder.finish() {
                        self.pending.push_back(tail);
                    }
                }
            }
        }
    }
}

/// Turns a raw upstream line stream into a safe client SSE stream while
/// keeping `StreamContext` current and screening for embedded errors before
/// any byte leaves the gateway.
pub struct StreamProcessor {
    request_id: String,
    client_format: EndpointSignature,
    registry: ConversionRegistry,
}

impl StreamProcessor {
    pub fn new(request_id: impl Into<String>, client_format: EndpointSignature) -> Self {
        Self {
            request_id: request_id.into(),
            client_format,
            registry: ConversionRegistry::new(),
        }
    }

    /// Parser for the upstream's wire format, falling back to the client's.
    fn parser_for(&self, ctx: &SharedStreamContext) -> Normalizer {
        let provider_format = ctx
            .lock()
            .ok()
            .and_then(|guard| guard.provider_api_format.clone());
        provider_format
            .as_deref()
            .and_then(|key| parse_signature_key(key).ok())
            .map(|sig| self.registry.normalizer_for(sig))
            .unwrap_or_else(|| self.registry.normalizer_for(self.client_format))
    }

    /// Decode one SSE event's payload into the context: raw chunk capture,
    /// usage counters, collected text, completion detection.
    pub fn handle_sse_event(
        &self,
        ctx: &SharedStreamContext,
        event_name: Option<&str>,
        data_str: &str,
    ) {
        if data_str.is_empty() {
            return;
        }
        if data_str == "[DONE]" {
            if let Ok(mut guard) = ctx.lock() {
                guard.has_completion = true;
            }
            return;
        }
        let Ok(data) = serde_json::from_str::<Value>(data_str) else {
            return;
        };

        let parser = self.parser_for(ctx);
        let Ok(mut guard) = ctx.lock() else {
            return;
        };
        guard.data_count += 1;
        let Value::Object(object) = data else {
            return;
        };
        let data = Value::Object(object.clone());
        guard.push_parsed_chunk(object);

        if let Some(usage) = parser.extract_usage(&data) {
            guard.update_usage(usage);
        }
        if let Some(text) = parser.extract_text(&data) {
            guard.collected_text.push_str(&text);
        }

        let event_type = event_name
            .map(str::to_string)
            .or_else(|| data.get("type").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        if event_type == "response.completed" || event_type == "message_stop" {
            guard.has_completion = true;
        }
    }

    /// Read ahead up to `max_prefetch_lines`, failing fast on HTTP-200 bodies
    /// that are really errors. Nothing is forwarded until this returns.
    pub async fn prefetch_and_check_error(
        &self,
        lines: &mut LineStream,
        provider_name: &str,
        base_url: &str,
        ctx: &SharedStreamContext,
        max_prefetch_lines: usize,
    ) -> GatewayResult<Vec<String>> {
        let parser = self.parser_for(ctx);
        let mut prefetched: Vec<String> = Vec::new();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(request_id = %self.request_id, error = %err, "prefetch read failed");
                    break;
                }
            };
            prefetched.push(line.clone());

            let normalized = line.trim_end_matches('\r');
            if normalized.is_empty() || normalized.starts_with(':') {
                if prefetched.len() >= max_prefetch_lines {
                    break;
                }
                continue;
            }

            let data_str = normalized.strip_prefix("data: ").unwrap_or(normalized);
            if data_str == "[DONE]" {
                break;
            }

            let Ok(data) = serde_json::from_str::<Value>(data_str) else {
                if prefetched.len() >= max_prefetch_lines {
                    break;
                }
                continue;
            };

            if data.is_object() && parser.is_error_response(&data) {
                let parsed = parser.parse_error(&data, 200);
                tracing::warn!(
                    request_id = %self.request_id,
                    provider = provider_name,
                    error_type = ?parsed.error_type,
                    message = %parsed.message,
                    "embedded error detected during prefetch"
                );
                return Err(GatewayError::EmbeddedError {
                    provider: provider_name.to_string(),
                    code: parsed.code,
                    message: sanitize_error_message(&parsed.message),
                    status: parsed.error_type,
                });
            }

            // Valid data and no error: stop reading ahead.
            break;
        }

        self.check_prefetched_buffer(&prefetched, provider_name, base_url, ctx)?;
        Ok(prefetched)
    }

    /// Whole-buffer screen for non-SSE bodies: HTML pages from a
    /// misconfigured base_url, or a bare JSON error spread across lines.
    fn check_prefetched_buffer(
        &self,
        prefetched: &[String],
        provider_name: &str,
        base_url: &str,
        ctx: &SharedStreamContext,
    ) -> GatewayResult<()> {
        if prefetched.is_empty() {
            return Ok(());
        }
        let joined = prefetched.join("\n");
        let stripped = joined.trim_start_matches('\u{feff}').trim_start();

        let prefix = stripped
            .get(..stripped.len().min(32))
            .unwrap_or_default()
            .to_ascii_lowercase();
        if prefix.starts_with("<!doctype") || prefix.starts_with("<html") {
            tracing::error!(
                request_id = %self.request_id,
                provider = provider_name,
                base_url,
                "HTML response detected, base_url likely misconfigured"
            );
            return Err(GatewayError::ProviderNotAvailable(format!(
                "provider '{provider_name}' returned an HTML page instead of an API response; check the endpoint base_url"
            )));
        }

        if stripped.starts_with('{') || stripped.starts_with('[') {
            if let Ok(data) = serde_json::from_str::<Value>(stripped)
                && data.is_object()
            {
                let parser = self.parser_for(ctx);
                if parser.is_error_response(&data) {
                    let parsed = parser.parse_error(&data, 200);
                    return Err(GatewayError::EmbeddedError {
                        provider: provider_name.to_string(),
                        code: parsed.code,
                        message: sanitize_error_message(&parsed.message),
                        status: parsed.error_type,
                    });
                }
            }
        }

        Ok(())
    }

    /// Drive prefetched lines then the live tail into `tx`.
    ///
    /// A closed receiver is the client-disconnect signal: status becomes 499
    /// and the upstream is dropped. Read failures after bytes have been sent
    /// stamp a 500 but are not retried.
    pub async fn run_response_stream(
        &self,
        ctx: SharedStreamContext,
        mut lines: LineStream,
        prefetched: Vec<String>,
        mut converter: Option<StreamConverter>,
        tx: mpsc::Sender<Bytes>,
    ) {
        let mut sse = SseParser::new();

        for line in prefetched {
            if !self
                .forward_line(&ctx, &mut sse, &mut converter, &line, &tx)
                .await
            {
                return;
            }
        }

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !self
                        .forward_line(&ctx, &mut sse, &mut converter, &line, &tx)
                        .await
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    if let Ok(mut guard) = ctx.lock() {
                        guard.mark_failed(500, sanitize_error_message(&err.to_string()));
                    }
                    return;
                }
            }
        }

        for event in sse.finish() {
            self.handle_sse_event(&ctx, event.event.as_deref(), &event.data);
        }
        if let Some(converter) = converter.as_mut() {
            for frame in converter.finish() {
                if tx.send(Bytes::from(frame)).await.is_err() {
                    self.mark_disconnected(&ctx);
                    return;
                }
            }
        }
    }

    /// Returns false when the stream should stop (client went away).
    async fn forward_line(
        &self,
        ctx: &SharedStreamContext,
        sse: &mut SseParser,
        converter: &mut Option<StreamConverter>,
        line: &str,
        tx: &mpsc::Sender<Bytes>,
    ) -> bool {
        let normalized = line.trim_end_matches('\r');
        let events = sse.feed_line(normalized);

        let mut outgoing: Vec<Bytes> = Vec::new();
        match converter.as_mut() {
            Some(converter) => {
                for event in &events {
                    for frame in converter.convert_event(event.event.as_deref(), &event.data) {
                        outgoing.push(Bytes::from(frame));
                    }
                }
                if !normalized.is_empty()
                    && let Ok(mut guard) = ctx.lock()
                {
                    guard.chunk_count += 1;
                }
            }
            None => {
                if normalized.is_empty() {
                    outgoing.push(Bytes::from_static(b"\n"));
                } else {
                    if let Ok(mut guard) = ctx.lock() {
                        guard.chunk_count += 1;
                    }
                    outgoing.push(Bytes::from(format!("{line}\n")));
                }
            }
        }

        for event in &events {
            self.handle_sse_event(ctx, event.event.as_deref(), &event.data);
        }

        for chunk in outgoing {
            if tx.send(chunk).await.is_err() {
                self.mark_disconnected(ctx);
                return false;
            }
        }
        true
    }

    fn mark_disconnected(&self, ctx: &SharedStreamContext) {
        tracing::warn!(request_id = %self.request_id, "client disconnected");
        if let Ok(mut guard) = ctx.lock() {
            guard.mark_failed(499, "client_disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamContext, shared_context};
    use futures_util::stream;

    fn byte_stream(chunks: Vec<&'static str>) -> ByteStream {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes()))),
        )
        .boxed()
    }

    fn processor() -> StreamProcessor {
        StreamProcessor::new("req-1", parse_signature_key("openai:chat").unwrap())
    }

    #[tokio::test]
    async fn line_stream_reassembles_split_chunks() {
        let mut lines = LineStream::new(byte_stream(vec!["data: {\"a\"", ":1}\n\ndata: x\n"]));
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("data: {\"a\":1}")
        );
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("data: x"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefetch_detects_gemini_embedded_error() {
        let ctx = shared_context(StreamContext::new("gemini-pro", "gemini:chat"));
        if let Ok(mut guard) = ctx.lock() {
            guard.provider_api_format = Some("gemini:chat".to_string());
        }
        let mut lines = LineStream::new(byte_stream(vec![
            "data: {\"error\":{\"code\":429,\"message\":\"quota\"}}\n",
        ]));
        let err = processor()
            .prefetch_and_check_error(&mut lines, "gemini-main", "https://example", &ctx, 5)
            .await
            .unwrap_err();
        match err {
            GatewayError::EmbeddedError { provider, code, .. } => {
                assert_eq!(provider, "gemini-main");
                assert_eq!(code, Some(429));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn prefetch_detects_html_misconfiguration() {
        let ctx = shared_context(StreamContext::new("gpt-4o", "openai:chat"));
        let mut lines = LineStream::new(byte_stream(vec![
            "<!DOCTYPE html>\n<html><body>nginx</body></html>\n",
        ]));
        let err = processor()
            .prefetch_and_check_error(&mut lines, "p1", "https://wrong", &ctx, 5)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_not_available");
    }

    #[tokio::test]
    async fn prefetch_passes_valid_data_through() {
        let ctx = shared_context(StreamContext::new("gpt-4o", "openai:chat"));
        let mut lines = LineStream::new(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
        ]));
        let prefetched = processor()
            .prefetch_and_check_error(&mut lines, "p1", "https://ok", &ctx, 5)
            .await
            .unwrap();
        assert_eq!(prefetched.len(), 1);
    }

    #[tokio::test]
    async fn passthrough_stream_reemits_lines_and_collects_usage() {
        let ctx = shared_context(StreamContext::new("gpt-4o", "openai:chat"));
        let lines = LineStream::new(byte_stream(vec![
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        ]));
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        processor()
            .run_response_stream(ctx.clone(), lines, Vec::new(), None, tx)
            .await;

        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(String::from_utf8_lossy(&chunk).into_owned());
        }
        assert!(out.iter().any(|l| l.contains("\"he\"")));
        assert!(out.iter().any(|l| l.contains("[DONE]")));

        let guard = ctx.lock().unwrap();
        assert_eq!(guard.input_tokens, 10);
        assert_eq!(guard.output_tokens, 5);
        assert!(guard.has_completion);
        assert_eq!(guard.collected_text, "he");
        assert!(guard.chunk_count >= 3);
    }

    #[tokio::test]
    async fn dropped_receiver_marks_client_disconnected() {
        let ctx = shared_context(StreamContext::new("gpt-4o", "openai:chat"));
        let lines = LineStream::new(byte_stream(vec![
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"},\"finish_reason\":null}]}\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"b\"},\"finish_reason\":null}]}\n",
        ]));
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        drop(rx);
        processor()
            .run_response_stream(ctx.clone(), lines, Vec::new(), None, tx)
            .await;
        let guard = ctx.lock().unwrap();
        assert_eq!(guard.status_code, 499);
        assert_eq!(guard.error_message.as_deref(), Some("client_disconnected"));
    }
}
