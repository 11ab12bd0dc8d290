use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use wreq::{Client, Method, Proxy};

use aether_common::{GatewayError, GatewayResult};
use aether_protocol::Headers;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    /// Ask for a streaming body instead of buffering.
    pub stream: bool,
    pub timeout: Option<Duration>,
}

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamHttpResponse {
    /// Buffered body bytes; empty for streaming responses.
    pub fn bytes(&self) -> Bytes {
        match &self.body {
            UpstreamBody::Bytes(bytes) => bytes.clone(),
            UpstreamBody::Stream(_) => Bytes::new(),
        }
    }
}

/// Outbound HTTP seam for dispatch and polling.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, req: UpstreamHttpRequest) -> GatewayResult<UpstreamHttpResponse>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide wreq client, cached per proxy setting. Shared freely across
/// tasks; wreq clients are cheap to clone.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> GatewayResult<Self> {
        let proxy = normalize_proxy(config.proxy.clone());
        let initial = build_client(&config, proxy.as_deref())?;
        let mut clients = HashMap::new();
        clients.insert(proxy, initial);
        Ok(Self {
            config,
            clients: Arc::new(Mutex::new(clients)),
        })
    }

    fn client(&self) -> GatewayResult<Client> {
        let proxy = normalize_proxy(self.config.proxy.clone());
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| GatewayError::Upstream("client cache lock poisoned".to_string()))?;
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref())?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> GatewayResult<Client> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(
            Proxy::all(proxy)
                .map_err(|e| GatewayError::Upstream(format!("invalid proxy: {e}")))?,
        );
    }
    builder
        .build()
        .map_err(|e| GatewayError::Upstream(format!("client build failed: {e}")))
}

#[async_trait::async_trait]
impl UpstreamClient for WreqUpstreamClient {
    async fn send(&self, req: UpstreamHttpRequest) -> GatewayResult<UpstreamHttpResponse> {
        let client = self.client()?;
        let method = match req.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        let mut builder = client.request(method, &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::ProviderNotAvailable(format!("upstream send failed: {e}")))?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = if req.stream {
            let stream = response
                .bytes_stream()
                .map(|item| {
                    item.map_err(|e| GatewayError::Upstream(format!("stream read failed: {e}")))
                })
                .boxed();
            UpstreamBody::Stream(stream)
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| GatewayError::Upstream(format!("body read failed: {e}")))?;
            UpstreamBody::Bytes(bytes)
        };

        Ok(UpstreamHttpResponse {
            status,
            headers,
            body,
        })
    }
}
