use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;

use aether_common::{GatewayError, new_request_id};
use aether_core::{
    CallerIdentity, DispatchBody, DispatchEngine, DownloadOutcome, VideoService,
};
use aether_protocol::{
    ApiFamily, EndpointKind, EndpointSignature, Headers, detect_request_context,
};

use crate::error::{error_response, unauthorized};

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<DispatchEngine>,
    pub video: Arc<VideoService>,
}

pub fn proxy_router(engine: Arc<DispatchEngine>, video: Arc<VideoService>) -> Router {
    let state = ProxyState { engine, video };
    Router::new()
        // OpenAI surface
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/responses", post(openai_responses))
        .route("/v1/videos", post(openai_video_submit))
        .route("/v1/videos", get(openai_video_list))
        .route("/v1/videos/{id}", get(openai_video_get))
        .route("/v1/videos/{id}/content", get(openai_video_content))
        // Claude surface
        .route("/v1/messages", post(claude_messages))
        // Gemini surface
        .route("/v1beta/models/{*name}", post(gemini_model_post))
        .route("/v1beta/models/{*name}", get(gemini_model_get))
        .route("/v1beta/operations/{*name}", get(gemini_operation_get))
        .route("/v1beta/files/{*name}", get(gemini_file_download))
        .with_state(state)
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn query_pairs(raw: Option<&str>) -> Vec<(String, String)> {
    raw.unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

async fn authenticate(
    state: &ProxyState,
    path: &str,
    headers: &Headers,
    query: &[(String, String)],
) -> Result<CallerIdentity, Response> {
    let ctx = detect_request_context(path, headers, query);
    let family = ctx.endpoint.api_family;
    let Some(credential) = ctx.credential else {
        return Err(unauthorized(family));
    };
    state
        .engine
        .authenticate(&credential)
        .await
        .ok_or_else(|| unauthorized(family))
}

/// SSE responses carry anti-buffering headers so intermediaries do not batch
/// the stream.
fn stream_response(rx: tokio::sync::mpsc::Receiver<Bytes>, content_type: &'static str) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (status, axum::Json(body)).into_response()
}

async fn dispatch_chat(
    state: ProxyState,
    path: &str,
    header_map: HeaderMap,
    raw_query: Option<String>,
    mut body: Value,
    client_format: EndpointSignature,
    model_from_path: Option<String>,
    force_stream: Option<bool>,
) -> Response {
    let headers = headers_to_vec(&header_map);
    let query = query_pairs(raw_query.as_deref());
    let family = client_format.api_family;

    let caller = match authenticate(&state, path, &headers, &query).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    if let Some(model) = model_from_path
        && let Some(object) = body.as_object_mut()
    {
        object.insert("model".to_string(), Value::String(model));
    }
    let is_stream = force_stream
        .unwrap_or_else(|| body.get("stream").and_then(Value::as_bool).unwrap_or(false));
    let task_type = if client_format.endpoint_kind == EndpointKind::Cli {
        "cli"
    } else {
        "chat"
    };

    let request_id = new_request_id();
    match state
        .engine
        .dispatch_chat(&request_id, caller, client_format, task_type, body, is_stream)
        .await
    {
        Ok(outcome) => match outcome.body {
            DispatchBody::Bytes(bytes) => {
                let mut response = Response::new(Body::from(bytes));
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(outcome.content_type),
                );
                response
            }
            DispatchBody::Stream(rx) => stream_response(rx, outcome.content_type),
        },
        Err(err) => error_response(family, &err),
    }
}

fn sig(family: ApiFamily, kind: EndpointKind) -> EndpointSignature {
    EndpointSignature::new(family, kind)
}

// ---- OpenAI ----

async fn openai_chat_completions(
    State(state): State<ProxyState>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    dispatch_chat(
        state,
        "/v1/chat/completions",
        header_map,
        raw_query,
        body,
        sig(ApiFamily::OpenAI, EndpointKind::Chat),
        None,
        None,
    )
    .await
}

async fn openai_responses(
    State(state): State<ProxyState>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    dispatch_chat(
        state,
        "/v1/responses",
        header_map,
        raw_query,
        body,
        sig(ApiFamily::OpenAI, EndpointKind::Cli),
        None,
        None,
    )
    .await
}

async fn openai_video_submit(
    State(state): State<ProxyState>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let headers = headers_to_vec(&header_map);
    let query = query_pairs(raw_query.as_deref());
    let caller = match authenticate(&state, "/v1/videos", &headers, &query).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    let request_id = new_request_id();
    match state
        .video
        .submit(
            &request_id,
            caller,
            sig(ApiFamily::OpenAI, EndpointKind::Video),
            body,
            None,
            &headers,
        )
        .await
    {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => error_response(ApiFamily::OpenAI, &err),
    }
}

async fn openai_video_list(
    State(state): State<ProxyState>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let headers = headers_to_vec(&header_map);
    let query = query_pairs(raw_query.as_deref());
    let caller = match authenticate(&state, "/v1/videos", &headers, &query).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    match state
        .video
        .list_tasks(caller.user_id, sig(ApiFamily::OpenAI, EndpointKind::Video))
        .await
    {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => error_response(ApiFamily::OpenAI, &err),
    }
}

async fn openai_video_get(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let headers = headers_to_vec(&header_map);
    let query = query_pairs(raw_query.as_deref());
    let caller = match authenticate(&state, "/v1/videos", &headers, &query).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    match state.video.task_by_operation(caller.user_id, &id).await {
        Ok(task) => json_response(
            StatusCode::OK,
            state
                .video
                .render_task(sig(ApiFamily::OpenAI, EndpointKind::Video), &task),
        ),
        Err(err) => error_response(ApiFamily::OpenAI, &err),
    }
}

async fn openai_video_content(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let headers = headers_to_vec(&header_map);
    let query = query_pairs(raw_query.as_deref());
    let caller = match authenticate(&state, "/v1/videos", &headers, &query).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    download_response(&state, caller, &id, ApiFamily::OpenAI).await
}

// ---- Claude ----

async fn claude_messages(
    State(state): State<ProxyState>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    // chat vs cli is decided by the auth header on this shared path.
    let headers = headers_to_vec(&header_map);
    let query = query_pairs(raw_query.as_deref());
    let detected = detect_request_context("/v1/messages", &headers, &query);
    dispatch_chat(
        state,
        "/v1/messages",
        header_map,
        raw_query,
        body,
        detected.endpoint,
        None,
        None,
    )
    .await
}

// ---- Gemini ----

/// `{model}:{action}` from a Gemini-style path tail.
fn split_model_action(name: &str) -> (String, String) {
    match name.rsplit_once(':') {
        Some((model, action)) => (model.to_string(), action.to_ascii_lowercase()),
        None => (name.to_string(), String::new()),
    }
}

async fn gemini_model_post(
    State(state): State<ProxyState>,
    Path(name): Path<String>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let (model, action) = split_model_action(&name);
    match action.as_str() {
        "generatecontent" | "streamgeneratecontent" => {
            let is_stream = action == "streamgeneratecontent";
            dispatch_chat(
                state,
                "/v1beta/models",
                header_map,
                raw_query,
                body,
                sig(ApiFamily::Gemini, EndpointKind::Chat),
                Some(model),
                Some(is_stream),
            )
            .await
        }
        "predictlongrunning" => {
            let headers = headers_to_vec(&header_map);
            let query = query_pairs(raw_query.as_deref());
            let path = format!("/v1beta/models/{name}");
            let caller = match authenticate(&state, &path, &headers, &query).await {
                Ok(caller) => caller,
                Err(response) => return response,
            };
            let request_id = new_request_id();
            match state
                .video
                .submit(
                    &request_id,
                    caller,
                    sig(ApiFamily::Gemini, EndpointKind::Video),
                    body,
                    Some(&model),
                    &headers,
                )
                .await
            {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(err) => error_response(ApiFamily::Gemini, &err),
            }
        }
        _ => error_response(
            ApiFamily::Gemini,
            &GatewayError::InvalidRequest(format!("unsupported action {action:?}")),
        ),
    }
}

async fn gemini_model_get(
    State(state): State<ProxyState>,
    Path(name): Path<String>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    // Task polling arrives as models/{model}/operations/{short_id}.
    if !name.contains("/operations/") {
        return error_response(
            ApiFamily::Gemini,
            &GatewayError::NotFound("operation".to_string()),
        );
    }
    gemini_operation_lookup(state, name, header_map, raw_query).await
}

async fn gemini_operation_get(
    State(state): State<ProxyState>,
    Path(name): Path<String>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    gemini_operation_lookup(state, name, header_map, raw_query).await
}

async fn gemini_operation_lookup(
    state: ProxyState,
    name: String,
    header_map: HeaderMap,
    raw_query: Option<String>,
) -> Response {
    let headers = headers_to_vec(&header_map);
    let query = query_pairs(raw_query.as_deref());
    let caller = match authenticate(&state, "/v1beta/operations", &headers, &query).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    match state.video.task_by_operation(caller.user_id, &name).await {
        Ok(task) => json_response(
            StatusCode::OK,
            state
                .video
                .render_task(sig(ApiFamily::Gemini, EndpointKind::Video), &task),
        ),
        Err(err) => error_response(ApiFamily::Gemini, &err),
    }
}

async fn gemini_file_download(
    State(state): State<ProxyState>,
    Path(name): Path<String>,
    header_map: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let headers = headers_to_vec(&header_map);
    let query = query_pairs(raw_query.as_deref());
    let caller = match authenticate(&state, "/v1beta/files", &headers, &query).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    let short_id = name
        .strip_suffix(":download")
        .unwrap_or(name.as_str())
        .to_string();
    download_response(&state, caller, &short_id, ApiFamily::Gemini).await
}

async fn download_response(
    state: &ProxyState,
    caller: CallerIdentity,
    operation: &str,
    family: ApiFamily,
) -> Response {
    match state.video.download_content(caller.user_id, operation).await {
        Ok(DownloadOutcome::Ready {
            content_type,
            bytes,
        }) => {
            let mut response = Response::new(Body::from(bytes));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            response
        }
        Ok(DownloadOutcome::Processing(status)) => json_response(
            StatusCode::ACCEPTED,
            json!({"detail": format!("video is still processing (status: {status})")}),
        ),
        Ok(DownloadOutcome::Failed(message)) => json_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({"detail": format!("video generation failed: {message}")}),
        ),
        Ok(DownloadOutcome::Expired) => json_response(
            StatusCode::GONE,
            json!({"detail": "video URL has expired"}),
        ),
        Ok(DownloadOutcome::NotAvailable) => json_response(
            StatusCode::NOT_FOUND,
            json!({"detail": "video not available"}),
        ),
        Err(err) => error_response(family, &err),
    }
}
