use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use aether_common::{GatewayError, sanitize_error_message};
use aether_protocol::ApiFamily;

fn status_for(error: &GatewayError) -> StatusCode {
    match error.kind() {
        "invalid_request" => StatusCode::BAD_REQUEST,
        "conflict" => StatusCode::CONFLICT,
        "not_found" => StatusCode::NOT_FOUND,
        "embedded_error" | "provider_not_available" | "upstream_error" => StatusCode::BAD_GATEWAY,
        "client_disconnected" => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render a gateway error in the client family's native error shape.
pub fn error_response(family: ApiFamily, error: &GatewayError) -> Response {
    let status = status_for(error);
    let message = sanitize_error_message(&error.to_string());
    let body = match family {
        ApiFamily::OpenAI => json!({
            "error": {"message": message, "type": error.kind()},
        }),
        ApiFamily::Claude => json!({
            "type": "error",
            "error": {"type": error.kind(), "message": message},
        }),
        ApiFamily::Gemini => json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "status": gemini_status_label(status),
            },
        }),
    };
    (status, Json(body)).into_response()
}

pub fn unauthorized(family: ApiFamily) -> Response {
    let body = match family {
        ApiFamily::OpenAI => json!({
            "error": {"message": "missing or invalid api key", "type": "authentication_error"},
        }),
        ApiFamily::Claude => json!({
            "type": "error",
            "error": {"type": "authentication_error", "message": "missing or invalid api key"},
        }),
        ApiFamily::Gemini => json!({
            "error": {"code": 401, "message": "missing or invalid api key", "status": "UNAUTHENTICATED"},
        }),
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

fn gemini_status_label(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        409 => "ABORTED",
        429 => "RESOURCE_EXHAUSTED",
        502 => "BAD_GATEWAY",
        _ => "INTERNAL",
    }
}
