pub mod auth;
pub mod claude;
pub mod detection;
pub mod gemini;
pub mod headers;
pub mod metadata;
pub mod openai;
pub mod signature;
pub mod sse;

pub use auth::{build_auth_headers, default_auth_method_for, extract_credential};
pub use detection::{
    RequestContext, detect_format_from_request, detect_format_from_response,
    detect_request_context,
};
pub use headers::{
    HOP_BY_HOP_HEADERS, Headers, UPSTREAM_DROP_HEADERS, header_get, header_remove, header_set,
    is_hop_by_hop, merge_headers_with_protection, normalize_headers,
};
pub use metadata::{
    EndpointDefinition, can_passthrough_endpoint, data_format_id, list_endpoint_definitions,
    resolve_endpoint_definition,
};
pub use signature::{
    ApiFamily, AuthMethod, EndpointKind, EndpointSignature, EndpointType, SignatureError,
    is_cli_format, is_same_format, make_signature_key, normalize_signature_key,
    parse_signature_key,
};
pub use sse::{SseEvent, SseParser};
