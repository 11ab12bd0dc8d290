use std::error::Error;
use std::fmt;

use serde_json::Value;

use aether_protocol::ApiFamily;

use crate::internal::{
    InternalChatRequest, InternalChatResponse, InternalStreamEvent, InternalUsage,
    InternalVideoPollResult, InternalVideoRequest,
};

pub mod claude;
pub mod gemini;
pub mod openai;

pub type TransformResult<T> = Result<T, TransformError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    MissingField(&'static str),
    InvalidShape(String),
    UnsupportedPair { src: String, dst: String },
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformError::MissingField(field) => write!(f, "missing field: {field}"),
            TransformError::InvalidShape(msg) => write!(f, "invalid payload shape: {msg}"),
            TransformError::UnsupportedPair { src, dst } => {
                write!(f, "no conversion from {src} to {dst}")
            }
        }
    }
}

impl Error for TransformError {}

/// Error payload details after `is_error_response` matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedError {
    /// Family-native type/status; numeric Gemini codes come back as digits.
    pub error_type: Option<String>,
    pub message: String,
    pub code: Option<i64>,
}

/// One normalizer per family, selected by `ApiFamily` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    OpenAI,
    Claude,
    Gemini,
}

impl Normalizer {
    pub fn for_family(family: ApiFamily) -> Self {
        match family {
            ApiFamily::OpenAI => Normalizer::OpenAI,
            ApiFamily::Claude => Normalizer::Claude,
            ApiFamily::Gemini => Normalizer::Gemini,
        }
    }

    pub fn family(self) -> ApiFamily {
        match self {
            Normalizer::OpenAI => ApiFamily::OpenAI,
            Normalizer::Claude => ApiFamily::Claude,
            Normalizer::Gemini => ApiFamily::Gemini,
        }
    }

    pub fn chat_request_to_internal(self, body: &Value) -> TransformResult<InternalChatRequest> {
        match self {
            Normalizer::OpenAI => openai::chat_request_to_internal(body),
            Normalizer::Claude => claude::chat_request_to_internal(body),
            Normalizer::Gemini => gemini::chat_request_to_internal(body),
        }
    }

    pub fn chat_request_from_internal(self, req: &InternalChatRequest) -> Value {
        match self {
            Normalizer::OpenAI => openai::chat_request_from_internal(req),
            Normalizer::Claude => claude::chat_request_from_internal(req),
            Normalizer::Gemini => gemini::chat_request_from_internal(req),
        }
    }

    pub fn chat_response_to_internal(self, body: &Value) -> InternalChatResponse {
        match self {
            Normalizer::OpenAI => openai::chat_response_to_internal(body),
            Normalizer::Claude => claude::chat_response_to_internal(body),
            Normalizer::Gemini => gemini::chat_response_to_internal(body),
        }
    }

    pub fn chat_response_from_internal(self, resp: &InternalChatResponse) -> Value {
        match self {
            Normalizer::OpenAI => openai::chat_response_from_internal(resp),
            Normalizer::Claude => claude::chat_response_from_internal(resp),
            Normalizer::Gemini => gemini::chat_response_from_internal(resp),
        }
    }

    /// Usage counters from a response or stream chunk, if the payload has any.
    pub fn extract_usage(self, body: &Value) -> Option<InternalUsage> {
        match self {
            Normalizer::OpenAI => openai::extract_usage(body),
            Normalizer::Claude => claude::extract_usage(body),
            Normalizer::Gemini => gemini::extract_usage(body),
        }
    }

    /// Visible text carried by a response or stream chunk.
    pub fn extract_text(self, body: &Value) -> Option<String> {
        match self {
            Normalizer::OpenAI => openai::extract_text(body),
            Normalizer::Claude => claude::extract_text(body),
            Normalizer::Gemini => gemini::extract_text(body),
        }
    }

    /// Whether a 200-status payload actually conveys an error.
    pub fn is_error_response(self, body: &Value) -> bool {
        match self {
            Normalizer::OpenAI => openai::is_error_response(body),
            Normalizer::Claude => claude::is_error_response(body),
            Normalizer::Gemini => gemini::is_error_response(body),
        }
    }

    pub fn parse_error(self, body: &Value, status: u16) -> ParsedError {
        match self {
            Normalizer::OpenAI => openai::parse_error(body, status),
            Normalizer::Claude => claude::parse_error(body, status),
            Normalizer::Gemini => gemini::parse_error(body, status),
        }
    }

    pub fn decode_stream_chunk(
        self,
        event_name: Option<&str>,
        chunk: &Value,
    ) -> Vec<InternalStreamEvent> {
        match self {
            Normalizer::OpenAI => openai::decode_stream_chunk(chunk),
            Normalizer::Claude => claude::decode_stream_chunk(event_name, chunk),
            Normalizer::Gemini => gemini::decode_stream_chunk(chunk),
        }
    }

    pub fn video_request_to_internal(self, body: &Value) -> TransformResult<InternalVideoRequest> {
        match self {
            Normalizer::OpenAI => openai::video_request_to_internal(body),
            Normalizer::Gemini => gemini::video_request_to_internal(body),
            Normalizer::Claude => Err(TransformError::UnsupportedPair {
                src: "claude".to_string(),
                dst: "video".to_string(),
            }),
        }
    }

    pub fn video_request_from_internal(self, req: &InternalVideoRequest) -> TransformResult<Value> {
        match self {
            Normalizer::OpenAI => Ok(openai::video_request_from_internal(req)),
            Normalizer::Gemini => Ok(gemini::video_request_from_internal(req)),
            Normalizer::Claude => Err(TransformError::UnsupportedPair {
                src: "video".to_string(),
                dst: "claude".to_string(),
            }),
        }
    }

    pub fn video_poll_to_internal(self, body: &Value) -> InternalVideoPollResult {
        match self {
            Normalizer::OpenAI => openai::video_poll_to_internal(body),
            Normalizer::Gemini => gemini::video_poll_to_internal(body),
            // Claude has no video surface; treat anything as still-processing.
            Normalizer::Claude => InternalVideoPollResult::default(),
        }
    }
}
