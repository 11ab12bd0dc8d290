use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Canonical chat request the normalizers translate through.
///
/// Holds the fields every family can express; anything family-specific rides
/// in `extra` untouched so a round trip does not silently drop it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InternalChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<InternalMessage>,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
    pub stream: bool,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternalMessage {
    pub role: MessageRole,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
}

impl InternalUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_tokens == 0
            && self.cache_creation_tokens == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InternalChatResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: InternalUsage,
}

/// Family-agnostic streaming delta, decoded from one upstream chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalStreamEvent {
    Start {
        id: Option<String>,
        model: Option<String>,
    },
    TextDelta(String),
    Usage(InternalUsage),
    Done {
        finish_reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Submitted,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl VideoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Submitted => "submitted",
            VideoStatus::Queued => "queued",
            VideoStatus::Processing => "processing",
            VideoStatus::Completed => "completed",
            VideoStatus::Failed => "failed",
            VideoStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(VideoStatus::Pending),
            "submitted" => Some(VideoStatus::Submitted),
            "queued" => Some(VideoStatus::Queued),
            "processing" => Some(VideoStatus::Processing),
            "completed" => Some(VideoStatus::Completed),
            "failed" => Some(VideoStatus::Failed),
            "cancelled" => Some(VideoStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VideoStatus::Completed | VideoStatus::Failed | VideoStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InternalVideoRequest {
    pub model: String,
    pub prompt: String,
    pub duration_seconds: Option<f64>,
    pub resolution: Option<String>,
    pub aspect_ratio: Option<String>,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InternalVideoPollResult {
    pub status: VideoStatus,
    pub progress_percent: i32,
    pub video_url: Option<String>,
    pub video_urls: Vec<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub video_duration_seconds: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub raw_response: Option<Value>,
}

impl Default for VideoStatus {
    fn default() -> Self {
        VideoStatus::Pending
    }
}
