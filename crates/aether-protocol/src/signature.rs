use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol family of an endpoint. Decides wire format and auth defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFamily {
    /// OpenAI-compatible (includes deepseek, grok, qwen and friends).
    OpenAI,
    Claude,
    Gemini,
}

impl ApiFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiFamily::OpenAI => "openai",
            ApiFamily::Claude => "claude",
            ApiFamily::Gemini => "gemini",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ApiFamily::OpenAI),
            "claude" => Some(ApiFamily::Claude),
            "gemini" => Some(ApiFamily::Gemini),
            _ => None,
        }
    }
}

/// Endpoint variant within a family. Decides path and data-format variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Chat,
    Cli,
    Video,
    Image,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::Chat => "chat",
            EndpointKind::Cli => "cli",
            EndpointKind::Video => "video",
            EndpointKind::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chat" => Some(EndpointKind::Chat),
            "cli" => Some(EndpointKind::Cli),
            "video" => Some(EndpointKind::Video),
            "image" => Some(EndpointKind::Image),
            _ => None,
        }
    }
}

/// How upstream auth headers are constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// `Authorization: Bearer {token}`
    Bearer,
    /// `x-api-key: {key}`
    ApiKey,
    /// `x-goog-api-key: {key}`
    GoogApiKey,
    /// Google OAuth2 / service account; bearer on the upstream side.
    Oauth2,
    /// `?key={key}`; emitted upstream as `x-goog-api-key`.
    QueryKey,
}

/// Functional category of an inbound request, independent of family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Chat,
    Video,
    Files,
    Image,
    Audio,
    Embedding,
    Models,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureError {
    pub value: String,
}

impl SignatureError {
    pub fn kind(&self) -> &'static str {
        "invalid_signature"
    }
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid endpoint signature: {:?}", self.value)
    }
}

impl Error for SignatureError {}

/// Structured `(family, kind)` identity of an endpoint variant.
///
/// The canonical string form is `family:kind`, all lowercase; it is the key
/// used wherever a JSON map, metrics label or log line needs a format id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointSignature {
    pub api_family: ApiFamily,
    pub endpoint_kind: EndpointKind,
}

impl EndpointSignature {
    pub const fn new(api_family: ApiFamily, endpoint_kind: EndpointKind) -> Self {
        Self {
            api_family,
            endpoint_kind,
        }
    }

    pub fn key(&self) -> String {
        make_signature_key(self.api_family, self.endpoint_kind)
    }

    pub fn is_cli(&self) -> bool {
        self.endpoint_kind == EndpointKind::Cli
    }

    /// CLI variants share the chat data path; everything else maps to itself.
    pub fn base(&self) -> EndpointSignature {
        if self.endpoint_kind == EndpointKind::Cli {
            EndpointSignature::new(self.api_family, EndpointKind::Chat)
        } else {
            *self
        }
    }
}

impl fmt::Display for EndpointSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.api_family.as_str(), self.endpoint_kind.as_str())
    }
}

pub fn make_signature_key(api_family: ApiFamily, endpoint_kind: EndpointKind) -> String {
    format!("{}:{}", api_family.as_str(), endpoint_kind.as_str())
}

/// Parse a signature key. Case-insensitive, whitespace-tolerant.
pub fn parse_signature_key(value: &str) -> Result<EndpointSignature, SignatureError> {
    let raw = value.trim();
    let invalid = || SignatureError {
        value: value.to_string(),
    };
    let (fam_raw, kind_raw) = raw.split_once(':').ok_or_else(invalid)?;
    let api_family = ApiFamily::parse(fam_raw).ok_or_else(invalid)?;
    let endpoint_kind = EndpointKind::parse(kind_raw).ok_or_else(invalid)?;
    Ok(EndpointSignature::new(api_family, endpoint_kind))
}

/// Normalize case/whitespace to the canonical lowercase `family:kind`.
pub fn normalize_signature_key(value: &str) -> Result<String, SignatureError> {
    parse_signature_key(value).map(|sig| sig.key())
}

pub fn is_cli_format(value: &str) -> bool {
    parse_signature_key(value).map(|sig| sig.is_cli()).unwrap_or(false)
}

pub fn is_same_format(a: &str, b: &str) -> bool {
    match (parse_signature_key(a), parse_signature_key(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_key_is_canonical() {
        assert_eq!(
            make_signature_key(ApiFamily::OpenAI, EndpointKind::Chat),
            "openai:chat"
        );
    }

    #[test]
    fn parse_roundtrip() {
        let sig = parse_signature_key("OpenAI:CHAT").unwrap();
        assert_eq!(sig.api_family, ApiFamily::OpenAI);
        assert_eq!(sig.endpoint_kind, EndpointKind::Chat);
        assert_eq!(sig.key(), "openai:chat");
        assert_eq!(parse_signature_key(&sig.key()).unwrap(), sig);
    }

    #[test]
    fn parse_rejects_missing_separator_and_unknown_parts() {
        assert!(parse_signature_key("OPENAI").is_err());
        assert!(parse_signature_key("mistral:chat").is_err());
        assert!(parse_signature_key("openai:speech").is_err());
        assert_eq!(parse_signature_key("").unwrap_err().kind(), "invalid_signature");
    }

    #[test]
    fn normalize_strips_case_and_whitespace() {
        assert_eq!(
            normalize_signature_key("  Gemini:VIDEO  ").unwrap(),
            "gemini:video"
        );
    }

    #[test]
    fn cli_base_maps_to_chat() {
        let cli = parse_signature_key("claude:cli").unwrap();
        assert!(cli.is_cli());
        assert_eq!(cli.base().key(), "claude:chat");
        let chat = parse_signature_key("openai:chat").unwrap();
        assert_eq!(chat.base(), chat);
    }
}
