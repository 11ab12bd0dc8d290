use crate::signature::{ApiFamily, AuthMethod, EndpointKind, EndpointSignature};

/// Static per-signature endpoint policy: default upstream path, auth method,
/// fixed headers, header keys a client may not override, and the data-format
/// id used to decide payload passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDefinition {
    pub signature: EndpointSignature,
    pub default_path: &'static str,
    pub auth_method: AuthMethod,
    pub extra_headers: &'static [(&'static str, &'static str)],
    pub protected_headers: &'static [&'static str],
    /// Signatures sharing a `data_format_id` can exchange payloads untouched.
    pub data_format_id: &'static str,
    pub allow_passthrough: bool,
}

const OPENAI_CHAT: EndpointDefinition = EndpointDefinition {
    signature: EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat),
    default_path: "/v1/chat/completions",
    auth_method: AuthMethod::Bearer,
    extra_headers: &[],
    protected_headers: &[],
    data_format_id: "openai_chat",
    allow_passthrough: true,
};

const OPENAI_CLI: EndpointDefinition = EndpointDefinition {
    signature: EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Cli),
    default_path: "/v1/responses",
    auth_method: AuthMethod::Bearer,
    extra_headers: &[],
    protected_headers: &[],
    data_format_id: "openai_responses",
    allow_passthrough: true,
};

const OPENAI_VIDEO: EndpointDefinition = EndpointDefinition {
    signature: EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Video),
    default_path: "/v1/videos",
    auth_method: AuthMethod::Bearer,
    extra_headers: &[],
    protected_headers: &[],
    data_format_id: "openai_video",
    allow_passthrough: true,
};

const OPENAI_IMAGE: EndpointDefinition = EndpointDefinition {
    signature: EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Image),
    default_path: "/v1/images/generations",
    auth_method: AuthMethod::Bearer,
    extra_headers: &[],
    protected_headers: &[],
    data_format_id: "openai_image",
    allow_passthrough: true,
};

const CLAUDE_CHAT: EndpointDefinition = EndpointDefinition {
    signature: EndpointSignature::new(ApiFamily::Claude, EndpointKind::Chat),
    default_path: "/v1/messages",
    auth_method: AuthMethod::ApiKey,
    extra_headers: &[("anthropic-version", "2023-06-01")],
    protected_headers: &["anthropic-version"],
    data_format_id: "claude",
    allow_passthrough: true,
};

const CLAUDE_CLI: EndpointDefinition = EndpointDefinition {
    signature: EndpointSignature::new(ApiFamily::Claude, EndpointKind::Cli),
    default_path: "/v1/messages",
    auth_method: AuthMethod::Bearer,
    extra_headers: &[
        ("anthropic-version", "2023-06-01"),
        ("anthropic-beta", "oauth-2025-04-20"),
    ],
    protected_headers: &["anthropic-version", "anthropic-beta"],
    data_format_id: "claude",
    allow_passthrough: true,
};

const GEMINI_CHAT: EndpointDefinition = EndpointDefinition {
    signature: EndpointSignature::new(ApiFamily::Gemini, EndpointKind::Chat),
    default_path: "/v1beta/models/{model}:generateContent",
    auth_method: AuthMethod::GoogApiKey,
    extra_headers: &[],
    protected_headers: &[],
    data_format_id: "gemini",
    allow_passthrough: true,
};

const GEMINI_CLI: EndpointDefinition = EndpointDefinition {
    signature: EndpointSignature::new(ApiFamily::Gemini, EndpointKind::Cli),
    default_path: "/v1beta/models/{model}:generateContent",
    auth_method: AuthMethod::Oauth2,
    extra_headers: &[],
    protected_headers: &[],
    data_format_id: "gemini",
    allow_passthrough: true,
};

const GEMINI_VIDEO: EndpointDefinition = EndpointDefinition {
    signature: EndpointSignature::new(ApiFamily::Gemini, EndpointKind::Video),
    default_path: "/v1beta/models/{model}:predictLongRunning",
    auth_method: AuthMethod::GoogApiKey,
    extra_headers: &[],
    protected_headers: &[],
    data_format_id: "gemini_video",
    allow_passthrough: true,
};

const ENDPOINT_DEFINITIONS: &[EndpointDefinition] = &[
    OPENAI_CHAT,
    OPENAI_CLI,
    OPENAI_VIDEO,
    OPENAI_IMAGE,
    CLAUDE_CHAT,
    CLAUDE_CLI,
    GEMINI_CHAT,
    GEMINI_CLI,
    GEMINI_VIDEO,
];

pub fn list_endpoint_definitions() -> &'static [EndpointDefinition] {
    ENDPOINT_DEFINITIONS
}

pub fn resolve_endpoint_definition(sig: EndpointSignature) -> Option<&'static EndpointDefinition> {
    ENDPOINT_DEFINITIONS.iter().find(|d| d.signature == sig)
}

pub fn data_format_id(sig: EndpointSignature) -> Option<&'static str> {
    resolve_endpoint_definition(sig).map(|d| d.data_format_id)
}

/// True iff both signatures carry the same `data_format_id`, meaning a body
/// can cross between them without data conversion.
pub fn can_passthrough_endpoint(client: EndpointSignature, provider: EndpointSignature) -> bool {
    match (data_format_id(client), data_format_id(provider)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::parse_signature_key;

    fn sig(key: &str) -> EndpointSignature {
        parse_signature_key(key).unwrap()
    }

    #[test]
    fn every_signature_resolves() {
        for def in list_endpoint_definitions() {
            assert_eq!(
                resolve_endpoint_definition(def.signature).unwrap().signature,
                def.signature
            );
        }
    }

    #[test]
    fn claude_chat_and_cli_share_data_format() {
        assert!(can_passthrough_endpoint(sig("claude:cli"), sig("claude:chat")));
        assert!(can_passthrough_endpoint(sig("claude:chat"), sig("claude:cli")));
    }

    #[test]
    fn openai_chat_and_cli_do_not_passthrough() {
        assert!(!can_passthrough_endpoint(sig("openai:chat"), sig("openai:cli")));
    }

    #[test]
    fn gemini_cli_shares_chat_payloads() {
        assert!(can_passthrough_endpoint(sig("gemini:cli"), sig("gemini:chat")));
    }
}
