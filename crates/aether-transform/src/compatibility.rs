use serde::{Deserialize, Serialize};

use aether_protocol::{EndpointSignature, can_passthrough_endpoint};

use crate::registry::ConversionRegistry;

/// Per-endpoint format acceptance policy (`format_acceptance_config` JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatAcceptanceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub accept_formats: Vec<String>,
    #[serde(default)]
    pub reject_formats: Vec<String>,
    #[serde(default = "default_stream_conversion")]
    pub stream_conversion: bool,
}

fn default_stream_conversion() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityDecision {
    pub is_compatible: bool,
    pub needs_conversion: bool,
    pub skip_reason: Option<String>,
}

impl CompatibilityDecision {
    fn allow(needs_conversion: bool) -> Self {
        Self {
            is_compatible: true,
            needs_conversion,
            skip_reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            is_compatible: false,
            needs_conversion: false,
            skip_reason: Some(reason.into()),
        }
    }
}

fn contains_format(list: &[String], sig: EndpointSignature) -> bool {
    let key = sig.key();
    list.iter().any(|f| f.trim().eq_ignore_ascii_case(&key))
}

/// Decide whether an endpoint can serve a client format.
///
/// Ordered switch: exact match passes through; the master conversion flag
/// gates everything else; endpoint policy applies unless a higher layer set
/// `skip_endpoint_check`; shared data formats pass through; otherwise the
/// registry must advertise a full conversion (stream variant included for
/// streaming requests).
pub fn is_format_compatible(
    client: EndpointSignature,
    provider: EndpointSignature,
    acceptance: Option<&FormatAcceptanceConfig>,
    is_stream: bool,
    conversion_enabled: bool,
    registry: &ConversionRegistry,
    skip_endpoint_check: bool,
) -> CompatibilityDecision {
    if client == provider {
        return CompatibilityDecision::allow(false);
    }

    if !conversion_enabled {
        return CompatibilityDecision::reject("format conversion disabled");
    }

    if !skip_endpoint_check {
        let Some(config) = acceptance else {
            return CompatibilityDecision::reject("endpoint has no format acceptance policy");
        };
        if !config.enabled {
            return CompatibilityDecision::reject("endpoint format acceptance not enabled");
        }
        if contains_format(&config.reject_formats, client) {
            return CompatibilityDecision::reject(format!(
                "endpoint rejects {} payloads",
                client.key()
            ));
        }
        if !config.accept_formats.is_empty() && !contains_format(&config.accept_formats, client) {
            return CompatibilityDecision::reject(format!(
                "endpoint does not accept {} payloads",
                client.key()
            ));
        }
        if is_stream && !config.stream_conversion {
            return CompatibilityDecision::reject("endpoint does not allow stream conversion");
        }
    }

    if can_passthrough_endpoint(client, provider) {
        return CompatibilityDecision::allow(false);
    }

    if !registry.can_convert_full(client, provider, is_stream) {
        return CompatibilityDecision::reject(format!(
            "no full converter between {} and {}",
            client.key(),
            provider.key()
        ));
    }

    CompatibilityDecision::allow(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_protocol::parse_signature_key;

    fn sig(key: &str) -> EndpointSignature {
        parse_signature_key(key).unwrap()
    }

    fn accepting(formats: &[&str]) -> FormatAcceptanceConfig {
        FormatAcceptanceConfig {
            enabled: true,
            accept_formats: formats.iter().map(|f| f.to_string()).collect(),
            reject_formats: Vec::new(),
            stream_conversion: true,
        }
    }

    #[test]
    fn exact_match_is_passthrough() {
        let decision = is_format_compatible(
            sig("openai:chat"),
            sig("openai:chat"),
            None,
            true,
            false,
            &ConversionRegistry::new(),
            false,
        );
        assert_eq!(decision, CompatibilityDecision::allow(false));
    }

    #[test]
    fn master_switch_off_blocks_cross_format() {
        let decision = is_format_compatible(
            sig("claude:chat"),
            sig("openai:chat"),
            Some(&accepting(&["claude:chat"])),
            false,
            false,
            &ConversionRegistry::new(),
            false,
        );
        assert!(!decision.is_compatible);
        assert!(decision.skip_reason.as_deref().unwrap().contains("disabled"));
    }

    #[test]
    fn reject_list_wins_over_accept_list() {
        let config = FormatAcceptanceConfig {
            enabled: true,
            accept_formats: vec!["claude:chat".to_string()],
            reject_formats: vec!["CLAUDE:CHAT".to_string()],
            stream_conversion: true,
        };
        let decision = is_format_compatible(
            sig("claude:chat"),
            sig("openai:chat"),
            Some(&config),
            false,
            true,
            &ConversionRegistry::new(),
            false,
        );
        assert!(!decision.is_compatible);
    }

    #[test]
    fn stream_requires_stream_conversion_flag() {
        let mut config = accepting(&["claude:chat"]);
        config.stream_conversion = false;
        let decision = is_format_compatible(
            sig("claude:chat"),
            sig("openai:chat"),
            Some(&config),
            true,
            true,
            &ConversionRegistry::new(),
            false,
        );
        assert!(!decision.is_compatible);
    }

    #[test]
    fn shared_data_format_passes_without_conversion() {
        let decision = is_format_compatible(
            sig("claude:cli"),
            sig("claude:chat"),
            Some(&accepting(&["claude:cli"])),
            true,
            true,
            &ConversionRegistry::new(),
            false,
        );
        assert_eq!(decision, CompatibilityDecision::allow(false));
    }

    #[test]
    fn convertible_pair_needs_conversion() {
        let decision = is_format_compatible(
            sig("claude:chat"),
            sig("openai:chat"),
            Some(&accepting(&["claude:chat"])),
            true,
            true,
            &ConversionRegistry::new(),
            false,
        );
        assert_eq!(decision, CompatibilityDecision::allow(true));
    }

    #[test]
    fn skip_endpoint_check_bypasses_missing_policy() {
        let decision = is_format_compatible(
            sig("claude:chat"),
            sig("openai:chat"),
            None,
            false,
            true,
            &ConversionRegistry::new(),
            true,
        );
        assert_eq!(decision, CompatibilityDecision::allow(true));
    }
}
