use serde_json::Value;

use aether_protocol::{EndpointSignature, make_signature_key, parse_signature_key};
use aether_storage::ProviderBundle;
use aether_storage::entities::{provider_api_keys, provider_endpoints};
use aether_transform::{ConversionRegistry, FormatAcceptanceConfig, is_format_compatible};

/// A `(provider, endpoint, key)` triple eligible to serve a request.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: i64,
    pub provider_name: String,
    pub endpoint: provider_endpoints::Model,
    pub key: provider_api_keys::Model,
    pub needs_conversion: bool,
    pub provider_api_format: String,
    pub affinity_hit: bool,
}

impl Candidate {
    pub fn endpoint_signature(&self) -> Option<EndpointSignature> {
        parse_signature_key(&self.provider_api_format).ok()
    }
}

/// Candidate enumeration and ranking for dispatch.
///
/// Exact-format matches rank ahead of convertible ones; within a group,
/// affinity hits first, then key priority, then endpoint id for determinism.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheAwareScheduler {
    registry: ConversionRegistry,
}

impl CacheAwareScheduler {
    pub fn new() -> Self {
        Self {
            registry: ConversionRegistry::new(),
        }
    }

    /// Whether the provider can serve `model`. Providers without an explicit
    /// model list accept everything; mapping happens at billing time.
    fn check_model_support(&self, _bundle: &ProviderBundle, _model: &str) -> bool {
        true
    }

    /// Whether a key may serve an endpoint format: active, and either
    /// advertising no format list or listing this one.
    fn check_key_availability(
        &self,
        key: &provider_api_keys::Model,
        endpoint_format: &str,
    ) -> bool {
        if !key.is_active {
            return false;
        }
        match key.api_formats.as_array() {
            Some(formats) if !formats.is_empty() => formats
                .iter()
                .filter_map(Value::as_str)
                .any(|f| f.trim().eq_ignore_ascii_case(endpoint_format)),
            _ => true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_candidates(
        &self,
        bundles: &[ProviderBundle],
        client_format: EndpointSignature,
        model: &str,
        affinity_key_id: Option<i64>,
        is_stream: bool,
        global_conversion_enabled: bool,
    ) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = Vec::new();

        for bundle in bundles {
            if !bundle.provider.is_active || !self.check_model_support(bundle, model) {
                continue;
            }
            // Global or provider-level switch bypasses per-endpoint policy.
            let skip_endpoint_check =
                global_conversion_enabled || bundle.provider.enable_format_conversion;

            for endpoint in &bundle.endpoints {
                if !endpoint.is_active {
                    continue;
                }
                let Ok(endpoint_sig) = parse_signature_key(&make_signature_key_raw(
                    &endpoint.api_family,
                    &endpoint.endpoint_kind,
                )) else {
                    continue;
                };
                let acceptance: Option<FormatAcceptanceConfig> = endpoint
                    .format_acceptance_config
                    .as_ref()
                    .and_then(|raw| serde_json::from_value(raw.clone()).ok());

                let decision = is_format_compatible(
                    client_format,
                    endpoint_sig,
                    acceptance.as_ref(),
                    is_stream,
                    global_conversion_enabled,
                    &self.registry,
                    skip_endpoint_check,
                );
                if !decision.is_compatible {
                    continue;
                }

                let endpoint_format = endpoint_sig.key();
                for key in &bundle.keys {
                    if !self.check_key_availability(key, &endpoint_format) {
                        continue;
                    }
                    candidates.push(Candidate {
                        provider_id: bundle.provider.id,
                        provider_name: bundle.provider.name.clone(),
                        endpoint: endpoint.clone(),
                        key: key.clone(),
                        needs_conversion: decision.needs_conversion,
                        provider_api_format: endpoint_format.clone(),
                        affinity_hit: affinity_key_id.is_some_and(|id| id == key.id),
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            a.needs_conversion
                .cmp(&b.needs_conversion)
                .then(b.affinity_hit.cmp(&a.affinity_hit))
                .then(a.key.internal_priority.cmp(&b.key.internal_priority))
                .then(a.endpoint.id.cmp(&b.endpoint.id))
        });
        candidates
    }
}

fn make_signature_key_raw(family: &str, kind: &str) -> String {
    format!(
        "{}:{}",
        family.trim().to_ascii_lowercase(),
        kind.trim().to_ascii_lowercase()
    )
}

/// Signature of a stored endpoint row, normalized.
pub fn endpoint_signature_of(endpoint: &provider_endpoints::Model) -> Option<EndpointSignature> {
    parse_signature_key(&make_signature_key_raw(
        &endpoint.api_family,
        &endpoint.endpoint_kind,
    ))
    .ok()
}

/// Convenience used where only enum values are at hand.
pub fn signature_key_of(endpoint: &provider_endpoints::Model) -> Option<String> {
    endpoint_signature_of(endpoint)
        .map(|sig| make_signature_key(sig.api_family, sig.endpoint_kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::OffsetDateTime;

    use aether_storage::entities::providers;

    fn endpoint(id: i64, format: &str, acceptance: Option<Value>) -> provider_endpoints::Model {
        let (family, kind) = format.split_once(':').unwrap();
        provider_endpoints::Model {
            id,
            provider_id: 1,
            api_family: family.to_string(),
            endpoint_kind: kind.to_string(),
            base_url: "https://upstream.example".to_string(),
            format_acceptance_config: acceptance,
            body_rules: None,
            extra_headers: None,
            is_active: true,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn key(id: i64, formats: Value, priority: i32) -> provider_api_keys::Model {
        provider_api_keys::Model {
            id,
            provider_id: 1,
            api_key: "enc".to_string(),
            api_formats: formats,
            internal_priority: priority,
            is_active: true,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn bundle(
        endpoints: Vec<provider_endpoints::Model>,
        keys: Vec<provider_api_keys::Model>,
    ) -> ProviderBundle {
        ProviderBundle {
            provider: providers::Model {
                id: 1,
                name: "p1".to_string(),
                is_active: true,
                enable_format_conversion: false,
                created_at: OffsetDateTime::UNIX_EPOCH,
                updated_at: OffsetDateTime::UNIX_EPOCH,
            },
            endpoints,
            keys,
        }
    }

    fn sig(key: &str) -> EndpointSignature {
        parse_signature_key(key).unwrap()
    }

    #[test]
    fn cross_format_candidate_when_endpoint_accepts() {
        let scheduler = CacheAwareScheduler::new();
        let bundles = vec![bundle(
            vec![endpoint(
                1,
                "openai:chat",
                Some(json!({
                    "enabled": true,
                    "accept_formats": ["claude:chat"],
                    "stream_conversion": true,
                })),
            )],
            vec![key(1, json!(["openai:chat"]), 1)],
        )];
        let candidates = scheduler.build_candidates(
            &bundles,
            sig("claude:chat"),
            "dummy-model",
            None,
            true,
            true,
        );
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].needs_conversion);
        assert_eq!(candidates[0].provider_api_format, "openai:chat");
    }

    #[test]
    fn master_switch_off_blocks_cross_format() {
        let scheduler = CacheAwareScheduler::new();
        let bundles = vec![bundle(
            vec![endpoint(
                1,
                "openai:chat",
                Some(json!({
                    "enabled": true,
                    "accept_formats": ["claude:chat"],
                    "stream_conversion": true,
                })),
            )],
            vec![key(1, json!(["openai:chat"]), 1)],
        )];
        let candidates = scheduler.build_candidates(
            &bundles,
            sig("claude:chat"),
            "dummy-model",
            None,
            true,
            false,
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn global_switch_on_skips_endpoint_policy() {
        let scheduler = CacheAwareScheduler::new();
        let bundles = vec![bundle(
            vec![endpoint(1, "openai:chat", None)],
            vec![key(1, json!(["openai:chat"]), 1)],
        )];
        let candidates = scheduler.build_candidates(
            &bundles,
            sig("claude:chat"),
            "dummy-model",
            None,
            true,
            true,
        );
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].needs_conversion);
    }

    #[test]
    fn exact_matches_rank_before_convertible() {
        let scheduler = CacheAwareScheduler::new();
        // openai endpoint deliberately listed first; claude (exact) must win.
        let bundles = vec![bundle(
            vec![
                endpoint(
                    1,
                    "openai:chat",
                    Some(json!({
                        "enabled": true,
                        "accept_formats": ["claude:chat"],
                        "stream_conversion": true,
                    })),
                ),
                endpoint(2, "claude:chat", None),
            ],
            vec![
                key(1, json!(["openai:chat"]), 1),
                key(2, json!(["claude:chat"]), 1),
            ],
        )];
        let candidates = scheduler.build_candidates(
            &bundles,
            sig("claude:chat"),
            "dummy-model",
            None,
            true,
            true,
        );
        assert_eq!(candidates.len(), 2);
        assert!(!candidates[0].needs_conversion);
        assert_eq!(candidates[0].provider_api_format, "claude:chat");
        assert!(candidates[1].needs_conversion);
        assert_eq!(candidates[1].provider_api_format, "openai:chat");
    }

    #[test]
    fn affinity_and_priority_break_ties() {
        let scheduler = CacheAwareScheduler::new();
        let bundles = vec![bundle(
            vec![endpoint(1, "openai:chat", None)],
            vec![
                key(1, json!([]), 5),
                key(2, json!([]), 1),
                key(3, json!([]), 9),
            ],
        )];
        // No affinity: lowest internal_priority first.
        let candidates = scheduler.build_candidates(
            &bundles,
            sig("openai:chat"),
            "m",
            None,
            false,
            true,
        );
        assert_eq!(candidates[0].key.id, 2);

        // Affinity on key 3 outranks priority.
        let candidates = scheduler.build_candidates(
            &bundles,
            sig("openai:chat"),
            "m",
            Some(3),
            false,
            true,
        );
        assert_eq!(candidates[0].key.id, 3);
        assert!(candidates[0].affinity_hit);
    }

    #[test]
    fn inactive_keys_and_format_mismatches_are_filtered() {
        let scheduler = CacheAwareScheduler::new();
        let mut inactive = key(1, json!([]), 1);
        inactive.is_active = false;
        let wrong_format = key(2, json!(["claude:chat"]), 1);
        let bundles = vec![bundle(
            vec![endpoint(1, "openai:chat", None)],
            vec![inactive, wrong_format],
        )];
        let candidates = scheduler.build_candidates(
            &bundles,
            sig("openai:chat"),
            "m",
            None,
            false,
            true,
        );
        assert!(candidates.is_empty());
    }
}
