use aether_protocol::{ApiFamily, parse_signature_key};

/// Normalize `input_tokens` so billing sees non-cached input only.
///
/// Claude already reports non-cached input; OpenAI and Gemini include cache
/// hits in the prompt count, so the cache-read portion is subtracted (clamped
/// at zero). Unknown or missing formats pass through untouched.
pub fn normalize_input_tokens_for_billing(
    api_format: Option<&str>,
    input_tokens: i64,
    cache_read_tokens: i64,
) -> i64 {
    if input_tokens <= 0 {
        return input_tokens.max(0);
    }
    if cache_read_tokens <= 0 {
        return input_tokens;
    }
    let family = api_format
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .and_then(|t| parse_signature_key(t).ok())
        .map(|sig| sig.api_family);
    match family {
        Some(ApiFamily::Claude) | None => input_tokens,
        Some(ApiFamily::OpenAI) | Some(ApiFamily::Gemini) => {
            (input_tokens - cache_read_tokens).max(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_family_subtracts_cached_tokens() {
        assert_eq!(
            normalize_input_tokens_for_billing(Some("openai:cli"), 160_070, 81_664),
            78_406
        );
    }

    #[test]
    fn gemini_family_subtracts_cached_tokens() {
        assert_eq!(
            normalize_input_tokens_for_billing(Some("gemini:chat"), 1_000, 400),
            600
        );
    }

    #[test]
    fn claude_family_keeps_upstream_counts() {
        assert_eq!(
            normalize_input_tokens_for_billing(Some("claude:cli"), 160_070, 81_664),
            160_070
        );
    }

    #[test]
    fn missing_or_unknown_format_passes_through() {
        assert_eq!(normalize_input_tokens_for_billing(None, 100, 20), 100);
        assert_eq!(normalize_input_tokens_for_billing(Some(""), 100, 20), 100);
        assert_eq!(normalize_input_tokens_for_billing(Some("bogus"), 100, 20), 100);
    }

    #[test]
    fn clamps_when_cached_exceeds_input() {
        assert_eq!(normalize_input_tokens_for_billing(Some("openai:cli"), 10, 20), 0);
    }
}
