use crate::headers::{Headers, header_get};
use crate::metadata::resolve_endpoint_definition;
use crate::signature::{AuthMethod, EndpointSignature};

fn bearer_token(headers: &Headers) -> Option<String> {
    let auth = header_get(headers, "authorization")?;
    if auth.len() >= 7 && auth[..7].eq_ignore_ascii_case("bearer ") {
        let token = auth[7..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

/// Extract the client credential for one auth method. Headers must already
/// be lowercase-normalized.
pub fn extract_credential(
    method: AuthMethod,
    headers: &Headers,
    query: &[(String, String)],
) -> Option<String> {
    match method {
        AuthMethod::Bearer | AuthMethod::Oauth2 => bearer_token(headers),
        AuthMethod::ApiKey => header_get(headers, "x-api-key").map(str::to_string),
        AuthMethod::GoogApiKey => query
            .iter()
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.clone())
            .or_else(|| header_get(headers, "x-goog-api-key").map(str::to_string)),
        AuthMethod::QueryKey => query
            .iter()
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.clone()),
    }
}

/// Build the upstream auth headers for one credential.
pub fn build_auth_headers(method: AuthMethod, credential: &str) -> Headers {
    match method {
        AuthMethod::Bearer | AuthMethod::Oauth2 => {
            vec![("Authorization".to_string(), format!("Bearer {credential}"))]
        }
        AuthMethod::ApiKey => vec![("x-api-key".to_string(), credential.to_string())],
        // Query-key clients are re-authenticated upstream via the header form.
        AuthMethod::GoogApiKey | AuthMethod::QueryKey => {
            vec![("x-goog-api-key".to_string(), credential.to_string())]
        }
    }
}

pub fn default_auth_method_for(sig: EndpointSignature) -> AuthMethod {
    resolve_endpoint_definition(sig)
        .map(|d| d.auth_method)
        .unwrap_or(AuthMethod::Bearer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::parse_signature_key;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn bearer_extraction_trims_and_requires_prefix() {
        let h = headers(&[("authorization", "Bearer  sk-test ")]);
        assert_eq!(
            extract_credential(AuthMethod::Bearer, &h, &[]),
            Some("sk-test".to_string())
        );
        let h = headers(&[("authorization", "Basic abc")]);
        assert_eq!(extract_credential(AuthMethod::Bearer, &h, &[]), None);
    }

    #[test]
    fn goog_key_prefers_query_over_header() {
        let h = headers(&[("x-goog-api-key", "from-header")]);
        let q = vec![("key".to_string(), "from-query".to_string())];
        assert_eq!(
            extract_credential(AuthMethod::GoogApiKey, &h, &q),
            Some("from-query".to_string())
        );
        assert_eq!(
            extract_credential(AuthMethod::GoogApiKey, &h, &[]),
            Some("from-header".to_string())
        );
    }

    #[test]
    fn query_key_builds_goog_header_upstream() {
        let built = build_auth_headers(AuthMethod::QueryKey, "k1");
        assert_eq!(built, vec![("x-goog-api-key".to_string(), "k1".to_string())]);
    }

    #[test]
    fn oauth2_reuses_bearer_upstream() {
        let built = build_auth_headers(AuthMethod::Oauth2, "tok");
        assert_eq!(
            built,
            vec![("Authorization".to_string(), "Bearer tok".to_string())]
        );
    }

    #[test]
    fn defaults_follow_endpoint_definitions() {
        assert_eq!(
            default_auth_method_for(parse_signature_key("claude:chat").unwrap()),
            AuthMethod::ApiKey
        );
        assert_eq!(
            default_auth_method_for(parse_signature_key("gemini:chat").unwrap()),
            AuthMethod::GoogApiKey
        );
        assert_eq!(
            default_auth_method_for(parse_signature_key("openai:cli").unwrap()),
            AuthMethod::Bearer
        );
    }
}
