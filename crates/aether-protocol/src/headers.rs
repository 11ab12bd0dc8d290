/// Header map used across the dispatch path. Names compare case-insensitively.
pub type Headers = Vec<(String, String)>;

pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Client headers never forwarded upstream.
pub const UPSTREAM_DROP_HEADERS: &[&str] = &[
    "host",
    "authorization",
    "x-api-key",
    "x-goog-api-key",
    "cookie",
    "content-length",
];

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let key = name.to_ascii_lowercase();
    let idx = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == key)?;
    Some(headers.remove(idx).1)
}

/// Lowercase all names; detection and auth extraction assume this.
pub fn normalize_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Merge `extra` into `base` without letting the client override protected keys.
pub fn merge_headers_with_protection(
    base: &mut Headers,
    extra: &Headers,
    protected: &[&str],
) {
    for (name, value) in extra {
        let is_protected = protected.iter().any(|p| name.eq_ignore_ascii_case(p));
        if is_protected && header_get(base, name).is_some() {
            continue;
        }
        header_set(base, name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers: Headers = vec![("Content-Type".into(), "text/plain".into())];
        header_set(&mut headers, "content-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn merge_respects_protected_keys() {
        let mut base: Headers = vec![("anthropic-version".into(), "2023-06-01".into())];
        let extra: Headers = vec![
            ("anthropic-version".into(), "1999-01-01".into()),
            ("x-custom".into(), "1".into()),
        ];
        merge_headers_with_protection(&mut base, &extra, &["anthropic-version"]);
        assert_eq!(header_get(&base, "anthropic-version"), Some("2023-06-01"));
        assert_eq!(header_get(&base, "x-custom"), Some("1"));
    }
}
