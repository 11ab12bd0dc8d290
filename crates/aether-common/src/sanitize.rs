use std::sync::LazyLock;

use regex::Regex;

static BEARER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").expect("bearer pattern"));
static SECRET_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(key|token|api[_-]?key|access[_-]?token)=[^&\s'\x22]+")
        .expect("secret param pattern")
});
static SK_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bsk-[A-Za-z0-9_-]{8,}").expect("sk token pattern"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s'\x22]+").expect("url pattern"));

/// Strip credentials and internal upstream URLs from a message before it is
/// persisted or returned to a client.
pub fn sanitize_error_message(message: &str) -> String {
    let out = BEARER.replace_all(message, "bearer [redacted]");
    let out = SK_TOKEN.replace_all(&out, "[redacted]");
    let out = SECRET_PARAM.replace_all(&out, "$1=[redacted]");
    let out = URL.replace_all(&out, "[upstream-url]");
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_bearer_tokens() {
        let out = sanitize_error_message("auth failed: Bearer abc.def-123");
        assert!(!out.contains("abc.def-123"));
        assert!(out.contains("[redacted]"));
    }

    #[test]
    fn strips_query_keys_and_urls() {
        let out = sanitize_error_message(
            "GET https://generativelanguage.googleapis.com/v1beta/models?key=AIzaSyX failed",
        );
        assert!(!out.contains("AIzaSyX"));
        assert!(!out.contains("googleapis.com"));
        assert!(out.contains("[upstream-url]"));
    }

    #[test]
    fn strips_sk_style_secrets() {
        let out = sanitize_error_message("invalid api key sk-PCr5oXZNKb9HcyzYqTIM");
        assert!(!out.contains("sk-PCr5oXZNKb9HcyzYqTIM"));
    }

    #[test]
    fn leaves_plain_messages_untouched() {
        assert_eq!(sanitize_error_message("quota exceeded"), "quota exceeded");
    }
}
