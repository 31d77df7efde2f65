//! Downstream credential extraction and per-scheme upstream auth synthesis.

use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    OpenAI,
    Anthropic,
    Google,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::OpenAI => "openai",
            AuthScheme::Anthropic => "anthropic",
            AuthScheme::Google => "google",
        }
    }
}

impl std::fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header set and query addition for the upstream request.
#[derive(Debug, Clone, Default)]
pub struct TranslatedAuth {
    pub headers: Vec<(String, String)>,
    /// Google auth travels as `?key=<tok>`; everything else uses headers.
    pub query_key: Option<String>,
}

/// Pull the caller's token: `Authorization: Bearer …` first, `x-api-key`
/// second.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_str(headers, "authorization") {
        let value = value.trim();
        if value.len() > 7 && value[..7].eq_ignore_ascii_case("bearer ") {
            let token = value[7..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    header_str(headers, "x-api-key")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Build the upstream header set for `scheme`. `query` is the incoming query
/// string; a Google request that already carries `key=` there needs no token
/// of its own.
pub fn translate(
    headers: &HeaderMap,
    scheme: AuthScheme,
    query: Option<&str>,
) -> Result<TranslatedAuth, ProxyError> {
    let token = bearer_token(headers);
    let mut out = TranslatedAuth::default();
    out.headers
        .push(("content-type".to_string(), "application/json".to_string()));

    match scheme {
        AuthScheme::OpenAI => {
            let token = token.ok_or_else(|| ProxyError::forbidden("missing credentials"))?;
            out.headers
                .push(("authorization".to_string(), format!("Bearer {token}")));
        }
        AuthScheme::Anthropic => {
            let token = token.ok_or_else(|| ProxyError::forbidden("missing credentials"))?;
            out.headers.push(("x-api-key".to_string(), token));
            let version = header_str(headers, "anthropic-version")
                .unwrap_or_else(|| ANTHROPIC_VERSION.to_string());
            out.headers
                .push(("anthropic-version".to_string(), version));
        }
        AuthScheme::Google => {
            let query_has_key = query
                .map(|q| q.split('&').any(|pair| pair.starts_with("key=")))
                .unwrap_or(false);
            match token {
                Some(token) => out.query_key = Some(token),
                None if query_has_key => {}
                None => return Err(ProxyError::forbidden("missing credentials")),
            }
        }
    }

    out.headers.extend(forwardable_headers(headers));
    Ok(out)
}

/// Headers that travel to the upstream unchanged: `Accept`,
/// `Accept-Encoding`, and custom `x-*` headers. Hop-by-hop headers, `Host`,
/// and all credential carriers are dropped; the translator re-emits auth
/// itself.
pub fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        let Ok(value) = value.to_str() else { continue };
        let keep = matches!(name.as_str(), "accept" | "accept-encoding")
            || (name.starts_with("x-")
                && !matches!(name.as_str(), "x-api-key" | "x-goog-api-key"));
        if keep {
            out.push((name, value.to_string()));
        }
    }
    out
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn header_value<'a>(out: &'a TranslatedAuth, name: &str) -> Option<&'a str> {
        out.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn bearer_wins_over_api_key() {
        let map = headers(&[("authorization", "Bearer tok-a"), ("x-api-key", "tok-b")]);
        assert_eq!(bearer_token(&map).as_deref(), Some("tok-a"));
    }

    #[test]
    fn api_key_is_fallback() {
        let map = headers(&[("x-api-key", "tok-b")]);
        assert_eq!(bearer_token(&map).as_deref(), Some("tok-b"));
    }

    #[test]
    fn openai_emits_bearer_and_content_type() {
        let map = headers(&[("authorization", "Bearer sk-X")]);
        let out = translate(&map, AuthScheme::OpenAI, None).unwrap();
        assert_eq!(header_value(&out, "authorization"), Some("Bearer sk-X"));
        assert_eq!(header_value(&out, "content-type"), Some("application/json"));
        assert!(out.query_key.is_none());
    }

    #[test]
    fn anthropic_swaps_to_api_key_header() {
        let map = headers(&[("authorization", "Bearer k")]);
        let out = translate(&map, AuthScheme::Anthropic, None).unwrap();
        assert_eq!(header_value(&out, "x-api-key"), Some("k"));
        assert_eq!(header_value(&out, "anthropic-version"), Some("2023-06-01"));
        assert_eq!(header_value(&out, "authorization"), None);
    }

    #[test]
    fn anthropic_preserves_incoming_version() {
        let map = headers(&[
            ("authorization", "Bearer k"),
            ("anthropic-version", "2024-10-22"),
        ]);
        let out = translate(&map, AuthScheme::Anthropic, None).unwrap();
        assert_eq!(header_value(&out, "anthropic-version"), Some("2024-10-22"));
    }

    #[test]
    fn google_moves_token_to_query() {
        let map = headers(&[("authorization", "Bearer g-key")]);
        let out = translate(&map, AuthScheme::Google, None).unwrap();
        assert_eq!(out.query_key.as_deref(), Some("g-key"));
        assert_eq!(header_value(&out, "authorization"), None);
    }

    #[test]
    fn google_accepts_preexisting_query_key() {
        let map = HeaderMap::new();
        let out = translate(&map, AuthScheme::Google, Some("key=abc&alt=sse")).unwrap();
        assert!(out.query_key.is_none());
    }

    #[test]
    fn empty_credentials_are_rejected() {
        let map = HeaderMap::new();
        let err = translate(&map, AuthScheme::OpenAI, None).unwrap_err();
        assert_eq!(err.status, http::StatusCode::FORBIDDEN);
    }

    #[test]
    fn custom_headers_propagate_but_credentials_do_not() {
        let map = headers(&[
            ("authorization", "Bearer sk"),
            ("accept", "text/event-stream"),
            ("accept-encoding", "gzip"),
            ("x-request-id", "abc"),
            ("x-goog-api-key", "leak"),
            ("host", "localhost:8080"),
            ("connection", "keep-alive"),
        ]);
        let out = translate(&map, AuthScheme::OpenAI, None).unwrap();
        assert_eq!(header_value(&out, "accept"), Some("text/event-stream"));
        assert_eq!(header_value(&out, "accept-encoding"), Some("gzip"));
        assert_eq!(header_value(&out, "x-request-id"), Some("abc"));
        assert_eq!(header_value(&out, "x-goog-api-key"), None);
        assert_eq!(header_value(&out, "host"), None);
        assert_eq!(header_value(&out, "connection"), None);
    }
}
