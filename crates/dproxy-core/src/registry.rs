//! Upstream whitelist. Anything absent from this map is rejected before a
//! single upstream byte moves; this is the SSRF boundary.

use std::collections::HashMap;

use crate::auth::AuthScheme;
use crate::config::GatewayConfig;

pub const GOOGLE_HOST: &str = "generativelanguage.googleapis.com";
pub const OPENAI_HOST: &str = "api.openai.com";

#[derive(Debug, Clone)]
pub struct UpstreamDescriptor {
    pub host: String,
    pub auth: Option<AuthScheme>,
    pub https: bool,
}

impl UpstreamDescriptor {
    pub fn scheme(&self) -> &'static str {
        if self.https { "https" } else { "http" }
    }

    /// Effective auth scheme for a request to `path`. Entries that pin a
    /// scheme use it; otherwise the path decides — `/anthropic/` and
    /// `/v1/messages` mean anthropic, everything else openai. Google is only
    /// ever selected by pinning.
    pub fn auth_for_path(&self, path: &str) -> AuthScheme {
        if let Some(auth) = self.auth {
            return auth;
        }
        if path.contains("/anthropic/") || path.contains("/v1/messages") {
            AuthScheme::Anthropic
        } else {
            AuthScheme::OpenAI
        }
    }
}

#[derive(Debug)]
pub struct UpstreamRegistry {
    entries: HashMap<String, UpstreamDescriptor>,
    default_host: Option<String>,
}

impl UpstreamRegistry {
    /// Built-in minimal whitelist overlaid with the configured domains.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut entries = HashMap::new();
        for (host, auth) in [
            (GOOGLE_HOST, AuthScheme::Google),
            (OPENAI_HOST, AuthScheme::OpenAI),
        ] {
            entries.insert(
                host.to_string(),
                UpstreamDescriptor {
                    host: host.to_string(),
                    auth: Some(auth),
                    https: true,
                },
            );
        }

        let mut default_host = None;
        for (host, domain) in &config.allowed_domains {
            let key = host.to_ascii_lowercase();
            if domain.default
                && default_host.is_none()
                && domain.auth_type.unwrap_or(AuthScheme::OpenAI) == AuthScheme::OpenAI
            {
                default_host = Some(key.clone());
            }
            entries.insert(
                key.clone(),
                UpstreamDescriptor {
                    host: key,
                    auth: domain.auth_type,
                    https: domain.https,
                },
            );
        }

        Self {
            entries,
            default_host,
        }
    }

    pub fn lookup(&self, host: &str) -> Option<&UpstreamDescriptor> {
        self.entries.get(&host.to_ascii_lowercase())
    }

    /// Facade target for non-Gemini models; `None` means the facade answers
    /// 400 instead of guessing.
    pub fn default_upstream(&self) -> Option<&UpstreamDescriptor> {
        self.entries.get(self.default_host.as_ref()?)
    }

    /// Facade target for `gemini-*` models.
    pub fn google_upstream(&self) -> Option<&UpstreamDescriptor> {
        self.entries
            .values()
            .find(|entry| entry.auth == Some(AuthScheme::Google))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(raw: &str) -> GatewayConfig {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn builtins_are_present_without_config() {
        let registry = UpstreamRegistry::from_config(&GatewayConfig::default());
        assert!(registry.lookup(GOOGLE_HOST).is_some());
        assert!(registry.lookup(OPENAI_HOST).is_some());
        assert!(registry.lookup("evil.example.com").is_none());
        assert!(registry.default_upstream().is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = UpstreamRegistry::from_config(&GatewayConfig::default());
        assert!(registry.lookup("API.OpenAI.com").is_some());
    }

    #[test]
    fn config_extends_and_overrides_builtins() {
        let registry = UpstreamRegistry::from_config(&config(
            r#"{"allowed_domains": {
                "api.deepseek.com": {"auth_type": "openai", "default": true},
                "api.openai.com": {"auth_type": "openai", "https": false}
            }}"#,
        ));
        assert!(registry.lookup("api.deepseek.com").is_some());
        assert!(!registry.lookup(OPENAI_HOST).unwrap().https);
        assert_eq!(
            registry.default_upstream().unwrap().host,
            "api.deepseek.com"
        );
    }

    #[test]
    fn google_upstream_found_by_pinned_scheme() {
        let registry = UpstreamRegistry::from_config(&GatewayConfig::default());
        assert_eq!(registry.google_upstream().unwrap().host, GOOGLE_HOST);
    }

    #[test]
    fn auth_detection_follows_path_when_unpinned() {
        let descriptor = UpstreamDescriptor {
            host: "api.moonshot.cn".to_string(),
            auth: None,
            https: true,
        };
        assert_eq!(
            descriptor.auth_for_path("/anthropic/v1/messages"),
            AuthScheme::Anthropic
        );
        assert_eq!(
            descriptor.auth_for_path("/v1/messages"),
            AuthScheme::Anthropic
        );
        assert_eq!(
            descriptor.auth_for_path("/v1/chat/completions"),
            AuthScheme::OpenAI
        );
        assert_eq!(descriptor.auth_for_path("/v1/rerank"), AuthScheme::OpenAI);
    }

    #[test]
    fn pinned_scheme_wins_over_path() {
        let descriptor = UpstreamDescriptor {
            host: GOOGLE_HOST.to_string(),
            auth: Some(AuthScheme::Google),
            https: true,
        };
        assert_eq!(
            descriptor.auth_for_path("/v1/messages"),
            AuthScheme::Google
        );
    }
}
