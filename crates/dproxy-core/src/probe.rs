//! Pre-dispatch junk-traffic filter. Scanners and probes get a terse 403
//! before any body is read; the only trace they leave is a counter.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use http::Method;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeRules {
    pub path_blocklist: Vec<String>,
    pub path_prefix_blocklist: Vec<String>,
    pub user_agent_substrings: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub ip_blocklist: Vec<String>,
}

impl Default for ProbeRules {
    fn default() -> Self {
        Self {
            path_blocklist: vec!["/".to_string(), "/favicon.ico".to_string()],
            path_prefix_blocklist: vec!["/.well-known/".to_string(), "/locales/".to_string()],
            user_agent_substrings: vec![
                "CensysInspect".to_string(),
                "Go-http-client".to_string(),
            ],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            ip_blocklist: vec![
                "193.34.212.110".to_string(),
                "185.191.127.222".to_string(),
                "162.142.125.124".to_string(),
                "194.62.248.69".to_string(),
                "209.38.219.203".to_string(),
            ],
        }
    }
}

/// Regex lists applied to request log lines so probe noise stays out of the
/// logs even when a probe makes it past the blocklists.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogFilterConfig {
    pub patterns: Vec<String>,
    pub ip_patterns: Vec<String>,
}

#[derive(Debug)]
pub struct ProbeFilter {
    rules: ProbeRules,
    log_patterns: Vec<Regex>,
    rejected: AtomicU64,
}

impl ProbeFilter {
    pub fn new(rules: ProbeRules, log_filter: &LogFilterConfig) -> Self {
        let log_patterns = log_filter
            .patterns
            .iter()
            .chain(log_filter.ip_patterns.iter())
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(event = "probe_filter_bad_pattern", pattern = %pattern, error = %err);
                    None
                }
            })
            .collect();
        Self {
            rules,
            log_patterns,
            rejected: AtomicU64::new(0),
        }
    }

    pub fn matches(
        &self,
        method: &Method,
        path: &str,
        user_agent: Option<&str>,
        peer: Option<IpAddr>,
    ) -> bool {
        if self.rules.path_blocklist.iter().any(|p| p == path) {
            return true;
        }
        if self
            .rules
            .path_prefix_blocklist
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return true;
        }
        if !self
            .rules
            .allowed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
        {
            return true;
        }
        if let Some(agent) = user_agent
            && self
                .rules
                .user_agent_substrings
                .iter()
                .any(|needle| agent.contains(needle.as_str()))
        {
            return true;
        }
        if let Some(peer) = peer {
            let peer = peer.to_string();
            if self.rules.ip_blocklist.iter().any(|ip| *ip == peer) {
                return true;
            }
        }
        false
    }

    pub fn record_rejection(&self) -> u64 {
        self.rejected.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// True when a request log line should be suppressed.
    pub fn suppresses_log(&self, line: &str) -> bool {
        self.log_patterns.iter().any(|regex| regex.is_match(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_filter() -> ProbeFilter {
        ProbeFilter::new(ProbeRules::default(), &LogFilterConfig::default())
    }

    #[test]
    fn root_path_is_a_probe() {
        let filter = default_filter();
        assert!(filter.matches(&Method::GET, "/", None, None));
        assert!(filter.matches(&Method::GET, "/.well-known/security.txt", None, None));
    }

    #[test]
    fn scanner_user_agent_is_a_probe() {
        let filter = default_filter();
        assert!(filter.matches(
            &Method::GET,
            "/health",
            Some("Mozilla/5.0 (compatible; CensysInspect/1.2)"),
            None,
        ));
    }

    #[test]
    fn disallowed_method_is_a_probe() {
        let filter = default_filter();
        assert!(filter.matches(&Method::TRACE, "/v1/chat/completions", None, None));
        assert!(!filter.matches(&Method::POST, "/v1/chat/completions", None, None));
    }

    #[test]
    fn blocklisted_peer_is_a_probe() {
        let filter = default_filter();
        let bad: IpAddr = "193.34.212.110".parse().unwrap();
        let good: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(filter.matches(&Method::GET, "/health", None, Some(bad)));
        assert!(!filter.matches(&Method::GET, "/health", None, Some(good)));
    }

    #[test]
    fn rejection_counter_increments() {
        let filter = default_filter();
        assert_eq!(filter.record_rejection(), 1);
        assert_eq!(filter.record_rejection(), 2);
        assert_eq!(filter.rejected_count(), 2);
    }

    #[test]
    fn log_suppression_uses_config_patterns() {
        let filter = ProbeFilter::new(
            ProbeRules::default(),
            &LogFilterConfig {
                patterns: vec!["GET /wp-admin".to_string()],
                ip_patterns: vec![r"185\.191\.".to_string()],
            },
        );
        assert!(filter.suppresses_log("GET /wp-admin/setup.php"));
        assert!(filter.suppresses_log("peer 185.191.127.222 disconnected"));
        assert!(!filter.suppresses_log("POST /v1/chat/completions"));
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let filter = ProbeFilter::new(
            ProbeRules::default(),
            &LogFilterConfig {
                patterns: vec!["(".to_string(), "ok".to_string()],
                ip_patterns: Vec::new(),
            },
        );
        assert!(filter.suppresses_log("ok line"));
    }
}
