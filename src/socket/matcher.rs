//! `no_proxy` bypass matching.
//!
//! Rules are a comma-separated list of hostnames (with optional leading
//! dot) and IP literals. Hostname matching is case-insensitive and matches
//! whole labels: `example.com` covers `example.com` and `a.example.com`
//! but never `notexample.com`. `*` bypasses everything.

use std::net::IpAddr;

use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    All,
    Domain(String),
    Ip(IpAddr),
}

/// Compiled `no_proxy` rule list.
#[derive(Debug, Clone, Default)]
pub struct NoProxyMatcher {
    rules: Vec<Rule>,
}

impl NoProxyMatcher {
    /// Reads `no_proxy` / `NO_PROXY` from the environment.
    pub fn from_env() -> Self {
        let raw = std::env::var("no_proxy")
            .or_else(|_| std::env::var("NO_PROXY"))
            .unwrap_or_default();
        Self::from_list(&raw)
    }

    /// Parses a comma-separated rule list.
    pub fn from_list(list: &str) -> Self {
        let mut rules = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry == "*" {
                rules.push(Rule::All);
                continue;
            }
            let bare = entry.trim_start_matches('[').trim_end_matches(']');
            if let Ok(ip) = bare.parse::<IpAddr>() {
                rules.push(Rule::Ip(ip));
                continue;
            }
            let domain = entry.trim_start_matches('.').to_lowercase();
            if !domain.is_empty() {
                rules.push(Rule::Domain(domain));
            }
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether requests for `host` bypass the proxy.
    pub fn matches(&self, host: &str) -> bool {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let ip = bare.parse::<IpAddr>().ok();
        let lower = bare.to_lowercase();

        self.rules.iter().any(|rule| match rule {
            Rule::All => true,
            Rule::Ip(rule_ip) => ip == Some(*rule_ip),
            Rule::Domain(domain) => {
                lower == *domain
                    || (lower.len() > domain.len()
                        && lower.ends_with(domain)
                        && lower.as_bytes()[lower.len() - domain.len() - 1] == b'.')
            }
        })
    }

    pub fn matches_url(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|h| self.matches(h))
    }
}
