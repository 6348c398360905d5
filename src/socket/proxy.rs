//! HTTP proxy configuration.
//!
//! A pipeline routes calls through at most one proxy. The configuration
//! can be built programmatically or read from the `http_proxy` and
//! `no_proxy` environment variables; `http_proxy` may carry userinfo
//! (`http://user:pw@host:port/`) which becomes Basic proxy credentials.

use base64::{engine::general_purpose, Engine as _};
use http::HeaderValue;
use url::Url;
use zeroize::Zeroizing;

use crate::socket::matcher::NoProxyMatcher;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    host: String,
    port: u16,
    credentials: Option<(String, Zeroizing<String>)>,
    bypass: NoProxyMatcher,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            bypass: NoProxyMatcher::default(),
        }
    }

    /// Parses a proxy URL, taking credentials from its userinfo part.
    pub fn from_url(url: &str) -> Option<Self> {
        let url = Url::parse(url).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let mut config = Self::new(host, port);
        if !url.username().is_empty() {
            config = config.with_auth(url.username(), url.password().unwrap_or(""));
        }
        Some(config)
    }

    /// Reads `http_proxy` / `HTTP_PROXY` and `no_proxy` / `NO_PROXY`.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var("http_proxy")
            .or_else(|_| std::env::var("HTTP_PROXY"))
            .ok()?;
        let config = Self::from_url(&raw)?;
        Some(config.with_bypass(NoProxyMatcher::from_env()))
    }

    /// Basic credentials for `Proxy-Authorization`.
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), Zeroizing::new(password.to_string())));
        self
    }

    /// Replaces the bypass rules with a parsed `no_proxy` list.
    pub fn with_no_proxy(self, list: &str) -> Self {
        self.with_bypass(NoProxyMatcher::from_list(list))
    }

    pub fn with_bypass(mut self, bypass: NoProxyMatcher) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether `url` must skip the proxy per the `no_proxy` rules.
    pub fn should_bypass(&self, url: &Url) -> bool {
        self.bypass.matches_url(url)
    }

    /// `Proxy-Authorization` value for the configured credentials.
    pub(crate) fn authorization(&self) -> Option<HeaderValue> {
        let (user, password) = self.credentials.as_ref()?;
        let raw = Zeroizing::new(format!("{}:{}", user, &**password));
        let value = format!("Basic {}", general_purpose::STANDARD.encode(raw.as_bytes()));
        HeaderValue::from_str(&value).ok()
    }
}
