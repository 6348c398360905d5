//! Authentication orchestration.
//!
//! Challenge parsing, the scheme capability traits, and the per-pipeline
//! registry of handlers and live sessions. Schemes are small capability
//! sets: a handler creates sessions from challenges, a session produces
//! per-call credentials and decides whether a repeated challenge warrants
//! another round.

pub mod basic;
pub mod digest;
pub mod keyring;

use std::sync::{Arc, Mutex};

use http::header::HeaderName;
use http::HeaderMap;
use url::Url;

use crate::base::NetError;

pub use basic::BasicAuthHandler;
pub use digest::DigestAuthHandler;
pub use keyring::{Key, KeyHandler, KeyRing};

/// One parsed challenge from `WWW-Authenticate` or `Proxy-Authenticate`.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Lowercase scheme name.
    pub scheme: String,
    params: Vec<(String, String)>,
}

impl Challenge {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    /// Parses every challenge carried by `header` values in `headers`.
    ///
    /// Handles both one-challenge-per-header and the comma-joined multi
    /// challenge form.
    pub fn parse_all(headers: &HeaderMap, header: HeaderName) -> Vec<Challenge> {
        let mut out = Vec::new();
        for value in headers.get_all(header) {
            let Ok(text) = value.to_str() else { continue };
            let mut current: Option<Challenge> = None;
            for part in split_quoted_commas(text) {
                // A part introducing a scheme is a bare token, or a token
                // followed by its first `key=value` parameter.
                let first_token_has_eq = part.split_whitespace().next().is_some_and(|t| t.contains('='));
                if !first_token_has_eq {
                    if let Some(done) = current.take() {
                        out.push(done);
                    }
                    match part.split_once(char::is_whitespace) {
                        Some((scheme, rest)) => {
                            let mut ch = Challenge {
                                scheme: scheme.to_lowercase(),
                                params: Vec::new(),
                            };
                            if let Some(p) = parse_param(rest) {
                                ch.params.push(p);
                            }
                            current = Some(ch);
                        }
                        None => {
                            current = Some(Challenge {
                                scheme: part.to_lowercase(),
                                params: Vec::new(),
                            });
                        }
                    }
                } else if let Some(ch) = current.as_mut() {
                    if let Some(p) = parse_param(part) {
                        ch.params.push(p);
                    }
                }
            }
            if let Some(done) = current.take() {
                out.push(done);
            }
        }
        out
    }
}

/// Splits on commas outside double quotes.
fn split_quoted_commas(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in text.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                let part = text[start..i].trim();
                if !part.is_empty() {
                    parts.push(part);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let part = text[start..].trim();
    if !part.is_empty() {
        parts.push(part);
    }
    parts
}

/// Parses `key=value` or `key="value"`.
fn parse_param(text: &str) -> Option<(String, String)> {
    let (key, value) = text.split_once('=')?;
    let mut value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value = &value[1..value.len() - 1];
    }
    Some((key.trim().to_string(), value.to_string()))
}

/// The origin of a URL as an absolute URI (path `/`).
pub(crate) fn origin_of(url: &Url) -> Option<Url> {
    let host = url.host_str()?;
    let s = match url.port() {
        Some(port) => format!("{}://{}:{}/", url.scheme(), host, port),
        None => format!("{}://{}/", url.scheme(), host),
    };
    Url::parse(&s).ok()
}

/// Creates sessions for one authentication scheme.
pub trait AuthHandler: Send + Sync {
    /// Lowercase scheme name this handler answers.
    fn scheme(&self) -> &'static str;

    /// Relative strength; among offered schemes the strongest registered
    /// handler wins.
    fn strength(&self) -> u8;

    /// Builds a session from a challenge, resolving credentials through
    /// `keys`. `None` when the key handler has no matching credentials or
    /// the challenge is unusable; the call is then delivered verbatim.
    fn create_session(
        &self,
        challenge: &Challenge,
        url: &Url,
        keys: &dyn KeyHandler,
    ) -> Option<Box<dyn AuthSession>>;
}

/// A live authentication session for one protection space.
pub trait AuthSession: Send {
    fn scheme(&self) -> &'static str;

    fn realm(&self) -> &str;

    /// Protection space URIs (RFC 2617 `domain`).
    fn domain(&self) -> &[Url];

    /// Whether credentials may be attached before a challenge.
    fn authenticate_in_advance(&self) -> bool;

    /// Credentials header value for one transmission.
    fn credentials(&mut self, method: &str, uri: &str) -> Result<String, NetError>;

    /// Called on a repeat challenge for a call already carrying this
    /// session's credentials. `true` means a fresh round is worth trying
    /// (e.g. Digest `stale`); `false` terminates the call.
    fn invalidate(&mut self, challenge: &Challenge) -> bool;
}

/// Session plus the direction it authenticates (origin or proxy).
pub(crate) struct SessionState {
    inner: Box<dyn AuthSession>,
    for_proxy: bool,
}

impl SessionState {
    pub(crate) fn credentials(&mut self, method: &str, uri: &str) -> Result<String, NetError> {
        self.inner.credentials(method, uri)
    }

    pub(crate) fn invalidate(&mut self, challenge: &Challenge) -> bool {
        self.inner.invalidate(challenge)
    }

    pub(crate) fn for_proxy(&self) -> bool {
        self.for_proxy
    }

    pub(crate) fn scheme(&self) -> &'static str {
        self.inner.scheme()
    }

    fn in_advance(&self) -> bool {
        self.inner.authenticate_in_advance()
    }

    fn domain(&self) -> &[Url] {
        self.inner.domain()
    }
}

pub(crate) type SharedSession = Arc<Mutex<SessionState>>;

/// Protection space key: `(host, port, realm)` plus direction.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProtectionSpace {
    host: String,
    port: u16,
    realm: String,
    for_proxy: bool,
}

struct SessionEntry {
    space: ProtectionSpace,
    session: SharedSession,
}

/// Per-pipeline registry of auth handlers and live sessions.
pub(crate) struct AuthRegistry {
    handlers: Vec<Arc<dyn AuthHandler>>,
    sessions: Vec<SessionEntry>,
}

impl AuthRegistry {
    pub(crate) fn new() -> Self {
        Self { handlers: Vec::new(), sessions: Vec::new() }
    }

    pub(crate) fn register(&mut self, handler: Arc<dyn AuthHandler>) {
        self.handlers.push(handler);
    }

    /// Strongest registered handler whose scheme is offered.
    fn select<'c>(&self, challenges: &'c [Challenge]) -> Option<(&Arc<dyn AuthHandler>, &'c Challenge)> {
        self.handlers
            .iter()
            .filter_map(|h| {
                challenges
                    .iter()
                    .find(|c| c.scheme == h.scheme())
                    .map(|c| (h, c))
            })
            .max_by_key(|(h, _)| h.strength())
    }

    /// Answers a 401/407 challenge with a new session, registering it under
    /// its protection space. `endpoint` is the authenticating party: the
    /// origin server, or the proxy for 407.
    pub(crate) fn create_session(
        &mut self,
        url: &Url,
        endpoint: (&str, u16),
        challenges: &[Challenge],
        for_proxy: bool,
        keys: &dyn KeyHandler,
    ) -> Option<SharedSession> {
        let (handler, challenge) = self.select(challenges)?;
        let inner = handler.create_session(challenge, url, keys)?;
        let space = ProtectionSpace {
            host: endpoint.0.to_lowercase(),
            port: endpoint.1,
            realm: inner.realm().to_string(),
            for_proxy,
        };
        tracing::debug!(
            scheme = inner.scheme(),
            realm = %space.realm,
            host = %space.host,
            "authentication session created"
        );
        let session: SharedSession = Arc::new(Mutex::new(SessionState { inner, for_proxy }));
        // A repeat challenge for the same space replaces the session.
        self.sessions.retain(|e| e.space != space);
        self.sessions.push(SessionEntry { space, session: session.clone() });
        Some(session)
    }

    /// A session whose protection space covers `url`, for attaching
    /// credentials in advance of a challenge.
    pub(crate) fn find_in_advance(&self, url: &Url) -> Option<SharedSession> {
        let host = url.host_str()?.to_lowercase();
        let port = url.port_or_known_default()?;
        self.sessions.iter().find_map(|e| {
            if e.space.for_proxy || e.space.host != host || e.space.port != port {
                return None;
            }
            let state = e.session.lock().unwrap();
            if !state.in_advance() {
                return None;
            }
            let domains = state.domain();
            let covered = domains.is_empty() || domains.iter().any(|d| url_within(d, url));
            if covered {
                drop(state);
                Some(e.session.clone())
            } else {
                None
            }
        })
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Prefix match of `url` against a protection-space URI.
fn url_within(space: &Url, url: &Url) -> bool {
    space.scheme() == url.scheme()
        && space.host_str() == url.host_str()
        && space.port_or_known_default() == url.port_or_known_default()
        && url.path().starts_with(space.path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::WWW_AUTHENTICATE;
    use http::HeaderValue;

    fn headers_with(value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.append(WWW_AUTHENTICATE, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn test_parse_single_challenge() {
        let h = headers_with(r#"Digest realm="x", nonce="abc", qop="auth""#);
        let cs = Challenge::parse_all(&h, WWW_AUTHENTICATE);
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].scheme, "digest");
        assert_eq!(cs[0].realm(), Some("x"));
        assert_eq!(cs[0].param("nonce"), Some("abc"));
        assert_eq!(cs[0].param("qop"), Some("auth"));
    }

    #[test]
    fn test_parse_multiple_challenges_one_header() {
        let h = headers_with(r#"Basic realm="a", Digest realm="b", nonce="n""#);
        let cs = Challenge::parse_all(&h, WWW_AUTHENTICATE);
        assert_eq!(cs.len(), 2);
        assert_eq!(cs[0].scheme, "basic");
        assert_eq!(cs[0].realm(), Some("a"));
        assert_eq!(cs[1].scheme, "digest");
        assert_eq!(cs[1].param("nonce"), Some("n"));
    }

    #[test]
    fn test_parse_quoted_commas() {
        let h = headers_with(r#"Basic realm="a, b, c""#);
        let cs = Challenge::parse_all(&h, WWW_AUTHENTICATE);
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].realm(), Some("a, b, c"));
    }

    #[test]
    fn test_parse_bare_scheme() {
        let h = headers_with("Negotiate");
        let cs = Challenge::parse_all(&h, WWW_AUTHENTICATE);
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].scheme, "negotiate");
        assert!(cs[0].realm().is_none());
    }

    #[test]
    fn test_registry_selects_strongest() {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(BasicAuthHandler::new()));
        registry.register(Arc::new(DigestAuthHandler::new()));

        let h = headers_with(r#"Basic realm="r", Digest realm="r", nonce="n""#);
        let cs = Challenge::parse_all(&h, WWW_AUTHENTICATE);
        let (handler, _) = registry.select(&cs).unwrap();
        assert_eq!(handler.scheme(), "digest");
    }

    #[test]
    fn test_registry_session_and_in_advance_lookup() {
        let keys = KeyRing::default();
        keys.add_key(Key::new("u", "p", "r", Vec::new()));

        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(BasicAuthHandler::new().with_auth_in_advance(true)));

        let url = Url::parse("http://h/secret/page").unwrap();
        let h = headers_with(r#"Basic realm="r""#);
        let cs = Challenge::parse_all(&h, WWW_AUTHENTICATE);
        let session = registry.create_session(&url, ("h", 80), &cs, false, &keys);
        assert!(session.is_some());
        assert_eq!(registry.session_count(), 1);

        let other = Url::parse("http://h/other").unwrap();
        assert!(registry.find_in_advance(&other).is_some());

        let elsewhere = Url::parse("http://elsewhere/").unwrap();
        assert!(registry.find_in_advance(&elsewhere).is_none());
    }

    #[test]
    fn test_url_within() {
        let space = Url::parse("http://h/app/").unwrap();
        assert!(url_within(&space, &Url::parse("http://h/app/data").unwrap()));
        assert!(!url_within(&space, &Url::parse("http://h/other").unwrap()));
        assert!(!url_within(&space, &Url::parse("http://x/app/").unwrap()));
    }
}
