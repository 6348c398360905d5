//! HTTP Basic authentication (RFC 7617).

use base64::{engine::general_purpose, Engine as _};
use url::Url;
use zeroize::Zeroizing;

use crate::auth::keyring::KeyHandler;
use crate::auth::{origin_of, AuthHandler, AuthSession, Challenge};
use crate::base::NetError;

/// Handler for the `Basic` scheme.
#[derive(Debug, Clone, Default)]
pub struct BasicAuthHandler {
    in_advance: bool,
}

impl BasicAuthHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach credentials to calls inside the protection space without
    /// waiting for a challenge.
    pub fn with_auth_in_advance(mut self, enabled: bool) -> Self {
        self.in_advance = enabled;
        self
    }
}

impl AuthHandler for BasicAuthHandler {
    fn scheme(&self) -> &'static str {
        "basic"
    }

    fn strength(&self) -> u8 {
        1
    }

    fn create_session(
        &self,
        challenge: &Challenge,
        url: &Url,
        keys: &dyn KeyHandler,
    ) -> Option<Box<dyn AuthSession>> {
        let realm = challenge.realm()?.to_string();
        let space: Vec<Url> = origin_of(url).into_iter().collect();
        let key = keys.inquire_key(&space, &[realm.clone()], "basic")?;

        let domain = if key.domain.is_empty() { Vec::new() } else { key.domain.clone() };
        Some(Box::new(BasicSession {
            realm,
            domain,
            header: basic_credentials(&key.username, key.password()),
            in_advance: self.in_advance,
        }))
    }
}

fn basic_credentials(username: &str, password: &str) -> Zeroizing<String> {
    let raw = Zeroizing::new(format!("{}:{}", username, password));
    Zeroizing::new(format!("Basic {}", general_purpose::STANDARD.encode(raw.as_bytes())))
}

/// Basic sessions are a single reusable header value.
struct BasicSession {
    realm: String,
    domain: Vec<Url>,
    header: Zeroizing<String>,
    in_advance: bool,
}

impl AuthSession for BasicSession {
    fn scheme(&self) -> &'static str {
        "basic"
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn domain(&self) -> &[Url] {
        &self.domain
    }

    fn authenticate_in_advance(&self) -> bool {
        self.in_advance
    }

    fn credentials(&mut self, _method: &str, _uri: &str) -> Result<String, NetError> {
        Ok(self.header.to_string())
    }

    /// A repeat 401 with Basic credentials means they are wrong.
    fn invalidate(&mut self, _challenge: &Challenge) -> bool {
        false
    }
}
