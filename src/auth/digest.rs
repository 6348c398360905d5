//! HTTP Digest authentication.
//!
//! RFC 2617 with `qop="auth"`, falling back to RFC 2069 when the server
//! offers no qop. MD5 and MD5-sess algorithms; the nonce count advances
//! per call per session, the client nonce is fresh per call, and a `stale`
//! re-challenge refreshes the nonce without a new credential round.

use std::fmt::Write as _;

use md5::{Digest as _, Md5};
use url::Url;
use zeroize::Zeroizing;

use crate::auth::keyring::KeyHandler;
use crate::auth::{origin_of, AuthHandler, AuthSession, Challenge};
use crate::base::NetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Algorithm {
    /// Absent from the challenge; MD5 semantics, token omitted in the reply.
    #[default]
    Unspecified,
    Md5,
    Md5Sess,
}

impl Algorithm {
    fn parse(token: &str) -> Option<Self> {
        match token.to_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "md5-sess" => Some(Self::Md5Sess),
            _ => None,
        }
    }

    fn token(&self) -> &'static str {
        match self {
            Self::Unspecified => "",
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
        }
    }
}

/// Challenge parameters a Digest session needs.
#[derive(Debug, Clone)]
struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    domain: Vec<Url>,
    algorithm: Algorithm,
    /// RFC 2617 `qop=auth`; `false` selects the RFC 2069 response formula.
    qop_auth: bool,
    stale: bool,
}

impl DigestChallenge {
    fn parse(challenge: &Challenge, base: &Url) -> Option<Self> {
        let realm = challenge.realm()?.to_string();
        let nonce = challenge.param("nonce")?.to_string();

        let algorithm = match challenge.param("algorithm") {
            Some(token) => Algorithm::parse(token)?,
            None => Algorithm::Unspecified,
        };

        let qop_auth = challenge
            .param("qop")
            .map(|v| v.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false);

        // `domain` is a space-separated list of URIs, possibly relative.
        let domain = challenge
            .param("domain")
            .map(|list| {
                list.split_whitespace()
                    .filter_map(|u| base.join(u).ok())
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            realm,
            nonce,
            opaque: challenge.param("opaque").map(str::to_string),
            domain,
            algorithm,
            qop_auth,
            stale: challenge
                .param("stale")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        })
    }
}

/// Handler for the `Digest` scheme.
#[derive(Debug, Clone, Default)]
pub struct DigestAuthHandler {
    in_advance: bool,
}

impl DigestAuthHandler {
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

impl AuthHandler for DigestAuthHandler {
    fn scheme(&self) -> &'static str {
        "digest"
    }

    fn strength(&self) -> u8 {
        10
    }

    fn create_session(
        &self,
        challenge: &Challenge,
        url: &Url,
        keys: &dyn KeyHandler,
    ) -> Option<Box<dyn AuthSession>> {
        let parsed = DigestChallenge::parse(challenge, url)?;
        let space: Vec<Url> = if parsed.domain.is_empty() {
            origin_of(url).into_iter().collect()
        } else {
            parsed.domain.clone()
        };
        let key = keys.inquire_key(&space, &[parsed.realm.clone()], "digest")?;

        Some(Box::new(DigestSession {
            username: key.username.clone(),
            password: Zeroizing::new(key.password().to_string()),
            base: url.clone(),
            challenge: parsed,
            nonce_count: 0,
            in_advance: self.in_advance,
        }))
    }
}

struct DigestSession {
    username: String,
    password: Zeroizing<String>,
    /// URL the first challenge arrived for; resolves relative domain URIs.
    base: Url,
    challenge: DigestChallenge,
    nonce_count: u32,
    in_advance: bool,
}

impl DigestSession {
    fn hex_md5(input: &str) -> String {
        let digest = Md5::digest(input.as_bytes());
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            let _ = write!(hex, "{:02x}", byte);
        }
        hex
    }

    /// Fresh client nonce per call.
    fn generate_cnonce() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("{:016x}", (seed as u64) ^ ((seed >> 64) as u64))
    }

    fn compute_response(&self, method: &str, uri: &str, cnonce: &str, nc: &str) -> String {
        let ch = &self.challenge;

        let mut ha1 = Self::hex_md5(&format!(
            "{}:{}:{}",
            self.username, ch.realm, &*self.password
        ));
        if ch.algorithm == Algorithm::Md5Sess {
            ha1 = Self::hex_md5(&format!("{}:{}:{}", ha1, ch.nonce, cnonce));
        }

        let ha2 = Self::hex_md5(&format!("{}:{}", method, uri));

        if ch.qop_auth {
            Self::hex_md5(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, ch.nonce, nc, cnonce, ha2
            ))
        } else {
            // RFC 2069 compatibility.
            Self::hex_md5(&format!("{}:{}:{}", ha1, ch.nonce, ha2))
        }
    }

    fn assemble(&self, uri: &str, response: &str, cnonce: &str, nc: &str) -> String {
        let ch = &self.challenge;
        let mut auth = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            self.username, ch.realm, ch.nonce, uri
        );
        if ch.algorithm != Algorithm::Unspecified {
            let _ = write!(auth, ", algorithm={}", ch.algorithm.token());
        }
        let _ = write!(auth, ", response=\"{}\"", response);
        if let Some(opaque) = &ch.opaque {
            let _ = write!(auth, ", opaque=\"{}\"", opaque);
        }
        if ch.qop_auth {
            let _ = write!(auth, ", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce);
        }
        auth
    }
}

impl AuthSession for DigestSession {
    fn scheme(&self) -> &'static str {
        "digest"
    }

    fn realm(&self) -> &str {
        &self.challenge.realm
    }

    fn domain(&self) -> &[Url] {
        &self.challenge.domain
    }

    fn authenticate_in_advance(&self) -> bool {
        self.in_advance
    }

    fn credentials(&mut self, method: &str, uri: &str) -> Result<String, NetError> {
        self.nonce_count += 1;
        let nc = format!("{:08x}", self.nonce_count);
        let cnonce = Self::generate_cnonce();
        let response = self.compute_response(method, uri, &cnonce, &nc);
        Ok(self.assemble(uri, &response, &cnonce, &nc))
    }

    fn invalidate(&mut self, challenge: &Challenge) -> bool {
        let Some(fresh) = DigestChallenge::parse(challenge, &self.base) else {
            return false;
        };
        if fresh.stale {
            // Nonce expired; same credentials, fresh nonce and counter.
            self.challenge.nonce = fresh.nonce;
            self.challenge.opaque = fresh.opaque;
            self.challenge.qop_auth = fresh.qop_auth;
            self.nonce_count = 0;
            true
        } else {
            false
        }
    }
}
