//! Credential lookup: keys, key handlers, and the caching key ring.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use url::Url;
use zeroize::Zeroizing;

/// One credential: username/password valid for a realm and a protection
/// space described by absolute domain URIs.
#[derive(Clone)]
pub struct Key {
    pub username: String,
    password: Zeroizing<String>,
    pub realm: String,
    pub domain: Vec<Url>,
}

impl Key {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
        domain: Vec<Url>,
    ) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
            realm: realm.into(),
            domain,
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("username", &self.username)
            .field("realm", &self.realm)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Resolves credentials for authentication challenges.
///
/// `domain` lists absolute URIs describing the protection space, `realms`
/// the challenge realms, `scheme` the lowercase auth scheme.
pub trait KeyHandler: Send + Sync {
    fn inquire_key(&self, domain: &[Url], realms: &[String], scheme: &str) -> Option<Key>;

    /// Called when a key was rejected by the server.
    fn invalidate_key(&self, _key: &Key) {}
}

/// Caching key store with an optional uplink handler for misses.
pub struct KeyRing {
    entries: DashMap<String, Key>,
    uplink: Option<Arc<dyn KeyHandler>>,
}

impl KeyRing {
    pub fn new(uplink: Option<Arc<dyn KeyHandler>>) -> Self {
        Self { entries: DashMap::new(), uplink }
    }

    fn cache_key(domain: &[Url], realm: &str) -> String {
        let origin = domain
            .first()
            .and_then(|u| u.host_str().map(|h| format!("{}:{}", h, u.port_or_known_default().unwrap_or(0))))
            .unwrap_or_default();
        format!("{}|{}", origin.to_lowercase(), realm)
    }

    /// Stores a key; it will answer inquiries matching its realm and domain.
    pub fn add_key(&self, key: Key) {
        self.entries.insert(Self::cache_key(&key.domain, &key.realm), key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for KeyRing {
    fn default() -> Self {
        Self::new(None)
    }
}

impl KeyHandler for KeyRing {
    fn inquire_key(&self, domain: &[Url], realms: &[String], scheme: &str) -> Option<Key> {
        for realm in realms {
            if let Some(k) = self.entries.get(&Self::cache_key(domain, realm)) {
                return Some(k.clone());
            }
        }
        // Keys stored without a domain answer any origin with that realm.
        for realm in realms {
            if let Some(k) = self.entries.get(&Self::cache_key(&[], realm)) {
                return Some(k.clone());
            }
        }
        let key = self.uplink.as_ref()?.inquire_key(domain, realms, scheme)?;
        self.entries
            .insert(Self::cache_key(&key.domain, &key.realm), key.clone());
        Some(key)
    }

    fn invalidate_key(&self, key: &Key) {
        self.entries.remove(&Self::cache_key(&key.domain, &key.realm));
        if let Some(uplink) = &self.uplink {
            uplink.invalidate_key(key);
        }
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("entries", &self.entries.len())
            .field("has_uplink", &self.uplink.is_some())
            .finish()
    }
}
