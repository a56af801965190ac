use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Expiry sentinel for credentials that live as long as the browsing
/// session (CDP reports these as `expires: -1`).
pub const NEVER_EXPIRES: i64 = -1;

/// A single named auth token, scoped by domain and path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Absolute expiry in epoch seconds, or [`NEVER_EXPIRES`].
    #[serde(default = "default_expires", deserialize_with = "de_expires")]
    pub expires: i64,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_expires() -> i64 {
    NEVER_EXPIRES
}

// Browsers report fractional seconds; anything negative means "session".
fn de_expires<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    let raw = f64::deserialize(deserializer)?;
    if raw < 0.0 {
        Ok(NEVER_EXPIRES)
    } else {
        Ok(raw.floor() as i64)
    }
}

impl Credential {
    pub fn new(name: &str, value: &str, domain: &str, path: &str, expires: i64) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: path.to_string(),
            expires,
        }
    }

    /// Uniqueness key within a [`CredentialSet`].
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.name, &self.domain, &self.path)
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires != NEVER_EXPIRES && self.expires < now
    }
}

/// An ordered, key-unique collection of credentials. Replaced wholesale on
/// refresh, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CredentialSet {
    items: Vec<Credential>,
}

impl CredentialSet {
    /// Build a set, keeping the first credential seen for each
    /// `(name, domain, path)` key.
    pub fn new(credentials: Vec<Credential>) -> Self {
        let mut items: Vec<Credential> = Vec::with_capacity(credentials.len());
        for credential in credentials {
            if items.iter().any(|c| c.key() == credential.key()) {
                debug!(name = %credential.name, domain = %credential.domain, "Dropping duplicate credential");
                continue;
            }
            items.push(credential);
        }
        Self { items }
    }

    /// Parse the cookie array returned by CDP `Network.getCookies`
    /// (either the bare array or the `{"cookies": [...]}` envelope).
    pub fn from_cookie_json(value: &Value) -> Result<Self> {
        let array = match value {
            Value::Array(_) => value,
            Value::Object(map) => map.get("cookies").ok_or_else(|| {
                Error::Parse("cookie payload has no 'cookies' field".to_string())
            })?,
            _ => return Err(Error::Parse("cookie payload is not an array".to_string())),
        };
        let credentials: Vec<Credential> = serde_json::from_value(array.clone())
            .map_err(|e| Error::Parse(format!("invalid cookie record: {}", e)))?;
        Ok(Self::new(credentials))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_stale_at(&self, now: i64) -> bool {
        self.items.iter().any(|c| c.is_expired_at(now))
    }

    /// `Cookie` header value: `name=value` pairs joined by `"; "`.
    pub fn header_value(&self) -> String {
        self.items
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl<'de> Deserialize<'de> for CredentialSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let items = Vec::<Credential>::deserialize(deserializer)?;
        Ok(Self::new(items))
    }
}

impl From<Vec<Credential>> for CredentialSet {
    fn from(items: Vec<Credential>) -> Self {
        Self::new(items)
    }
}
