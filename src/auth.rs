//! Entity and user authentication claims.
//!
//! Entity authentication identifies the device by ESN; user authentication
//! carries the account's identity cookies. Both are plain data builders.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::device::DeviceIdentity;
use crate::error::{Error, Result};

/// Entity authentication scheme used for unprovisioned devices.
pub const ENTITY_AUTH_SCHEME: &str = "NONE";
/// User authentication scheme for cookie-derived credentials.
pub const USER_AUTH_SCHEME: &str = "NETFLIXID";

/// Named session cookies supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieSet {
    cookies: BTreeMap<String, String>,
}

impl CookieSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// First cookie present under any of `names`.
    fn first_of<'a>(&'a self, names: &[String]) -> Option<(&'a str, &'a str)> {
        names.iter().find_map(|name| {
            self.cookies
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v.as_str()))
        })
    }

    /// Parse a `NAME=VALUE` pair, as given on the command line.
    pub fn parse_pair(pair: &str) -> Result<(String, String)> {
        let (name, value) = pair.split_once('=').ok_or_else(|| {
            Error::Authentication(format!("Cookie must be NAME=VALUE, got {:?}", pair))
        })?;
        Ok((name.trim().to_string(), value.trim().to_string()))
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CookieSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = CookieSet::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

/// Accepted cookie names, in lookup order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CookieNames {
    pub identity: Vec<String>,
    pub secure_identity: Vec<String>,
}

impl Default for CookieNames {
    fn default() -> Self {
        Self {
            identity: vec!["NetflixId".to_string(), "nflxid".to_string()],
            secure_identity: vec!["SecureNetflixId".to_string(), "securenflxid".to_string()],
        }
    }
}

/// Entity authentication data as sent in a handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityAuthData {
    pub scheme: String,
    pub authdata: EntityAuthPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityAuthPayload {
    pub identity: String,
}

/// User authentication data carried in message headers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAuthData {
    pub scheme: String,
    pub authdata: UserAuthPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAuthPayload {
    pub netflixid: String,
    pub securenetflixid: String,
}

/// Builds entity authentication claims.
pub struct EntityAuthenticator;

impl EntityAuthenticator {
    #[must_use]
    pub fn claim(device: &DeviceIdentity) -> EntityAuthData {
        EntityAuthData {
            scheme: ENTITY_AUTH_SCHEME.to_string(),
            authdata: EntityAuthPayload {
                identity: device.esn().to_string(),
            },
        }
    }
}

/// Builds user authentication claims and account fingerprints from cookies.
#[derive(Debug, Clone, Default)]
pub struct UserAuthenticator {
    names: CookieNames,
}

impl UserAuthenticator {
    pub fn new(names: CookieNames) -> Self {
        Self { names }
    }

    /// Build the user authentication claim.
    ///
    /// Both identity cookies must be present, non-empty and free of
    /// whitespace or control characters.
    pub fn claim(&self, cookies: &CookieSet) -> Result<UserAuthData> {
        let identity = required_cookie(cookies, &self.names.identity)?;
        let secure = required_cookie(cookies, &self.names.secure_identity)?;
        Ok(UserAuthData {
            scheme: USER_AUTH_SCHEME.to_string(),
            authdata: UserAuthPayload {
                netflixid: identity.to_string(),
                securenetflixid: secure.to_string(),
            },
        })
    }

    /// Hex SHA-256 of the primary identity cookie.
    ///
    /// This keys the session cache, so it validates the same way [`claim`]
    /// does.
    ///
    /// [`claim`]: UserAuthenticator::claim
    pub fn fingerprint(&self, cookies: &CookieSet) -> Result<String> {
        let identity = required_cookie(cookies, &self.names.identity)?;
        Ok(hex::encode(Sha256::digest(identity.as_bytes())))
    }
}

fn required_cookie<'a>(cookies: &'a CookieSet, names: &[String]) -> Result<&'a str> {
    let primary = names.first().map(String::as_str).unwrap_or("<unnamed>");
    let (name, value) = cookies
        .first_of(names)
        .ok_or_else(|| Error::Authentication(format!("Cookie {} is missing", primary)))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Authentication(format!("Cookie {} is empty", name)));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Authentication(format!("Cookie {} is malformed", name)));
    }
    Ok(value)
}
