//! Secrets that must never reach logs: portal credentials and the shared
//! webhook secret.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

const VERIFY_CONTEXT: &[u8] = b"scout-webhook-callback";

/// A string that prints as `[REDACTED]` in `Debug` and `Display`.
pub struct SecretString(SecretBox<str>);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretBox::new(Box::from(value.into().as_str())))
    }

    /// Only call this where the value is actually sent somewhere.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }

    /// Constant-time comparison against a presented value.
    ///
    /// Both sides key an HMAC over a fixed context and the tags are compared
    /// with `verify_slice`, so timing does not depend on where the inputs
    /// differ or on their lengths. An empty secret matches nothing.
    pub fn matches(&self, presented: &str) -> bool {
        if self.is_empty() {
            return false;
        }
        let Ok(mut expected) = HmacSha256::new_from_slice(self.expose().as_bytes()) else {
            return false;
        };
        expected.update(VERIFY_CONTEXT);
        let tag = expected.finalize().into_bytes();
        let Ok(mut check) = HmacSha256::new_from_slice(presented.as_bytes()) else {
            return false;
        };
        check.update(VERIFY_CONTEXT);
        check.verify_slice(&tag).is_ok()
    }
}

impl Clone for SecretString {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_string())
    }
}

impl Default for SecretString {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretString::new)
    }
}

/// Portal login. The username is not secret, the password is.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .finish()
    }
}
