//! Issues and checks the admin bearer token. The token is a symmetrically
//! signed claim with a two hour lifetime; it is integrity-only, carries no
//! secrets, and verification never touches a store.

use std::time::Duration;

use anyhow::Context as _;
use errors::ErrorMetadata;
use jsonwebtoken::{
    decode,
    encode,
    Algorithm,
    DecodingKey,
    EncodingKey,
    Header,
    Validation,
};
use serde::{
    Deserialize,
    Serialize,
};

pub const ADMIN_TOKEN_TTL: Duration = Duration::from_secs(2 * 3600);

/// Who is making the request, as far as authorization cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Identity {
    Admin,
    Anonymous,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        matches!(self, Identity::Admin)
    }
}

#[derive(Serialize, Deserialize)]
struct AdminClaims {
    is_admin: bool,
    exp: u64,
}

/// Holds the admin password and the signing keys derived from it. When no
/// password is configured the whole admin surface is disabled.
#[derive(Clone)]
pub struct KeyBroker {
    keys: Option<AdminKeys>,
}

#[derive(Clone)]
struct AdminKeys {
    password: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyBroker {
    pub fn new(admin_password: Option<String>) -> Self {
        let keys = admin_password
            .filter(|p| !p.is_empty())
            .map(|password| AdminKeys {
                encoding: EncodingKey::from_secret(password.as_bytes()),
                decoding: DecodingKey::from_secret(password.as_bytes()),
                password,
            });
        Self { keys }
    }

    pub fn enabled(&self) -> bool {
        self.keys.is_some()
    }

    fn keys(&self) -> anyhow::Result<&AdminKeys> {
        self.keys.as_ref().ok_or_else(|| {
            anyhow::Error::from(ErrorMetadata::overloaded(
                "AdminDisabled",
                "no admin password is configured on this deployment",
            ))
        })
    }

    /// Exchange the admin password for a signed token.
    pub fn issue_admin_token(&self, password: &str, now: u64) -> anyhow::Result<String> {
        let keys = self.keys()?;
        if password != keys.password {
            anyhow::bail!(ErrorMetadata::unauthenticated(
                "InvalidAdminPassword",
                "admin password does not match",
            ));
        }
        let claims = AdminClaims {
            is_admin: true,
            exp: now + ADMIN_TOKEN_TTL.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .context("signing admin token")
    }

    /// Pure check: signature and expiry only.
    pub fn verify_admin_token(&self, token: &str) -> bool {
        let Some(keys) = self.keys.as_ref() else {
            return false;
        };
        let validation = Validation::new(Algorithm::HS256);
        match decode::<AdminClaims>(token, &keys.decoding, &validation) {
            Ok(data) => data.claims.is_admin,
            Err(_) => false,
        }
    }

    /// Direct password comparison, for the admin endpoints that take the
    /// password in the request body rather than a bearer token.
    pub fn verify_admin_password(&self, password: &str) -> bool {
        self.keys
            .as_ref()
            .is_some_and(|keys| keys.password == password)
    }

    pub fn identity(&self, token: Option<&str>) -> Identity {
        match token {
            Some(token) if self.verify_admin_token(token) => Identity::Admin,
            _ => Identity::Anonymous,
        }
    }
}
