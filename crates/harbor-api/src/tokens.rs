use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use harbor_types::api::{AccessClaims, RefreshClaims};
use harbor_types::models::Identity;

use crate::error::ApiError;

/// Access tokens are short-lived and verified without a storage lookup, so
/// they cannot be individually revoked; revocation only cuts off refreshing.
/// The exact duration is tunable, not load-bearing.
pub const ACCESS_TTL_SECS: i64 = 15 * 60;

pub const REFRESH_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

pub const OTP_TTL_MS: i64 = 5 * 60 * 1000;

/// Signs and verifies the two token kinds with independent secrets.
/// Verification is pure computation; no I/O, never suspends.
#[derive(Clone)]
pub struct Tokens {
    access_secret: String,
    refresh_secret: String,
}

impl Tokens {
    pub fn new(access_secret: impl Into<String>, refresh_secret: impl Into<String>) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
        }
    }

    pub fn sign_access(&self, identity: &Identity) -> Result<String, ApiError> {
        let claims = AccessClaims {
            sub: identity.id,
            username: identity.username.clone(),
            exp: (Utc::now().timestamp() + ACCESS_TTL_SECS) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.access_secret.as_bytes()),
        )
        .map_err(|e| ApiError::Storage(anyhow::Error::new(e)))
    }

    pub fn sign_refresh(&self, user_id: Uuid) -> Result<String, ApiError> {
        let claims = RefreshClaims {
            sub: user_id,
            jti: Uuid::new_v4(),
            exp: (Utc::now().timestamp() + REFRESH_TTL_MS / 1000) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.refresh_secret.as_bytes()),
        )
        .map_err(|e| ApiError::Storage(anyhow::Error::new(e)))
    }

    /// Stateless signature + expiry check; the contract shared by HTTP
    /// middleware and the gateway handshake.
    pub fn verify_access(&self, token: &str) -> Result<Identity, ApiError> {
        let data = decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(self.access_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| ApiError::auth("invalid or expired access token"))?;

        Ok(Identity {
            id: data.claims.sub,
            username: data.claims.username,
        })
    }

    /// Signature/expiry check on a refresh token. Callers must still check
    /// the stored row; the claims alone never authorize a refresh.
    pub fn decode_refresh(&self, token: &str) -> Result<Uuid, ApiError> {
        let data = decode::<RefreshClaims>(
            token,
            &DecodingKey::from_secret(self.refresh_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| ApiError::auth("invalid or expired refresh token"))?;

        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> Tokens {
        Tokens::new("access-secret", "refresh-secret")
    }

    fn identity() -> Identity {
        Identity {
            id: Uuid::new_v4(),
            username: "alice".into(),
        }
    }

    #[test]
    fn access_roundtrip() {
        let t = tokens();
        let who = identity();
        let token = t.sign_access(&who).unwrap();
        let verified = t.verify_access(&token).unwrap();
        assert_eq!(verified, who);
    }

    #[test]
    fn wrong_secret_rejected() {
        let who = identity();
        let token = tokens().sign_access(&who).unwrap();
        let other = Tokens::new("different", "refresh-secret");
        assert!(other.verify_access(&token).is_err());
    }

    #[test]
    fn access_and_refresh_secrets_are_not_interchangeable() {
        let t = tokens();
        let who = identity();
        let refresh = t.sign_refresh(who.id).unwrap();
        // a refresh token must never pass as an access token
        assert!(t.verify_access(&refresh).is_err());
    }

    #[test]
    fn expired_access_rejected() {
        let t = tokens();
        // hand-craft claims well past expiry (default validation has 60s leeway)
        let claims = AccessClaims {
            sub: Uuid::new_v4(),
            username: "alice".into(),
            exp: (Utc::now().timestamp() - 300) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret("access-secret".as_bytes()),
        )
        .unwrap();
        assert!(t.verify_access(&token).is_err());
    }

    #[test]
    fn refresh_roundtrip() {
        let t = tokens();
        let id = Uuid::new_v4();
        let token = t.sign_refresh(id).unwrap();
        assert_eq!(t.decode_refresh(&token).unwrap(), id);
    }
}
