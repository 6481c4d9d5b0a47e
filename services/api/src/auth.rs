//! Token auth for the write surface.
//!
//! Operators authenticate with username/password against the `users` table;
//! the service issues an HS256 JWT carrying the user id and role.  Writes
//! require the `admin` or `operator` role; reads are open.

use axum::http::{header, HeaderMap};
use axum::response::Response;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use pbkdf2::password_hash::rand_core::OsRng;
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use serde::{Deserialize, Serialize};

use crate::http::response::{forbidden, unauthorized};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl AuthKeys {
    pub fn new(secret: &str, lifetime_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            lifetime: Duration::hours(lifetime_hours),
        }
    }

    pub fn issue(&self, subject: &str, role: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_owned(),
            role: role.to_owned(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding, &Validation::default()).map(|data| data.claims)
    }
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

pub fn can_write(role: &str) -> bool {
    matches!(role, "admin" | "operator")
}

/// Guard for write endpoints: a valid bearer token with a writer role.
pub fn require_writer(auth: &AuthKeys, headers: &HeaderMap) -> Result<Claims, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer);
    let Some(token) = token else {
        return Err(unauthorized("missing bearer token"));
    };
    let claims = auth
        .verify(token)
        .map_err(|_| unauthorized("invalid or expired token"))?;
    if !can_write(&claims.role) {
        return Err(forbidden("not authorized"));
    }
    Ok(claims)
}

pub fn hash_password(password: &str) -> Result<String, pbkdf2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Pbkdf2
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_and_verify() {
        let hashed = hash_password("secret").unwrap();
        assert!(verify_password("secret", &hashed));
        assert!(!verify_password("wrong", &hashed));
    }

    #[test]
    fn token_round_trips_subject_and_role() {
        let keys = AuthKeys::new("test-secret", 8);
        let token = keys.issue("user1", "admin").unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.sub, "user1");
        assert_eq!(claims.role, "admin");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_is_rejected() {
        let keys = AuthKeys::new("test-secret", -1);
        let token = keys.issue("user1", "admin").unwrap();
        assert!(keys.verify(&token).is_err());
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let keys = AuthKeys::new("test-secret", 8);
        let other = AuthKeys::new("other-secret", 8);
        let token = other.issue("user1", "admin").unwrap();
        assert!(keys.verify(&token).is_err());
    }

    #[test]
    fn only_admin_and_operator_may_write() {
        assert!(can_write("admin"));
        assert!(can_write("operator"));
        assert!(!can_write("viewer"));
        assert!(!can_write(""));
    }
}
