//! Bearer tokens and password hashing.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use kaiwa_core::{Error, Result};

const TOKEN_TTL_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id.
    sub: i64,
    exp: i64,
    iat: i64,
}

#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl AuthKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, user_id: i64) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user_id,
            exp: now + TOKEN_TTL_SECS,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token encode: {e}")))
    }

    /// Returns the user id for a valid, unexpired token.
    pub fn verify(&self, token: &str) -> Result<i64> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| Error::Auth(format!("invalid token: {e}")))?;
        Ok(data.claims.sub)
    }
}

/// Salted SHA-256, stored as `salt$hex`.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::thread_rng().gen();
    let salt_hex = hex(&salt);
    let digest = Sha256::digest(format!("{salt_hex}{password}").as_bytes());
    format!("{salt_hex}${}", hex(&digest))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, expected)) = stored.split_once('$') else {
        return false;
    };
    let digest = Sha256::digest(format!("{salt_hex}{password}").as_bytes());
    // Constant-time compare; both sides are fixed-length hex.
    let actual = hex(&digest);
    if actual.len() != expected.len() {
        return false;
    }
    actual
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_user_id() {
        let keys = AuthKeys::new("test-secret");
        let token = keys.issue(42).expect("issue");
        assert_eq!(keys.verify(&token).expect("verify"), 42);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let keys = AuthKeys::new("test-secret");
        let other = AuthKeys::new("other-secret");
        let token = keys.issue(42).expect("issue");
        assert!(other.verify(&token).is_err());
        assert!(keys.verify("not-a-token").is_err());
    }

    #[test]
    fn password_hash_verifies_and_salts() {
        let a = hash_password("秘密口令");
        let b = hash_password("秘密口令");
        assert_ne!(a, b, "salts differ");
        assert!(verify_password("秘密口令", &a));
        assert!(verify_password("秘密口令", &b));
        assert!(!verify_password("wrong", &a));
        assert!(!verify_password("秘密口令", "garbage"));
    }
}
