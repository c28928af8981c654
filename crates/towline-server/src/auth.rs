//! Bearer token verification.
//!
//! Tokens are HS256 JWTs whose `sub` claim carries the user id. Clients
//! mint them at login (outside this service); the relay and the HTTP
//! history routes only ever verify.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use towline_relay::RelayError;

/// JWT claims the relay cares about. Expiry is enforced by the
/// validation step, not carried here.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default, deserialize_with = "deserialize_subject")]
    sub: Option<i64>,
}

/// Accept a numeric or numeric-string subject; anything else is None.
fn deserialize_subject<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Verifier over the server's shared HS256 secret.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Create a verifier for the given secret.
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify a token and extract the user id from its subject.
    ///
    /// Any decode failure (bad signature, expired, wrong algorithm) or
    /// an unusable subject is an auth failure; callers do not learn
    /// which, and neither does the client.
    pub fn verify(&self, token: &str) -> Result<i64, RelayError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!(error = %e, "Token verification failed");
            RelayError::auth_failed("invalid token")
        })?;

        data.claims
            .sub
            .ok_or_else(|| RelayError::auth_failed("token subject is not a user id"))
    }
}
