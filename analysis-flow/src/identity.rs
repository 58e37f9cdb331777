use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Caller identity as established by the credential lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub email: String,
}

/// Trait for resolving an opaque credential into an identity.
///
/// `None` means anonymous; callers decide whether that is acceptable.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, credential: &str) -> Option<Identity>;
}

/// Claims carried by session tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub user_id: String,
    pub email: String,
    pub exp: usize,
}

/// Verifies HS256 session tokens signed with a shared secret
pub struct JwtIdentityResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityResolver for JwtIdentityResolver {
    fn resolve(&self, credential: &str) -> Option<Identity> {
        match decode::<SessionClaims>(credential.trim(), &self.key, &self.validation) {
            Ok(data) => Some(Identity {
                user_id: data.claims.user_id,
                email: data.claims.email,
            }),
            Err(e) => {
                debug!("Rejected session token: {}", e);
                None
            }
        }
    }
}
