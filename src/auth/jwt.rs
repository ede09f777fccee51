//! HS256 bearer-token verification.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::{AuthError, Identity, IdentityVerifier};

/// Claims carried by a collaboration token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// User id
    pub sub: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

impl From<JwtClaims> for Identity {
    fn from(claims: JwtClaims) -> Self {
        Identity {
            user_id: claims.sub,
            name: claims.name,
            email: claims.email,
            avatar: claims.avatar,
        }
    }
}

/// Verifies tokens signed with a shared secret
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::InvalidConfig("JWT secret is empty".to_string()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential);

        match decode::<JwtClaims>(token, &self.key, &self.validation) {
            Ok(data) if data.claims.sub.is_empty() => {
                Err(AuthError::InvalidCredential("empty subject".to_string()))
            }
            Ok(data) => Ok(data.claims.into()),
            Err(err) => match err.kind() {
                ErrorKind::ExpiredSignature => Err(AuthError::Expired),
                ErrorKind::InvalidSignature => {
                    Err(AuthError::InvalidCredential("invalid signature".to_string()))
                }
                _ => Err(AuthError::InvalidCredential(err.to_string())),
            },
        }
    }
}
