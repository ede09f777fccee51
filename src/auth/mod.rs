//! Identity verification and document access checks.
//!
//! Both are external collaborators: the engine consumes a verified identity
//! and a yes/no grant, nothing more.

mod access;
mod jwt;

pub use access::{HttpAccessPolicy, StaticAccessPolicy};
pub use jwt::{JwtClaims, JwtVerifier};

use async_trait::async_trait;
use thiserror::Error;

/// A verified caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
}

/// Errors from the identity and authorization collaborators
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Credential expired")]
    Expired,

    #[error("Authorization service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Turns a client credential into a verified identity
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Answers whether a user may read and write a document
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn check_access(&self, user_id: &str, document_id: &str) -> Result<bool, AuthError>;
}
