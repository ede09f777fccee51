//! Document access policies.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AccessPolicy, AuthError};

#[derive(Debug, Deserialize)]
struct AccessResponse {
    allowed: bool,
}

/// Asks the permission service over HTTP
pub struct HttpAccessPolicy {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpAccessPolicy {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            AuthError::InvalidConfig(format!("access service URL {:?}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(AuthError::InvalidConfig(format!(
                "access service URL {} cannot take a path",
                base_url
            )));
        }

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("codoc-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AuthError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    /// `<base>/documents/<document_id>/access`, with the id as one escaped segment
    fn access_url(&self, document_id: &str) -> Result<Url, AuthError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AuthError::InvalidConfig(format!("{} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["documents", document_id, "access"]);
        Ok(url)
    }
}

#[async_trait]
impl AccessPolicy for HttpAccessPolicy {
    async fn check_access(&self, user_id: &str, document_id: &str) -> Result<bool, AuthError> {
        let url = self.access_url(document_id)?;
        debug!(user = %user_id, document = %document_id, "Checking document access");

        let response = self
            .http_client
            .get(url.clone())
            .query(&[("userId", user_id)])
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            warn!("Access service returned HTTP {} for {}", status, url);
            return Err(AuthError::Unavailable(format!("HTTP {} from {}", status, url)));
        }

        let body: AccessResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(format!("invalid access response: {}", e)))?;
        Ok(body.allowed)
    }
}

/// Fixed grants, or everything when running in development mode
#[derive(Default)]
pub struct StaticAccessPolicy {
    allow_all: bool,
    grants: DashMap<String, DashSet<String>>,
}

impl StaticAccessPolicy {
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            grants: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn deny_all() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn grant(&self, user_id: &str, document_id: &str) {
        self.grants
            .entry(document_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    #[cfg(test)]
    pub fn revoke(&self, user_id: &str, document_id: &str) {
        if let Some(users) = self.grants.get(document_id) {
            users.remove(user_id);
        }
    }
}

#[async_trait]
impl AccessPolicy for StaticAccessPolicy {
    async fn check_access(&self, user_id: &str, document_id: &str) -> Result<bool, AuthError> {
        if self.allow_all {
            return Ok(true);
        }
        Ok(self
            .grants
            .get(document_id)
            .is_some_and(|users| users.contains(user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_grants() {
        let policy = StaticAccessPolicy::deny_all();
        assert!(!policy.check_access("alice", "doc").await.unwrap());

        policy.grant("alice", "doc");
        assert!(policy.check_access("alice", "doc").await.unwrap());
        assert!(!policy.check_access("bob", "doc").await.unwrap());

        policy.revoke("alice", "doc");
        assert!(!policy.check_access("alice", "doc").await.unwrap());
    }

    #[tokio::test]
    async fn test_allow_all() {
        let policy = StaticAccessPolicy::allow_all();
        assert!(policy.check_access("anyone", "anything").await.unwrap());
    }

    #[test]
    fn test_access_url() {
        let policy = HttpAccessPolicy::new("http://perms.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            policy.access_url("doc-1").unwrap().as_str(),
            "http://perms.local/documents/doc-1/access"
        );

        let nested =
            HttpAccessPolicy::new("http://perms.local/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            nested.access_url("doc-1").unwrap().as_str(),
            "http://perms.local/api/documents/doc-1/access"
        );
    }

    #[test]
    fn test_document_id_is_one_escaped_segment() {
        let policy = HttpAccessPolicy::new("http://perms.local", Duration::from_secs(1)).unwrap();
        let url = policy.access_url("a/b?c#d").unwrap();
        assert_eq!(url.as_str(), "http://perms.local/documents/a%2Fb%3Fc%23d/access");
        assert_eq!(url.query(), None);

        let url = policy.access_url("../admin").unwrap();
        assert_eq!(url.path(), "/documents/..%2Fadmin/access");
    }

    #[test]
    fn test_invalid_service_url() {
        assert!(matches!(
            HttpAccessPolicy::new("not a url", Duration::from_secs(1)),
            Err(AuthError::InvalidConfig(_))
        ));
        assert!(matches!(
            HttpAccessPolicy::new("mailto:perms@example.com", Duration::from_secs(1)),
            Err(AuthError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let policy =
            HttpAccessPolicy::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        assert!(matches!(
            policy.check_access("alice", "doc").await,
            Err(AuthError::Unavailable(_))
        ));
    }
}
