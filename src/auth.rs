//! The contract `BatchService` needs from an OS-account authenticator.
//!
//! The real PAM-backed implementation lives outside this crate; this module
//! only defines the trait and a couple of test doubles so the rest of the
//! core can be exercised without linking against the host's account
//! database.

use async_trait::async_trait;

#[async_trait]
pub trait UserAuthenticator: Send + Sync {
    /// Verifies `credential` for `user` against the host account database.
    /// Returns `Ok(false)` for a plain bad-credential rejection; `Err` is
    /// reserved for the authenticator itself being unavailable (PAM down,
    /// etc).
    async fn authenticate(&self, user: &str, credential: &str) -> anyhow::Result<bool>;
}

/// Accepts every credential. Only for tests exercising the rest of the
/// service without a real account database.
#[derive(Debug, Default)]
pub struct AllowAllAuthenticator;

#[async_trait]
impl UserAuthenticator for AllowAllAuthenticator {
    async fn authenticate(&self, _user: &str, _credential: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Matches against a fixed in-memory user/credential table. For tests that
/// need authentication to actually fail for some users.
#[derive(Debug, Default)]
pub struct FixedCredentialAuthenticator {
    credentials: std::collections::HashMap<String, String>,
}

impl FixedCredentialAuthenticator {
    pub fn new(credentials: std::collections::HashMap<String, String>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl UserAuthenticator for FixedCredentialAuthenticator {
    async fn authenticate(&self, user: &str, credential: &str) -> anyhow::Result<bool> {
        Ok(self.credentials.get(user).map(|c| c == credential).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_accepts_anything() {
        let auth = AllowAllAuthenticator;
        assert!(auth.authenticate("alice", "wrong").await.unwrap());
    }

    #[tokio::test]
    async fn fixed_credentials_reject_mismatch() {
        let mut creds = std::collections::HashMap::new();
        creds.insert("alice".to_string(), "secret".to_string());
        let auth = FixedCredentialAuthenticator::new(creds);
        assert!(auth.authenticate("alice", "secret").await.unwrap());
        assert!(!auth.authenticate("alice", "wrong").await.unwrap());
        assert!(!auth.authenticate("bob", "secret").await.unwrap());
    }
}
