use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user {0} has no stored credentials")]
    UnknownUser(String),
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("credential rejected: {0}")]
    Rejected(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("credential storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// Whether the user has to authorize again rather than wait and retry.
    pub fn needs_reauthorization(&self) -> bool {
        !matches!(self, AuthError::Refresh(_) | AuthError::Storage(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub secret: String,
    /// Unix seconds; `None` means the provider did not report an expiry.
    pub expires_at: Option<i64>,
}

impl AccessToken {
    pub fn expires_within(&self, now: i64, skew_secs: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now.saturating_add(skew_secs),
            None => false,
        }
    }
}

/// Owns credential lifetime. The reconciler only reads and asks for refresh.
#[async_trait]
pub trait AuthManager: Send + Sync {
    async fn access_token(&self, user_id: &str) -> Result<AccessToken, AuthError>;

    async fn refresh(&self, user_id: &str) -> Result<AccessToken, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_window_uses_skew() {
        let token = AccessToken {
            secret: "t".into(),
            expires_at: Some(1_000),
        };
        assert!(token.expires_within(950, 60));
        assert!(!token.expires_within(900, 60));
        assert!(
            !AccessToken {
                secret: "t".into(),
                expires_at: None
            }
            .expires_within(i64::MAX, 60)
        );
    }
}
