use async_trait::async_trait;
use onedrive_core::OAuthClient;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::clock::now_unix;
use crate::storage::{AccountError, AccountStore};
use crate::sync::auth::{AccessToken, AuthError, AuthManager};

#[derive(Debug, Error)]
pub enum TokenProviderError {
    #[error("oauth client is required to refresh expired token")]
    MissingOAuthClient,
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("oauth refresh failed: {0}")]
    OAuth(#[from] onedrive_core::OAuthError),
    #[error("account storage failed: {0}")]
    Account(#[from] AccountError),
}

impl From<TokenProviderError> for AuthError {
    fn from(err: TokenProviderError) -> Self {
        match err {
            TokenProviderError::MissingRefreshToken => AuthError::MissingRefreshToken,
            TokenProviderError::OAuth(err) if err.is_invalid_grant() => {
                AuthError::Rejected(err.to_string())
            }
            TokenProviderError::Account(AccountError::NotFound(id)) => AuthError::UnknownUser(id),
            TokenProviderError::Account(err) => AuthError::Storage(err.to_string()),
            other => AuthError::Refresh(other.to_string()),
        }
    }
}

/// Serves stored access tokens and refreshes them through the identity
/// platform, writing the new material back to the account store.
pub struct TokenProvider {
    accounts: AccountStore,
    oauth_client: Option<OAuthClient>,
    refresh_lock: Mutex<()>,
}

impl TokenProvider {
    pub fn new(accounts: AccountStore, oauth_client: Option<OAuthClient>) -> Self {
        Self {
            accounts,
            oauth_client,
            refresh_lock: Mutex::new(()),
        }
    }

    async fn refresh_account(&self, user_id: &str) -> Result<AccessToken, TokenProviderError> {
        // One refresh at a time; refresh tokens may be single-use.
        let _guard = self.refresh_lock.lock().await;
        let account = self
            .accounts
            .get_account(user_id)
            .await?
            .ok_or_else(|| AccountError::NotFound(user_id.to_string()))?;
        let refresh_token = account
            .refresh_token
            .ok_or(TokenProviderError::MissingRefreshToken)?;
        let client = self
            .oauth_client
            .as_ref()
            .ok_or(TokenProviderError::MissingOAuthClient)?;

        let token = client.refresh_token(&refresh_token).await?;
        let now = now_unix();
        let expires_at = token
            .expires_in
            .map(|secs| now.saturating_add(secs as i64));
        self.accounts
            .update_tokens(
                user_id,
                &token.access_token,
                token.refresh_token.as_deref(),
                expires_at,
                now,
            )
            .await?;
        info!(user_id, "access token refreshed");

        Ok(AccessToken {
            secret: token.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl AuthManager for TokenProvider {
    async fn access_token(&self, user_id: &str) -> Result<AccessToken, AuthError> {
        let account = self
            .accounts
            .get_account(user_id)
            .await
            .map_err(TokenProviderError::from)?
            .ok_or_else(|| AuthError::UnknownUser(user_id.to_string()))?;
        Ok(AccessToken {
            secret: account.access_token,
            expires_at: account.expires_at,
        })
    }

    async fn refresh(&self, user_id: &str) -> Result<AccessToken, AuthError> {
        Ok(self.refresh_account(user_id).await?)
    }
}
