use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

pub const DEFAULT_SCOPES: &[&str] = &["Files.Read.All", "offline_access", "User.Read"];

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl OAuthError {
    /// The identity platform rejected the grant itself (revoked or expired
    /// refresh token), as opposed to a transport or server failure.
    pub fn is_invalid_grant(&self) -> bool {
        match self {
            OAuthError::Api { status, body } => {
                matches!(*status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED)
                    && body.contains("invalid_grant")
            }
            _ => false,
        }
    }
}

/// Refresh-token client for the Microsoft identity platform v2.0 endpoint.
#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    authority: Url,
    tenant_id: String,
    client_id: String,
    client_secret: Option<String>,
    scopes: Vec<String>,
}

impl OAuthClient {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_authority(DEFAULT_AUTHORITY, tenant_id, client_id, client_secret)
    }

    pub fn with_authority(
        authority: &str,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            authority: Url::parse(authority)?,
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn token_url(&self) -> Result<Url, OAuthError> {
        Ok(self
            .authority
            .join(&format!("/{}/oauth2/v2.0/token", self.tenant_id))?)
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, OAuthError> {
        let url = self.token_url()?;
        let scope = self.scopes.join(" ");
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];
        if let Some(secret) = self.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self.http.post(url).form(&form).send().await?;
        if response.status().is_success() {
            Ok(response.json::<OAuthToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OAuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}
