use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com";
const ROOT_ITEM_ID: &str = "root";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("item {0} has no download url")]
    MissingDownloadUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Thin client over the `/me/drive` endpoints of Microsoft Graph.
///
/// The access token is passed per call: the caller owns token lifetime and
/// may refresh between requests without rebuilding the client.
#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: Url,
}

impl GraphClient {
    pub fn new() -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    pub async fn get_item(&self, token: &str, item_id: &str) -> Result<DriveItem, DriveError> {
        let url = self.endpoint(&format!("/v1.0/me/drive/items/{item_id}"))?;
        self.get_json(token, url).await
    }

    /// Resolves the short-lived pre-authenticated content URL of a file.
    pub async fn get_download_url(&self, token: &str, item_id: &str) -> Result<Url, DriveError> {
        let item = self.get_item(token, item_id).await?;
        item.download_url
            .ok_or_else(|| DriveError::MissingDownloadUrl(item_id.to_string()))
    }

    pub async fn list_children_page(
        &self,
        token: &str,
        item_id: &str,
    ) -> Result<DriveItemPage, DriveError> {
        let url = if item_id == ROOT_ITEM_ID {
            self.endpoint("/v1.0/me/drive/root/children")?
        } else {
            self.endpoint(&format!("/v1.0/me/drive/items/{item_id}/children"))?
        };
        self.get_json(token, url).await
    }

    /// Lists every direct child of `item_id`, following `@odata.nextLink`.
    pub async fn list_children_all(
        &self,
        token: &str,
        item_id: &str,
    ) -> Result<Vec<DriveItem>, DriveError> {
        let mut page = self.list_children_page(token, item_id).await?;
        let mut items = std::mem::take(&mut page.value);
        while let Some(next) = page.next_link.take() {
            page = self.get_json(token, Url::parse(&next)?).await?;
            items.append(&mut page.value);
        }
        Ok(items)
    }

    /// Fetches one page of the drive change feed.
    ///
    /// `link` is either `None` (start a full enumeration) or a previously
    /// returned `@odata.nextLink` / `@odata.deltaLink`.
    pub async fn delta_page(
        &self,
        token: &str,
        link: Option<&str>,
    ) -> Result<DriveItemPage, DriveError> {
        let url = match link {
            Some(link) => Url::parse(link)?,
            None => self.endpoint("/v1.0/me/drive/root/delta")?,
        };
        self.get_json(token, url).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        url: Url,
    ) -> Result<T, DriveError> {
        let response = self.http.get(url).bearer_auth(token).send().await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default, rename = "eTag")]
    pub e_tag: Option<String>,
    #[serde(default, rename = "cTag")]
    pub c_tag: Option<String>,
    #[serde(default)]
    pub created_date_time: Option<String>,
    #[serde(default)]
    pub last_modified_date_time: Option<String>,
    #[serde(default)]
    pub parent_reference: Option<ParentReference>,
    #[serde(default)]
    pub file: Option<FileFacet>,
    #[serde(default)]
    pub folder: Option<FolderFacet>,
    #[serde(default)]
    pub root: Option<RootFacet>,
    #[serde(default)]
    pub deleted: Option<DeletedFacet>,
    #[serde(default, rename = "@microsoft.graph.downloadUrl")]
    pub download_url: Option<Url>,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub hashes: Option<FileHashes>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHashes {
    #[serde(default)]
    pub sha256_hash: Option<String>,
    #[serde(default)]
    pub sha1_hash: Option<String>,
    #[serde(default)]
    pub quick_xor_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeletedFacet {
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DriveItemPage {
    #[serde(default)]
    pub value: Vec<DriveItem>,
    #[serde(default, rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(default, rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

/// Present only on the drive root item (`"root": {}`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RootFacet {}
