use async_trait::async_trait;
use onedrive_core::{ApiErrorClass, DriveError, DriveItem, DriveItemPage, GraphClient};
use reqwest::StatusCode;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote api error: {message}")]
    Api {
        class: ApiErrorClass,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("item {0} has no downloadable content")]
    MissingContent(String),
    /// The provider no longer accepts the stored change-feed cursor.
    #[error("resume cursor expired: {0}")]
    CursorExpired(String),
}

impl RemoteError {
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            RemoteError::Api {
                class: ApiErrorClass::Auth,
                ..
            }
        )
    }
}

impl From<DriveError> for RemoteError {
    fn from(err: DriveError) -> Self {
        match (&err, err.classification()) {
            (DriveError::MissingDownloadUrl(id), _) => RemoteError::MissingContent(id.clone()),
            (DriveError::Api { status, .. }, _) if *status == StatusCode::GONE => {
                RemoteError::CursorExpired(err.to_string())
            }
            (_, Some(class)) => RemoteError::Api {
                class,
                message: err.to_string(),
            },
            (_, None) => RemoteError::Transport(err.to_string()),
        }
    }
}

/// One file or folder entry as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    pub size: Option<i64>,
    pub parent_id: Option<String>,
    pub remote_path_hint: Option<String>,
    pub content_tag: Option<String>,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub download_url: Option<Url>,
    pub sha256: Option<String>,
    pub is_root: bool,
    pub is_deleted: bool,
}

impl From<DriveItem> for RemoteItem {
    fn from(item: DriveItem) -> Self {
        let is_folder = item.is_folder();
        let is_root = item.is_root();
        let is_deleted = item.is_deleted();
        let (parent_id, remote_path_hint) = match item.parent_reference {
            Some(parent) => (parent.id, parent.path),
            None => (None, None),
        };
        let sha256 = item
            .file
            .and_then(|file| file.hashes)
            .and_then(|hashes| hashes.sha256_hash);
        Self {
            name: item.name.unwrap_or_else(|| item.id.clone()),
            id: item.id,
            is_folder,
            size: item.size,
            parent_id,
            remote_path_hint,
            content_tag: item.e_tag.or(item.c_tag),
            created_at: parse_timestamp(item.created_date_time.as_deref()),
            modified_at: parse_timestamp(item.last_modified_date_time.as_deref()),
            download_url: item.download_url,
            sha256,
            is_root,
            is_deleted,
        }
    }
}

/// One page of the change feed. `next_link` continues the current
/// enumeration; `cursor` is set on the last page and resumes the next one.
#[derive(Debug, Clone, Default)]
pub struct DeltaPage {
    pub items: Vec<RemoteItem>,
    pub next_link: Option<String>,
    pub cursor: Option<String>,
}

impl From<DriveItemPage> for DeltaPage {
    fn from(page: DriveItemPage) -> Self {
        Self {
            items: page.value.into_iter().map(RemoteItem::from).collect(),
            next_link: page.next_link,
            cursor: page.delta_link,
        }
    }
}

/// Where to fetch a file's bytes from, plus what they should hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSource {
    pub url: Url,
    pub sha256: Option<String>,
}

#[async_trait]
pub trait RemoteDriveClient: Send + Sync {
    /// Direct children of `node_id`; `"root"` names the drive root.
    async fn list_children(&self, token: &str, node_id: &str)
    -> Result<Vec<RemoteItem>, RemoteError>;

    /// One change-feed page, starting fresh when `link` is `None`.
    async fn list_delta(&self, token: &str, link: Option<&str>)
    -> Result<DeltaPage, RemoteError>;

    async fn resolve_download_source(
        &self,
        token: &str,
        item_id: &str,
    ) -> Result<ContentSource, RemoteError>;
}

#[async_trait]
impl RemoteDriveClient for GraphClient {
    async fn list_children(
        &self,
        token: &str,
        node_id: &str,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let items = self.list_children_all(token, node_id).await?;
        Ok(items.into_iter().map(RemoteItem::from).collect())
    }

    async fn list_delta(&self, token: &str, link: Option<&str>) -> Result<DeltaPage, RemoteError> {
        Ok(self.delta_page(token, link).await?.into())
    }

    async fn resolve_download_source(
        &self,
        token: &str,
        item_id: &str,
    ) -> Result<ContentSource, RemoteError> {
        let item = RemoteItem::from(self.get_item(token, item_id).await?);
        match item.download_url {
            Some(url) => Ok(ContentSource {
                url,
                sha256: item.sha256,
            }),
            None => Err(RemoteError::MissingContent(item_id.to_string())),
        }
    }
}

fn parse_timestamp(value: Option<&str>) -> Option<i64> {
    let value = value?;
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|parsed| parsed.unix_timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn converts_drive_item_fields() {
        let item: DriveItem = serde_json::from_value(json!({
            "id": "item-1",
            "name": "a.txt",
            "size": 5,
            "eTag": "etag-1",
            "cTag": "ctag-1",
            "createdDateTime": "2024-01-01T00:00:00Z",
            "lastModifiedDateTime": "not a date",
            "parentReference": { "id": "folder-1", "path": "/drive/root:/docs" },
            "file": { "hashes": { "sha256Hash": "ABC" } }
        }))
        .unwrap();

        let remote = RemoteItem::from(item);

        assert_eq!(remote.content_tag.as_deref(), Some("etag-1"));
        assert_eq!(remote.parent_id.as_deref(), Some("folder-1"));
        assert_eq!(remote.remote_path_hint.as_deref(), Some("/drive/root:/docs"));
        assert_eq!(remote.created_at, Some(1_704_067_200));
        assert_eq!(remote.modified_at, None);
        assert_eq!(remote.sha256.as_deref(), Some("ABC"));
        assert!(!remote.is_folder);
    }

    #[test]
    fn tombstone_without_name_uses_id() {
        let item: DriveItem =
            serde_json::from_value(json!({ "id": "gone", "deleted": {} })).unwrap();

        let remote = RemoteItem::from(item);

        assert_eq!(remote.name, "gone");
        assert!(remote.is_deleted);
    }

    #[test]
    fn auth_classification_survives_conversion() {
        let err = RemoteError::from(DriveError::Api {
            status: StatusCode::UNAUTHORIZED,
            body: "expired".into(),
        });
        assert!(err.is_auth());

        let err = RemoteError::from(DriveError::Api {
            status: StatusCode::NOT_FOUND,
            body: "gone".into(),
        });
        assert!(!err.is_auth());

        let err = RemoteError::from(DriveError::Api {
            status: StatusCode::GONE,
            body: "resyncRequired".into(),
        });
        assert!(matches!(err, RemoteError::CursorExpired(_)));
    }

    #[tokio::test]
    async fn resolves_download_source_from_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/items/item-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "item-1",
                "name": "a.txt",
                "file": { "hashes": { "sha256Hash": "ABC" } },
                "@microsoft.graph.downloadUrl": "https://download.example/a"
            })))
            .mount(&server)
            .await;
        let client = GraphClient::with_base_url(&server.uri()).unwrap();

        let source = client
            .resolve_download_source("token", "item-1")
            .await
            .unwrap();

        assert_eq!(source.url.as_str(), "https://download.example/a");
        assert_eq!(source.sha256.as_deref(), Some("ABC"));
    }
}
