use onedrive_core::{ApiErrorClass, DriveError, GraphClient};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn get_item_sends_bearer_token_and_parses_facets() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/items/item-1"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "item-1",
            "name": "a.txt",
            "size": 5,
            "eTag": "\"{ABC},1\"",
            "createdDateTime": "2024-01-01T00:00:00Z",
            "lastModifiedDateTime": "2024-01-02T00:00:00Z",
            "parentReference": { "id": "folder-1", "path": "/drive/root:/docs" },
            "file": { "mimeType": "text/plain", "hashes": { "sha256Hash": "ABCD" } },
            "@microsoft.graph.downloadUrl": "https://download.example/a.txt"
        })))
        .mount(&server)
        .await;

    let client = GraphClient::with_base_url(&server.uri()).unwrap();
    let item = client.get_item("test-token", "item-1").await.unwrap();

    assert_eq!(item.name.as_deref(), Some("a.txt"));
    assert_eq!(item.e_tag.as_deref(), Some("\"{ABC},1\""));
    assert!(!item.is_folder());
    assert!(!item.is_root());
    assert_eq!(
        item.parent_reference.unwrap().path.as_deref(),
        Some("/drive/root:/docs")
    );
    assert_eq!(
        item.file.unwrap().hashes.unwrap().sha256_hash.as_deref(),
        Some("ABCD")
    );
    assert_eq!(
        item.download_url.unwrap().as_str(),
        "https://download.example/a.txt"
    );
}

#[tokio::test]
async fn get_download_url_fails_without_download_reference() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/items/folder-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "folder-1",
            "name": "docs",
            "folder": { "childCount": 0 }
        })))
        .mount(&server)
        .await;

    let client = GraphClient::with_base_url(&server.uri()).unwrap();
    let err = client
        .get_download_url("test-token", "folder-1")
        .await
        .expect_err("folders have no content url");

    assert!(matches!(err, DriveError::MissingDownloadUrl(id) if id == "folder-1"));
}

#[tokio::test]
async fn list_children_all_follows_next_link() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/root/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "id": "a", "name": "a.txt", "file": {} }
            ],
            "@odata.nextLink": format!("{}/v1.0/me/drive/root/children/page2?skiptoken=2", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/root/children/page2"))
        .and(query_param("skiptoken", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "id": "b", "name": "docs", "folder": { "childCount": 3 } }
            ]
        })))
        .mount(&server)
        .await;

    let client = GraphClient::with_base_url(&server.uri()).unwrap();
    let items = client.list_children_all("test-token", "root").await.unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, "a");
    assert!(items[1].is_folder());
}

#[tokio::test]
async fn list_children_of_folder_uses_item_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/items/folder-1/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
        .mount(&server)
        .await;

    let client = GraphClient::with_base_url(&server.uri()).unwrap();
    let items = client
        .list_children_all("test-token", "folder-1")
        .await
        .unwrap();

    assert!(items.is_empty());
}

#[tokio::test]
async fn delta_page_returns_delta_link_and_tombstones() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "id": "root-id", "name": "root", "root": {}, "folder": {} },
                { "id": "gone", "deleted": { "state": "deleted" } }
            ],
            "@odata.deltaLink": "https://graph.example/v1.0/me/drive/root/delta?token=next"
        })))
        .mount(&server)
        .await;

    let client = GraphClient::with_base_url(&server.uri()).unwrap();
    let page = client.delta_page("test-token", None).await.unwrap();

    assert!(page.next_link.is_none());
    assert_eq!(
        page.delta_link.as_deref(),
        Some("https://graph.example/v1.0/me/drive/root/delta?token=next")
    );
    assert!(page.value[0].is_root());
    assert!(page.value[1].is_deleted());
    assert!(page.value[1].name.is_none());
}

#[tokio::test]
async fn delta_page_resumes_from_cursor_link() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/root/delta"))
        .and(query_param("token", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [],
            "@odata.deltaLink": "https://graph.example/delta?token=def"
        })))
        .mount(&server)
        .await;

    let client = GraphClient::with_base_url(&server.uri()).unwrap();
    let cursor = format!("{}/v1.0/me/drive/root/delta?token=abc", server.uri());
    let page = client
        .delta_page("test-token", Some(&cursor))
        .await
        .unwrap();

    assert!(page.value.is_empty());
    assert_eq!(
        page.delta_link.as_deref(),
        Some("https://graph.example/delta?token=def")
    );
}

#[tokio::test]
async fn unauthorized_response_is_classified_as_auth() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(401).set_body_string("InvalidAuthenticationToken"))
        .mount(&server)
        .await;

    let client = GraphClient::with_base_url(&server.uri()).unwrap();
    let err = client
        .delta_page("expired", None)
        .await
        .expect_err("expected 401");

    assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
    assert!(err.is_auth());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn throttled_response_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/items/x"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = GraphClient::with_base_url(&server.uri()).unwrap();
    let err = client
        .get_item("test-token", "x")
        .await
        .expect_err("expected 429");

    assert_eq!(err.classification(), Some(ApiErrorClass::RateLimit));
    assert!(err.is_retryable());
}
