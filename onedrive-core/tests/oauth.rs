use onedrive_core::OAuthClient;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[test]
fn token_url_targets_tenant_endpoint() {
    let client = OAuthClient::with_authority("https://login.example", "tenant-1", "client-id", None)
        .expect("client should build");
    let url = client.token_url().expect("url should build");

    assert_eq!(
        url.as_str(),
        "https://login.example/tenant-1/oauth2/v2.0/token"
    );
}

#[tokio::test]
async fn refresh_token_posts_form_data() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/tenant-1/oauth2/v2.0/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .and(body_string_contains("client_id=client-id"))
        .and(body_string_contains("client_secret=secret"))
        .and(body_string_contains("scope=Files.Read.All+offline_access+User.Read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-2",
            "scope": "Files.Read.All"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_authority(
        &server.uri(),
        "tenant-1",
        "client-id",
        Some("secret".to_string()),
    )
    .unwrap();
    let token = client.refresh_token("refresh-1").await.unwrap();

    assert_eq!(token.access_token, "token");
    assert_eq!(token.expires_in, Some(3600));
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn rejected_grant_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/tenant-1/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "AADSTS70008: The refresh token has expired"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_authority(&server.uri(), "tenant-1", "client-id", None)
        .unwrap()
        .with_scopes(["Files.Read"]);
    let err = client
        .refresh_token("stale")
        .await
        .expect_err("expected invalid_grant");

    assert!(err.is_invalid_grant());
}
