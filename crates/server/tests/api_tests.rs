//! Integration tests for the HTTP request adapter.

mod common;

use axum::body::Body;
use axum::http::header::{
    CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LAST_MODIFIED, WWW_AUTHENTICATE,
};
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use common::*;
use quarry_core::ChecksumAlgorithm;
use quarry_server::handlers::ORIGIN_HEADER;
use quarry_signer::ArtifactSigner;
use serde_json::Value;
use tower::ServiceExt;

/// Send one request through the router.
async fn send(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Bytes>,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match body {
        Some(bytes) => {
            builder = builder.header(CONTENT_LENGTH, bytes.len());
            Body::from(bytes)
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn error_code(body: &Bytes) -> String {
    let json: Value = serde_json::from_slice(body).unwrap();
    json["code"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::with_central().await;
    let (status, _, body) = send(&server.router, "GET", "/-/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["sources"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    quarry_server::metrics::register_metrics();
    let server = TestServer::new().await;
    let (status, _, body) = send(&server.router, "GET", "/-/metrics", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("quarry_"));
}

#[tokio::test]
async fn test_metrics_can_be_disabled() {
    let server = TestServer::builder()
        .configure(|c| c.server.metrics_enabled = false)
        .build()
        .await;
    let (status, _, _) = send(&server.router, "GET", "/-/metrics", None, &[]).await;
    // Falls through to the repository handler, which has no such artifact.
    assert_ne!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_get_fetches_and_serves() {
    let server = TestServer::with_central().await;
    let path = unique_jar_path("get");
    let data = seeded_bytes(1, 10_000);
    server.fetcher.serve("central", &path, found(&data));

    let uri = format!("/{path}");
    let (status, headers, body) = send(&server.router, "GET", &uri, None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, data);
    assert_eq!(headers[CONTENT_TYPE], "application/java-archive");
    assert_eq!(headers[CONTENT_LENGTH], "10000");
    assert_eq!(headers[ORIGIN_HEADER], "upstream:central");
    assert!(headers.contains_key(LAST_MODIFIED));
    let etag = format!("\"{}\"", ChecksumAlgorithm::Sha256.digest(&data));
    assert_eq!(headers[ETAG], etag.as_str());

    let (status, _, body) = send(
        &server.router,
        "GET",
        &uri,
        None,
        &[(IF_NONE_MATCH.as_str(), etag.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(body.is_empty());
    assert_eq!(server.fetcher.calls("central", &path), 1);
}

#[tokio::test]
async fn test_get_missing_is_404() {
    let server = TestServer::with_central().await;
    let (status, _, body) = send(
        &server.router,
        "GET",
        "/com/example/none/1.0/none-1.0.pom",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "not_found");
}

#[tokio::test]
async fn test_invalid_path_is_400() {
    let server = TestServer::with_central().await;
    let (status, _, body) =
        send(&server.router, "GET", "/com/%2E%2E/secret", None, &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "invalid_path");
    assert_eq!(server.fetcher.total_calls(), 0);
}

#[tokio::test]
async fn test_head_returns_metadata_only() {
    let server = TestServer::with_central().await;
    let path = unique_jar_path("head");
    let data = seeded_bytes(2, 777);
    server.fetcher.serve("central", &path, found(&data));

    let (status, headers, body) =
        send(&server.router, "HEAD", &format!("/{path}"), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CONTENT_LENGTH], "777");
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_checksum_sidecar_served() {
    let server = TestServer::with_central().await;
    let path = unique_jar_path("sha");
    let data = seeded_bytes(3, 500);
    server.fetcher.serve("central", &path, found(&data));

    let (status, headers, body) =
        send(&server.router, "GET", &format!("/{path}.sha1"), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CONTENT_TYPE], "text/plain");
    assert_eq!(body, ChecksumAlgorithm::Sha1.digest(&data).as_bytes());
}

#[tokio::test]
async fn test_put_publishes_and_signs() {
    let key = ArtifactSigner::generate("local-1");
    let server = TestServer::builder().signer(key).build().await;
    let path = "com/example/app/1.0/app-1.0.pom";
    let data = Bytes::from_static(b"<project><artifactId>app</artifactId></project>");

    let uri = format!("/{path}");
    let auth = publisher_auth();
    let creds = [("authorization", auth.as_str())];
    let (status, headers, _) =
        send(&server.router, "PUT", &uri, Some(data.clone()), &creds).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(headers.contains_key(ETAG));

    let (status, headers, body) = send(&server.router, "GET", &uri, None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, data);
    assert_eq!(headers[CONTENT_TYPE], "application/xml");
    assert_eq!(headers[ORIGIN_HEADER], "published");

    let (status, _, sig) =
        send(&server.router, "GET", &format!("{uri}.sig"), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(sig.starts_with(b"local-1:"));

    let (status, _, body) = send(&server.router, "PUT", &uri, Some(data), &creds).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "conflict");
}

#[tokio::test]
async fn test_put_sidecar_is_accepted_and_ignored() {
    let server = TestServer::new().await;
    let auth = publisher_auth();
    let creds = [("authorization", auth.as_str())];
    let (status, _, _) = send(
        &server.router,
        "PUT",
        "/com/example/app/1.0/app-1.0.pom.md5",
        Some(Bytes::from_static(b"d41d8cd98f00b204e9800998ecf8427e")),
        &creds,
    )
    .await;
    // Opaque sidecars are stored like any artifact.
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, _) = send(
        &server.router,
        "PUT",
        "/com/example/app/1.0/app-1.0.pom.sha1",
        Some(Bytes::from_static(b"da39a3ee5e6b4b0d3255bfef95601890afd80709")),
        &creds,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_put_requires_length_and_respects_limit() {
    let server = TestServer::builder()
        .configure(|c| c.server.max_upload_size = 16)
        .build()
        .await;
    let uri = "/com/example/big/1.0/big-1.0.jar";

    let (status, _, _) = send(&server.router, "PUT", uri, None, &[]).await;
    assert_eq!(status, StatusCode::LENGTH_REQUIRED);

    let (status, _, body) = send(
        &server.router,
        "PUT",
        uri,
        Some(Bytes::from(vec![0u8; 64])),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(&body), "payload_too_large");
}

#[tokio::test]
async fn test_put_without_valid_credentials_is_rejected() {
    let server = TestServer::new().await;
    let uri = "/com/example/app/1.0/app-1.0.jar";
    let data = Bytes::from_static(b"jar bytes");

    let (status, headers, body) = send(&server.router, "PUT", uri, Some(data.clone()), &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "unauthorized");
    assert!(headers[WWW_AUTHENTICATE].to_str().unwrap().starts_with("Basic "));

    let wrong = basic_auth(PUBLISHER, "not-the-password");
    let (status, _, _) = send(
        &server.router,
        "PUT",
        uri,
        Some(data.clone()),
        &[("authorization", wrong.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let stranger = basic_auth("mallory", PUBLISHER_PASSWORD);
    let (status, _, _) = send(
        &server.router,
        "PUT",
        uri,
        Some(data.clone()),
        &[("authorization", stranger.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(
        &server.router,
        "PUT",
        uri,
        Some(data),
        &[("authorization", "Bearer some-token")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(server.engine.show(&uri[1..]).unwrap().is_none());
    assert_eq!(server.engine.stats().counters.publishes, 0);
}

#[tokio::test]
async fn test_unauthenticated_put_cannot_shadow_upstream() {
    let key = ArtifactSigner::generate("local-1");
    let server = TestServer::builder()
        .source(quarry_core::UpstreamSource::new(
            "central",
            "https://repo.example.org/maven2",
        ))
        .signer(key)
        .build()
        .await;
    let path = "org/acme/core/2.0/core-2.0.jar";
    let genuine = seeded_bytes(7, 512);
    server.fetcher.serve("central", path, found(&genuine));

    let uri = format!("/{path}");
    let (status, _, _) = send(
        &server.router,
        "PUT",
        &uri,
        Some(Bytes::from_static(b"evil")),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, headers, body) = send(&server.router, "GET", &uri, None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, genuine);
    assert_eq!(headers[ORIGIN_HEADER], "upstream:central");
}

#[tokio::test]
async fn test_put_over_plain_http_revokes_publisher() {
    let server = TestServer::new().await;
    let uri = "/com/example/app/1.0/app-1.0.jar";
    let auth = publisher_auth();

    let (status, _, body) = send(
        &server.router,
        "PUT",
        uri,
        Some(Bytes::from_static(b"jar bytes")),
        &[("authorization", auth.as_str()), ("x-forwarded-proto", "http")],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "forbidden");
    assert!(!server.engine.state().users().contains(PUBLISHER));

    let (status, _, _) = send(
        &server.router,
        "PUT",
        uri,
        Some(Bytes::from_static(b"jar bytes")),
        &[("authorization", auth.as_str()), ("x-forwarded-proto", "https")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unsupported_method() {
    let server = TestServer::new().await;
    let (status, _, _) = send(
        &server.router,
        "DELETE",
        "/com/example/app/1.0/app-1.0.jar",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}
