//! Integration tests for the registry HTTP API

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use bytes::Bytes;
use registry_manifests::RegistryBuilder;
use serde_json::json;
use sha2::{Digest, Sha256};
use storage::MemoryStorage;
use tower::ServiceExt;

const SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
const LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Helper to create a test registry
fn test_registry() -> axum::Router {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    RegistryBuilder::new(storage.into())
        .bucket("test-registry")
        .build()
}

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .unwrap_or_else(|| panic!("missing {name} header"))
            .to_str()
            .unwrap()
    }

    fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

async fn send(app: &axum::Router, request: Request<Body>) -> Reply {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    Reply {
        status,
        headers,
        body,
    }
}

async fn get(app: &axum::Router, uri: &str, accept: &[&str]) -> Reply {
    let mut request = Request::builder().method("GET").uri(uri);
    for value in accept {
        request = request.header(header::ACCEPT, *value);
    }
    send(app, request.body(Body::empty()).unwrap()).await
}

async fn push_blob(app: &axum::Router, data: &[u8]) -> String {
    let digest = sha256(data);

    let started = send(
        app,
        Request::builder()
            .method("POST")
            .uri("/v2/library/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(started.status, StatusCode::ACCEPTED);
    let upload_url = started.header("location").to_string();

    let completed = send(
        app,
        Request::builder()
            .method("PUT")
            .uri(format!("{upload_url}?digest={digest}"))
            .body(Body::from(data.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(completed.status, StatusCode::CREATED);
    digest
}

async fn push_manifest(
    app: &axum::Router,
    reference: &str,
    content_type: &str,
    body: &[u8],
) -> Reply {
    send(
        app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/library/app/manifests/{reference}"))
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_vec()))
            .unwrap(),
    )
    .await
}

fn schema2(config: &str, layers: &[&str]) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|digest| {
            json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 1,
                "digest": digest,
            })
        })
        .collect();
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": SCHEMA2,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1,
            "digest": config,
        },
        "layers": layers,
    }))
    .unwrap()
}

async fn publish_image(app: &axum::Router, tag: &str, seed: &str) -> (Vec<u8>, String) {
    let config = push_blob(app, format!("{seed} config").as_bytes()).await;
    let layer = push_blob(app, format!("{seed} layer").as_bytes()).await;
    let body = schema2(&config, &[&layer]);

    let reply = push_manifest(app, tag, SCHEMA2, &body).await;
    assert_eq!(reply.status, StatusCode::CREATED);
    let digest = reply.header("docker-content-digest").to_string();
    (body, digest)
}

#[tokio::test]
async fn test_api_version_check() {
    let app = test_registry();

    let reply = get(&app, "/v2/", &[]).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(
        reply.header("docker-distribution-api-version"),
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_blob_upload_and_download() {
    let app = test_registry();

    let data = b"Hello, registry!";
    let digest = push_blob(&app, data).await;

    let reply = get(&app, &format!("/v2/library/app/blobs/{digest}"), &[]).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], data);
    assert_eq!(reply.header("docker-content-digest"), digest);

    let reply = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri(format!("/v2/library/app/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("content-length"), data.len().to_string());
}

#[tokio::test]
async fn test_blob_upload_rejects_wrong_digest() {
    let app = test_registry();

    let wrong = sha256(b"something else");
    let reply = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!(
                "/v2/library/app/blobs/uploads/6c0f2a5e-8a47-4b8e-9d4e-4f1f6f0c9a11?digest={wrong}"
            ))
            .body(Body::from("actual data"))
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["errors"][0]["code"], "DIGEST_INVALID");

    let reply = get(&app, &format!("/v2/library/app/blobs/{wrong}"), &[]).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_upload_and_download() {
    let app = test_registry();
    let (body, digest) = publish_image(&app, "latest", "app").await;
    assert_eq!(digest, sha256(&body));

    let reply = get(&app, "/v2/library/app/manifests/latest", &[SCHEMA2]).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], &body[..]);
    assert_eq!(reply.header("content-type"), SCHEMA2);
    assert_eq!(reply.header("docker-content-digest"), digest);
    assert_eq!(reply.header("content-length"), body.len().to_string());

    let reply = get(&app, &format!("/v2/library/app/manifests/{digest}"), &[]).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], &body[..]);

    let reply = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri("/v2/library/app/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("docker-content-digest"), digest);
    assert_eq!(reply.header("content-length"), body.len().to_string());
}

#[tokio::test]
async fn test_manifest_put_response() {
    let app = test_registry();
    let config = push_blob(&app, b"config").await;
    let body = schema2(&config, &[]);

    let reply = push_manifest(&app, "v1", SCHEMA2, &body).await;
    assert_eq!(reply.status, StatusCode::CREATED);
    let digest = sha256(&body);
    assert_eq!(
        reply.header("location"),
        format!("/v2/library/app/manifests/{digest}")
    );
    assert_eq!(reply.header("docker-distribution-api-version"), "registry/2.0");

    // Pushing the same bytes again is fine.
    let reply = push_manifest(&app, "v1", SCHEMA2, &body).await;
    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.header("docker-content-digest"), digest);
}

#[tokio::test]
async fn test_manifest_with_missing_blob() {
    let app = test_registry();
    let config = push_blob(&app, b"config").await;
    let missing = format!("sha256:{}", "deadbeef".repeat(8));
    let body = schema2(&config, &[&missing]);

    let reply = push_manifest(&app, "latest", SCHEMA2, &body).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    let error = &reply.json()["errors"][0];
    assert_eq!(error["code"], "MANIFEST_BLOB_UNKNOWN");
    assert_eq!(error["detail"]["digest"], missing.as_str());

    let reply = get(
        &app,
        &format!("/v2/library/app/manifests/{}", sha256(&body)),
        &[],
    )
    .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_push_by_digest() {
    let app = test_registry();
    let config = push_blob(&app, b"config").await;
    let body = schema2(&config, &[]);

    let wrong = sha256(b"not the manifest");
    let reply = push_manifest(&app, &wrong, SCHEMA2, &body).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["errors"][0]["code"], "DIGEST_INVALID");

    let digest = sha256(&body);
    let reply = push_manifest(&app, &digest, SCHEMA2, &body).await;
    assert_eq!(reply.status, StatusCode::CREATED);

    let reply = get(&app, "/v2/library/app/tags/list", &[]).await;
    assert_eq!(reply.json()["tags"], json!([]));
}

#[tokio::test]
async fn test_manifest_content_type_is_required() {
    let app = test_registry();
    let config = push_blob(&app, b"config").await;
    let body = schema2(&config, &[]);

    let reply = push_manifest(&app, "latest", "application/json", &body).await;
    assert_eq!(reply.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let reply = push_manifest(&app, "latest", SCHEMA2, b"{not json").await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["errors"][0]["code"], "MANIFEST_INVALID");
}

#[tokio::test]
async fn test_manifest_list_negotiation() {
    let app = test_registry();
    let (amd64_body, amd64) = publish_image(&app, "latest", "amd64").await;
    let (_, arm64) = publish_image(&app, "arm64", "arm64").await;

    let list = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": LIST,
        "manifests": [
            {
                "mediaType": SCHEMA2,
                "size": 1,
                "digest": amd64,
                "platform": { "architecture": "amd64", "os": "linux" },
            },
            {
                "mediaType": SCHEMA2,
                "size": 1,
                "digest": arm64,
                "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" },
            },
        ],
    }))
    .unwrap();
    let reply = push_manifest(&app, "latest", LIST, &list).await;
    assert_eq!(reply.status, StatusCode::CREATED);

    let reply = get(
        &app,
        "/v2/library/app/manifests/latest",
        &[format!("{LIST}, {SCHEMA2}").as_str()],
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("content-type"), LIST);
    assert_eq!(&reply.body[..], &list[..]);

    // Clients that do not know about lists get the image.
    let reply = get(&app, "/v2/library/app/manifests/latest", &[]).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("content-type"), SCHEMA2);
    assert_eq!(&reply.body[..], &amd64_body[..]);

    let reply = get(&app, "/v2/library/app/manifests/latest", &[SCHEMA1]).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    let error = &reply.json()["errors"][0];
    assert_eq!(error["code"], "MANIFEST_UNKNOWN");
    assert_eq!(error["detail"]["accepted"], json!([SCHEMA1]));
}

#[tokio::test]
async fn test_list_tags() {
    let app = test_registry();
    let config = push_blob(&app, b"config").await;
    let body = schema2(&config, &[]);

    for tag in ["v1.1", "v1.0", "latest"] {
        let reply = push_manifest(&app, tag, SCHEMA2, &body).await;
        assert_eq!(reply.status, StatusCode::CREATED);
    }

    let reply = get(&app, "/v2/library/app/tags/list", &[]).await;
    assert_eq!(reply.status, StatusCode::OK);

    let tag_list = reply.json();
    assert_eq!(tag_list["name"], "library/app");
    assert_eq!(tag_list["tags"], json!(["latest", "v1.0", "v1.1"]));
}

#[tokio::test]
async fn test_repositories_are_isolated() {
    let app = test_registry();
    let digest = push_blob(&app, b"private layer").await;

    let reply = get(&app, &format!("/v2/library/other/blobs/{digest}"), &[]).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.json()["errors"][0]["code"], "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_blob_not_found() {
    let app = test_registry();

    let reply = get(
        &app,
        &format!("/v2/library/app/blobs/{}", sha256(b"nonexistent")),
        &[],
    )
    .await;

    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_not_found() {
    let app = test_registry();

    let reply = get(&app, "/v2/library/app/manifests/nonexistent", &[]).await;

    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.json()["errors"][0]["code"], "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn test_invalid_names() {
    let app = test_registry();

    let reply = get(&app, "/v2/library/app/blobs/invalid-digest", &[]).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["errors"][0]["code"], "DIGEST_INVALID");

    let reply = get(&app, "/v2/Library/app/manifests/latest", &[]).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["errors"][0]["code"], "NAME_INVALID");
}

#[tokio::test]
async fn test_oversized_manifest() {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    let app = RegistryBuilder::new(storage.into())
        .bucket("test-registry")
        .max_manifest_size(64)
        .build();

    let reply = push_manifest(&app, "latest", SCHEMA2, &[b' '; 128]).await;
    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(reply.header("content-type").starts_with("application/json"));
    let error = &reply.json()["errors"][0];
    assert_eq!(error["code"], "SIZE_INVALID");
    assert_eq!(error["detail"]["limit"], 64);
}
