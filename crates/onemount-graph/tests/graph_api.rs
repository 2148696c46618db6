//! Integration tests for the Graph client against a mock HTTP server.

use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use onemount_core::{DeltaCursor, ItemId};
use onemount_graph::{delta, items, upload, GraphClient, GraphError};

async fn client_for(server: &MockServer) -> GraphClient {
    GraphClient::with_base_url("test-token", server.uri())
}

#[tokio::test]
async fn test_get_root() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/root"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ROOT1",
            "name": "root",
            "size": 0,
            "folder": { "childCount": 2 }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let root = items::get_root(&client).await.unwrap();
    assert_eq!(root.id.as_str(), "ROOT1");
    assert!(root.is_directory);
}

#[tokio::test]
async fn test_list_children_follows_pagination() {
    let server = MockServer::start().await;
    let page2_url = format!("{}/page2", server.uri());

    Mock::given(method("GET"))
        .and(path("/me/drive/items/DIR1/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [ { "id": "A", "name": "a.txt", "size": 1, "file": {} } ],
            "@odata.nextLink": page2_url,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [ { "id": "B", "name": "sub", "folder": {} } ]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let children = items::list_children(&client, &ItemId::new("DIR1").unwrap())
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].id.as_str(), "A");
    assert!(children[1].is_directory);
}

#[tokio::test]
async fn test_delta_passes_cursor_and_extracts_next() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("token", "cur1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "id": "X", "name": "x.txt", "size": 5, "eTag": "\"e2\"", "file": {} }
            ],
            "@odata.deltaLink":
                "https://graph.microsoft.com/v1.0/me/drive/root/delta?token=cur2"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let cursor = DeltaCursor::new("cur1").unwrap();
    let page = delta::get_delta(&client, Some(&cursor)).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.cursor, Some(DeltaCursor::new("cur2").unwrap()));
}

#[tokio::test]
async fn test_delta_cursor_expiry_is_410() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let cursor = DeltaCursor::new("stale").unwrap();
    let err = delta::get_delta(&client, Some(&cursor)).await.unwrap_err();
    assert!(matches!(err, GraphError::CursorExpired));
}

#[tokio::test]
async fn test_throttle_is_retried_with_retry_after() {
    let server = MockServer::start().await;
    // first attempt throttled, second succeeds
    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "me"})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    items::probe(&client).await.unwrap();
}

#[tokio::test]
async fn test_unauthorized_is_typed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = items::probe(&client).await.unwrap_err();
    assert!(matches!(err, GraphError::Unauthorized));
}

#[tokio::test]
async fn test_mkdir_name_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/me/drive/items/DIR1/children"))
        .respond_with(ResponseTemplate::new(409).set_body_string(
            r#"{"error":{"code":"nameAlreadyExists","message":"exists"}}"#,
        ))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = items::mkdir(&client, &ItemId::new("DIR1").unwrap(), "pkg")
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::NameAlreadyExists));
}

#[tokio::test]
async fn test_mkdir_requests_fail_on_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/me/drive/items/DIR1/children"))
        .and(body_string_contains("conflictBehavior"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "NEWDIR",
            "name": "pkg",
            "folder": {}
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let dir = items::mkdir(&client, &ItemId::new("DIR1").unwrap(), "pkg")
        .await
        .unwrap();
    assert_eq!(dir.id.as_str(), "NEWDIR");
    assert!(dir.is_directory);
}

#[tokio::test]
async fn test_upload_small_returns_item() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/me/drive/items/DIR1:/new.txt:/content"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "NEW1",
            "name": "new.txt",
            "size": 9,
            "eTag": "\"e1\"",
            "file": {}
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let item = upload::upload_small(&client, &ItemId::new("DIR1").unwrap(), "new.txt", b"some data")
        .await
        .unwrap();
    assert_eq!(item.id.as_str(), "NEW1");
    assert_eq!(item.size, 9);
}

#[tokio::test]
async fn test_chunked_upload_session_flow() {
    let server = MockServer::start().await;
    let session_url = format!("{}/upload-session/1", server.uri());

    Mock::given(method("POST"))
        .and(path("/me/drive/items/DIR1:/big.bin:/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uploadUrl": session_url,
            "expirationDateTime": "2026-08-02T00:00:00Z"
        })))
        .mount(&server)
        .await;
    // intermediate chunk
    Mock::given(method("PUT"))
        .and(path("/upload-session/1"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "nextExpectedRanges": ["5-9"]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // final chunk
    Mock::given(method("PUT"))
        .and(path("/upload-session/1"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "BIG1",
            "name": "big.bin",
            "size": 10,
            "file": {}
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let handle = upload::create_upload_session(&client, &ItemId::new("DIR1").unwrap(), "big.bin")
        .await
        .unwrap();

    let first = upload::upload_chunk(&client, &handle.upload_url, b"01234", 0, 10)
        .await
        .unwrap();
    assert!(first.is_none());

    let last = upload::upload_chunk(&client, &handle.upload_url, b"56789", 5, 10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.id.as_str(), "BIG1");
}

#[tokio::test]
async fn test_download_to_streams_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"file body bytes".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("F1.partial");
    let client = client_for(&server).await;
    let written = items::download_to(&client, &ItemId::new("F1").unwrap(), &dest)
        .await
        .unwrap();
    assert_eq!(written, 15);
    assert_eq!(std::fs::read(&dest).unwrap(), b"file body bytes");
}

#[tokio::test]
async fn test_quota() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "drive1",
            "quota": { "total": 1000, "used": 250, "remaining": 750 }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let quota = items::quota(&client).await.unwrap();
    assert_eq!(quota.total, 1000);
    assert_eq!(quota.remaining, 750);
}
