//! Upload operations
//!
//! - [`upload_small`] - single PUT for bodies under the small-file threshold
//! - [`create_upload_session`] - starts a resumable session
//! - [`upload_chunk`] - pushes one `Content-Range` chunk to the session URL
//! - [`cancel_session`] - discards a session server-side
//!
//! ## Microsoft Graph API References
//!
//! - [Upload small files](https://learn.microsoft.com/en-us/graph/api/driveitem-put-content)
//! - [Upload large files](https://learn.microsoft.com/en-us/graph/api/driveitem-createuploadsession)

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use onemount_core::ports::{RemoteItem, UploadHandle};
use onemount_core::ItemId;

use crate::client::GraphClient;
use crate::items::{to_remote_item, GraphDriveItem};
use crate::GraphError;

/// Response from creating an upload session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
    expiration_date_time: Option<DateTime<Utc>>,
}

/// `PUT /me/drive/items/{parent}:/{name}:/content` - small-file upload.
pub async fn upload_small(
    client: &GraphClient,
    parent_id: &ItemId,
    name: &str,
    data: &[u8],
) -> Result<RemoteItem, GraphError> {
    let path = format!("/me/drive/items/{parent_id}:/{name}:/content");
    debug!(name, bytes = data.len(), "Uploading small file");

    let item: GraphDriveItem = client
        .send_checked(
            client
                .request(Method::PUT, &path)
                .header("Content-Type", "application/octet-stream")
                .body(data.to_vec()),
        )
        .await?
        .json()
        .await?;

    debug!(id = %item.id, name = %item.name, "Small upload completed");
    to_remote_item(item)
}

/// `POST /me/drive/items/{parent}:/{name}:/createUploadSession`.
///
/// The returned URL accepts `Content-Range` chunk PUTs until the session
/// expires (typically after 15 minutes of inactivity).
pub async fn create_upload_session(
    client: &GraphClient,
    parent_id: &ItemId,
    name: &str,
) -> Result<UploadHandle, GraphError> {
    let path = format!("/me/drive/items/{parent_id}:/{name}:/createUploadSession");
    debug!(name, "Creating upload session");

    let response: UploadSessionResponse = client
        .send_checked(
            client
                .request(Method::POST, &path)
                .header("Content-Type", "application/json")
                .body("{}"),
        )
        .await?
        .json()
        .await?;

    Ok(UploadHandle {
        upload_url: response.upload_url,
        expires_at: response.expiration_date_time,
    })
}

/// PUT one chunk to a session URL.
///
/// Returns `Some(item)` when the server answers 200/201 (final chunk),
/// `None` for an intermediate 202 Accepted.
pub async fn upload_chunk(
    client: &GraphClient,
    upload_url: &str,
    data: &[u8],
    offset: u64,
    total: u64,
) -> Result<Option<RemoteItem>, GraphError> {
    let chunk_len = data.len() as u64;
    let range_end = offset + chunk_len - 1;
    let content_range = format!("bytes {offset}-{range_end}/{total}");
    debug!(range = %content_range, "Uploading chunk");

    let response = client
        .send_checked(
            client
                .request_absolute(Method::PUT, upload_url)
                .header("Content-Length", chunk_len.to_string())
                .header("Content-Range", &content_range)
                .body(data.to_vec()),
        )
        .await?;

    let status = response.status();
    if status == StatusCode::OK || status == StatusCode::CREATED {
        let item: GraphDriveItem = response.json().await?;
        debug!(id = %item.id, "Upload session completed");
        return Ok(Some(to_remote_item(item)?));
    }
    // 202 Accepted: chunk stored, more expected
    Ok(None)
}

/// `DELETE {uploadUrl}` - cancel a resumable session.
///
/// A session the server has already discarded answers 404; that is treated
/// as success.
pub async fn cancel_session(client: &GraphClient, upload_url: &str) -> Result<(), GraphError> {
    match client
        .send_checked(client.request_absolute(Method::DELETE, upload_url))
        .await
    {
        Ok(_) | Err(GraphError::NotFound) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_session_response_deserialization() {
        let json = r#"{
            "uploadUrl": "https://sn3302.up.1drv.com/up/session1",
            "expirationDateTime": "2026-06-15T12:00:00Z"
        }"#;
        let response: UploadSessionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.upload_url, "https://sn3302.up.1drv.com/up/session1");
        assert!(response.expiration_date_time.is_some());
    }

    #[test]
    fn test_upload_session_response_without_expiry() {
        let json = r#"{ "uploadUrl": "https://example.test/u" }"#;
        let response: UploadSessionResponse = serde_json::from_str(json).unwrap();
        assert!(response.expiration_date_time.is_none());
    }

    #[test]
    fn test_content_range_format() {
        // first 10 MiB chunk of a 25 MiB body
        let chunk = 10u64 * 1024 * 1024;
        let total = 25u64 * 1024 * 1024;
        let content_range = format!("bytes {}-{}/{}", 0, chunk - 1, total);
        assert_eq!(content_range, "bytes 0-10485759/26214400");
    }
}
