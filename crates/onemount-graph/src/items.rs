//! Item metadata and content operations
//!
//! Covers the Graph endpoints for single items, paged child listings,
//! directory creation, rename/reparent, deletion, content download and the
//! drive quota probe.
//!
//! ## Microsoft Graph API References
//!
//! - [Get DriveItem](https://learn.microsoft.com/en-us/graph/api/driveitem-get)
//! - [List children](https://learn.microsoft.com/en-us/graph/api/driveitem-list-children)
//! - [Download content](https://learn.microsoft.com/en-us/graph/api/driveitem-get-content)

use std::path::Path;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Method;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use onemount_core::ports::{DriveQuota, RemoteItem};
use onemount_core::{ETag, ItemId, QuickXorHash};

use crate::client::GraphClient;
use crate::GraphError;

// ============================================================================
// Graph API response types
// ============================================================================

/// A DriveItem as returned by the Graph API.
///
/// Fields use `Option` because not all are present in every response
/// (deleted items lack file metadata, folders lack hashes).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphDriveItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub size: Option<u64>,
    #[serde(rename = "eTag")]
    pub e_tag: Option<String>,
    pub last_modified_date_time: Option<DateTime<Utc>>,
    pub parent_reference: Option<GraphParentReference>,
    pub file: Option<GraphFileFacet>,
    pub folder: Option<serde_json::Value>,
    pub deleted: Option<serde_json::Value>,
}

/// Parent reference in a DriveItem response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphParentReference {
    pub id: Option<String>,
    #[allow(dead_code)]
    pub path: Option<String>,
}

/// File facet (present if the item is a file).
#[derive(Debug, Deserialize)]
pub(crate) struct GraphFileFacet {
    pub hashes: Option<GraphHashes>,
}

/// Content hashes for a file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphHashes {
    pub quick_xor_hash: Option<String>,
}

/// One page of a children listing.
#[derive(Debug, Deserialize)]
pub(crate) struct GraphChildrenPage {
    #[serde(default)]
    pub value: Vec<GraphDriveItem>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

/// Response from `/me/drive` carrying the quota facet.
#[derive(Debug, Deserialize)]
struct DriveResponse {
    quota: Option<QuotaFacet>,
}

#[derive(Debug, Deserialize)]
struct QuotaFacet {
    total: Option<u64>,
    used: Option<u64>,
    remaining: Option<u64>,
}

// ============================================================================
// DTO conversion
// ============================================================================

/// Converts a Graph DriveItem into the port-level [`RemoteItem`].
pub(crate) fn to_remote_item(item: GraphDriveItem) -> Result<RemoteItem, GraphError> {
    let id = ItemId::new(&item.id).map_err(|e| GraphError::Status {
        status: 200,
        body: format!("unusable item id in response: {e}"),
    })?;
    let parent_id = match item.parent_reference.as_ref().and_then(|p| p.id.clone()) {
        Some(pid) => Some(ItemId::new(pid).map_err(|e| GraphError::Status {
            status: 200,
            body: format!("unusable parent id in response: {e}"),
        })?),
        None => None,
    };
    let hash = item
        .file
        .as_ref()
        .and_then(|f| f.hashes.as_ref())
        .and_then(|h| h.quick_xor_hash.clone())
        .and_then(|h| QuickXorHash::new(h).ok());
    let etag = item.e_tag.and_then(|e| ETag::new(e).ok());

    Ok(RemoteItem {
        id,
        name: item.name,
        parent_id,
        size: item.size.unwrap_or(0),
        etag,
        hash,
        mtime: item.last_modified_date_time,
        is_directory: item.folder.is_some(),
        is_deleted: item.deleted.is_some(),
    })
}

// ============================================================================
// Operations
// ============================================================================

/// `GET /me` - connectivity/auth probe.
pub async fn probe(client: &GraphClient) -> Result<(), GraphError> {
    client
        .send_checked(client.request(Method::GET, "/me"))
        .await?;
    Ok(())
}

/// `GET /me/drive/root` - the drive root item.
pub async fn get_root(client: &GraphClient) -> Result<RemoteItem, GraphError> {
    let item: GraphDriveItem = client
        .send_checked(client.request(Method::GET, "/me/drive/root"))
        .await?
        .json()
        .await?;
    to_remote_item(item)
}

/// `GET /me/drive/items/{id}` - one item's metadata.
pub async fn get_item(client: &GraphClient, id: &ItemId) -> Result<RemoteItem, GraphError> {
    let path = format!("/me/drive/items/{id}");
    let item: GraphDriveItem = client
        .send_checked(client.request(Method::GET, &path))
        .await?
        .json()
        .await?;
    to_remote_item(item)
}

/// `GET /me/drive/items/{id}/children` - all children, following pagination.
pub async fn list_children(
    client: &GraphClient,
    id: &ItemId,
) -> Result<Vec<RemoteItem>, GraphError> {
    let path = format!("/me/drive/items/{id}/children");
    let mut page: GraphChildrenPage = client
        .send_checked(client.request(Method::GET, &path))
        .await?
        .json()
        .await?;

    let mut items = Vec::new();
    loop {
        for raw in page.value.drain(..) {
            items.push(to_remote_item(raw)?);
        }
        let Some(next) = page.next_link.take() else {
            break;
        };
        debug!(url = %next, "Following children nextLink");
        page = client
            .send_checked(client.request_absolute(Method::GET, &next))
            .await?
            .json()
            .await?;
    }
    Ok(items)
}

/// `POST /me/drive/items/{parent}/children` - create a directory.
///
/// Uses `fail` conflict behavior so a duplicate name surfaces as
/// [`GraphError::NameAlreadyExists`] rather than silently renaming.
pub async fn mkdir(
    client: &GraphClient,
    parent_id: &ItemId,
    name: &str,
) -> Result<RemoteItem, GraphError> {
    let path = format!("/me/drive/items/{parent_id}/children");
    let body = serde_json::json!({
        "name": name,
        "folder": {},
        "@microsoft.graph.conflictBehavior": "fail",
    });
    let item: GraphDriveItem = client
        .send_checked(client.request(Method::POST, &path).json(&body))
        .await?
        .json()
        .await?;
    to_remote_item(item)
}

/// `PATCH /me/drive/items/{id}` - rename and/or reparent.
pub async fn rename(
    client: &GraphClient,
    id: &ItemId,
    new_parent: &ItemId,
    new_name: &str,
) -> Result<RemoteItem, GraphError> {
    let path = format!("/me/drive/items/{id}");
    let body = serde_json::json!({
        "name": new_name,
        "parentReference": { "id": new_parent.as_str() },
    });
    let item: GraphDriveItem = client
        .send_checked(client.request(Method::PATCH, &path).json(&body))
        .await?
        .json()
        .await?;
    to_remote_item(item)
}

/// `DELETE /me/drive/items/{id}` - tombstone an item.
pub async fn delete_item(client: &GraphClient, id: &ItemId) -> Result<(), GraphError> {
    let path = format!("/me/drive/items/{id}");
    client
        .send_checked(client.request(Method::DELETE, &path))
        .await?;
    Ok(())
}

/// `GET /me/drive/items/{id}/content` - stream the body into `dest`.
///
/// Returns the number of bytes written. The destination is the cache's
/// partial path; the caller fsyncs and renames into place.
pub async fn download_to(
    client: &GraphClient,
    id: &ItemId,
    dest: &Path,
) -> Result<u64, GraphError> {
    let path = format!("/me/drive/items/{id}/content");
    let response = client
        .send_checked(client.request(Method::GET, &path))
        .await?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    debug!(id = %id, bytes = written, "Downloaded content");
    Ok(written)
}

/// `GET /me/drive` - storage quota.
pub async fn quota(client: &GraphClient) -> Result<DriveQuota, GraphError> {
    let drive: DriveResponse = client
        .send_checked(client.request(Method::GET, "/me/drive"))
        .await?
        .json()
        .await?;
    let quota = drive.quota.unwrap_or(QuotaFacet {
        total: None,
        used: None,
        remaining: None,
    });
    Ok(DriveQuota {
        total: quota.total.unwrap_or(0),
        used: quota.used.unwrap_or(0),
        remaining: quota.remaining.unwrap_or(0),
    })
}
