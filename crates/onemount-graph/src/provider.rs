//! `RemoteDrive` port implementation
//!
//! Adapts the Graph plumbing onto the provider-agnostic trait the sync core
//! consumes, mapping `GraphError` onto `CoreError` at the boundary.

use std::path::Path;

use async_trait::async_trait;

use onemount_core::ports::{DeltaPage, DriveQuota, RemoteDrive, RemoteItem, UploadHandle};
use onemount_core::{CoreError, DeltaCursor, ItemId};

use crate::client::GraphClient;
use crate::{delta, items, upload};

#[async_trait]
impl RemoteDrive for GraphClient {
    async fn probe(&self) -> Result<(), CoreError> {
        items::probe(self).await.map_err(CoreError::from)
    }

    async fn get_root(&self) -> Result<RemoteItem, CoreError> {
        items::get_root(self).await.map_err(CoreError::from)
    }

    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, CoreError> {
        items::get_item(self, id).await.map_err(CoreError::from)
    }

    async fn list_children(&self, id: &ItemId) -> Result<Vec<RemoteItem>, CoreError> {
        items::list_children(self, id)
            .await
            .map_err(CoreError::from)
    }

    async fn download_to(&self, id: &ItemId, dest: &Path) -> Result<u64, CoreError> {
        items::download_to(self, id, dest)
            .await
            .map_err(CoreError::from)
    }

    async fn upload_small(
        &self,
        parent_id: &ItemId,
        name: &str,
        data: &[u8],
    ) -> Result<RemoteItem, CoreError> {
        upload::upload_small(self, parent_id, name, data)
            .await
            .map_err(CoreError::from)
    }

    async fn create_upload_session(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<UploadHandle, CoreError> {
        upload::create_upload_session(self, parent_id, name)
            .await
            .map_err(CoreError::from)
    }

    async fn upload_chunk(
        &self,
        upload_url: &str,
        data: &[u8],
        offset: u64,
        total: u64,
    ) -> Result<Option<RemoteItem>, CoreError> {
        upload::upload_chunk(self, upload_url, data, offset, total)
            .await
            .map_err(CoreError::from)
    }

    async fn cancel_upload_session(&self, upload_url: &str) -> Result<(), CoreError> {
        upload::cancel_session(self, upload_url)
            .await
            .map_err(CoreError::from)
    }

    async fn mkdir(&self, parent_id: &ItemId, name: &str) -> Result<RemoteItem, CoreError> {
        items::mkdir(self, parent_id, name)
            .await
            .map_err(CoreError::from)
    }

    async fn rename(
        &self,
        id: &ItemId,
        new_parent: &ItemId,
        new_name: &str,
    ) -> Result<RemoteItem, CoreError> {
        items::rename(self, id, new_parent, new_name)
            .await
            .map_err(CoreError::from)
    }

    async fn delete(&self, id: &ItemId) -> Result<(), CoreError> {
        items::delete_item(self, id).await.map_err(CoreError::from)
    }

    async fn delta(&self, cursor: Option<&DeltaCursor>) -> Result<DeltaPage, CoreError> {
        delta::get_delta(self, cursor).await.map_err(CoreError::from)
    }

    async fn quota(&self) -> Result<DriveQuota, CoreError> {
        items::quota(self).await.map_err(CoreError::from)
    }
}
