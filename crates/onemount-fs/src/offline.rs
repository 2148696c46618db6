//! Offline mode tracking and drain-on-reconnect
//!
//! While offline, mutating FUSE operations append to the persisted change
//! log (see `onemount-store`'s `OfflineLog`). When connectivity returns, the
//! drainer replays the log in timestamp order, issuing uploads, renames and
//! deletes, clearing each entry only once its replay succeeded. The log is
//! the ground truth, so restarting mid-drain is safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use onemount_core::domain::{ItemState, OfflineChange, OfflineChangeKind, Priority};
use onemount_core::ports::RemoteDrive;
use onemount_core::{CoreError, ItemId};
use onemount_store::{MetadataStore, OfflineLog};

use crate::inode::InodeGraph;
use crate::upload::UploadManager;

/// Shared offline/online flag with a change channel.
pub struct OfflineTracker {
    offline: AtomicBool,
    tx: watch::Sender<bool>,
}

impl OfflineTracker {
    #[must_use]
    pub fn new(start_offline: bool) -> Self {
        let (tx, _) = watch::channel(start_offline);
        Self {
            offline: AtomicBool::new(start_offline),
            tx,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self) {
        if !self.offline.swap(true, Ordering::SeqCst) {
            info!("Connectivity lost, entering offline mode");
            let _ = self.tx.send(true);
        }
    }

    pub fn set_online(&self) {
        if self.offline.swap(false, Ordering::SeqCst) {
            info!("Connectivity restored");
            let _ = self.tx.send(false);
        }
    }

    /// Watch channel: `true` while offline.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Replays the offline change log against the server.
pub struct OfflineDrainer {
    store: Arc<MetadataStore>,
    log: Arc<OfflineLog>,
    graph: Arc<InodeGraph>,
    remote: Arc<dyn RemoteDrive>,
    uploads: UploadManager,
}

impl OfflineDrainer {
    pub fn new(
        store: Arc<MetadataStore>,
        log: Arc<OfflineLog>,
        graph: Arc<InodeGraph>,
        remote: Arc<dyn RemoteDrive>,
        uploads: UploadManager,
    ) -> Self {
        Self {
            store,
            log,
            graph,
            remote,
            uploads,
        }
    }

    /// Drains the log in timestamp order. Returns the number of entries
    /// cleared. A connectivity error aborts the drain; everything not yet
    /// cleared replays on the next reconnect.
    pub async fn drain_on_reconnect(&self) -> Result<usize, CoreError> {
        let changes = self.log.all().await.map_err(CoreError::from)?;
        if changes.is_empty() {
            return Ok(0);
        }
        info!(pending = changes.len(), "Draining offline change log");

        let mut drained = 0usize;
        for (seq, change) in changes {
            match self.apply(&change).await {
                Ok(()) => {
                    self.log.remove(seq).await.map_err(CoreError::from)?;
                    drained += 1;
                }
                Err(e) if e.is_offline() => {
                    warn!(error = %e, "Connectivity lost mid-drain, aborting");
                    return Err(e);
                }
                Err(CoreError::NotFound(_)) => {
                    // both sides gone; nothing left to replay
                    debug!(id = %change.id, "Offline change target vanished, clearing");
                    self.log.remove(seq).await.map_err(CoreError::from)?;
                    drained += 1;
                }
                Err(e) => {
                    warn!(id = %change.id, kind = %change.kind, error = %e, "Offline change replay failed, keeping for next drain");
                }
            }
        }

        info!(drained, "Offline drain complete");
        Ok(drained)
    }

    async fn apply(&self, change: &OfflineChange) -> Result<(), CoreError> {
        match &change.kind {
            OfflineChangeKind::Create | OfflineChangeKind::Modify => {
                let Some(entry) = self
                    .store
                    .try_get(&change.id)
                    .await
                    .map_err(CoreError::from)?
                else {
                    return Ok(()); // deleted again while offline
                };
                if entry.state != ItemState::DirtyLocal {
                    return Ok(()); // already synced by an earlier drain
                }
                self.uploads.queue(&change.id, Priority::High).await?;
                self.uploads.wait(&change.id).await
            }
            OfflineChangeKind::Rename {
                new_parent,
                new_name,
            } => {
                if change.id.is_local() || new_parent.is_local() {
                    // the pending upload will create it under its final
                    // parent and name
                    return Ok(());
                }
                match self
                    .remote
                    .rename(&change.id, new_parent, new_name)
                    .await
                {
                    Ok(item) => {
                        self.graph.rename(&change.id, new_parent, new_name);
                        let etag = item.etag;
                        let _ = self
                            .store
                            .update(&change.id, |entry| entry.etag = etag)
                            .await;
                        Ok(())
                    }
                    Err(CoreError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            OfflineChangeKind::Delete => {
                self.delete_remote(&change.id).await
            }
        }
    }

    async fn delete_remote(&self, id: &ItemId) -> Result<(), CoreError> {
        if id.is_local() {
            // never reached the server; the tombstone is purely local
            if self.store.try_get(id).await.map_err(CoreError::from)?.is_some() {
                self.store.delete(id).await.map_err(CoreError::from)?;
            }
            return Ok(());
        }
        match self.remote.delete(id).await {
            Ok(()) | Err(CoreError::NotFound(_)) => {
                if self.store.try_get(id).await.map_err(CoreError::from)?.is_some() {
                    self.store.delete(id).await.map_err(CoreError::from)?;
                }
                self.graph.remove(id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_transitions_and_notifies() {
        let tracker = OfflineTracker::new(false);
        let rx = tracker.subscribe();
        assert!(!tracker.is_offline());

        tracker.set_offline();
        assert!(tracker.is_offline());
        assert!(*rx.borrow());

        tracker.set_online();
        assert!(!tracker.is_offline());
        assert!(!*rx.borrow());
    }

    #[test]
    fn test_tracker_duplicate_set_is_quiet() {
        let tracker = OfflineTracker::new(true);
        assert!(tracker.is_offline());
        tracker.set_offline();
        assert!(tracker.is_offline());
    }
}
