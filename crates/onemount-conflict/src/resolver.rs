//! Conflict resolution executor
//!
//! Applies a decided [`Outcome`] to the metadata store and content cache:
//!
//! - `TakeRemote`: the cached local body is discarded and the entry becomes
//!   the remote version (a ghost to be re-hydrated on next read)
//! - `KeepLocal`: the dirty body stays and is requeued for upload over the
//!   remote version
//! - `Fork`: the local body survives under a conflict-copy name as a new
//!   item; the original takes the remote version
//!
//! The caller (the delta loop or the offline drainer) owns requeueing the
//! uploads named in the returned [`ResolutionOutcome`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use onemount_cache::ContentCache;
use onemount_core::domain::{Entry, ItemState, TransitionCause};
use onemount_core::ports::RemoteItem;
use onemount_core::ItemId;
use onemount_store::MetadataStore;

use crate::detector::Conflict;
use crate::namer::{conflict_copy_name, ensure_unique};
use crate::strategy::{decide, Outcome, PolicyRules};
use crate::ConflictError;

/// What the resolver did, and what the caller still has to do.
#[derive(Debug)]
pub struct ResolutionOutcome {
    pub outcome: Outcome,
    /// Item whose body must be (re)queued for upload
    pub requeue_upload: Option<ItemId>,
    /// The conflict-copy entry, when the outcome forked
    pub forked: Option<Entry>,
}

/// Applies conflict resolutions against the store and cache.
pub struct ConflictResolver {
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    rules: PolicyRules,
}

impl ConflictResolver {
    pub fn new(store: Arc<MetadataStore>, cache: Arc<ContentCache>, rules: PolicyRules) -> Self {
        Self {
            store,
            cache,
            rules,
        }
    }

    /// Decides via the policy rules and applies the outcome.
    pub async fn resolve(&self, conflict: Conflict) -> Result<ResolutionOutcome, ConflictError> {
        let strategy = self.rules.evaluate(&conflict.policy_path());
        let outcome = decide(&conflict, strategy);
        info!(
            id = %conflict.local.id,
            kind = ?conflict.kind,
            strategy = %strategy,
            outcome = ?outcome,
            "Resolving conflict"
        );
        self.apply(conflict, outcome).await
    }

    /// Applies a specific outcome (tests and manual resolution paths).
    pub async fn apply(
        &self,
        conflict: Conflict,
        outcome: Outcome,
    ) -> Result<ResolutionOutcome, ConflictError> {
        match outcome {
            Outcome::KeepLocal => self.apply_keep_local(conflict).await,
            Outcome::TakeRemote => self.apply_take_remote(conflict).await,
            Outcome::Fork => self.apply_fork(conflict).await,
        }
    }

    /// Local wins: adopt the remote etag as the upload baseline so the next
    /// upload replaces the server version.
    async fn apply_keep_local(
        &self,
        conflict: Conflict,
    ) -> Result<ResolutionOutcome, ConflictError> {
        let id = conflict.local.id.clone();
        let remote_etag = conflict.remote.as_ref().and_then(|r| r.etag.clone());
        self.store
            .update(&id, |entry| {
                entry.etag = remote_etag;
            })
            .await?;

        Ok(ResolutionOutcome {
            outcome: Outcome::KeepLocal,
            requeue_upload: Some(id),
            forked: None,
        })
    }

    /// Remote wins: drop the cached body; the entry becomes the remote
    /// version (or disappears entirely on a remote deletion).
    async fn apply_take_remote(
        &self,
        conflict: Conflict,
    ) -> Result<ResolutionOutcome, ConflictError> {
        let id = conflict.local.id.clone();
        self.cache.delete(&id)?;

        match conflict.remote {
            Some(ref remote) if !remote.is_deleted => {
                if conflict.local.is_directory() {
                    // directories carry no body; refresh fields in place
                    let etag = remote.etag.clone();
                    let mtime = remote.mtime.unwrap_or_else(Utc::now);
                    self.store
                        .update(&id, |entry| {
                            entry.etag = etag;
                            entry.mtime = mtime;
                        })
                        .await?;
                } else {
                    self.replace_with_remote(&conflict.local, remote).await?;
                }
            }
            _ => {
                // remote tombstone: the local entry goes away with it
                self.store
                    .transition(&id, ItemState::Deleted, TransitionCause::RemoteTombstone)
                    .await?;
                self.store.delete(&id).await?;
            }
        }

        Ok(ResolutionOutcome {
            outcome: Outcome::TakeRemote,
            requeue_upload: None,
            forked: None,
        })
    }

    /// Keep both: fork the local body as a new dirty item under a
    /// conflict-copy name, then let the original take the remote version.
    async fn apply_fork(&self, conflict: Conflict) -> Result<ResolutionOutcome, ConflictError> {
        let local = conflict.local.clone();
        let parent_id = local
            .parent_id
            .clone()
            .ok_or_else(|| onemount_core::CoreError::Conflict("fork of root".to_string()))?;

        // pick a free conflict-copy name among the siblings
        let siblings: Vec<String> = self
            .store
            .children(&parent_id)
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect();
        let candidate = conflict_copy_name(&local.name, Utc::now().date_naive());
        let fork_name = ensure_unique(&candidate, &siblings);

        let mut fork = Entry::new_local_file(parent_id, &fork_name)?;
        fork.size = local.size;
        fork.mtime = local.mtime;

        // the fork takes the local body
        let body = self.cache.get(&local.id)?;
        self.cache.insert(&fork.id, &body)?;
        self.store
            .create(&fork, TransitionCause::CreateLocalDirty)
            .await?;
        debug!(original = %local.id, fork = %fork.id, name = %fork_name, "Forked conflict copy");

        // the original takes the remote version
        let take = Conflict {
            remote: conflict.remote.clone(),
            ..conflict
        };
        self.apply_take_remote(take).await?;

        Ok(ResolutionOutcome {
            outcome: Outcome::Fork,
            requeue_upload: Some(fork.id.clone()),
            forked: Some(fork),
        })
    }

    /// Swaps a dirty file entry for a ghost carrying the remote metadata.
    /// The entry keeps its ID, so the inode graph's node mapping survives.
    async fn replace_with_remote(
        &self,
        local: &Entry,
        remote: &RemoteItem,
    ) -> Result<(), ConflictError> {
        self.store
            .transition(
                &local.id,
                ItemState::Deleted,
                TransitionCause::RemoteTombstone,
            )
            .await?;
        self.store.delete(&local.id).await?;

        let parent_id = remote
            .parent_id
            .clone()
            .or_else(|| local.parent_id.clone())
            .ok_or_else(|| onemount_core::CoreError::Conflict("remote item without parent".to_string()))?;
        let ghost = Entry::new_remote(
            remote.id.clone(),
            parent_id,
            remote.name.clone(),
            remote.kind(),
            remote.size,
            remote.hash.clone(),
            remote.etag.clone(),
            remote.mtime.unwrap_or_else(Utc::now),
        );
        self.store.create(&ghost, TransitionCause::CreateRemote).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemount_core::domain::StateController;
    use onemount_core::{ETag, QuickXorHash};
    use onemount_store::DatabasePool;

    struct Fixture {
        store: Arc<MetadataStore>,
        cache: Arc<ContentCache>,
        resolver: ConflictResolver,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(MetadataStore::new(pool, Arc::new(StateController::new())));
        let cache = Arc::new(ContentCache::new(dir.path()).unwrap());
        let resolver = ConflictResolver::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            PolicyRules::default(),
        );
        let root = Entry::root(ItemId::new("root").unwrap());
        store
            .create(&root, TransitionCause::CreateLocalHydrated)
            .await
            .unwrap();
        Fixture {
            store,
            cache,
            resolver,
            _dir: dir,
        }
    }

    async fn dirty_entry(fx: &Fixture, name: &str, body: &[u8]) -> Entry {
        let mut entry = Entry::new_local_file(ItemId::new("root").unwrap(), name).unwrap();
        entry.id = ItemId::new(format!("srv-{name}")).unwrap();
        entry.pending_remote = false;
        entry.size = body.len() as u64;
        entry.etag = Some(ETag::new("\"e1\"").unwrap());
        fx.store
            .create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();
        fx.cache.insert(&entry.id, body).unwrap();
        entry
    }

    fn remote_for(entry: &Entry, etag: &str) -> RemoteItem {
        RemoteItem {
            id: entry.id.clone(),
            name: entry.name.clone(),
            parent_id: entry.parent_id.clone(),
            size: 99,
            etag: Some(ETag::new(etag).unwrap()),
            hash: Some(QuickXorHash::new("remoteHash=").unwrap()),
            mtime: Some(Utc::now()),
            is_directory: false,
            is_deleted: false,
        }
    }

    fn conflict_of(entry: &Entry, remote: Option<RemoteItem>) -> Conflict {
        Conflict {
            kind: crate::ConflictKind::Content,
            local: entry.clone(),
            remote,
            last_change: None,
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_keep_local_adopts_remote_etag_and_requeues() {
        let fx = fixture().await;
        let entry = dirty_entry(&fx, "a.txt", b"local body").await;
        let remote = remote_for(&entry, "\"e2\"");

        let result = fx
            .resolver
            .apply(conflict_of(&entry, Some(remote)), Outcome::KeepLocal)
            .await
            .unwrap();

        assert_eq!(result.requeue_upload, Some(entry.id.clone()));
        let updated = fx.store.get(&entry.id).await.unwrap();
        assert_eq!(updated.state, ItemState::DirtyLocal);
        assert_eq!(updated.etag.unwrap().as_str(), "\"e2\"");
        // the local body survives
        assert_eq!(fx.cache.get(&entry.id).unwrap(), b"local body");
    }

    #[tokio::test]
    async fn test_take_remote_discards_body_and_becomes_ghost() {
        let fx = fixture().await;
        let entry = dirty_entry(&fx, "a.txt", b"local body").await;
        let remote = remote_for(&entry, "\"e2\"");

        fx.resolver
            .apply(conflict_of(&entry, Some(remote)), Outcome::TakeRemote)
            .await
            .unwrap();

        let updated = fx.store.get(&entry.id).await.unwrap();
        assert_eq!(updated.state, ItemState::Ghost);
        assert_eq!(updated.size, 99);
        assert_eq!(updated.etag.unwrap().as_str(), "\"e2\"");
        assert!(!fx.cache.has(&entry.id));
        // still linked under the root
        let root = fx.store.get(&ItemId::new("root").unwrap()).await.unwrap();
        assert!(root.children.contains(&entry.id));
    }

    #[tokio::test]
    async fn test_take_remote_deletion_purges_entry() {
        let fx = fixture().await;
        let entry = dirty_entry(&fx, "gone.txt", b"local body").await;
        let mut conflict = conflict_of(&entry, None);
        conflict.kind = crate::ConflictKind::Delete;

        fx.resolver.apply(conflict, Outcome::TakeRemote).await.unwrap();

        assert!(fx.store.try_get(&entry.id).await.unwrap().is_none());
        assert!(!fx.cache.has(&entry.id));
    }

    #[tokio::test]
    async fn test_fork_keeps_both_versions() {
        let fx = fixture().await;
        let entry = dirty_entry(&fx, "report.docx", b"my edits").await;
        let remote = remote_for(&entry, "\"e2\"");

        let result = fx
            .resolver
            .apply(conflict_of(&entry, Some(remote)), Outcome::Fork)
            .await
            .unwrap();

        // the fork carries the local body under a conflict-copy name
        let fork = result.forked.unwrap();
        assert!(fork.id.is_local());
        assert!(fork.name.contains("conflict copy"));
        assert!(fork.name.ends_with(".docx"));
        assert_eq!(fx.cache.get(&fork.id).unwrap(), b"my edits");
        assert_eq!(result.requeue_upload, Some(fork.id.clone()));

        // the original became the remote ghost
        let original = fx.store.get(&entry.id).await.unwrap();
        assert_eq!(original.state, ItemState::Ghost);
        assert!(!fx.cache.has(&entry.id));

        // both live under the root
        let root = fx.store.get(&ItemId::new("root").unwrap()).await.unwrap();
        assert!(root.children.contains(&entry.id));
        assert!(root.children.contains(&fork.id));
    }

    #[tokio::test]
    async fn test_resolve_uses_policy_rules() {
        let fx = fixture().await;
        let entry = dirty_entry(&fx, "notes.txt", b"newer local").await;
        // local is clearly newer than remote
        let mut remote = remote_for(&entry, "\"e2\"");
        remote.mtime = Some(Utc::now() - chrono::Duration::seconds(600));
        let mut conflict = conflict_of(&entry, Some(remote));
        conflict.local.mtime = Utc::now();

        let result = fx.resolver.resolve(conflict).await.unwrap();
        assert_eq!(result.outcome, Outcome::KeepLocal);
    }
}
