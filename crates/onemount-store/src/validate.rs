//! Catalog validation pass
//!
//! Enumerates every persisted entry, unmarshals it, runs the record-level
//! checks plus the cross-record invariants (parent existence, children-list
//! consistency, case-insensitive name uniqueness) and reports invalid rows
//! without mutating anything.

use std::collections::{HashMap, HashSet};

use sqlx::Row;

use onemount_core::domain::{Entry, ItemId};

use crate::{DatabasePool, StoreError};

/// One row that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRow {
    pub id: String,
    pub reason: String,
}

/// Result of a full validation pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Number of rows examined
    pub checked: u64,
    /// Rows that violated an invariant
    pub invalid: Vec<InvalidRow>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Validates every row in `metadata_v2`. Read-only.
pub async fn validate_all(pool: &DatabasePool) -> Result<ValidationReport, StoreError> {
    let rows = sqlx::query("SELECT id, record FROM metadata_v2")
        .fetch_all(pool.pool())
        .await?;

    let mut report = ValidationReport::default();
    let mut entries: HashMap<ItemId, Entry> = HashMap::new();

    for row in &rows {
        report.checked += 1;
        let id: String = row.get("id");
        let record: String = row.get("record");
        match serde_json::from_str::<Entry>(&record) {
            Ok(entry) => {
                if entry.id.as_str() != id {
                    report.invalid.push(InvalidRow {
                        id: id.clone(),
                        reason: format!("row key {id} does not match record id {}", entry.id),
                    });
                }
                if let Err(e) = entry.validate() {
                    report.invalid.push(InvalidRow {
                        id: id.clone(),
                        reason: e.to_string(),
                    });
                }
                entries.insert(entry.id.clone(), entry);
            }
            Err(e) => report.invalid.push(InvalidRow {
                id,
                reason: format!("unmarshal failed: {e}"),
            }),
        }
    }

    // Cross-record invariants.
    for entry in entries.values() {
        if entry.state.is_deleted() {
            continue;
        }
        match &entry.parent_id {
            None => {} // root
            Some(parent_id) => match entries.get(parent_id) {
                None => report.invalid.push(InvalidRow {
                    id: entry.id.to_string(),
                    reason: format!("orphaned: parent {parent_id} missing"),
                }),
                Some(parent) if parent.state.is_deleted() => {
                    report.invalid.push(InvalidRow {
                        id: entry.id.to_string(),
                        reason: format!("parent {parent_id} is deleted"),
                    })
                }
                Some(parent) => {
                    if !parent.children.contains(&entry.id) {
                        report.invalid.push(InvalidRow {
                            id: entry.id.to_string(),
                            reason: format!(
                                "not present in parent {parent_id}'s children list"
                            ),
                        });
                    }
                }
            },
        }
    }

    // Case-insensitive name uniqueness within each directory.
    let mut seen: HashSet<(ItemId, String)> = HashSet::new();
    for entry in entries.values() {
        if entry.state.is_deleted() {
            continue;
        }
        if let Some(parent_id) = &entry.parent_id {
            let key = (parent_id.clone(), entry.name.to_lowercase());
            if !seen.insert(key) {
                report.invalid.push(InvalidRow {
                    id: entry.id.to_string(),
                    reason: format!(
                        "duplicate name {:?} (case-insensitive) under parent {parent_id}",
                        entry.name
                    ),
                });
            }
        }
    }

    if !report.is_clean() {
        tracing::warn!(
            checked = report.checked,
            invalid = report.invalid.len(),
            "Catalog validation found invalid rows"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetadataStore;
    use onemount_core::domain::{StateController, TransitionCause};
    use std::sync::Arc;

    async fn fixture() -> (DatabasePool, MetadataStore) {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = MetadataStore::new(pool.clone(), Arc::new(StateController::new()));
        (pool, store)
    }

    #[tokio::test]
    async fn test_clean_catalog_passes() {
        let (pool, store) = fixture().await;
        let root = Entry::root(ItemId::new("root").unwrap());
        store
            .create(&root, TransitionCause::CreateLocalHydrated)
            .await
            .unwrap();
        let file = Entry::new_local_file(root.id.clone(), "a.txt").unwrap();
        store
            .create(&file, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();

        let report = validate_all(&pool).await.unwrap();
        assert_eq!(report.checked, 2);
        assert!(report.is_clean(), "unexpected: {:?}", report.invalid);
    }

    #[tokio::test]
    async fn test_detects_orphan() {
        let (pool, store) = fixture().await;
        let ghost_parent = ItemId::new("missing-parent").unwrap();
        let mut file = Entry::new_local_file(ghost_parent, "lost.txt").unwrap();
        file.pending_remote = false;
        file.id = ItemId::new("orphan").unwrap();
        store.save(&file).await.unwrap();

        let report = validate_all(&pool).await.unwrap();
        assert!(!report.is_clean());
        assert!(report.invalid[0].reason.contains("orphaned"));
    }

    #[tokio::test]
    async fn test_detects_garbage_row() {
        let (pool, _store) = fixture().await;
        sqlx::query(
            "INSERT INTO metadata_v2 (id, parent_id, name_lower, state, record) \
             VALUES ('junk', NULL, 'junk', 'ghost', 'not json')",
        )
        .execute(pool.pool())
        .await
        .unwrap();

        let report = validate_all(&pool).await.unwrap();
        assert_eq!(report.invalid.len(), 1);
        assert!(report.invalid[0].reason.contains("unmarshal failed"));
    }

    #[tokio::test]
    async fn test_detects_duplicate_names_case_insensitive() {
        let (pool, store) = fixture().await;
        let root = Entry::root(ItemId::new("root").unwrap());
        store
            .create(&root, TransitionCause::CreateLocalHydrated)
            .await
            .unwrap();
        let a = Entry::new_local_file(root.id.clone(), "Name.txt").unwrap();
        store
            .create(&a, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();
        // save() bypasses the store's duplicate checking, simulating drift
        let mut b = Entry::new_local_file(root.id.clone(), "name.TXT").unwrap();
        b.pending_remote = false;
        b.id = ItemId::new("dup").unwrap();
        store.save(&b).await.unwrap();

        let report = validate_all(&pool).await.unwrap();
        assert!(report
            .invalid
            .iter()
            .any(|r| r.reason.contains("duplicate name")));
    }

    #[tokio::test]
    async fn test_validation_does_not_mutate() {
        let (pool, store) = fixture().await;
        sqlx::query(
            "INSERT INTO metadata_v2 (id, parent_id, name_lower, state, record) \
             VALUES ('junk', NULL, 'junk', 'ghost', 'not json')",
        )
        .execute(pool.pool())
        .await
        .unwrap();

        validate_all(&pool).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
