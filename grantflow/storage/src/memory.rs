//! In-memory storage backend
//!
//! Always available; backs the test suites and embedded runs. Enforces the
//! same invariants the relational backend gets from its unique constraints.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use grantflow_schemas::{
    CanonicalRecord, CatalogEntry, CatalogTable, DedupKey, Execution, ExecutionStatus,
    ExecutionType,
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{Error, ExecutionFilter, Result, Statistics, Store};

#[derive(Default)]
struct MemoryState {
    executions: HashMap<Uuid, Execution>,
    concessions: Vec<CanonicalRecord>,
    dedup_keys: HashSet<DedupKey>,
    catalogs: HashMap<CatalogTable, BTreeMap<String, CatalogEntry>>,
}

/// In-memory [`Store`] implementation
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        let mut state = self.state.write().await;
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        let mut state = self.state.write().await;
        match state.executions.get_mut(&execution.id) {
            Some(existing) => {
                *existing = execution.clone();
                Ok(())
            }
            None => Err(Error::ExecutionNotFound(execution.id)),
        }
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let state = self.state.read().await;
        Ok(state.executions.get(&id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let state = self.state.read().await;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| filter.execution_type.is_none_or(|t| e.execution_type == t))
            .filter(|e| {
                filter
                    .entity
                    .as_deref()
                    .is_none_or(|entity| e.entity == entity)
            })
            .cloned()
            .collect();

        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            executions.truncate(limit);
        }

        Ok(executions)
    }

    async fn delete_execution(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.executions.get(&id) {
            Some(execution) if execution.status == ExecutionStatus::Running => {
                Err(Error::ExecutionStillRunning(id))
            }
            Some(_) => {
                state.executions.remove(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_active_execution(
        &self,
        entity: &str,
        year: Option<i32>,
    ) -> Result<Option<Execution>> {
        let state = self.state.read().await;
        let found = state
            .executions
            .values()
            .filter(|e| e.status.is_active() && e.entity == entity)
            .filter(|e| year.is_none() || e.year == year)
            .max_by_key(|e| e.started_at)
            .cloned();
        Ok(found)
    }

    async fn last_successful_execution(
        &self,
        execution_type: ExecutionType,
        entity: Option<&str>,
    ) -> Result<Option<Execution>> {
        let state = self.state.read().await;
        let found = state
            .executions
            .values()
            .filter(|e| e.execution_type == execution_type)
            .filter(|e| e.status == ExecutionStatus::Completed)
            .filter(|e| entity.is_none_or(|entity| e.entity == entity))
            .max_by_key(|e| e.finished_at)
            .cloned();
        Ok(found)
    }

    async fn has_completed_execution(
        &self,
        execution_type: ExecutionType,
        entity: &str,
        year: i32,
    ) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.executions.values().any(|e| {
            e.execution_type == execution_type
                && e.entity == entity
                && e.year == Some(year)
                && e.status == ExecutionStatus::Completed
        }))
    }

    async fn reclaim_running_as_interrupted(&self, error_message: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut reclaimed = 0;

        for execution in state.executions.values_mut() {
            if execution.status == ExecutionStatus::Running {
                execution.status = ExecutionStatus::Interrupted;
                execution.finished_at = Some(now);
                execution.error_message = Some(error_message.to_string());
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            debug!(reclaimed, "Reclassified orphaned executions as interrupted");
        }
        Ok(reclaimed)
    }

    async fn prune_terminal_executions(&self, entity: &str, year: Option<i32>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.executions.len();
        state
            .executions
            .retain(|_, e| !(e.entity == entity && e.year == year && e.is_terminal()));
        Ok((before - state.executions.len()) as u64)
    }

    async fn statistics(&self) -> Result<Statistics> {
        let state = self.state.read().await;
        let mut stats = Statistics {
            total_executions: state.executions.len() as u64,
            concession_count: state.concessions.len() as u64,
            ..Default::default()
        };

        for execution in state.executions.values() {
            match execution.execution_type {
                ExecutionType::Seeding => stats.seeding_executions += 1,
                ExecutionType::Sync => stats.sync_executions += 1,
                ExecutionType::SyncCatalogs => stats.catalog_sync_executions += 1,
            }
            match execution.status {
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                _ => {}
            }
            if execution.status.is_active() {
                stats.active += 1;
            }

            if execution.status == ExecutionStatus::Completed {
                let slot = match execution.execution_type {
                    ExecutionType::Seeding => &mut stats.last_successful_seeding,
                    ExecutionType::Sync => &mut stats.last_successful_sync,
                    ExecutionType::SyncCatalogs => &mut stats.last_successful_catalog_sync,
                };
                if execution.finished_at > *slot {
                    *slot = execution.finished_at;
                }
            }
        }

        for (table, entries) in &state.catalogs {
            stats
                .catalog_counts
                .insert(table.as_str().to_string(), entries.len() as u64);
        }

        Ok(stats)
    }

    async fn insert_ignore_concessions(&self, records: &[CanonicalRecord]) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut inserted = 0;

        for record in records {
            let key = record.dedup_key();
            if state.dedup_keys.insert(key) {
                state.concessions.push(record.clone());
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn concession_count(&self) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state.concessions.len() as u64)
    }

    async fn upsert_catalog_entries(
        &self,
        table: CatalogTable,
        entries: &[CatalogEntry],
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let rows = state.catalogs.entry(table).or_default();
        let mut new_codes = 0;

        for entry in entries {
            match rows.get_mut(&entry.code) {
                Some(existing) => {
                    // refresh the description, never remove the code
                    existing.description = entry.description.clone();
                    existing.parent = entry.parent.clone();
                }
                None => {
                    rows.insert(entry.code.clone(), entry.clone());
                    new_codes += 1;
                }
            }
        }

        Ok(new_codes)
    }

    async fn catalog_count(&self, table: CatalogTable) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .catalogs
            .get(&table)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use grantflow_schemas::RegimeTag;

    fn record(source_id: &str, regime: RegimeTag) -> CanonicalRecord {
        CanonicalRecord {
            source_id: source_id.to_string(),
            grant_date: NaiveDate::from_ymd_opt(2024, 5, 15).unwrap(),
            regime,
            beneficiary: "ACME SL".to_string(),
            call_reference: None,
            amount: 1000.0,
            instrument: None,
        }
    }

    #[tokio::test]
    async fn duplicate_key_is_ignored() {
        let store = MemoryStore::new();

        let first = store
            .insert_ignore_concessions(&[record("123", RegimeTag::Ordinary)])
            .await
            .unwrap();
        let second = store
            .insert_ignore_concessions(&[record("123", RegimeTag::Ordinary)])
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(store.concession_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_grant_under_two_regimes_yields_two_rows() {
        let store = MemoryStore::new();

        let inserted = store
            .insert_ignore_concessions(&[
                record("123", RegimeTag::Ordinary),
                record("123", RegimeTag::Minimis),
            ])
            .await
            .unwrap();

        assert_eq!(inserted, 2);
        assert_eq!(store.concession_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn catalog_upsert_refreshes_but_never_removes() {
        let store = MemoryStore::new();
        let table = CatalogTable::Instruments;

        let first = store
            .upsert_catalog_entries(
                table,
                &[
                    CatalogEntry::new("SUB", "Subsidy"),
                    CatalogEntry::new("LOAN", "Loan"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(first, 2);

        // refreshed description, shrunk upstream set: count must not go down
        let second = store
            .upsert_catalog_entries(table, &[CatalogEntry::new("SUB", "Direct subsidy")])
            .await
            .unwrap();
        assert_eq!(second, 0);
        assert_eq!(store.catalog_count(table).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reclaim_marks_running_as_interrupted() {
        let store = MemoryStore::new();

        let mut running = Execution::new(ExecutionType::Seeding, "concessions", Some(2024));
        running.status = ExecutionStatus::Running;
        store.insert_execution(&running).await.unwrap();

        let mut done = Execution::new(ExecutionType::Seeding, "concessions", Some(2023));
        done.status = ExecutionStatus::Completed;
        store.insert_execution(&done).await.unwrap();

        let reclaimed = store
            .reclaim_running_as_interrupted("service restarted")
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let reloaded = store.get_execution(running.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Interrupted);
        assert!(reloaded.finished_at.is_some());
        assert_eq!(reloaded.error_message.as_deref(), Some("service restarted"));
    }

    #[tokio::test]
    async fn atemporal_entity_matches_any_year() {
        let store = MemoryStore::new();

        let mut catalog_sync = Execution::new(ExecutionType::SyncCatalogs, "catalogs", None);
        catalog_sync.status = ExecutionStatus::Running;
        store.insert_execution(&catalog_sync).await.unwrap();

        let blocking = store.find_active_execution("catalogs", None).await.unwrap();
        assert!(blocking.is_some());

        let unrelated = store
            .find_active_execution("concessions", Some(2024))
            .await
            .unwrap();
        assert!(unrelated.is_none());
    }

    #[tokio::test]
    async fn delete_refuses_running_execution() {
        let store = MemoryStore::new();

        let mut running = Execution::new(ExecutionType::Seeding, "concessions", Some(2024));
        running.status = ExecutionStatus::Running;
        store.insert_execution(&running).await.unwrap();

        let result = store.delete_execution(running.id).await;
        assert!(matches!(result, Err(Error::ExecutionStillRunning(_))));
        assert!(store.get_execution(running.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prune_keeps_active_executions() {
        let store = MemoryStore::new();

        let mut old = Execution::new(ExecutionType::Seeding, "concessions", Some(2024));
        old.status = ExecutionStatus::Failed;
        store.insert_execution(&old).await.unwrap();

        let mut active = Execution::new(ExecutionType::Seeding, "concessions", Some(2024));
        active.status = ExecutionStatus::Running;
        store.insert_execution(&active).await.unwrap();

        let pruned = store
            .prune_terminal_executions("concessions", Some(2024))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_execution(active.id).await.unwrap().is_some());
        assert!(store.get_execution(old.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn statistics_aggregates_by_type_and_status() {
        let store = MemoryStore::new();

        let mut completed = Execution::new(ExecutionType::Seeding, "concessions", Some(2024));
        completed.status = ExecutionStatus::Completed;
        completed.finished_at = Some(Utc::now());
        store.insert_execution(&completed).await.unwrap();

        let mut failed = Execution::new(ExecutionType::Sync, "concessions", Some(2024));
        failed.status = ExecutionStatus::Failed;
        store.insert_execution(&failed).await.unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.seeding_executions, 1);
        assert_eq!(stats.sync_executions, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert!(stats.last_successful_seeding.is_some());
        assert!(stats.last_successful_sync.is_none());
    }
}
