//! First load: paged bulk ingestion of remote data before the normal
//! pull/push cycle takes over. Each page is applied under a transaction
//! with the state table; every fifth API batch yields to the runtime so
//! a large hydration cannot starve other tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::events::{MutationEvent, MutationKind};
use crate::query::{Condition, QueryPlan, WhereOp};
use crate::record::{self, LOCAL_ID, Record, SERVER_ID};
use crate::storage::{STATE_TABLE, TxMode};
use crate::transport::Remote;

/// Existing-row lookups are chunked at this size.
pub const WRITE_BATCH_SIZE: usize = 200;

const YIELD_EVERY_BATCHES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstLoadProgress {
    pub table: String,
    pub inserted: u64,
    pub updated: u64,
    pub total: u64,
}

pub type ProgressCallback = Arc<dyn Fn(&FirstLoadProgress) + Send + Sync>;

#[derive(Default)]
struct TableStats {
    inserted: u64,
    updated: u64,
    total: u64,
    // `None` until the first batch decided whether the bulk-add fast
    // path applies.
    was_empty: Option<bool>,
}

impl TableStats {
    fn progress(&self, table: &str) -> FirstLoadProgress {
        FirstLoadProgress {
            table: table.to_string(),
            inserted: self.inserted,
            updated: self.updated,
            total: self.total,
        }
    }
}

/// Run the configured first load once. `first_load_done` is set at the
/// end regardless of per-table errors; the first error is surfaced.
pub(crate) async fn run(db: &Arc<DbInner>, progress: Option<ProgressCallback>) -> Result<()> {
    if db.state.first_load_done() {
        return Ok(());
    }
    let result = match &db.remote {
        None => Ok(()),
        Some(Remote::PerTable(tables)) => {
            let mut first_err: Option<Error> = None;
            let mut api_batches = 0usize;
            for (table, transport) in tables {
                if let Err(e) =
                    load_table(db, table, transport.as_ref(), &progress, &mut api_batches).await
                {
                    tracing::warn!(table = %table, error = %e, "first load failed");
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        }
        Some(Remote::Batch(batch)) => load_batched(db, batch.as_ref(), &progress).await,
    };
    db.state.set_first_load_done()?;
    if let Err(e) = &result {
        db.state.set_api_error(Some(e.to_api_error()));
    }
    result
}

async fn load_table(
    db: &Arc<DbInner>,
    table: &str,
    transport: &dyn crate::transport::RemoteTable,
    progress: &Option<ProgressCallback>,
    api_batches: &mut usize,
) -> Result<()> {
    let mut stats = TableStats::default();
    let mut last_id: Option<Value> = None;
    loop {
        let page = match transport.first_load(last_id.clone()).await.map_err(Error::Api)? {
            Some(page) => page,
            // This table has no first-load support; incremental pull
            // covers it.
            None => return Ok(()),
        };
        if page.is_empty() {
            return Ok(());
        }
        let page_last = page.last().and_then(record::remote_id_of).cloned();
        if page_last.is_none() || page_last == last_id {
            // A page ending on the same cursor would loop forever.
            return Err(Error::logic(format!(
                "first load for table {table:?} returned a duplicate page"
            )));
        }
        last_id = page_last;

        stats.total += page.len() as u64;
        ingest_page(db, table, page, &mut stats)?;
        if let Some(callback) = progress {
            callback(&stats.progress(table));
        }

        *api_batches += 1;
        if *api_batches % YIELD_EVERY_BATCHES == 0 {
            tokio::task::yield_now().await;
        }
    }
}

async fn load_batched(
    db: &Arc<DbInner>,
    remote: &dyn crate::transport::RemoteBatch,
    progress: &Option<ProgressCallback>,
) -> Result<()> {
    let mut cursors: BTreeMap<String, Value> = BTreeMap::new();
    let mut stats: BTreeMap<String, TableStats> = BTreeMap::new();
    let mut first_err: Option<Error> = None;
    let mut api_batches = 0usize;
    loop {
        let Some(batch) = remote.first_load(cursors).await.map_err(Error::Api)? else {
            return first_err.map_or(Ok(()), Err);
        };
        let all_empty = batch.data.values().all(Vec::is_empty);
        for (table, page) in batch.data {
            if page.is_empty() {
                continue;
            }
            let table_stats = stats.entry(table.clone()).or_default();
            table_stats.total += page.len() as u64;
            if let Err(e) = ingest_page(db, &table, page, table_stats) {
                tracing::warn!(table = %table, error = %e, "first load batch failed");
                first_err.get_or_insert(e);
                continue;
            }
            if let Some(callback) = progress {
                callback(&table_stats.progress(&table));
            }
        }
        cursors = batch.cursors;

        api_batches += 1;
        if api_batches % YIELD_EVERY_BATCHES == 0 {
            tokio::task::yield_now().await;
        }
        if !batch.has_more || all_empty {
            return first_err.map_or(Ok(()), Err);
        }
    }
}

/// Apply one page inside a transaction over the table and the state
/// table: bulk-add everything when the table started empty, otherwise
/// reconcile against existing rows chunk by chunk.
fn ingest_page(
    db: &Arc<DbInner>,
    table_name: &str,
    page: Vec<Record>,
    stats: &mut TableStats,
) -> Result<()> {
    let table = db.backend.table(table_name)?;
    let tables = [table_name.to_string(), STATE_TABLE.to_string()];
    db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &tables, || {
        let empty = match stats.was_empty {
            Some(b) => b,
            None => {
                let b = table.count()? == 0;
                stats.was_empty = Some(b);
                b
            }
        };

        let mut max_updated: Option<String> = None;
        for r in &page {
            if let Some(ts) = record::updated_at_of(r) {
                if max_updated.as_deref().is_none_or(|m| ts > m) {
                    max_updated = Some(ts.to_string());
                }
            }
        }
        let live: Vec<Record> = page.into_iter().filter(|r| !record::is_tombstone(r)).collect();

        let mut touched: Vec<String> = Vec::new();
        if empty {
            for remote in live {
                let mut fresh = record::remote_to_local(remote);
                let local_id = record::new_local_id();
                fresh.insert(LOCAL_ID.into(), Value::String(local_id.clone()));
                table.insert(fresh)?;
                stats.inserted += 1;
                touched.push(local_id);
            }
        } else {
            for chunk in live.chunks(WRITE_BATCH_SIZE) {
                let ids: Vec<Value> =
                    chunk.iter().filter_map(|r| record::remote_id_of(r).cloned()).collect();
                let lookup = QueryPlan {
                    groups: vec![vec![Condition {
                        field: SERVER_ID.into(),
                        op: WhereOp::AnyOf(ids),
                    }]],
                    options: Default::default(),
                };
                let existing: BTreeMap<String, Record> = table
                    .query(&lookup)?
                    .into_iter()
                    .filter_map(|row| {
                        let key = record::server_id_of(&row)
                            .map(|v| serde_json::to_string(v).unwrap_or_default())?;
                        Some((key, row))
                    })
                    .collect();
                for remote in chunk {
                    let Some(remote_id) = record::remote_id_of(remote) else { continue };
                    let key = serde_json::to_string(remote_id).unwrap_or_default();
                    let incoming = record::remote_to_local(remote.clone());
                    match existing.get(&key).and_then(|row| record::local_id_of(row)) {
                        Some(local_id) => {
                            // In-place merge keyed by the stable local id.
                            table.update(local_id, &incoming)?;
                            stats.updated += 1;
                            touched.push(local_id.to_string());
                        }
                        None => {
                            let mut fresh = incoming;
                            let local_id = record::new_local_id();
                            fresh.insert(LOCAL_ID.into(), Value::String(local_id.clone()));
                            table.insert(fresh)?;
                            stats.inserted += 1;
                            touched.push(local_id);
                        }
                    }
                }
            }
        }

        if let Some(ts) = &max_updated {
            db.state.update_last_pulled(table_name, ts)?;
        }
        if !touched.is_empty() {
            db.emit_after_commit(MutationEvent::new(MutationKind::Pull, table_name, touched));
        }
        Ok(())
    })
}
