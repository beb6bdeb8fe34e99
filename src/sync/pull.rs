//! Incremental pull: fetch records updated after the per-table
//! watermark, apply them under a transaction with the state table, and
//! resolve collisions with pending local changes per the configured
//! strategy.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::ConflictStrategy;
use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::events::{MutationEvent, MutationKind};
use crate::query::cmp_values;
use crate::record::{self, LOCAL_ID, Record, SERVER_ID, UPDATED_AT};
use crate::state::{FieldConflict, PendingChange, RecordConflict};
use crate::storage::{STATE_TABLE, TxMode};
use crate::transport::Remote;

pub(crate) async fn pull_once(db: &Arc<DbInner>) -> Result<()> {
    let Some(remote) = &db.remote else { return Ok(()) };
    match remote {
        Remote::PerTable(tables) => {
            let mut first_err: Option<Error> = None;
            for (table, transport) in tables {
                let since = db.state.last_pulled(table);
                match transport.list(since.as_deref()).await {
                    Ok(records) => {
                        if let Err(e) = apply_remote_records(db, table, records) {
                            tracing::warn!(table = %table, error = %e, "pull apply failed");
                            first_err.get_or_insert(e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(table = %table, error = %e, "pull list failed");
                        first_err.get_or_insert(Error::Api(e));
                    }
                }
            }
            first_err.map_or(Ok(()), Err)
        }
        Remote::Batch(batch) => {
            let since: BTreeMap<String, Option<String>> = batch
                .sync_tables()
                .into_iter()
                .map(|t| {
                    let watermark = db.state.last_pulled(&t);
                    (t, watermark)
                })
                .collect();
            let by_table = batch.pull(since).await.map_err(Error::Api)?;
            let mut first_err: Option<Error> = None;
            for (table, records) in by_table {
                if let Err(e) = apply_remote_records(db, &table, records) {
                    tracing::warn!(table = %table, error = %e, "pull apply failed");
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        }
    }
}

/// Apply one table's worth of pulled records. An empty result set does
/// not change the watermark.
pub(crate) fn apply_remote_records(
    db: &Arc<DbInner>,
    table_name: &str,
    records: Vec<Record>,
) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let table = db.backend.table(table_name)?;
    let strategy = db.options.conflict_resolution_strategy;
    let tables = [table_name.to_string(), STATE_TABLE.to_string()];
    db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &tables, || {
        let mut touched: Vec<String> = Vec::new();
        let mut max_updated: Option<String> = None;

        for remote in records {
            let Some(remote_id) = record::remote_id_of(&remote).cloned() else {
                tracing::warn!(table = %table_name, "pulled record without id; skipped");
                continue;
            };
            if let Some(ts) = record::updated_at_of(&remote) {
                if max_updated.as_deref().is_none_or(|m| ts > m) {
                    max_updated = Some(ts.to_string());
                }
            }
            // A pending local Remove for this record wins over whatever
            // the remote says; push will finish the job.
            if db.state.has_pending_remove(table_name, &remote_id) {
                continue;
            }

            let local = table.get_by_field(SERVER_ID, &remote_id)?;
            if record::is_tombstone(&remote) {
                if let Some(row) = local {
                    if let Some(local_id) = record::local_id_of(&row) {
                        let local_id = local_id.to_string();
                        table.remove(&local_id)?;
                        touched.push(local_id);
                    }
                }
                continue;
            }

            let incoming = record::remote_to_local(remote);
            match local {
                None => {
                    let mut fresh = incoming;
                    let local_id = record::new_local_id();
                    fresh.insert(LOCAL_ID.into(), Value::String(local_id.clone()));
                    table.insert(fresh)?;
                    touched.push(local_id);
                }
                Some(existing) => {
                    let Some(local_id) = record::local_id_of(&existing).map(str::to_string)
                    else {
                        continue;
                    };
                    match db.state.pending_for(table_name, &local_id) {
                        None => {
                            // No local edits in flight: remote wins per
                            // field.
                            table.update(&local_id, &incoming)?;
                            touched.push(local_id);
                        }
                        Some(pending) => match strategy {
                            ConflictStrategy::LocalWins => {}
                            ConflictStrategy::RemoteWins => {
                                let mut replacement = incoming;
                                replacement
                                    .insert(LOCAL_ID.into(), Value::String(local_id.clone()));
                                table.upsert(replacement)?;
                                db.state.remove_pending_change(&local_id, table_name)?;
                                touched.push(local_id);
                            }
                            ConflictStrategy::TryShallowMerge => {
                                let conflicts = field_conflicts(&pending, &existing, &incoming);
                                if conflicts.is_empty() {
                                    let changes = unchanged_locally(&pending, &incoming);
                                    if !changes.is_empty() {
                                        table.update(&local_id, &changes)?;
                                    }
                                    db.state.clear_conflict(&local_id)?;
                                    touched.push(local_id);
                                } else {
                                    db.state.set_conflict(
                                        &local_id,
                                        RecordConflict {
                                            table: table_name.to_string(),
                                            fields: conflicts,
                                        },
                                    )?;
                                }
                            }
                        },
                    }
                }
            }
        }

        if let Some(ts) = &max_updated {
            db.state.update_last_pulled(table_name, ts)?;
        }
        if !touched.is_empty() {
            tracing::debug!(table = %table_name, count = touched.len(), "pull applied");
            db.emit_after_commit(MutationEvent::new(MutationKind::Pull, table_name, touched));
        }
        Ok(())
    })
}

/// Fields the pending change never touched; safe to take from the
/// remote.
fn unchanged_locally(pending: &PendingChange, incoming: &Record) -> Record {
    let locally_changed = pending.changes.as_ref();
    incoming
        .iter()
        .filter(|(k, _)| {
            !meaningful(k) || !locally_changed.is_some_and(|c| c.contains_key(k.as_str()))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// A key conflicts when the local pending recorded a change, the remote
/// also diverged from the `before` baseline, and the two sides disagree.
fn field_conflicts(
    pending: &PendingChange,
    existing: &Record,
    incoming: &Record,
) -> Vec<FieldConflict> {
    let Some(changes) = &pending.changes else { return Vec::new() };
    let empty = Record::new();
    let before = pending.before.as_ref().unwrap_or(&empty);
    let mut conflicts = Vec::new();
    for key in changes.keys().filter(|k| meaningful(k)) {
        let Some(remote_value) = incoming.get(key) else { continue };
        let baseline = before.get(key).unwrap_or(&Value::Null);
        let local_value = existing.get(key).unwrap_or(&Value::Null);
        let remote_diverged = cmp_values(baseline, remote_value) != Ordering::Equal;
        let sides_disagree = cmp_values(local_value, remote_value) != Ordering::Equal;
        if remote_diverged && sides_disagree {
            conflicts.push(FieldConflict {
                key: key.clone(),
                local_value: local_value.clone(),
                remote_value: remote_value.clone(),
            });
        }
    }
    conflicts
}

/// Reserved bookkeeping fields never participate in merge decisions.
fn meaningful(key: &str) -> bool {
    key != LOCAL_ID && key != UPDATED_AT && key != SERVER_ID
}
