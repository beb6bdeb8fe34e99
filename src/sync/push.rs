//! Push: drain the pending-change queue in Create → Update → Remove
//! order, apply acknowledgements, and handle records the server no
//! longer knows about.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::MissingRecordStrategy;
use crate::db::DbInner;
use crate::error::{ApiError, Error, Result};
use crate::events::{MutationEvent, MutationKind};
use crate::record::{self, LOCAL_ID, Record, SERVER_ID, UPDATED_AT};
use crate::state::{ChangeAction, PendingChange};
use crate::storage::{STATE_TABLE, TxMode};
use crate::transport::{PushAction, PushItem, Remote, RemoteAck, RemoteTable};

pub(crate) async fn push_once(db: &Arc<DbInner>) -> Result<()> {
    let Some(remote) = &db.remote else { return Ok(()) };
    let mut entries = db.state.get_state().pending_changes;
    if entries.is_empty() {
        return Ok(());
    }
    // Stable: entries of equal priority keep their insertion order.
    entries.sort_by_key(|c| c.action.priority());

    match remote {
        Remote::PerTable(tables) => {
            let mut first_err: Option<Error> = None;
            for entry in &entries {
                let Some(transport) = tables.get(&entry.table) else {
                    tracing::warn!(table = %entry.table, "pending change for unconfigured table");
                    continue;
                };
                if let Err(e) = push_entry(db, transport.as_ref(), entry).await {
                    tracing::warn!(
                        table = %entry.table,
                        local_id = %entry.local_id,
                        error = %e,
                        "push entry failed"
                    );
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        }
        Remote::Batch(batch) => push_batch(db, batch.as_ref(), entries).await,
    }
}

async fn push_entry(db: &Arc<DbInner>, remote: &dyn RemoteTable, entry: &PendingChange) -> Result<()> {
    match entry.action {
        ChangeAction::Remove => match &entry.server_id {
            // Never pushed; nothing for the server to delete.
            None => db.state.remove_pending_change(&entry.local_id, &entry.table),
            Some(id) => {
                remote.remove(id).await.map_err(Error::Api)?;
                db.state.remove_pending_change(&entry.local_id, &entry.table)
            }
        },
        ChangeAction::Update => {
            if db.state.has_conflicts(&entry.local_id) {
                // Field conflicts wait for user resolution.
                return Ok(());
            }
            let changes = entry.changes.clone().unwrap_or_default();
            match &entry.server_id {
                // The record was never introduced to the server (its
                // Create collapsed to an empty payload); send it whole.
                None => {
                    let ack = remote.add(&changes).await.map_err(Error::Api)?;
                    handle_create_ack(db, entry, ack)
                }
                Some(id) => {
                    let after = entry.after.clone().unwrap_or_default();
                    let exists = remote.update(id, &changes, &after).await.map_err(Error::Api)?;
                    if exists {
                        handle_update_ack(db, entry, &changes)
                    } else {
                        handle_missing_remote(db, entry)
                    }
                }
            }
        }
        ChangeAction::Create => {
            let changes = entry.changes.clone().unwrap_or_default();
            let ack = remote.add(&changes).await.map_err(Error::Api)?;
            handle_create_ack(db, entry, ack)
        }
    }
}

fn handle_update_ack(db: &Arc<DbInner>, entry: &PendingChange, changes: &Record) -> Result<()> {
    if db.state.same_pending_version(&entry.table, &entry.local_id, entry.version) {
        db.state.remove_pending_change(&entry.local_id, &entry.table)
    } else {
        // The record changed again mid-flight; the next push compares
        // against the state we just shipped.
        db.state.set_pending_change_before(&entry.table, &entry.local_id, changes)
    }
}

fn handle_create_ack(
    db: &Arc<DbInner>,
    entry: &PendingChange,
    ack: Option<RemoteAck>,
) -> Result<()> {
    let Some(ack) = ack else {
        // No result from the server: drop only if nothing happened
        // locally in the meantime.
        if db.state.same_pending_version(&entry.table, &entry.local_id, entry.version) {
            db.state.remove_pending_change(&entry.local_id, &entry.table)?;
        }
        return Ok(());
    };

    let table = db.backend.table(&entry.table)?;
    let tables = [entry.table.clone(), STATE_TABLE.to_string()];
    let applied = db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &tables, || {
        let mut server_fields = Record::new();
        server_fields.insert(SERVER_ID.into(), ack.id.clone());
        if let Some(ts) = &ack.updated_at {
            server_fields.insert(UPDATED_AT.into(), Value::String(ts.clone()));
        }
        let updated = table.update(&entry.local_id, &server_fields)?;
        if updated > 0 {
            if db.state.same_pending_version(&entry.table, &entry.local_id, entry.version) {
                db.state.remove_pending_change(&entry.local_id, &entry.table)?;
            } else {
                // Mutated while the add was in flight; keep pushing it
                // as an update under its new server id.
                db.state.update_pending_change(
                    &entry.table,
                    &entry.local_id,
                    ChangeAction::Update,
                    Some(ack.id.clone()),
                )?;
            }
            db.emit_after_commit(MutationEvent::new(
                MutationKind::Pull,
                &entry.table,
                vec![entry.local_id.clone()],
            ));
        } else {
            // Deleted locally between add and ack; tell the server to
            // delete on the next cycle.
            db.state.update_pending_change(
                &entry.table,
                &entry.local_id,
                ChangeAction::Remove,
                Some(ack.id.clone()),
            )?;
        }
        Ok(updated > 0)
    })?;

    if applied {
        if let Some(callback) = &db.options.on_after_remote_add {
            if let Some(item) = table.get(&entry.local_id)? {
                callback(&entry.table, &item);
            }
        }
    }
    Ok(())
}

fn handle_missing_remote(db: &Arc<DbInner>, entry: &PendingChange) -> Result<()> {
    let strategy = db.options.missing_remote_record_during_update_strategy;
    let table = db.backend.table(&entry.table)?;
    let tables = [entry.table.clone(), STATE_TABLE.to_string()];
    tracing::debug!(
        table = %entry.table,
        local_id = %entry.local_id,
        ?strategy,
        "remote record missing during update"
    );

    let mut affected: Option<Record> = None;
    db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &tables, || {
        let existing = table.get(&entry.local_id)?;
        match strategy {
            MissingRecordStrategy::Ignore => {
                db.state.remove_pending_change(&entry.local_id, &entry.table)?;
                affected = existing;
            }
            MissingRecordStrategy::DeleteLocalRecord => {
                table.remove(&entry.local_id)?;
                db.state.remove_pending_change(&entry.local_id, &entry.table)?;
                if existing.is_some() {
                    db.emit_after_commit(MutationEvent::new(
                        MutationKind::Pull,
                        &entry.table,
                        vec![entry.local_id.clone()],
                    ));
                }
                affected = existing;
            }
            MissingRecordStrategy::InsertRemoteRecord => {
                db.state.remove_pending_change(&entry.local_id, &entry.table)?;
                let Some(old) = existing else { return Ok(()) };
                table.remove(&entry.local_id)?;
                // Re-create under a fresh identity so the next push
                // introduces it to the server as new.
                let mut fresh = old;
                fresh.remove(SERVER_ID);
                let new_id = record::new_local_id();
                fresh.insert(LOCAL_ID.into(), Value::String(new_id.clone()));
                fresh.insert(UPDATED_AT.into(), Value::String(record::now_timestamp()));
                table.insert(fresh.clone())?;
                db.state.add_pending_change(crate::state::NewPendingChange {
                    action: ChangeAction::Create,
                    table: entry.table.clone(),
                    local_id: new_id.clone(),
                    server_id: None,
                    changes: Some(record::outgoing_payload(&fresh)),
                    before: None,
                    after: Some(fresh.clone()),
                })?;
                db.emit_after_commit(MutationEvent::new(
                    MutationKind::Add,
                    &entry.table,
                    vec![new_id],
                ));
                affected = Some(fresh);
            }
        }
        Ok(())
    })?;

    if let Some(callback) = &db.options.on_after_missing_remote_record_during_update {
        if let Some(item) = &affected {
            callback(strategy, item);
        }
    }
    Ok(())
}

struct SentItem {
    entry: PendingChange,
    action: PushAction,
}

async fn push_batch(
    db: &Arc<DbInner>,
    remote: &dyn crate::transport::RemoteBatch,
    entries: Vec<PendingChange>,
) -> Result<()> {
    let mut items: Vec<PushItem> = Vec::new();
    let mut sent: BTreeMap<String, SentItem> = BTreeMap::new();

    for entry in entries {
        match entry.action {
            ChangeAction::Remove if entry.server_id.is_none() => {
                db.state.remove_pending_change(&entry.local_id, &entry.table)?;
                continue;
            }
            ChangeAction::Update if db.state.has_conflicts(&entry.local_id) => continue,
            _ => {}
        }
        let action = match entry.action {
            ChangeAction::Create => PushAction::Add,
            // An update that never reached the server ships as an add.
            ChangeAction::Update if entry.server_id.is_none() => PushAction::Add,
            ChangeAction::Update => PushAction::Update,
            ChangeAction::Remove => PushAction::Remove,
        };
        items.push(PushItem {
            table: entry.table.clone(),
            action,
            local_id: entry.local_id.clone(),
            id: entry.server_id.clone(),
            data: match action {
                PushAction::Remove => None,
                _ => Some(entry.changes.clone().unwrap_or_default()),
            },
        });
        sent.insert(entry.local_id.clone(), SentItem { entry, action });
    }
    if items.is_empty() {
        return Ok(());
    }

    let outcomes = remote.push(items).await.map_err(Error::Api)?;
    let mut first_err: Option<Error> = None;
    for outcome in outcomes {
        let Some(item) = sent.get(&outcome.local_id) else { continue };
        if let Some(message) = &outcome.error {
            tracing::warn!(local_id = %outcome.local_id, error = %message, "push outcome error");
            first_err.get_or_insert(Error::Api(ApiError::other(message.clone())));
            continue;
        }
        let result = match item.action {
            PushAction::Add => {
                let ack = outcome
                    .id
                    .clone()
                    .map(|id| RemoteAck { id, updated_at: outcome.updated_at.clone() });
                handle_create_ack(db, &item.entry, ack)
            }
            PushAction::Update => {
                if outcome.success {
                    let changes = item.entry.changes.clone().unwrap_or_default();
                    handle_update_ack(db, &item.entry, &changes)
                } else {
                    // success=false on Update means the record is gone
                    // remotely.
                    handle_missing_remote(db, &item.entry)
                }
            }
            PushAction::Remove => {
                if outcome.success {
                    db.state.remove_pending_change(&item.entry.local_id, &item.entry.table)
                } else {
                    Err(Error::Api(ApiError::other(format!(
                        "remove of {} rejected without error detail",
                        item.entry.local_id
                    ))))
                }
            }
        };
        if let Err(e) = result {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}
