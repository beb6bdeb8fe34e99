//! Persistent synchronization state: the pending-change queue, per-table
//! watermarks and recorded conflicts, held in memory and mirrored into a
//! single row of the internal state table.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, Result};
use crate::events::{Bus, Subscription};
use crate::query::cmp_values;
use crate::record::{self, Record};
use crate::storage::{BackendTable, STATE_TABLE, StorageBackend, TxController, TxMode};

/// Key of the persisted state row.
pub const STATE_KEY: &str = "sync_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Remove,
}

impl ChangeAction {
    /// Push ordering: creates precede updates of the same record and
    /// removes execute last.
    pub fn priority(self) -> u8 {
        match self {
            ChangeAction::Create => 1,
            ChangeAction::Update => 2,
            ChangeAction::Remove => 3,
        }
    }
}

/// A queued intent to transmit one local mutation to the server. At most
/// one entry exists per (table, local_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub action: ChangeAction,
    pub table: String,
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<Value>,
    /// Incremented whenever this entry is touched while still pending;
    /// lets push acks detect "local changed again mid-flight".
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Record>,
}

/// Input to [`StateManager::add_pending_change`]; the manager assigns
/// the version.
#[derive(Debug, Clone)]
pub struct NewPendingChange {
    pub action: ChangeAction,
    pub table: String,
    pub local_id: String,
    pub server_id: Option<Value>,
    pub changes: Option<Record>,
    pub before: Option<Record>,
    pub after: Option<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub key: String,
    pub local_value: Value,
    pub remote_value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordConflict {
    pub table: String,
    pub fields: Vec<FieldConflict>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub first_load_done: bool,
    pub pending_changes: Vec<PendingChange>,
    /// Per-table high watermark: the newest `updated_at` observed.
    pub last_pulled: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conflicts: BTreeMap<String, RecordConflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Disabled,
    Disabling,
    Idle,
    Syncing,
    Error,
}

/// Snapshot handed to observers: persisted state plus runtime fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedState {
    #[serde(flatten)]
    pub state: SyncState,
    pub status: SyncStatus,
    pub hydrated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_error: Option<ApiError>,
}

struct StateInner {
    state: SyncState,
    status: SyncStatus,
    hydrated: bool,
    api_error: Option<ApiError>,
}

/// Owns the in-memory state and a storage handle scoped to the state
/// row. Every persisted mutation runs inside a transaction (joining the
/// caller's when one is open) and observers are notified after the
/// outermost commit.
pub struct StateManager {
    inner: Arc<Mutex<StateInner>>,
    store: Arc<dyn BackendTable>,
    backend: Arc<dyn StorageBackend>,
    tx: Arc<TxController>,
    observers: Arc<Bus<ObservedState>>,
}

fn observed(inner: &StateInner) -> ObservedState {
    ObservedState {
        state: inner.state.clone(),
        status: inner.status,
        hydrated: inner.hydrated,
        api_error: inner.api_error.clone(),
    }
}

impl StateManager {
    pub fn new(backend: Arc<dyn StorageBackend>, tx: Arc<TxController>) -> Result<Self> {
        let store = backend.table(STATE_TABLE)?;
        Ok(StateManager {
            inner: Arc::new(Mutex::new(StateInner {
                state: SyncState::default(),
                status: SyncStatus::Disabled,
                hydrated: false,
                api_error: None,
            })),
            store,
            backend,
            tx,
            observers: Arc::new(Bus::default()),
        })
    }

    /// Load the persisted row if present, otherwise keep defaults. Emits
    /// to observers exactly once.
    pub fn hydrate(&self) -> Result<()> {
        let stored = self.store.get(STATE_KEY)?;
        let snapshot = {
            let mut inner = self.inner.lock();
            if let Some(row) = stored {
                if let Some(raw) = row.get("value").and_then(Value::as_str) {
                    inner.state = serde_json::from_str(raw)?;
                }
            }
            inner.hydrated = true;
            observed(&inner)
        };
        self.observers.emit(&snapshot);
        Ok(())
    }

    pub fn subscribe(&self, listener: impl Fn(&ObservedState) + Send + Sync + 'static) -> Subscription {
        self.observers.subscribe(listener)
    }

    /// Deep clone of the persisted state.
    pub fn get_state(&self) -> SyncState {
        self.inner.lock().state.clone()
    }

    pub fn observed_state(&self) -> ObservedState {
        observed(&self.inner.lock())
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.lock().status
    }

    /// Apply a mutation, persist the state row, and notify observers
    /// after the outermost commit. Rolling back restores the in-memory
    /// state to what it was when the mutation started.
    fn mutate<T>(&self, f: impl FnOnce(&mut SyncState) -> T) -> Result<T> {
        let tables = [STATE_TABLE.to_string()];
        self.tx.run(self.backend.as_ref(), TxMode::ReadWrite, &tables, || {
            let snapshot = self.inner.lock().state.clone();
            let restore = Arc::clone(&self.inner);
            self.tx.after_rollback(move || {
                restore.lock().state = snapshot;
            });

            let out = f(&mut self.inner.lock().state);
            self.persist()?;

            let inner = Arc::clone(&self.inner);
            let observers = Arc::clone(&self.observers);
            self.tx.after_commit(move || {
                let snapshot = observed(&inner.lock());
                observers.emit(&snapshot);
            });
            Ok(out)
        })
    }

    fn persist(&self) -> Result<()> {
        let serialized = serde_json::to_string(&self.inner.lock().state)?;
        let mut row = Record::new();
        row.insert(record::LOCAL_ID.into(), Value::String(STATE_KEY.into()));
        row.insert("value".into(), Value::String(serialized));
        self.store.upsert(row)
    }

    /// Replace the whole state (used by conflict resolution flows that
    /// computed the next state outright).
    pub fn set_state(&self, next: SyncState) -> Result<()> {
        self.mutate(move |state| *state = next)
    }

    /// Queue a local mutation, merging into an existing entry for the
    /// same (table, local_id) when present.
    pub fn add_pending_change(&self, new: NewPendingChange) -> Result<()> {
        self.mutate(move |state| {
            let existing = state
                .pending_changes
                .iter_mut()
                .find(|c| c.table == new.table && c.local_id == new.local_id);
            match existing {
                Some(entry) => {
                    if entry.action == ChangeAction::Remove {
                        // Tombstone wins; drop the incoming mutation.
                        return;
                    }
                    entry.version += 1;
                    if entry.server_id.is_none() {
                        entry.server_id = new.server_id;
                    }
                    if new.action == ChangeAction::Remove {
                        entry.action = ChangeAction::Remove;
                        entry.changes = None;
                        entry.after = None;
                    } else {
                        if let Some(changes) = &new.changes {
                            record::merge_into(
                                entry.changes.get_or_insert_with(Record::new),
                                changes,
                            );
                        }
                        if let Some(after) = &new.after {
                            record::merge_into(entry.after.get_or_insert_with(Record::new), after);
                        }
                        // `before` stays at the pre-first-mutation
                        // snapshot; it is the merge baseline.
                    }
                }
                None => {
                    let appendable = new.action == ChangeAction::Remove
                        || new.changes.as_ref().is_some_and(|c| !record::payload_is_empty(c));
                    if appendable {
                        state.pending_changes.push(PendingChange {
                            action: new.action,
                            table: new.table,
                            local_id: new.local_id,
                            server_id: new.server_id,
                            version: 1,
                            changes: new.changes,
                            before: new.before,
                            after: new.after,
                        });
                    }
                }
            }
        })
    }

    /// True when no local mutation touched the entry since `version` was
    /// snapshotted; push success handlers use this before dropping.
    pub fn same_pending_version(&self, table: &str, local_id: &str, version: u64) -> bool {
        self.inner
            .lock()
            .state
            .pending_changes
            .iter()
            .any(|c| c.table == table && c.local_id == local_id && c.version == version)
    }

    pub fn pending_for(&self, table: &str, local_id: &str) -> Option<PendingChange> {
        self.inner
            .lock()
            .state
            .pending_changes
            .iter()
            .find(|c| c.table == table && c.local_id == local_id)
            .cloned()
    }

    pub fn has_pending_remove(&self, table: &str, server_id: &Value) -> bool {
        self.inner.lock().state.pending_changes.iter().any(|c| {
            c.table == table
                && c.action == ChangeAction::Remove
                && c.server_id
                    .as_ref()
                    .is_some_and(|sid| cmp_values(sid, server_id) == std::cmp::Ordering::Equal)
        })
    }

    pub fn remove_pending_change(&self, local_id: &str, table: &str) -> Result<()> {
        let (local_id, table) = (local_id.to_string(), table.to_string());
        self.mutate(move |state| {
            state.pending_changes.retain(|c| !(c.table == table && c.local_id == local_id));
        })
    }

    /// Rewrite an entry in place (push handlers turning an acked Create
    /// into an Update or Remove).
    pub fn update_pending_change(
        &self,
        table: &str,
        local_id: &str,
        action: ChangeAction,
        server_id: Option<Value>,
    ) -> Result<()> {
        let (table, local_id) = (table.to_string(), local_id.to_string());
        self.mutate(move |state| {
            if let Some(entry) = state
                .pending_changes
                .iter_mut()
                .find(|c| c.table == table && c.local_id == local_id)
            {
                entry.action = action;
                if server_id.is_some() {
                    entry.server_id = server_id;
                }
                if action == ChangeAction::Remove {
                    entry.changes = None;
                    entry.after = None;
                }
            }
        })
    }

    /// Advance the merge baseline to the fields just pushed, so the next
    /// push compares against the now-pushed state.
    pub fn set_pending_change_before(
        &self,
        table: &str,
        local_id: &str,
        before: &Record,
    ) -> Result<()> {
        let (table, local_id, before) = (table.to_string(), local_id.to_string(), before.clone());
        self.mutate(move |state| {
            if let Some(entry) = state
                .pending_changes
                .iter_mut()
                .find(|c| c.table == table && c.local_id == local_id)
            {
                record::merge_into(entry.before.get_or_insert_with(Record::new), &before);
            }
        })
    }

    pub fn has_conflicts(&self, local_id: &str) -> bool {
        self.inner.lock().state.conflicts.contains_key(local_id)
    }

    pub fn conflict_for(&self, local_id: &str) -> Option<RecordConflict> {
        self.inner.lock().state.conflicts.get(local_id).cloned()
    }

    pub fn set_conflict(&self, local_id: &str, conflict: RecordConflict) -> Result<()> {
        let local_id = local_id.to_string();
        self.mutate(move |state| {
            state.conflicts.insert(local_id, conflict);
        })
    }

    pub fn clear_conflict(&self, local_id: &str) -> Result<()> {
        let local_id = local_id.to_string();
        self.mutate(move |state| {
            state.conflicts.remove(&local_id);
        })
    }

    /// Monotonic: the watermark never moves backwards.
    pub fn update_last_pulled(&self, table: &str, timestamp: &str) -> Result<()> {
        let (table, timestamp) = (table.to_string(), timestamp.to_string());
        self.mutate(move |state| {
            let entry = state.last_pulled.entry(table).or_default();
            if timestamp.as_str() > entry.as_str() {
                *entry = timestamp;
            }
        })
    }

    pub fn last_pulled(&self, table: &str) -> Option<String> {
        self.inner.lock().state.last_pulled.get(table).cloned()
    }

    pub fn set_first_load_done(&self) -> Result<()> {
        self.mutate(|state| {
            state.first_load_done = true;
        })
    }

    pub fn first_load_done(&self) -> bool {
        self.inner.lock().state.first_load_done
    }

    /// Runtime-only; not persisted, observers still notified.
    pub fn set_sync_status(&self, status: SyncStatus) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.status = status;
            observed(&inner)
        };
        self.observers.emit(&snapshot);
    }

    pub fn set_api_error(&self, error: Option<ApiError>) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.api_error = error;
            observed(&inner)
        };
        self.observers.emit(&snapshot);
    }
}
