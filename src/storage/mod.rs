//! Storage abstraction: the backend contract the engine drives, the
//! declared-schema model, and the transaction controller.

pub mod memory;
pub mod sql;
pub mod sqlite;

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use serde_json::Value;

use crate::error::{Error, Result, StorageError};
use crate::query::QueryPlan;
use crate::record::{LOCAL_ID, Record, RESERVED_FIELDS};

/// Reserved internal table holding the persisted sync state. Must not be
/// declared by users.
pub const STATE_TABLE: &str = "_sync_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// One storage backend per database name. Tables hand back stable,
/// shareable handles.
pub trait StorageBackend: Send + Sync {
    fn table(&self, name: &str) -> Result<Arc<dyn BackendTable>>;
    /// Open the single physical transaction. Only called at nesting
    /// depth zero; see [`TxController`].
    fn begin(&self, mode: TxMode, tables: &[String]) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// Raw table operations, keyed by `local_id`. No pending-change or
/// event side effects; those live in the table enhancer.
pub trait BackendTable: Send + Sync {
    fn name(&self) -> &str;
    fn get(&self, local_id: &str) -> Result<Option<Record>>;
    /// First record whose `field` equals `value`, by the value-domain
    /// equality of the query algebra.
    fn get_by_field(&self, field: &str, value: &Value) -> Result<Option<Record>>;
    /// Fails on a duplicate `local_id` or duplicate non-null `server_id`.
    fn insert(&self, record: Record) -> Result<()>;
    fn upsert(&self, record: Record) -> Result<()>;
    /// Key-wise overwrite; returns the count actually changed (0 if
    /// absent).
    fn update(&self, local_id: &str, changes: &Record) -> Result<usize>;
    /// Idempotent.
    fn remove(&self, local_id: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn count(&self) -> Result<u64>;
    fn query(&self, plan: &QueryPlan) -> Result<Vec<Record>>;
    fn query_keys(&self, plan: &QueryPlan, field: &str) -> Result<Vec<Value>>;
    fn query_count(&self, plan: &QueryPlan) -> Result<u64>;
    fn query_delete(&self, plan: &QueryPlan) -> Result<usize>;
    fn query_update(&self, plan: &QueryPlan, changes: &Record) -> Result<usize>;
}

/// Column affinity for columnar backends. The in-memory engine ignores
/// kinds entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Number,
    Boolean,
    Json,
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        TableDef { name: name.into(), columns: Vec::new() }
    }

    pub fn column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(ColumnDef { name: name.into(), kind });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseSchema {
    pub tables: Vec<TableDef>,
}

impl DatabaseSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, def: TableDef) -> Self {
        self.tables.push(def);
        self
    }

    /// Reject declarations that collide with reserved names.
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            if table.name == STATE_TABLE {
                return Err(Error::logic(format!("table name {STATE_TABLE:?} is reserved")));
            }
            for col in &table.columns {
                if RESERVED_FIELDS.contains(&col.name.as_str()) {
                    return Err(Error::logic(format!(
                        "column {:?} on table {:?} is reserved",
                        col.name, table.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }
}

#[derive(Default)]
struct TxInner {
    depth: usize,
    failed: bool,
    after_commit: Vec<Box<dyn FnOnce() + Send>>,
    after_rollback: Vec<Box<dyn FnOnce() + Send>>,
}

/// Flat-composes nested transactions: a depth counter with one physical
/// BEGIN/COMMIT at depth zero. Reentrant on the owning thread, mutually
/// exclusive across threads, so sync-affecting write sections are
/// serialized.
pub struct TxController {
    inner: ReentrantMutex<RefCell<TxInner>>,
}

impl Default for TxController {
    fn default() -> Self {
        TxController { inner: ReentrantMutex::new(RefCell::new(TxInner::default())) }
    }
}

impl TxController {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the calling thread is inside a transaction body.
    pub fn in_transaction(&self) -> bool {
        match self.inner.try_lock() {
            Some(guard) => guard.borrow().depth > 0,
            None => false,
        }
    }

    /// Queue `f` to run after the outermost commit, or immediately when
    /// no transaction is open on this thread.
    pub fn after_commit(&self, f: impl FnOnce() + Send + 'static) {
        if let Some(guard) = self.inner.try_lock() {
            let mut inner = guard.borrow_mut();
            if inner.depth > 0 {
                inner.after_commit.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Queue `f` to run if the enclosing transaction rolls back. A no-op
    /// outside a transaction.
    pub fn after_rollback(&self, f: impl FnOnce() + Send + 'static) {
        if let Some(guard) = self.inner.try_lock() {
            let mut inner = guard.borrow_mut();
            if inner.depth > 0 {
                inner.after_rollback.push(Box::new(f));
            }
        }
    }

    pub fn run<T>(
        &self,
        backend: &dyn StorageBackend,
        mode: TxMode,
        tables: &[String],
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let guard = self.inner.lock();
        let root = {
            let mut inner = guard.borrow_mut();
            if inner.depth == 0 {
                inner.failed = false;
                inner.after_commit.clear();
                inner.after_rollback.clear();
            }
            inner.depth += 1;
            inner.depth == 1
        };
        if root {
            if let Err(e) = backend.begin(mode, tables) {
                guard.borrow_mut().depth -= 1;
                return Err(e);
            }
        }

        let result = body();

        let clean = {
            let mut inner = guard.borrow_mut();
            inner.depth -= 1;
            if result.is_err() {
                inner.failed = true;
            }
            !inner.failed
        };
        if !root {
            // Inner level: the outermost scope commits or rolls back.
            return result;
        }

        if clean {
            match backend.commit() {
                Ok(()) => {
                    let hooks = {
                        let mut inner = guard.borrow_mut();
                        inner.after_rollback.clear();
                        std::mem::take(&mut inner.after_commit)
                    };
                    drop(guard);
                    for hook in hooks {
                        hook();
                    }
                    result
                }
                Err(e) => {
                    let _ = backend.rollback();
                    self.unwind(guard);
                    Err(e)
                }
            }
        } else {
            let _ = backend.rollback();
            self.unwind(guard);
            match result {
                Err(e) => Err(e),
                // A nested failure that the outer body swallowed still
                // aborts the whole transaction.
                Ok(_) => Err(Error::Storage(StorageError::TxAborted)),
            }
        }
    }

    fn unwind(&self, guard: parking_lot::ReentrantMutexGuard<'_, RefCell<TxInner>>) {
        let hooks = {
            let mut inner = guard.borrow_mut();
            inner.after_commit.clear();
            std::mem::take(&mut inner.after_rollback)
        };
        drop(guard);
        // Newest snapshot first, so the earliest registered state wins.
        for hook in hooks.into_iter().rev() {
            hook();
        }
    }
}

/// Order table names for lock acquisition and BEGIN bookkeeping.
pub(crate) fn sorted_unique(tables: &[String]) -> Vec<String> {
    let mut names: Vec<String> = tables.to_vec();
    names.sort();
    names.dedup();
    names
}

pub(crate) fn require_local_id(record: &Record) -> Result<&str> {
    record
        .get(LOCAL_ID)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::logic(format!("record is missing {LOCAL_ID:?}")))
}
