//! The `Database` handle: opens a backend, validates the declared
//! configuration, memoizes table handles, scopes transactions, and owns
//! the sync runtime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::SyncOptions;
use crate::error::{Error, Result, StorageError};
use crate::events::{Bus, MutationEvent, MutationKind};
use crate::state::StateManager;
use crate::storage::{STATE_TABLE, StorageBackend, TxController, TxMode};
use crate::sync::SyncHandle;
use crate::sync::scheduler::SyncRuntime;
use crate::table::Table;
use crate::transport::Remote;

#[derive(Default)]
pub struct DatabaseConfig {
    pub remote: Option<Remote>,
    pub options: SyncOptions,
}

pub(crate) struct DbInner {
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) tx: Arc<TxController>,
    pub(crate) state: StateManager,
    pub(crate) mutations: Bus<MutationEvent>,
    pub(crate) tables: Mutex<BTreeMap<String, Table>>,
    pub(crate) remote: Option<Remote>,
    pub(crate) options: SyncOptions,
    pub(crate) sync_tables: Vec<String>,
    pub(crate) runtime: SyncRuntime,
    pub(crate) closed: AtomicBool,
}

impl DbInner {
    /// Emit after the outermost commit, or immediately when no
    /// transaction is open.
    pub(crate) fn emit_after_commit(self: &Arc<Self>, event: MutationEvent) {
        let db = Arc::clone(self);
        self.tx.after_commit(move || db.dispatch_event(&event));
    }

    pub(crate) fn dispatch_event(&self, event: &MutationEvent) {
        tracing::trace!(table = %event.table, kind = ?event.kind, "mutation event");
        self.mutations.emit(event);
        // Local mutations re-trigger the scheduler; pull events do not.
        if event.kind != MutationKind::Pull {
            crate::sync::scheduler::poke(self);
        }
    }
}

/// One storage backend per database; table handles are memoized so
/// references stay stable for the life of the database.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    pub fn open(backend: Arc<dyn StorageBackend>, config: DatabaseConfig) -> Result<Database> {
        let sync_tables = config.remote.as_ref().map(Remote::sync_tables).unwrap_or_default();
        if sync_tables.iter().any(|t| t == STATE_TABLE) {
            return Err(Error::logic(format!("table name {STATE_TABLE:?} is reserved")));
        }

        let tx = Arc::new(TxController::new());
        let state = StateManager::new(Arc::clone(&backend), Arc::clone(&tx))?;
        state.hydrate()?;

        Ok(Database {
            inner: Arc::new(DbInner {
                backend,
                tx,
                state,
                mutations: Bus::default(),
                tables: Mutex::new(BTreeMap::new()),
                remote: config.remote,
                options: config.options,
                sync_tables,
                runtime: SyncRuntime::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn table(&self, name: &str) -> Result<Table> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Storage(StorageError::Closed));
        }
        table_handle(&self.inner, name)
    }

    /// Run `body` in a transaction over `tables`. Nested calls compose
    /// into the outer transaction; any error rolls the whole thing back.
    /// The internal state table is always enrolled so queue and
    /// watermark updates stay atomic with the data they describe.
    pub fn transaction<T>(
        &self,
        mode: TxMode,
        tables: &[&str],
        body: impl FnOnce(&TxScope<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut names: Vec<String> = tables.iter().map(|s| s.to_string()).collect();
        names.push(STATE_TABLE.to_string());
        let scope = TxScope { db: &self.inner };
        self.inner.tx.run(self.inner.backend.as_ref(), mode, &names, || body(&scope))
    }

    pub fn sync(&self) -> SyncHandle {
        SyncHandle { db: Arc::clone(&self.inner) }
    }

    pub fn on_mutation(
        &self,
        listener: impl Fn(&MutationEvent) + Send + Sync + 'static,
    ) -> crate::events::Subscription {
        self.inner.mutations.subscribe(listener)
    }

    /// Stops the scheduler, closes the backend, clears the table memo.
    pub async fn close(&self) -> Result<()> {
        crate::sync::scheduler::enable(&self.inner, false).await?;
        self.inner.backend.close()?;
        self.inner.tables.lock().clear();
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Transaction body handle: table name → table view scoped to the
/// transaction.
pub struct TxScope<'a> {
    db: &'a Arc<DbInner>,
}

impl TxScope<'_> {
    pub fn table(&self, name: &str) -> Result<Table> {
        table_handle(self.db, name)
    }
}

pub(crate) fn table_handle(db: &Arc<DbInner>, name: &str) -> Result<Table> {
    if name == STATE_TABLE {
        return Err(Error::logic(format!("table name {STATE_TABLE:?} is reserved")));
    }
    let mut tables = db.tables.lock();
    if let Some(table) = tables.get(name) {
        return Ok(table.clone());
    }
    let backend = db.backend.table(name)?;
    let table = Table::new(
        Arc::downgrade(db),
        backend,
        name.to_string(),
        db.sync_tables.iter().any(|t| t == name),
    );
    tables.insert(name.to_string(), table.clone());
    Ok(table)
}
