//! Offline-first local datastore with background bidirectional sync.
//!
//! Records live in named tables behind a uniform query interface;
//! mutations on sync tables are queued and reconciled against a remote
//! transport by a visibility-aware, mutation-triggered scheduler.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod query;
pub mod record;
pub mod state;
pub mod storage;
pub mod sync;
pub mod table;
pub mod transport;

pub use config::{ConflictStrategy, MissingRecordStrategy, SyncOptions};
pub use db::{Database, DatabaseConfig, TxScope};
pub use error::{ApiError, ApiErrorKind, Error, Result, StorageError};
pub use events::{MutationEvent, MutationKind, Subscription};
pub use record::Record;
pub use state::{
    ChangeAction, FieldConflict, ObservedState, PendingChange, RecordConflict, SyncState,
    SyncStatus,
};
pub use storage::memory::MemoryBackend;
pub use storage::sqlite::{Migration, SqliteBackend};
pub use storage::{ColumnDef, ColumnKind, DatabaseSchema, StorageBackend, TableDef, TxMode};
pub use sync::{FirstLoadProgress, SyncHandle, WRITE_BATCH_SIZE};
pub use table::{Collection, Table, WhereClause};
pub use transport::{
    FirstLoadBatch, PushAction, PushItem, PushOutcome, Remote, RemoteAck, RemoteBatch, RemoteTable,
};
