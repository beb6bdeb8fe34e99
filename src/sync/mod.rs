//! The sync engine: first-load, pull, push, and the scheduler that
//! drives them, behind the public [`SyncHandle`].

pub mod first_load;
pub mod pull;
pub mod push;
pub(crate) mod scheduler;

use std::sync::Arc;

use crate::db::DbInner;
use crate::error::Result;
use crate::events::{MutationEvent, Subscription};
use crate::record::Record;
use crate::state::ObservedState;
use crate::storage::{STATE_TABLE, TxMode};

pub use first_load::{FirstLoadProgress, ProgressCallback, WRITE_BATCH_SIZE};

/// Public sync surface of a database.
pub struct SyncHandle {
    pub(crate) db: Arc<DbInner>,
}

impl SyncHandle {
    /// Start or stop the scheduler. Enabling twice does not start two
    /// loops; disabling waits for the running cycle to finish.
    pub async fn enable(&self, on: bool) -> Result<()> {
        scheduler::enable(&self.db, on).await
    }

    /// Run one pull-then-push cycle now. Coalesced with any cycle
    /// already in flight.
    pub async fn sync_now(&self) -> Result<()> {
        scheduler::sync_once(&self.db).await
    }

    /// Bulk-hydrate the store from the remote; a no-op once
    /// `first_load_done` is set.
    pub async fn start_first_load(&self, progress: Option<ProgressCallback>) -> Result<()> {
        first_load::run(&self.db, progress).await
    }

    /// Wire the host's visibility signal: hidden pauses the loop,
    /// visible resumes it.
    pub fn set_visible(&self, visible: bool) {
        scheduler::set_visible(&self.db, visible);
    }

    /// Resolve a recorded field conflict. Keeping local leaves the
    /// pending change queued; otherwise the stored remote values
    /// overwrite the local fields and the pending entry is dropped.
    pub async fn resolve_conflict(&self, local_id: &str, keep_local: bool) -> Result<()> {
        let Some(conflict) = self.db.state.conflict_for(local_id) else {
            return Ok(());
        };
        if keep_local {
            return self.db.state.clear_conflict(local_id);
        }
        let table = self.db.backend.table(&conflict.table)?;
        let tables = [conflict.table.clone(), STATE_TABLE.to_string()];
        let db = &self.db;
        db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &tables, || {
            let mut changes = Record::new();
            for field in &conflict.fields {
                changes.insert(field.key.clone(), field.remote_value.clone());
            }
            table.update(local_id, &changes)?;
            db.state.remove_pending_change(local_id, &conflict.table)?;
            db.state.clear_conflict(local_id)?;
            db.emit_after_commit(crate::events::MutationEvent::new(
                crate::events::MutationKind::Pull,
                &conflict.table,
                vec![local_id.to_string()],
            ));
            Ok(())
        })
    }

    pub fn on_state_change(
        &self,
        listener: impl Fn(&ObservedState) + Send + Sync + 'static,
    ) -> Subscription {
        self.db.state.subscribe(listener)
    }

    pub fn on_mutation(
        &self,
        listener: impl Fn(&MutationEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.db.mutations.subscribe(listener)
    }

    /// Observable snapshot: persisted state plus status, hydration and
    /// classified API error.
    pub fn state(&self) -> ObservedState {
        self.db.state.observed_state()
    }
}
