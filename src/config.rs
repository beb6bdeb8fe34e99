use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::record::Record;

/// How a pull resolves a remote change against a pending local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    #[default]
    TryShallowMerge,
}

/// What to do when the server reports a record targeted by Update no
/// longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingRecordStrategy {
    Ignore,
    DeleteLocalRecord,
    #[default]
    InsertRemoteRecord,
}

pub type AfterRemoteAdd = Arc<dyn Fn(&str, &Record) + Send + Sync>;
pub type AfterMissingRemote = Arc<dyn Fn(MissingRecordStrategy, &Record) + Send + Sync>;

#[derive(Clone)]
pub struct SyncOptions {
    /// Delay between periodic cycles; zero disables periodic scheduling
    /// (mutations and visibility changes still drive syncs).
    pub sync_interval: Duration,
    pub missing_remote_record_during_update_strategy: MissingRecordStrategy,
    pub conflict_resolution_strategy: ConflictStrategy,
    /// Fired after a Create ack has been applied to the local row.
    pub on_after_remote_add: Option<AfterRemoteAdd>,
    /// Fired after a missing-record strategy has been applied.
    pub on_after_missing_remote_record_during_update: Option<AfterMissingRemote>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            sync_interval: Duration::from_secs(30),
            missing_remote_record_during_update_strategy: MissingRecordStrategy::default(),
            conflict_resolution_strategy: ConflictStrategy::default(),
            on_after_remote_add: None,
            on_after_missing_remote_record_during_update: None,
        }
    }
}
