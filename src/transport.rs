//! Abstract remote transport. The engine never talks HTTP itself; hosts
//! implement one of these contracts and the engine drives it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::record::Record;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Server acknowledgement of a Create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAck {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Per-table transport: one implementation per sync table.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// `None` means the server produced no result; the pending entry is
    /// then dropped only if the local record was not touched meanwhile.
    async fn add(&self, item: &Record) -> ApiResult<Option<RemoteAck>>;

    /// Returns whether the record still exists remotely.
    async fn update(&self, id: &Value, changes: &Record, after: &Record) -> ApiResult<bool>;

    async fn remove(&self, id: &Value) -> ApiResult<()>;

    /// Records updated strictly after `since`.
    async fn list(&self, since: Option<&str>) -> ApiResult<Vec<Record>>;

    /// One bulk page starting after `last_id`; `Ok(None)` when the table
    /// has no first-load support.
    async fn first_load(&self, _last_id: Option<Value>) -> ApiResult<Option<Vec<Record>>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushAction {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushItem {
    pub table: String,
    pub action: PushAction,
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushOutcome {
    pub local_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirstLoadBatch {
    pub data: BTreeMap<String, Vec<Record>>,
    pub cursors: BTreeMap<String, Value>,
    pub has_more: bool,
}

/// Batch transport: all sync tables behind three calls.
#[async_trait]
pub trait RemoteBatch: Send + Sync {
    fn sync_tables(&self) -> Vec<String>;

    async fn push(&self, changes: Vec<PushItem>) -> ApiResult<Vec<PushOutcome>>;

    async fn pull(
        &self,
        since: BTreeMap<String, Option<String>>,
    ) -> ApiResult<BTreeMap<String, Vec<Record>>>;

    async fn first_load(
        &self,
        _cursors: BTreeMap<String, Value>,
    ) -> ApiResult<Option<FirstLoadBatch>> {
        Ok(None)
    }
}

/// The configured remote side, in either mode.
#[derive(Clone)]
pub enum Remote {
    PerTable(BTreeMap<String, Arc<dyn RemoteTable>>),
    Batch(Arc<dyn RemoteBatch>),
}

impl Remote {
    pub fn sync_tables(&self) -> Vec<String> {
        match self {
            Remote::PerTable(tables) => tables.keys().cloned().collect(),
            Remote::Batch(batch) => batch.sync_tables(),
        }
    }
}
