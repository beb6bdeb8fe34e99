use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// A record is an open field map in a named table. Reserved attributes
/// below; everything else is user-defined.
pub type Record = Map<String, Value>;

/// Client-assigned stable primary key, unique within a table.
pub const LOCAL_ID: &str = "local_id";
/// Server-assigned identifier, present once remotely acknowledged.
pub const SERVER_ID: &str = "server_id";
/// ISO-8601 timestamp; server-stamped on its writes, locally stamped
/// before enqueue.
pub const UPDATED_AT: &str = "updated_at";
/// Tombstone flag on remote records.
pub const DELETED: &str = "deleted";
/// Identifier attribute on records as the remote transport ships them.
pub const REMOTE_ID: &str = "id";

pub const RESERVED_FIELDS: [&str; 4] = [LOCAL_ID, SERVER_ID, UPDATED_AT, DELETED];

pub fn new_local_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn local_id_of(record: &Record) -> Option<&str> {
    record.get(LOCAL_ID).and_then(Value::as_str)
}

pub fn server_id_of(record: &Record) -> Option<&Value> {
    record.get(SERVER_ID).filter(|v| !v.is_null())
}

pub fn remote_id_of(record: &Record) -> Option<&Value> {
    record.get(REMOTE_ID).filter(|v| !v.is_null())
}

pub fn updated_at_of(record: &Record) -> Option<&str> {
    record.get(UPDATED_AT).and_then(Value::as_str)
}

pub fn is_tombstone(record: &Record) -> bool {
    record.get(DELETED).and_then(Value::as_bool).unwrap_or(false)
}

/// Assign a fresh `local_id` if the record does not carry one yet.
/// Returns the effective id.
pub fn ensure_local_id(record: &mut Record) -> String {
    match local_id_of(record) {
        Some(id) => id.to_string(),
        None => {
            let id = new_local_id();
            record.insert(LOCAL_ID.into(), Value::String(id.clone()));
            id
        }
    }
}

/// The payload shipped to the remote: everything except `local_id` and
/// `server_id` (the server assigns its own id).
pub fn outgoing_payload(record: &Record) -> Record {
    record
        .iter()
        .filter(|(k, _)| k.as_str() != LOCAL_ID && k.as_str() != SERVER_ID)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// An outgoing payload counts as empty when nothing but the local-only
/// fields `local_id` and `updated_at` remain.
pub fn payload_is_empty(changes: &Record) -> bool {
    !changes
        .keys()
        .any(|k| k.as_str() != LOCAL_ID && k.as_str() != UPDATED_AT)
}

/// Key-wise overwrite of `changes` into `target`.
pub fn merge_into(target: &mut Record, changes: &Record) {
    for (k, v) in changes {
        target.insert(k.clone(), v.clone());
    }
}

/// Convert a record as the remote ships it into its local shape: the
/// transport `id` becomes `server_id` and the tombstone flag is
/// stripped.
pub fn remote_to_local(mut remote: Record) -> Record {
    if let Some(id) = remote.remove(REMOTE_ID) {
        remote.insert(SERVER_ID.into(), id);
    }
    remote.remove(DELETED);
    remote
}
