//! Reference in-memory backend: each table is a `local_id` → record
//! map. Query semantics come straight from the `query` module, so this
//! backend doubles as the executable specification for the operators.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::{Error, Result, StorageError};
use crate::query::{self, QueryPlan, cmp_values};
use crate::record::{Record, SERVER_ID, server_id_of};
use crate::storage::{
    BackendTable, StorageBackend, TxMode, require_local_id, sorted_unique,
};

pub struct MemoryBackend {
    tables: RwLock<BTreeMap<String, Arc<MemTable>>>,
    // Snapshots of the tables enrolled in the open transaction, taken in
    // name order.
    tx: Mutex<Vec<(Arc<MemTable>, BTreeMap<String, Record>)>>,
    closed: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend {
            tables: RwLock::new(BTreeMap::new()),
            tx: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn open_table(&self, name: &str) -> Arc<MemTable> {
        if let Some(t) = self.tables.read().get(name) {
            return Arc::clone(t);
        }
        let mut tables = self.tables.write();
        Arc::clone(tables.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemTable { name: name.to_string(), rows: Mutex::new(BTreeMap::new()) })
        }))
    }
}

impl StorageBackend for MemoryBackend {
    fn table(&self, name: &str) -> Result<Arc<dyn BackendTable>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Storage(StorageError::Closed));
        }
        Ok(self.open_table(name))
    }

    fn begin(&self, mode: TxMode, tables: &[String]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Storage(StorageError::Closed));
        }
        if mode == TxMode::ReadOnly {
            return Ok(());
        }
        let mut snapshots = self.tx.lock();
        if !snapshots.is_empty() {
            return Err(Error::Storage(StorageError::TxAborted));
        }
        for name in sorted_unique(tables) {
            let table = self.open_table(&name);
            let rows = table.rows.lock().clone();
            snapshots.push((table, rows));
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.tx.lock().clear();
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        for (table, rows) in self.tx.lock().drain(..) {
            *table.rows.lock() = rows;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().clear();
        self.tables.write().clear();
        Ok(())
    }
}

pub struct MemTable {
    name: String,
    rows: Mutex<BTreeMap<String, Record>>,
}

impl MemTable {
    fn check_server_id_unique(
        &self,
        rows: &BTreeMap<String, Record>,
        record: &Record,
        local_id: &str,
    ) -> Result<()> {
        let Some(sid) = server_id_of(record) else { return Ok(()) };
        let clash = rows.iter().any(|(id, row)| {
            id != local_id
                && server_id_of(row)
                    .is_some_and(|other| cmp_values(other, sid) == std::cmp::Ordering::Equal)
        });
        if clash {
            return Err(Error::Storage(StorageError::Constraint(format!(
                "duplicate {SERVER_ID} {sid} in table {:?}",
                self.name
            ))));
        }
        Ok(())
    }

    fn matching_ids(&self, plan: &QueryPlan) -> Vec<String> {
        let rows: Vec<Record> = self.rows.lock().values().cloned().collect();
        query::execute_plan(rows, plan)
            .iter()
            .filter_map(crate::record::local_id_of)
            .map(str::to_string)
            .collect()
    }
}

impl BackendTable for MemTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, local_id: &str) -> Result<Option<Record>> {
        Ok(self.rows.lock().get(local_id).cloned())
    }

    fn get_by_field(&self, field: &str, value: &Value) -> Result<Option<Record>> {
        Ok(self
            .rows
            .lock()
            .values()
            .find(|row| cmp_values(query::field_value(row, field), value) == std::cmp::Ordering::Equal)
            .cloned())
    }

    fn insert(&self, record: Record) -> Result<()> {
        let local_id = require_local_id(&record)?.to_string();
        let mut rows = self.rows.lock();
        if rows.contains_key(&local_id) {
            return Err(Error::Storage(StorageError::Constraint(format!(
                "duplicate local_id {local_id:?} in table {:?}",
                self.name
            ))));
        }
        self.check_server_id_unique(&rows, &record, &local_id)?;
        rows.insert(local_id, record);
        Ok(())
    }

    fn upsert(&self, record: Record) -> Result<()> {
        let local_id = require_local_id(&record)?.to_string();
        let mut rows = self.rows.lock();
        self.check_server_id_unique(&rows, &record, &local_id)?;
        rows.insert(local_id, record);
        Ok(())
    }

    fn update(&self, local_id: &str, changes: &Record) -> Result<usize> {
        let mut rows = self.rows.lock();
        match rows.get_mut(local_id) {
            Some(row) => {
                crate::record::merge_into(row, changes);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn remove(&self, local_id: &str) -> Result<()> {
        self.rows.lock().remove(local_id);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.rows.lock().clear();
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        Ok(self.rows.lock().len() as u64)
    }

    fn query(&self, plan: &QueryPlan) -> Result<Vec<Record>> {
        let rows: Vec<Record> = self.rows.lock().values().cloned().collect();
        Ok(query::execute_plan(rows, plan))
    }

    fn query_keys(&self, plan: &QueryPlan, field: &str) -> Result<Vec<Value>> {
        let rows: Vec<Record> = self.rows.lock().values().cloned().collect();
        Ok(query::execute_plan_keys(rows, plan, field))
    }

    fn query_count(&self, plan: &QueryPlan) -> Result<u64> {
        Ok(self.query(plan)?.len() as u64)
    }

    fn query_delete(&self, plan: &QueryPlan) -> Result<usize> {
        let ids = self.matching_ids(plan);
        let mut rows = self.rows.lock();
        let mut removed = 0;
        for id in ids {
            if rows.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn query_update(&self, plan: &QueryPlan, changes: &Record) -> Result<usize> {
        let ids = self.matching_ids(plan);
        let mut rows = self.rows.lock();
        let mut updated = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(&id) {
                crate::record::merge_into(row, changes);
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Condition, WhereOp};
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn insert_rejects_duplicate_local_id() {
        let backend = MemoryBackend::new();
        let t = backend.table("todos").unwrap();
        t.insert(rec(json!({"local_id": "a", "title": "x"}))).unwrap();
        assert!(t.insert(rec(json!({"local_id": "a", "title": "y"}))).is_err());
    }

    #[test]
    fn insert_rejects_duplicate_server_id() {
        let backend = MemoryBackend::new();
        let t = backend.table("todos").unwrap();
        t.insert(rec(json!({"local_id": "a", "server_id": 7}))).unwrap();
        assert!(t.insert(rec(json!({"local_id": "b", "server_id": 7}))).is_err());
        // upsert over the same row keeps its own server_id
        t.upsert(rec(json!({"local_id": "a", "server_id": 7, "title": "z"}))).unwrap();
    }

    #[test]
    fn update_returns_changed_count() {
        let backend = MemoryBackend::new();
        let t = backend.table("todos").unwrap();
        t.insert(rec(json!({"local_id": "a", "title": "x"}))).unwrap();
        assert_eq!(t.update("a", &rec(json!({"title": "y"}))).unwrap(), 1);
        assert_eq!(t.update("ghost", &rec(json!({"title": "y"}))).unwrap(), 0);
        assert_eq!(t.get("a").unwrap().unwrap().get("title"), Some(&json!("y")));
    }

    #[test]
    fn rollback_restores_enrolled_tables() {
        let backend = MemoryBackend::new();
        let t = backend.table("todos").unwrap();
        t.insert(rec(json!({"local_id": "a", "title": "x"}))).unwrap();
        backend.begin(TxMode::ReadWrite, &["todos".to_string()]).unwrap();
        t.update("a", &rec(json!({"title": "y"}))).unwrap();
        t.insert(rec(json!({"local_id": "b"}))).unwrap();
        backend.rollback().unwrap();
        assert_eq!(t.get("a").unwrap().unwrap().get("title"), Some(&json!("x")));
        assert!(t.get("b").unwrap().is_none());
        assert_eq!(t.count().unwrap(), 1);
    }

    #[test]
    fn query_delete_respects_conditions() {
        let backend = MemoryBackend::new();
        let t = backend.table("todos").unwrap();
        for i in 0..4 {
            t.insert(rec(json!({"local_id": format!("id{i}"), "n": i}))).unwrap();
        }
        let plan = QueryPlan {
            groups: vec![vec![Condition { field: "n".into(), op: WhereOp::Above(json!(1)) }]],
            options: Default::default(),
        };
        assert_eq!(t.query_delete(&plan).unwrap(), 2);
        assert_eq!(t.count().unwrap(), 2);
    }
}
