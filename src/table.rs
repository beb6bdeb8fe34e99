//! Public table surface. The standard shape is the reactive one: every
//! mutation on a sync table runs in a transaction with the state table,
//! appends to the pending-change queue, and emits a mutation event. The
//! `raw` shape skips both and is what the sync engine itself writes
//! through.

use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::db::DbInner;
use crate::error::{Error, Result, StorageError};
use crate::events::{MutationEvent, MutationKind};
use crate::query::{Condition, QueryPlan, WhereOp, cmp_values, field_value};
use crate::record::{
    self, LOCAL_ID, Record, SERVER_ID, UPDATED_AT, ensure_local_id, now_timestamp,
};
use crate::state::{ChangeAction, NewPendingChange};
use crate::storage::{BackendTable, STATE_TABLE, TxMode};

#[derive(Clone)]
pub struct Table {
    db: Weak<DbInner>,
    backend: Arc<dyn BackendTable>,
    name: String,
    sync: bool,
    raw: bool,
}

impl Table {
    pub(crate) fn new(
        db: Weak<DbInner>,
        backend: Arc<dyn BackendTable>,
        name: String,
        sync: bool,
    ) -> Self {
        Table { db, backend, name, sync, raw: false }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The non-reactive shape: mutations skip the pending-change queue
    /// and mutation events entirely.
    pub fn raw(&self) -> Table {
        let mut t = self.clone();
        t.raw = true;
        t
    }

    fn db(&self) -> Result<Arc<DbInner>> {
        self.db.upgrade().ok_or(Error::Storage(StorageError::Closed))
    }

    fn tx_tables(&self) -> [String; 2] {
        [self.name.clone(), STATE_TABLE.to_string()]
    }

    // ---- reads ----------------------------------------------------

    pub fn get(&self, local_id: &str) -> Result<Option<Record>> {
        self.backend.get(local_id)
    }

    pub fn get_by_server_id(&self, server_id: &Value) -> Result<Option<Record>> {
        self.backend.get_by_field(SERVER_ID, server_id)
    }

    pub fn count(&self) -> Result<u64> {
        self.backend.count()
    }

    // ---- mutations ------------------------------------------------

    pub fn add(&self, item: Record) -> Result<String> {
        let mut ids = self.bulk_add(vec![item])?;
        Ok(ids.remove(0))
    }

    pub fn bulk_add(&self, items: Vec<Record>) -> Result<Vec<String>> {
        if self.raw {
            let mut ids = Vec::with_capacity(items.len());
            for item in items {
                ids.push(crate::storage::require_local_id(&item)?.to_string());
                self.backend.insert(item)?;
            }
            return Ok(ids);
        }
        let db = self.db()?;
        let mut ids = Vec::with_capacity(items.len());
        db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &self.tx_tables(), || {
            for mut item in items {
                let local_id = ensure_local_id(&mut item);
                if self.sync {
                    item.insert(UPDATED_AT.into(), Value::String(now_timestamp()));
                    self.backend.insert(item.clone())?;
                    db.state.add_pending_change(NewPendingChange {
                        action: ChangeAction::Create,
                        table: self.name.clone(),
                        local_id: local_id.clone(),
                        server_id: None,
                        changes: Some(record::outgoing_payload(&item)),
                        before: None,
                        after: Some(item),
                    })?;
                } else {
                    self.backend.insert(item)?;
                }
                ids.push(local_id);
            }
            db.emit_after_commit(MutationEvent::new(MutationKind::Add, &self.name, ids.clone()));
            Ok(())
        })?;
        Ok(ids)
    }

    /// Upsert by `local_id`: an existing row queues an Update, a new one
    /// a Create.
    pub fn put(&self, item: Record) -> Result<String> {
        let mut ids = self.bulk_put(vec![item])?;
        Ok(ids.remove(0))
    }

    pub fn bulk_put(&self, items: Vec<Record>) -> Result<Vec<String>> {
        if self.raw {
            let mut ids = Vec::with_capacity(items.len());
            for item in items {
                ids.push(crate::storage::require_local_id(&item)?.to_string());
                self.backend.upsert(item)?;
            }
            return Ok(ids);
        }
        let db = self.db()?;
        let mut ids = Vec::with_capacity(items.len());
        let mut added = Vec::new();
        let mut updated = Vec::new();
        db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &self.tx_tables(), || {
            for mut item in items {
                let local_id = ensure_local_id(&mut item);
                if !self.sync {
                    self.backend.upsert(item)?;
                    ids.push(local_id.clone());
                    added.push(local_id);
                    continue;
                }
                item.insert(UPDATED_AT.into(), Value::String(now_timestamp()));
                let existing = self.backend.get(&local_id)?;
                if let Some(prev) = &existing {
                    // A replacement must not shed an already-assigned
                    // server id.
                    if !item.contains_key(SERVER_ID) {
                        if let Some(sid) = record::server_id_of(prev) {
                            item.insert(SERVER_ID.into(), sid.clone());
                        }
                    }
                }
                self.backend.upsert(item.clone())?;
                match existing {
                    None => {
                        db.state.add_pending_change(NewPendingChange {
                            action: ChangeAction::Create,
                            table: self.name.clone(),
                            local_id: local_id.clone(),
                            server_id: None,
                            changes: Some(record::outgoing_payload(&item)),
                            before: None,
                            after: Some(item),
                        })?;
                        added.push(local_id.clone());
                    }
                    Some(prev) => {
                        db.state.add_pending_change(NewPendingChange {
                            action: ChangeAction::Update,
                            table: self.name.clone(),
                            local_id: local_id.clone(),
                            server_id: record::server_id_of(&prev).cloned(),
                            changes: Some(record::outgoing_payload(&item)),
                            before: Some(prev),
                            after: Some(item),
                        })?;
                        updated.push(local_id.clone());
                    }
                }
                ids.push(local_id);
            }
            if !added.is_empty() {
                db.emit_after_commit(MutationEvent::new(MutationKind::Add, &self.name, added.clone()));
            }
            if !updated.is_empty() {
                db.emit_after_commit(MutationEvent::new(
                    MutationKind::Update,
                    &self.name,
                    updated.clone(),
                ));
            }
            Ok(())
        })?;
        Ok(ids)
    }

    /// Partial update; returns the count actually changed (0 if absent).
    pub fn update(&self, local_id: &str, changes: Record) -> Result<usize> {
        self.bulk_update(vec![(local_id.to_string(), changes)])
    }

    pub fn bulk_update(&self, updates: Vec<(String, Record)>) -> Result<usize> {
        if self.raw {
            let mut n = 0;
            for (local_id, changes) in updates {
                n += self.backend.update(&local_id, &changes)?;
            }
            return Ok(n);
        }
        let db = self.db()?;
        let mut changed_ids = Vec::new();
        let n = db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &self.tx_tables(), || {
            let mut n = 0;
            for (local_id, mut changes) in updates {
                changes.remove(LOCAL_ID);
                if !self.sync {
                    let count = self.backend.update(&local_id, &changes)?;
                    if count > 0 {
                        n += count;
                        changed_ids.push(local_id);
                    }
                    continue;
                }
                let Some(prev) = self.backend.get(&local_id)? else { continue };
                changes.insert(UPDATED_AT.into(), Value::String(now_timestamp()));
                let count = self.backend.update(&local_id, &changes)?;
                if count == 0 {
                    continue;
                }
                let mut merged = prev.clone();
                record::merge_into(&mut merged, &changes);
                db.state.add_pending_change(NewPendingChange {
                    action: ChangeAction::Update,
                    table: self.name.clone(),
                    local_id: local_id.clone(),
                    server_id: record::server_id_of(&prev).cloned(),
                    changes: Some(record::outgoing_payload(&changes)),
                    before: Some(prev),
                    after: Some(merged),
                })?;
                n += count;
                changed_ids.push(local_id);
            }
            if !changed_ids.is_empty() {
                db.emit_after_commit(MutationEvent::new(
                    MutationKind::Update,
                    &self.name,
                    changed_ids.clone(),
                ));
            }
            Ok(n)
        })?;
        Ok(n)
    }

    /// Idempotent delete; queues a Remove (or cancels an unpushed
    /// Create) on sync tables.
    pub fn delete(&self, local_id: &str) -> Result<()> {
        self.bulk_delete(&[local_id.to_string()]).map(|_| ())
    }

    pub fn bulk_delete(&self, local_ids: &[String]) -> Result<usize> {
        if self.raw {
            for id in local_ids {
                self.backend.remove(id)?;
            }
            return Ok(local_ids.len());
        }
        let db = self.db()?;
        let mut removed = Vec::new();
        db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &self.tx_tables(), || {
            for local_id in local_ids {
                let prev = self.backend.get(local_id)?;
                let Some(prev) = prev else { continue };
                self.backend.remove(local_id)?;
                if self.sync {
                    db.state.add_pending_change(NewPendingChange {
                        action: ChangeAction::Remove,
                        table: self.name.clone(),
                        local_id: local_id.clone(),
                        server_id: record::server_id_of(&prev).cloned(),
                        changes: None,
                        before: Some(prev),
                        after: None,
                    })?;
                }
                removed.push(local_id.clone());
            }
            if !removed.is_empty() {
                db.emit_after_commit(MutationEvent::new(
                    MutationKind::Delete,
                    &self.name,
                    removed.clone(),
                ));
            }
            Ok(())
        })?;
        Ok(removed.len())
    }

    /// Empty the table; on sync tables every previously existing record
    /// gets a queued Remove.
    pub fn clear(&self) -> Result<()> {
        if self.raw {
            return self.backend.clear();
        }
        let db = self.db()?;
        db.tx.run(db.backend.as_ref(), TxMode::ReadWrite, &self.tx_tables(), || {
            let rows = self.backend.query(&QueryPlan::for_table_scan())?;
            self.backend.clear()?;
            let mut keys = Vec::with_capacity(rows.len());
            for prev in rows {
                let Some(local_id) = record::local_id_of(&prev).map(str::to_string) else {
                    continue;
                };
                if self.sync {
                    db.state.add_pending_change(NewPendingChange {
                        action: ChangeAction::Remove,
                        table: self.name.clone(),
                        local_id: local_id.clone(),
                        server_id: record::server_id_of(&prev).cloned(),
                        changes: None,
                        before: Some(prev),
                        after: None,
                    })?;
                }
                keys.push(local_id);
            }
            if !keys.is_empty() {
                db.emit_after_commit(MutationEvent::new(MutationKind::Delete, &self.name, keys));
            }
            Ok(())
        })
    }

    // ---- queries --------------------------------------------------

    pub fn where_by(&self, field: impl Into<String>) -> WhereClause {
        let field = field.into();
        WhereClause { base: self.collection().with_index(&field), field }
    }

    pub fn order_by(&self, field: impl Into<String>) -> Collection {
        let field = field.into();
        let mut c = self.collection().with_index(&field);
        c.plan.options.order_by = Some(field);
        c
    }

    pub fn reverse(&self) -> Collection {
        let mut c = self.collection();
        c.plan.options.reverse = true;
        c
    }

    pub fn offset(&self, n: usize) -> Collection {
        let mut c = self.collection();
        c.plan.options.offset = Some(n);
        c
    }

    pub fn limit(&self, n: usize) -> Collection {
        let mut c = self.collection();
        c.plan.options.limit = Some(n);
        c
    }

    pub fn to_collection(&self) -> Collection {
        self.collection()
    }

    fn collection(&self) -> Collection {
        Collection {
            table: self.clone(),
            plan: QueryPlan::default(),
            predicate: None,
            index_field: None,
        }
    }
}

type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// A pending query: a DNF of conditions, an optional opaque post-filter,
/// and ordering/paging options. Combinators return new values, so
/// intermediate collections can be reused freely.
#[derive(Clone)]
pub struct Collection {
    table: Table,
    plan: QueryPlan,
    predicate: Option<Predicate>,
    index_field: Option<String>,
}

impl Collection {
    fn with_index(mut self, field: &str) -> Self {
        if self.index_field.is_none() {
            self.index_field = Some(field.to_string());
        }
        self
    }

    fn push_group(mut self, field: String, op: WhereOp) -> Self {
        self.plan.groups.push(vec![Condition { field, op }]);
        self
    }

    /// Disjunction with another where-clause on the same base.
    pub fn or(self, field: impl Into<String>) -> WhereClause {
        let field = field.into();
        WhereClause { base: self.with_index(&field), field }
    }

    /// Opaque post-filter. Backends run the conditions without paging
    /// and offset/limit apply after this predicate.
    pub fn filter(mut self, f: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        let next: Predicate = match self.predicate.take() {
            None => Arc::new(f),
            Some(prev) => Arc::new(move |r| prev(r) && f(r)),
        };
        self.predicate = Some(next);
        self
    }

    /// Toggles the current direction.
    pub fn reverse(mut self) -> Self {
        self.plan.options.reverse = !self.plan.options.reverse;
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.plan.options.offset = Some(n);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.plan.options.limit = Some(n);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.plan.options.distinct = true;
        self
    }

    // ---- terminals ------------------------------------------------

    pub fn to_vec(&self) -> Result<Vec<Record>> {
        match &self.predicate {
            None => self.table.backend.query(&self.plan),
            Some(pred) => {
                let rows = self.table.backend.query(&self.plan.without_paging())?;
                let filtered: Vec<Record> = rows.into_iter().filter(|r| pred(r)).collect();
                Ok(paged(filtered, &self.plan))
            }
        }
    }

    pub fn first(&self) -> Result<Option<Record>> {
        let mut limited = self.clone();
        limited.plan.options.limit = Some(1);
        Ok(limited.to_vec()?.into_iter().next())
    }

    pub fn last(&self) -> Result<Option<Record>> {
        self.clone().reverse().first()
    }

    pub fn count(&self) -> Result<u64> {
        match &self.predicate {
            None => self.table.backend.query_count(&self.plan),
            Some(_) => Ok(self.to_vec()?.len() as u64),
        }
    }

    pub fn each(&self, mut f: impl FnMut(&Record)) -> Result<()> {
        for row in self.to_vec()? {
            f(&row);
        }
        Ok(())
    }

    pub fn each_key(&self, mut f: impl FnMut(&Value)) -> Result<()> {
        for key in self.keys()? {
            f(&key);
        }
        Ok(())
    }

    /// Values of the active index (the `where`/`order_by` field,
    /// falling back to the primary key).
    pub fn keys(&self) -> Result<Vec<Value>> {
        let field = self
            .index_field
            .clone()
            .or_else(|| self.plan.options.order_by.clone())
            .unwrap_or_else(|| LOCAL_ID.to_string());
        self.project(&field, self.plan.options.distinct)
    }

    pub fn primary_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .project(LOCAL_ID, self.plan.options.distinct)?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    /// Distinct projection of the primary-key column.
    pub fn unique_keys(&self) -> Result<Vec<Value>> {
        self.project(LOCAL_ID, true)
    }

    fn project(&self, field: &str, distinct: bool) -> Result<Vec<Value>> {
        let mut plan = self.plan.clone();
        plan.options.distinct = distinct;
        match &self.predicate {
            None => self.table.backend.query_keys(&plan, field),
            Some(pred) => {
                let rows = self.table.backend.query(&plan.without_paging())?;
                let mut keys: Vec<Value> = rows
                    .into_iter()
                    .filter(|r| pred(r))
                    .map(|r| field_value(&r, field).clone())
                    .collect();
                if distinct {
                    let mut seen = std::collections::HashSet::new();
                    keys.retain(|k| seen.insert(serde_json::to_string(k).unwrap_or_default()));
                }
                Ok(paged(keys, &self.plan))
            }
        }
    }

    /// Fetch and re-sort in memory by `key`.
    pub fn sort_by(&self, key: &str) -> Result<Vec<Record>> {
        let mut rows = self.to_vec()?;
        rows.sort_by(|a, b| cmp_values(field_value(a, key), field_value(b, key)));
        Ok(rows)
    }

    /// Delete everything the query matches; returns the deleted count.
    /// On the reactive shape this routes through the enhanced bulk
    /// delete so removals are queued for sync.
    pub fn delete(&self) -> Result<usize> {
        if self.table.raw && self.predicate.is_none() {
            return self.table.backend.query_delete(&self.plan);
        }
        let ids = self.matching_ids()?;
        self.table.bulk_delete(&ids)
    }

    /// Apply `changes` to every match; returns the updated count.
    pub fn modify(&self, changes: Record) -> Result<usize> {
        if self.table.raw && self.predicate.is_none() {
            return self.table.backend.query_update(&self.plan, &changes);
        }
        let ids = self.matching_ids()?;
        self.table.bulk_update(ids.into_iter().map(|id| (id, changes.clone())).collect())
    }

    /// Apply a mutator to every match; the per-record diff is what gets
    /// queued for sync.
    pub fn modify_with(&self, mutator: impl Fn(&mut Record)) -> Result<usize> {
        let rows = self.to_vec()?;
        let mut updates = Vec::new();
        for row in rows {
            let Some(local_id) = record::local_id_of(&row).map(str::to_string) else { continue };
            let mut next = row.clone();
            mutator(&mut next);
            let mut changes = Record::new();
            for (k, v) in &next {
                if row.get(k) != Some(v) {
                    changes.insert(k.clone(), v.clone());
                }
            }
            for k in row.keys() {
                if !next.contains_key(k) {
                    changes.insert(k.clone(), Value::Null);
                }
            }
            if !changes.is_empty() {
                updates.push((local_id, changes));
            }
        }
        self.table.bulk_update(updates)
    }

    fn matching_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .to_vec()?
            .iter()
            .filter_map(record::local_id_of)
            .map(str::to_string)
            .collect())
    }
}

fn paged<T>(items: Vec<T>, plan: &QueryPlan) -> Vec<T> {
    let offset = plan.options.offset.unwrap_or(0);
    let mut iter = items.into_iter().skip(offset);
    match plan.options.limit {
        Some(n) => iter.by_ref().take(n).collect(),
        None => iter.collect(),
    }
}

/// Operator entry point for one field; every operator returns a
/// [`Collection`]. Case-sensitive unless the name says otherwise.
pub struct WhereClause {
    base: Collection,
    field: String,
}

impl WhereClause {
    fn apply(self, op: WhereOp) -> Collection {
        let field = self.field;
        self.base.push_group(field, op)
    }

    pub fn equals(self, value: impl Into<Value>) -> Collection {
        self.apply(WhereOp::Equals(value.into()))
    }

    pub fn equals_ignore_case(self, value: impl Into<String>) -> Collection {
        self.apply(WhereOp::EqualsIgnoreCase(value.into()))
    }

    pub fn not_equal(self, value: impl Into<Value>) -> Collection {
        self.apply(WhereOp::NotEqual(value.into()))
    }

    pub fn above(self, value: impl Into<Value>) -> Collection {
        self.apply(WhereOp::Above(value.into()))
    }

    pub fn above_or_equal(self, value: impl Into<Value>) -> Collection {
        self.apply(WhereOp::AboveOrEqual(value.into()))
    }

    pub fn below(self, value: impl Into<Value>) -> Collection {
        self.apply(WhereOp::Below(value.into()))
    }

    pub fn below_or_equal(self, value: impl Into<Value>) -> Collection {
        self.apply(WhereOp::BelowOrEqual(value.into()))
    }

    /// Lower bound inclusive, upper bound exclusive.
    pub fn between(self, lower: impl Into<Value>, upper: impl Into<Value>) -> Collection {
        self.between_bounds(lower, upper, true, false)
    }

    pub fn between_bounds(
        self,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
        include_lower: bool,
        include_upper: bool,
    ) -> Collection {
        self.apply(WhereOp::Between {
            lower: lower.into(),
            upper: upper.into(),
            include_lower,
            include_upper,
        })
    }

    /// OR of between conditions, with the same default inclusivity.
    pub fn in_any_range(self, ranges: Vec<(Value, Value)>) -> Collection {
        self.in_any_range_bounds(ranges, true, false)
    }

    pub fn in_any_range_bounds(
        self,
        ranges: Vec<(Value, Value)>,
        include_lower: bool,
        include_upper: bool,
    ) -> Collection {
        self.apply(WhereOp::InAnyRange { ranges, include_lower, include_upper })
    }

    pub fn starts_with(self, prefix: impl Into<String>) -> Collection {
        self.apply(WhereOp::StartsWith(prefix.into()))
    }

    pub fn starts_with_ignore_case(self, prefix: impl Into<String>) -> Collection {
        self.apply(WhereOp::StartsWithIgnoreCase(prefix.into()))
    }

    pub fn starts_with_any_of(
        self,
        prefixes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Collection {
        self.apply(WhereOp::StartsWithAnyOf(prefixes.into_iter().map(Into::into).collect()))
    }

    pub fn starts_with_any_of_ignore_case(
        self,
        prefixes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Collection {
        self.apply(WhereOp::StartsWithAnyOfIgnoreCase(
            prefixes.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn any_of(self, values: impl IntoIterator<Item = impl Into<Value>>) -> Collection {
        self.apply(WhereOp::AnyOf(values.into_iter().map(Into::into).collect()))
    }

    pub fn any_of_ignore_case(
        self,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Collection {
        self.apply(WhereOp::AnyOfIgnoreCase(values.into_iter().map(Into::into).collect()))
    }

    pub fn none_of(self, values: impl IntoIterator<Item = impl Into<Value>>) -> Collection {
        self.apply(WhereOp::NoneOf(values.into_iter().map(Into::into).collect()))
    }
}
