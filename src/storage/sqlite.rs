//! rusqlite-backed driver: declared-schema bootstrap, versioned
//! migrations recorded in the internal state table, and execution of the
//! compiled query algebra.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::error::{Error, Result, StorageError};
use crate::query::QueryPlan;
use crate::record::{LOCAL_ID, Record, SERVER_ID, UPDATED_AT};
use crate::storage::sql::{self, CompiledQuery, bind_value, quote_ident};
use crate::storage::{
    BackendTable, ColumnKind, DatabaseSchema, STATE_TABLE, StorageBackend, TableDef,
    TxMode, require_local_id,
};

/// Key of the state-table row recording the applied schema version as a
/// decimal string.
pub const SCHEMA_VERSION_KEY: &str = "sqlite_schema_version";

pub type MigrationStep = Box<dyn Fn(&Connection) -> rusqlite::Result<()> + Send + Sync>;

/// One migration step. `upgrade` runs when moving up through this
/// version, `downgrade` when moving back below it.
pub struct Migration {
    pub version: u32,
    pub upgrade: MigrationStep,
    pub downgrade: Option<MigrationStep>,
}

struct SqliteInner {
    conn: Mutex<Option<Connection>>,
    schema: BTreeMap<String, TableDef>,
}

impl SqliteInner {
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(Error::Storage(StorageError::Closed)),
        }
    }
}

pub struct SqliteBackend {
    inner: Arc<SqliteInner>,
}

impl SqliteBackend {
    pub fn open(path: &str, schema: DatabaseSchema, migrations: &[Migration]) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, schema, migrations)
    }

    pub fn open_in_memory(schema: DatabaseSchema, migrations: &[Migration]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, schema, migrations)
    }

    pub fn with_connection(
        conn: Connection,
        schema: DatabaseSchema,
        migrations: &[Migration],
    ) -> Result<Self> {
        schema.validate()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch("BEGIN")?;
        let bootstrap = (|| -> Result<()> {
            create_state_table(&conn)?;
            for table in &schema.tables {
                create_table(&conn, table)?;
            }
            run_migrations(&conn, migrations)?;
            Ok(())
        })();
        match bootstrap {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }

        let mut tables: BTreeMap<String, TableDef> =
            schema.tables.into_iter().map(|t| (t.name.clone(), t)).collect();
        tables.insert(
            STATE_TABLE.to_string(),
            TableDef::new(STATE_TABLE).column("value", ColumnKind::Text),
        );
        Ok(SqliteBackend {
            inner: Arc::new(SqliteInner { conn: Mutex::new(Some(conn)), schema: tables }),
        })
    }
}

fn create_state_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {t} ({id} TEXT PRIMARY KEY NOT NULL, {v} TEXT)",
        t = quote_ident(STATE_TABLE),
        id = quote_ident(LOCAL_ID),
        v = quote_ident("value"),
    ))?;
    Ok(())
}

fn create_table(conn: &Connection, def: &TableDef) -> Result<()> {
    let mut cols = vec![
        format!("{} TEXT PRIMARY KEY NOT NULL", quote_ident(LOCAL_ID)),
        quote_ident(SERVER_ID),
        format!("{} TEXT", quote_ident(UPDATED_AT)),
    ];
    for col in &def.columns {
        let affinity = match col.kind {
            ColumnKind::Text | ColumnKind::Json => " TEXT",
            ColumnKind::Number => " NUMERIC",
            ColumnKind::Boolean => " INTEGER",
        };
        cols.push(format!("{}{affinity}", quote_ident(&col.name)));
    }
    let table = quote_ident(&def.name);
    conn.execute_batch(&format!("CREATE TABLE IF NOT EXISTS {table} ({})", cols.join(", ")))?;
    conn.execute_batch(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {idx} ON {table} ({sid}) WHERE {sid} IS NOT NULL",
        idx = quote_ident(&format!("{}_server_id", def.name)),
        sid = quote_ident(SERVER_ID),
    ))?;
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS {idx} ON {table} ({ua})",
        idx = quote_ident(&format!("{}_updated_at", def.name)),
        ua = quote_ident(UPDATED_AT),
    ))?;
    Ok(())
}

fn read_schema_version(conn: &Connection) -> Result<u32> {
    let stored: Option<String> = conn
        .query_row(
            &format!(
                "SELECT {v} FROM {t} WHERE {id} = ?1",
                v = quote_ident("value"),
                t = quote_ident(STATE_TABLE),
                id = quote_ident(LOCAL_ID),
            ),
            params![SCHEMA_VERSION_KEY],
            |r| r.get(0),
        )
        .optional()?;
    Ok(stored.and_then(|s| s.parse().ok()).unwrap_or(0))
}

fn write_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {t} ({id}, {v}) VALUES (?1, ?2) \
             ON CONFLICT({id}) DO UPDATE SET {v} = excluded.{v}",
            t = quote_ident(STATE_TABLE),
            id = quote_ident(LOCAL_ID),
            v = quote_ident("value"),
        ),
        params![SCHEMA_VERSION_KEY, version.to_string()],
    )?;
    Ok(())
}

/// Apply `upgrade` steps above the stored version in ascending order, or
/// `downgrade` steps in descending order when the store is ahead of the
/// target.
fn run_migrations(conn: &Connection, migrations: &[Migration]) -> Result<()> {
    let current = read_schema_version(conn)?;
    let target = migrations.iter().map(|m| m.version).max().unwrap_or(current);
    if target > current {
        let mut pending: Vec<&Migration> =
            migrations.iter().filter(|m| m.version > current && m.version <= target).collect();
        pending.sort_by_key(|m| m.version);
        for step in pending {
            (step.upgrade)(conn).map_err(StorageError::Sqlite)?;
        }
    } else if target < current {
        let mut pending: Vec<&Migration> =
            migrations.iter().filter(|m| m.version > target && m.version <= current).collect();
        pending.sort_by_key(|m| std::cmp::Reverse(m.version));
        for step in pending {
            match &step.downgrade {
                Some(down) => down(conn).map_err(StorageError::Sqlite)?,
                None => {
                    return Err(Error::logic(format!(
                        "no downgrade from schema version {}",
                        step.version
                    )));
                }
            }
        }
    }
    if target != current {
        write_schema_version(conn, target)?;
    }
    Ok(())
}

impl StorageBackend for SqliteBackend {
    fn table(&self, name: &str) -> Result<Arc<dyn BackendTable>> {
        let def = self
            .inner
            .schema
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Storage(StorageError::NoSuchTable(name.to_string())))?;
        Ok(Arc::new(SqliteTable { inner: Arc::clone(&self.inner), def }))
    }

    fn begin(&self, mode: TxMode, _tables: &[String]) -> Result<()> {
        let stmt = match mode {
            TxMode::ReadWrite => "BEGIN IMMEDIATE",
            TxMode::ReadOnly => "BEGIN",
        };
        self.inner.with_conn(|conn| Ok(conn.execute_batch(stmt)?))
    }

    fn commit(&self) -> Result<()> {
        self.inner.with_conn(|conn| Ok(conn.execute_batch("COMMIT")?))
    }

    fn rollback(&self) -> Result<()> {
        self.inner.with_conn(|conn| Ok(conn.execute_batch("ROLLBACK")?))
    }

    fn close(&self) -> Result<()> {
        self.inner.conn.lock().take();
        Ok(())
    }
}

pub struct SqliteTable {
    inner: Arc<SqliteInner>,
    def: TableDef,
}

impl SqliteTable {
    fn column_kind(&self, name: &str) -> ColumnKind {
        self.def
            .columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.kind)
            .unwrap_or(ColumnKind::Text)
    }

    fn check_declared(&self, record: &Record) -> Result<()> {
        for key in record.keys() {
            let reserved = key == LOCAL_ID || key == SERVER_ID || key == UPDATED_AT;
            if !reserved && !self.def.columns.iter().any(|c| c.name == *key) {
                return Err(Error::logic(format!(
                    "undeclared attribute {key:?} on table {:?}",
                    self.def.name
                )));
            }
        }
        Ok(())
    }

    fn hydrate_row(&self, row: &rusqlite::Row<'_>, names: &[String]) -> Result<Record> {
        let mut record = Record::new();
        for (i, name) in names.iter().enumerate() {
            if let Some(v) = self.hydrate_value(name, row.get_ref(i)?)? {
                record.insert(name.clone(), v);
            }
        }
        Ok(record)
    }

    fn hydrate_value(&self, column: &str, value: ValueRef<'_>) -> Result<Option<Value>> {
        let kind = self.column_kind(column);
        Ok(match value {
            ValueRef::Null => None,
            ValueRef::Integer(i) => {
                if kind == ColumnKind::Boolean {
                    Some(Value::Bool(i != 0))
                } else {
                    Some(Value::Number(i.into()))
                }
            }
            ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number),
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| Error::Storage(StorageError::Constraint(e.to_string())))?;
                if kind == ColumnKind::Json {
                    Some(serde_json::from_str(text)?)
                } else {
                    Some(Value::String(text.to_string()))
                }
            }
            ValueRef::Blob(_) => None,
        })
    }

    fn run_select(&self, compiled: &CompiledQuery) -> Result<Vec<Record>> {
        self.inner.with_conn(|conn| {
            let mut stmt = conn.prepare(&compiled.sql)?;
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(
                compiled.params.iter().map(bind_value),
            ))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(self.hydrate_row(row, &names)?);
            }
            Ok(out)
        })
    }

    fn run_execute(&self, compiled: &CompiledQuery) -> Result<usize> {
        self.inner.with_conn(|conn| {
            Ok(conn.execute(
                &compiled.sql,
                rusqlite::params_from_iter(compiled.params.iter().map(bind_value)),
            )?)
        })
    }
}

impl BackendTable for SqliteTable {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn get(&self, local_id: &str) -> Result<Option<Record>> {
        self.get_by_field(LOCAL_ID, &Value::String(local_id.to_string()))
    }

    fn get_by_field(&self, field: &str, value: &Value) -> Result<Option<Record>> {
        let compiled = CompiledQuery {
            sql: format!(
                "SELECT * FROM {} WHERE {} = ? LIMIT 1",
                quote_ident(&self.def.name),
                quote_ident(field),
            ),
            params: vec![value.clone()],
        };
        Ok(self.run_select(&compiled)?.into_iter().next())
    }

    fn insert(&self, record: Record) -> Result<()> {
        require_local_id(&record)?;
        self.check_declared(&record)?;
        let cols: Vec<&String> = record.keys().collect();
        let compiled = CompiledQuery {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&self.def.name),
                cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
                cols.iter().map(|_| "?").collect::<Vec<_>>().join(", "),
            ),
            params: record.values().cloned().collect(),
        };
        self.run_execute(&compiled)?;
        Ok(())
    }

    fn upsert(&self, record: Record) -> Result<()> {
        require_local_id(&record)?;
        self.check_declared(&record)?;
        let cols: Vec<&String> = record.keys().collect();
        let assignments: Vec<String> = cols
            .iter()
            .filter(|c| c.as_str() != LOCAL_ID)
            .map(|c| format!("{q} = excluded.{q}", q = quote_ident(c)))
            .collect();
        let conflict = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };
        let compiled = CompiledQuery {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {conflict}",
                quote_ident(&self.def.name),
                cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
                cols.iter().map(|_| "?").collect::<Vec<_>>().join(", "),
                quote_ident(LOCAL_ID),
            ),
            params: record.values().cloned().collect(),
        };
        self.run_execute(&compiled)?;
        Ok(())
    }

    fn update(&self, local_id: &str, changes: &Record) -> Result<usize> {
        if changes.is_empty() {
            return Ok(0);
        }
        self.check_declared(changes)?;
        let assignments: Vec<String> =
            changes.keys().map(|c| format!("{} = ?", quote_ident(c))).collect();
        let mut params: Vec<Value> = changes.values().cloned().collect();
        params.push(Value::String(local_id.to_string()));
        let compiled = CompiledQuery {
            sql: format!(
                "UPDATE {} SET {} WHERE {} = ?",
                quote_ident(&self.def.name),
                assignments.join(", "),
                quote_ident(LOCAL_ID),
            ),
            params,
        };
        self.run_execute(&compiled)
    }

    fn remove(&self, local_id: &str) -> Result<()> {
        let compiled = CompiledQuery {
            sql: format!(
                "DELETE FROM {} WHERE {} = ?",
                quote_ident(&self.def.name),
                quote_ident(LOCAL_ID),
            ),
            params: vec![Value::String(local_id.to_string())],
        };
        self.run_execute(&compiled)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.inner.with_conn(|conn| {
            conn.execute_batch(&format!("DELETE FROM {}", quote_ident(&self.def.name)))?;
            Ok(())
        })
    }

    fn count(&self) -> Result<u64> {
        self.inner.with_conn(|conn| {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(&self.def.name)),
                [],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }

    fn query(&self, plan: &QueryPlan) -> Result<Vec<Record>> {
        self.run_select(&sql::compile_select(&self.def.name, plan, None))
    }

    fn query_keys(&self, plan: &QueryPlan, field: &str) -> Result<Vec<Value>> {
        let compiled = sql::compile_select(&self.def.name, plan, Some(field));
        self.inner.with_conn(|conn| {
            let mut stmt = conn.prepare(&compiled.sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(
                compiled.params.iter().map(bind_value),
            ))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(self.hydrate_value(field, row.get_ref(0)?)?.unwrap_or(Value::Null));
            }
            Ok(out)
        })
    }

    fn query_count(&self, plan: &QueryPlan) -> Result<u64> {
        let compiled = sql::compile_count(&self.def.name, plan);
        self.inner.with_conn(|conn| {
            let n: i64 = conn.query_row(
                &compiled.sql,
                rusqlite::params_from_iter(compiled.params.iter().map(bind_value)),
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }

    fn query_delete(&self, plan: &QueryPlan) -> Result<usize> {
        self.run_execute(&sql::compile_delete(&self.def.name, plan))
    }

    fn query_update(&self, plan: &QueryPlan, changes: &Record) -> Result<usize> {
        if changes.is_empty() {
            return Ok(0);
        }
        self.check_declared(changes)?;
        self.run_execute(&sql::compile_update(&self.def.name, plan, changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Condition, WhereOp};
    use serde_json::json;

    fn schema() -> DatabaseSchema {
        DatabaseSchema::new().table(
            TableDef::new("todos")
                .column("title", ColumnKind::Text)
                .column("rank", ColumnKind::Number)
                .column("done", ColumnKind::Boolean)
                .column("tags", ColumnKind::Json),
        )
    }

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn roundtrip_preserves_types() {
        let backend = SqliteBackend::open_in_memory(schema(), &[]).unwrap();
        let t = backend.table("todos").unwrap();
        t.insert(rec(json!({
            "local_id": "a",
            "server_id": 7,
            "title": "x",
            "rank": 1.5,
            "done": true,
            "tags": ["red", "blue"],
        })))
        .unwrap();
        let row = t.get("a").unwrap().unwrap();
        assert_eq!(row.get("server_id"), Some(&json!(7)));
        assert_eq!(row.get("done"), Some(&json!(true)));
        assert_eq!(row.get("rank"), Some(&json!(1.5)));
        assert_eq!(row.get("tags"), Some(&json!(["red", "blue"])));
    }

    #[test]
    fn undeclared_attribute_is_a_logic_error() {
        let backend = SqliteBackend::open_in_memory(schema(), &[]).unwrap();
        let t = backend.table("todos").unwrap();
        let err = t.insert(rec(json!({"local_id": "a", "ghost": 1}))).unwrap_err();
        assert!(matches!(err, Error::Logic(_)));
    }

    #[test]
    fn reserved_column_is_rejected_at_open() {
        let bad = DatabaseSchema::new()
            .table(TableDef::new("todos").column("updated_at", ColumnKind::Text));
        assert!(SqliteBackend::open_in_memory(bad, &[]).is_err());
    }

    #[test]
    fn duplicate_server_id_violates_unique_index() {
        let backend = SqliteBackend::open_in_memory(schema(), &[]).unwrap();
        let t = backend.table("todos").unwrap();
        t.insert(rec(json!({"local_id": "a", "server_id": 9}))).unwrap();
        assert!(t.insert(rec(json!({"local_id": "b", "server_id": 9}))).is_err());
        // NULL server ids do not collide
        t.insert(rec(json!({"local_id": "c"}))).unwrap();
        t.insert(rec(json!({"local_id": "d"}))).unwrap();
    }

    #[test]
    fn migrations_bump_the_version_row() {
        let migrations = vec![
            Migration {
                version: 1,
                upgrade: Box::new(|conn| {
                    conn.execute_batch("CREATE TABLE extra_one (x INTEGER)")
                }),
                downgrade: None,
            },
            Migration {
                version: 2,
                upgrade: Box::new(|conn| {
                    conn.execute_batch("CREATE TABLE extra_two (x INTEGER)")
                }),
                downgrade: None,
            },
        ];
        let backend = SqliteBackend::open_in_memory(schema(), &migrations).unwrap();
        let state = backend.table(STATE_TABLE).unwrap();
        let row = state.get(SCHEMA_VERSION_KEY).unwrap().unwrap();
        assert_eq!(row.get("value"), Some(&json!("2")));
    }

    #[test]
    fn compiled_query_executes() {
        let backend = SqliteBackend::open_in_memory(schema(), &[]).unwrap();
        let t = backend.table("todos").unwrap();
        for (id, title) in [("a", "apple"), ("b", "Apricot"), ("c", "banana")] {
            t.insert(rec(json!({"local_id": id, "title": title}))).unwrap();
        }
        let plan = QueryPlan {
            groups: vec![vec![Condition {
                field: "title".into(),
                op: WhereOp::StartsWithIgnoreCase("ap".into()),
            }]],
            options: Default::default(),
        };
        let rows = t.query(&plan).unwrap();
        assert_eq!(rows.len(), 2);
        let case_sensitive = QueryPlan {
            groups: vec![vec![Condition {
                field: "title".into(),
                op: WhereOp::StartsWith("ap".into()),
            }]],
            options: Default::default(),
        };
        assert_eq!(t.query(&case_sensitive).unwrap().len(), 1);
    }

    #[test]
    fn rollback_discards_writes() {
        let backend = SqliteBackend::open_in_memory(schema(), &[]).unwrap();
        let t = backend.table("todos").unwrap();
        backend.begin(TxMode::ReadWrite, &["todos".to_string()]).unwrap();
        t.insert(rec(json!({"local_id": "a", "title": "x"}))).unwrap();
        backend.rollback().unwrap();
        assert_eq!(t.count().unwrap(), 0);
    }
}
