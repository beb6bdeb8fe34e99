//! End-to-end sync scenarios over the in-memory backend and an
//! in-process mock transport.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use syncstore::transport::ApiResult;
use syncstore::{
    ApiError, ApiErrorKind, ChangeAction, Database, DatabaseConfig, MemoryBackend,
    MissingRecordStrategy, PushItem, PushOutcome, Record, Remote, RemoteAck, RemoteBatch,
    RemoteTable, SyncOptions, SyncStatus,
};

fn rec(v: Value) -> Record {
    v.as_object().unwrap().clone()
}

struct MockRemote {
    next_id: AtomicI64,
    list_pages: Mutex<VecDeque<Vec<Record>>>,
    first_load_pages: Mutex<VecDeque<Vec<Record>>>,
    has_first_load: bool,
    update_exists: Mutex<bool>,
    fail_updates: Mutex<bool>,
    calls: Mutex<Vec<String>>,
    added: Mutex<Vec<Record>>,
}

impl MockRemote {
    fn new() -> Arc<Self> {
        Arc::new(MockRemote {
            next_id: AtomicI64::new(7),
            list_pages: Mutex::new(VecDeque::new()),
            first_load_pages: Mutex::new(VecDeque::new()),
            has_first_load: false,
            update_exists: Mutex::new(true),
            fail_updates: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
        })
    }

    fn with_first_load(pages: Vec<Vec<Record>>) -> Arc<Self> {
        Arc::new(MockRemote {
            next_id: AtomicI64::new(7),
            list_pages: Mutex::new(VecDeque::new()),
            first_load_pages: Mutex::new(pages.into_iter().collect()),
            has_first_load: true,
            update_exists: Mutex::new(true),
            fail_updates: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
        })
    }

    fn queue_list(&self, page: Vec<Record>) {
        self.list_pages.lock().push_back(page);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn mutation_calls(&self) -> Vec<String> {
        self.calls().into_iter().filter(|c| c != "list" && c != "first_load").collect()
    }
}

#[async_trait]
impl RemoteTable for MockRemote {
    async fn add(&self, item: &Record) -> ApiResult<Option<RemoteAck>> {
        self.calls.lock().push("add".into());
        self.added.lock().push(item.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Some(RemoteAck { id: json!(id), updated_at: Some("2024-01-01T00:00:00Z".into()) }))
    }

    async fn update(&self, id: &Value, _changes: &Record, _after: &Record) -> ApiResult<bool> {
        self.calls.lock().push(format!("update:{id}"));
        if *self.fail_updates.lock() {
            return Err(ApiError::network("connection refused"));
        }
        Ok(*self.update_exists.lock())
    }

    async fn remove(&self, id: &Value) -> ApiResult<()> {
        self.calls.lock().push(format!("remove:{id}"));
        Ok(())
    }

    async fn list(&self, _since: Option<&str>) -> ApiResult<Vec<Record>> {
        self.calls.lock().push("list".into());
        Ok(self.list_pages.lock().pop_front().unwrap_or_default())
    }

    async fn first_load(&self, _last_id: Option<Value>) -> ApiResult<Option<Vec<Record>>> {
        if !self.has_first_load {
            return Ok(None);
        }
        self.calls.lock().push("first_load".into());
        Ok(Some(self.first_load_pages.lock().pop_front().unwrap_or_default()))
    }
}

fn open(remote: &Arc<MockRemote>, options: SyncOptions) -> Database {
    let mut tables: BTreeMap<String, Arc<dyn RemoteTable>> = BTreeMap::new();
    tables.insert("todos".to_string(), Arc::clone(remote) as Arc<dyn RemoteTable>);
    Database::open(
        Arc::new(MemoryBackend::new()),
        DatabaseConfig { remote: Some(Remote::PerTable(tables)), options },
    )
    .unwrap()
}

fn pending(db: &Database) -> Vec<syncstore::PendingChange> {
    db.sync().state().state.pending_changes
}

// S1: create locally, drain the queue, server fields land on the row.
#[tokio::test]
async fn create_and_push() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    let todos = db.table("todos").unwrap();

    let local_id = todos.add(rec(json!({"title": "A"}))).unwrap();
    let queued = pending(&db);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].action, ChangeAction::Create);
    assert_eq!(queued[0].version, 1);

    db.sync().sync_now().await.unwrap();

    let row = todos.get(&local_id).unwrap().unwrap();
    assert_eq!(row.get("server_id"), Some(&json!(7)));
    assert_eq!(row.get("updated_at"), Some(&json!("2024-01-01T00:00:00Z")));
    assert!(pending(&db).is_empty());
    assert_eq!(remote.added.lock().len(), 1);
}

// S2: local and remote both changed the same field.
#[tokio::test]
async fn divergent_field_records_a_conflict() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    let todos = db.table("todos").unwrap();

    remote.queue_list(vec![rec(
        json!({"id": 3, "title": "x", "updated_at": "2024-01-01T00:00:00Z"}),
    )]);
    db.sync().sync_now().await.unwrap();
    let row = todos.where_by("title").equals("x").first().unwrap().unwrap();
    let local_id = row.get("local_id").unwrap().as_str().unwrap().to_string();

    todos.update(&local_id, rec(json!({"title": "y"}))).unwrap();
    remote.queue_list(vec![rec(
        json!({"id": 3, "title": "z", "updated_at": "2024-01-02T00:00:00Z"}),
    )]);
    db.sync().sync_now().await.unwrap();

    let state = db.sync().state().state;
    let conflict = state.conflicts.get(&local_id).expect("conflict recorded");
    assert_eq!(conflict.table, "todos");
    assert_eq!(conflict.fields.len(), 1);
    assert_eq!(conflict.fields[0].key, "title");
    assert_eq!(conflict.fields[0].local_value, json!("y"));
    assert_eq!(conflict.fields[0].remote_value, json!("z"));
    // Local keeps its value until the user resolves.
    assert_eq!(todos.get(&local_id).unwrap().unwrap().get("title"), Some(&json!("y")));
    // The conflicted update is not pushed.
    assert!(!remote.calls().iter().any(|c| c.starts_with("update")));
}

// S3: non-overlapping fields merge shallowly; the local edit stays
// queued (the push attempt fails on a downed server here).
#[tokio::test]
async fn shallow_merge_on_non_overlapping_fields() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    let todos = db.table("todos").unwrap();

    remote.queue_list(vec![rec(
        json!({"id": 3, "title": "x", "updated_at": "2024-01-01T00:00:00Z"}),
    )]);
    db.sync().sync_now().await.unwrap();
    let row = todos.where_by("title").equals("x").first().unwrap().unwrap();
    let local_id = row.get("local_id").unwrap().as_str().unwrap().to_string();

    todos.update(&local_id, rec(json!({"title": "y"}))).unwrap();
    *remote.fail_updates.lock() = true;
    remote.queue_list(vec![rec(
        json!({"id": 3, "title": "x", "extra": "e", "updated_at": "2024-01-02T00:00:00Z"}),
    )]);
    let _ = db.sync().sync_now().await;

    let row = todos.get(&local_id).unwrap().unwrap();
    assert_eq!(row.get("title"), Some(&json!("y")));
    assert_eq!(row.get("extra"), Some(&json!("e")));
    assert!(db.sync().state().state.conflicts.is_empty());
    let queued = pending(&db);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].action, ChangeAction::Update);
    assert!(queued[0].changes.as_ref().unwrap().contains_key("title"));
}

// S4: server lost the record; insert_remote_record re-creates it under
// a fresh identity.
#[tokio::test]
async fn missing_remote_record_reinserts() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    let todos = db.table("todos").unwrap();

    remote.queue_list(vec![rec(
        json!({"id": 9, "title": "keep", "updated_at": "2024-01-01T00:00:00Z"}),
    )]);
    db.sync().sync_now().await.unwrap();
    let row = todos.where_by("title").equals("keep").first().unwrap().unwrap();
    let old_id = row.get("local_id").unwrap().as_str().unwrap().to_string();

    todos.update(&old_id, rec(json!({"title": "kept"}))).unwrap();
    *remote.update_exists.lock() = false;
    db.sync().sync_now().await.unwrap();

    assert!(todos.get(&old_id).unwrap().is_none());
    let replacement = todos.where_by("title").equals("kept").first().unwrap().unwrap();
    let new_id = replacement.get("local_id").unwrap().as_str().unwrap().to_string();
    assert_ne!(new_id, old_id);
    assert!(replacement.get("server_id").is_none());

    let queued = pending(&db);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].action, ChangeAction::Create);
    assert_eq!(queued[0].local_id, new_id);
    assert!(!queued.iter().any(|c| c.local_id == old_id));
}

#[tokio::test]
async fn missing_remote_record_ignore_and_delete_strategies() {
    for strategy in [MissingRecordStrategy::Ignore, MissingRecordStrategy::DeleteLocalRecord] {
        let remote = MockRemote::new();
        let db = open(
            &remote,
            SyncOptions {
                missing_remote_record_during_update_strategy: strategy,
                ..Default::default()
            },
        );
        let todos = db.table("todos").unwrap();
        remote.queue_list(vec![rec(
            json!({"id": 9, "title": "a", "updated_at": "2024-01-01T00:00:00Z"}),
        )]);
        db.sync().sync_now().await.unwrap();
        let row = todos.where_by("title").equals("a").first().unwrap().unwrap();
        let local_id = row.get("local_id").unwrap().as_str().unwrap().to_string();

        todos.update(&local_id, rec(json!({"title": "b"}))).unwrap();
        *remote.update_exists.lock() = false;
        db.sync().sync_now().await.unwrap();

        assert!(pending(&db).is_empty());
        match strategy {
            MissingRecordStrategy::Ignore => {
                assert_eq!(
                    todos.get(&local_id).unwrap().unwrap().get("title"),
                    Some(&json!("b"))
                );
            }
            MissingRecordStrategy::DeleteLocalRecord => {
                assert!(todos.get(&local_id).unwrap().is_none());
            }
            MissingRecordStrategy::InsertRemoteRecord => unreachable!(),
        }
    }
}

// S5: a pulled tombstone does not resurrect a locally deleted record.
#[tokio::test]
async fn tombstone_pull_suppresses_resurrection() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    let todos = db.table("todos").unwrap();

    let local_id = todos.add(rec(json!({"title": "gone"}))).unwrap();
    db.sync().sync_now().await.unwrap();
    let sid = todos.get(&local_id).unwrap().unwrap().get("server_id").unwrap().clone();

    todos.delete(&local_id).unwrap();
    remote.queue_list(vec![rec(json!({"id": sid, "deleted": true}))]);
    db.sync().sync_now().await.unwrap();

    assert!(todos.get(&local_id).unwrap().is_none());
    assert_eq!(todos.count().unwrap(), 0);
    assert!(pending(&db).is_empty());
    assert!(remote.calls().iter().any(|c| c == &format!("remove:{sid}")));
}

// S6: a repeated first-load page aborts instead of looping forever.
#[tokio::test]
async fn first_load_duplicate_page_aborts() {
    let remote = MockRemote::with_first_load(vec![
        vec![
            rec(json!({"id": 1, "title": "a", "updated_at": "2024-01-01T00:00:00Z"})),
            rec(json!({"id": 2, "title": "b", "updated_at": "2024-01-01T00:00:01Z"})),
        ],
        vec![rec(json!({"id": 2, "title": "b", "updated_at": "2024-01-01T00:00:01Z"}))],
    ]);
    let db = open(&remote, SyncOptions::default());

    let err = db.sync().start_first_load(None).await.unwrap_err();
    assert!(err.to_string().contains("duplicate page"), "{err}");

    let observed = db.sync().state();
    assert!(observed.state.first_load_done);
    let api_error = observed.api_error.expect("api error recorded");
    assert!(api_error.message.contains("duplicate page"));
    // The records before the bad page were still ingested.
    assert_eq!(db.table("todos").unwrap().count().unwrap(), 2);
}

#[tokio::test]
async fn first_load_pages_and_reports_progress() {
    let remote = MockRemote::with_first_load(vec![
        vec![
            rec(json!({"id": 1, "title": "a", "updated_at": "2024-01-01T00:00:00Z"})),
            rec(json!({"id": 2, "title": "b", "updated_at": "2024-01-02T00:00:00Z"})),
        ],
        vec![
            rec(json!({"id": 3, "title": "c", "updated_at": "2024-01-03T00:00:00Z"})),
            rec(json!({"id": 4, "deleted": true, "updated_at": "2024-01-04T00:00:00Z"})),
        ],
    ]);
    let db = open(&remote, SyncOptions::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    db.sync()
        .start_first_load(Some(Arc::new(move |p: &syncstore::FirstLoadProgress| {
            sink.lock().push((p.inserted, p.total));
        })))
        .await
        .unwrap();

    let todos = db.table("todos").unwrap();
    // Tombstoned records are skipped.
    assert_eq!(todos.count().unwrap(), 3);
    let observed = db.sync().state();
    assert!(observed.state.first_load_done);
    assert_eq!(
        observed.state.last_pulled.get("todos").map(String::as_str),
        Some("2024-01-04T00:00:00Z")
    );
    assert_eq!(seen.lock().last(), Some(&(3, 4)));

    // Running again is a no-op.
    db.sync().start_first_load(None).await.unwrap();
    assert_eq!(remote.calls().iter().filter(|c| *c == "first_load").count(), 3);
}

#[tokio::test]
async fn pull_round_trip_sets_watermark() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());

    remote.queue_list(vec![rec(
        json!({"id": 42, "title": "r", "updated_at": "2024-03-05T10:00:00Z"}),
    )]);
    db.sync().sync_now().await.unwrap();

    let todos = db.table("todos").unwrap();
    let row = todos.where_by("title").equals("r").first().unwrap().unwrap();
    assert_eq!(row.get("server_id"), Some(&json!(42)));
    assert!(row.get("local_id").is_some());
    assert_eq!(
        db.sync().state().state.last_pulled.get("todos").map(String::as_str),
        Some("2024-03-05T10:00:00Z")
    );
}

#[tokio::test]
async fn pulling_the_same_record_twice_yields_one_row() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    let record = rec(json!({"id": 42, "title": "r", "updated_at": "2024-03-05T10:00:00Z"}));

    remote.queue_list(vec![record.clone()]);
    db.sync().sync_now().await.unwrap();
    remote.queue_list(vec![record]);
    db.sync().sync_now().await.unwrap();

    assert_eq!(db.table("todos").unwrap().count().unwrap(), 1);
}

#[tokio::test]
async fn empty_pull_leaves_watermark_untouched() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    db.sync().sync_now().await.unwrap();
    assert!(db.sync().state().state.last_pulled.is_empty());
}

#[tokio::test]
async fn push_order_is_create_update_remove() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    let todos = db.table("todos").unwrap();

    remote.queue_list(vec![
        rec(json!({"id": 100, "title": "b", "updated_at": "2024-01-01T00:00:00Z"})),
        rec(json!({"id": 101, "title": "c", "updated_at": "2024-01-01T00:00:01Z"})),
    ]);
    db.sync().sync_now().await.unwrap();
    let b = todos.where_by("title").equals("b").first().unwrap().unwrap();
    let c = todos.where_by("title").equals("c").first().unwrap().unwrap();
    let b_id = b.get("local_id").unwrap().as_str().unwrap().to_string();
    let c_id = c.get("local_id").unwrap().as_str().unwrap().to_string();

    // Queue in the worst order: remove, update, create.
    todos.delete(&c_id).unwrap();
    todos.update(&b_id, rec(json!({"title": "b2"}))).unwrap();
    todos.add(rec(json!({"title": "a"}))).unwrap();
    db.sync().sync_now().await.unwrap();

    assert_eq!(remote.mutation_calls(), vec!["add", "update:100", "remove:101"]);
    assert!(pending(&db).is_empty());
}

#[tokio::test]
async fn create_then_delete_never_reaches_the_remote() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    let todos = db.table("todos").unwrap();

    let local_id = todos.add(rec(json!({"title": "ephemeral"}))).unwrap();
    todos.delete(&local_id).unwrap();
    db.sync().sync_now().await.unwrap();

    assert!(pending(&db).is_empty());
    assert!(remote.mutation_calls().is_empty());
}

#[tokio::test]
async fn network_errors_are_classified_and_cleared() {
    let remote = MockRemote::new();
    let db = open(&remote, SyncOptions::default());
    let todos = db.table("todos").unwrap();

    remote.queue_list(vec![rec(
        json!({"id": 5, "title": "a", "updated_at": "2024-01-01T00:00:00Z"}),
    )]);
    db.sync().sync_now().await.unwrap();
    let row = todos.where_by("title").equals("a").first().unwrap().unwrap();
    let local_id = row.get("local_id").unwrap().as_str().unwrap().to_string();
    todos.update(&local_id, rec(json!({"title": "a2"}))).unwrap();

    *remote.fail_updates.lock() = true;
    assert!(db.sync().sync_now().await.is_err());
    let observed = db.sync().state();
    assert_eq!(observed.api_error.as_ref().map(|e| e.kind), Some(ApiErrorKind::Network));
    // Local work keeps queueing while the server is down.
    assert_eq!(pending(&db).len(), 1);

    *remote.fail_updates.lock() = false;
    db.sync().sync_now().await.unwrap();
    assert!(db.sync().state().api_error.is_none());
    assert!(pending(&db).is_empty());
}

#[tokio::test]
async fn resolve_conflict_both_ways() {
    for keep_local in [true, false] {
        let remote = MockRemote::new();
        let db = open(&remote, SyncOptions::default());
        let todos = db.table("todos").unwrap();

        remote.queue_list(vec![rec(
            json!({"id": 3, "title": "x", "updated_at": "2024-01-01T00:00:00Z"}),
        )]);
        db.sync().sync_now().await.unwrap();
        let row = todos.where_by("title").equals("x").first().unwrap().unwrap();
        let local_id = row.get("local_id").unwrap().as_str().unwrap().to_string();
        todos.update(&local_id, rec(json!({"title": "y"}))).unwrap();
        remote.queue_list(vec![rec(
            json!({"id": 3, "title": "z", "updated_at": "2024-01-02T00:00:00Z"}),
        )]);
        db.sync().sync_now().await.unwrap();
        assert!(db.sync().state().state.conflicts.contains_key(&local_id));

        db.sync().resolve_conflict(&local_id, keep_local).await.unwrap();
        let observed = db.sync().state();
        assert!(observed.state.conflicts.is_empty());
        let row = todos.get(&local_id).unwrap().unwrap();
        if keep_local {
            assert_eq!(row.get("title"), Some(&json!("y")));
            assert_eq!(observed.state.pending_changes.len(), 1);
        } else {
            assert_eq!(row.get("title"), Some(&json!("z")));
            assert!(observed.state.pending_changes.is_empty());
        }
    }
}

#[tokio::test]
async fn scheduler_drains_queue_on_mutation() {
    let remote = MockRemote::new();
    let db = open(
        &remote,
        SyncOptions { sync_interval: Duration::ZERO, ..Default::default() },
    );
    let sync = db.sync();
    sync.enable(true).await.unwrap();
    // Enabling twice must not start a second loop.
    sync.enable(true).await.unwrap();
    assert_eq!(db.sync().state().status, SyncStatus::Idle);

    db.table("todos").unwrap().add(rec(json!({"title": "A"}))).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !pending(&db).is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remote.added.lock().len(), 1);

    sync.enable(false).await.unwrap();
    assert_eq!(db.sync().state().status, SyncStatus::Disabled);
    db.close().await.unwrap();
}

#[tokio::test]
async fn hidden_scheduler_pauses_until_visible() {
    let remote = MockRemote::new();
    let db = open(
        &remote,
        SyncOptions { sync_interval: Duration::ZERO, ..Default::default() },
    );
    let sync = db.sync();
    sync.set_visible(false);
    sync.enable(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Paused: not even the initial pull ran.
    assert!(remote.calls().is_empty());

    db.table("todos").unwrap().add(rec(json!({"title": "A"}))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(remote.mutation_calls().is_empty());

    sync.set_visible(true);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !pending(&db).is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sync.enable(false).await.unwrap();
}

struct MockBatch {
    next_id: AtomicI64,
    pull_pages: Mutex<VecDeque<BTreeMap<String, Vec<Record>>>>,
    pushed: Mutex<Vec<PushItem>>,
}

#[async_trait]
impl RemoteBatch for MockBatch {
    fn sync_tables(&self) -> Vec<String> {
        vec!["todos".to_string(), "notes".to_string()]
    }

    async fn push(&self, changes: Vec<PushItem>) -> ApiResult<Vec<PushOutcome>> {
        let mut outcomes = Vec::new();
        for item in &changes {
            let id = match item.action {
                syncstore::PushAction::Add => {
                    Some(json!(self.next_id.fetch_add(1, Ordering::SeqCst)))
                }
                _ => item.id.clone(),
            };
            outcomes.push(PushOutcome {
                local_id: item.local_id.clone(),
                success: true,
                id,
                updated_at: Some("2024-06-01T00:00:00Z".into()),
                error: None,
            });
        }
        self.pushed.lock().extend(changes);
        Ok(outcomes)
    }

    async fn pull(
        &self,
        _since: BTreeMap<String, Option<String>>,
    ) -> ApiResult<BTreeMap<String, Vec<Record>>> {
        Ok(self.pull_pages.lock().pop_front().unwrap_or_default())
    }
}

#[tokio::test]
async fn batch_mode_round_trip() {
    let batch = Arc::new(MockBatch {
        next_id: AtomicI64::new(70),
        pull_pages: Mutex::new(VecDeque::new()),
        pushed: Mutex::new(Vec::new()),
    });
    let db = Database::open(
        Arc::new(MemoryBackend::new()),
        DatabaseConfig {
            remote: Some(Remote::Batch(Arc::clone(&batch) as Arc<dyn RemoteBatch>)),
            options: SyncOptions::default(),
        },
    )
    .unwrap();

    let todos = db.table("todos").unwrap();
    let local_id = todos.add(rec(json!({"title": "A"}))).unwrap();
    {
        let mut page = BTreeMap::new();
        page.insert(
            "notes".to_string(),
            vec![rec(json!({"id": 900, "body": "n", "updated_at": "2024-06-02T00:00:00Z"}))],
        );
        batch.pull_pages.lock().push_back(page);
    }
    db.sync().sync_now().await.unwrap();

    let row = todos.get(&local_id).unwrap().unwrap();
    assert_eq!(row.get("server_id"), Some(&json!(70)));
    assert!(pending(&db).is_empty());
    assert_eq!(batch.pushed.lock().len(), 1);

    let notes = db.table("notes").unwrap();
    assert_eq!(notes.count().unwrap(), 1);
    assert_eq!(
        db.sync().state().state.last_pulled.get("notes").map(String::as_str),
        Some("2024-06-02T00:00:00Z")
    );
}

#[tokio::test]
async fn state_survives_reopen_on_the_same_backend() {
    let backend = Arc::new(MemoryBackend::new());
    let remote = MockRemote::new();
    let mut tables: BTreeMap<String, Arc<dyn RemoteTable>> = BTreeMap::new();
    tables.insert("todos".to_string(), Arc::clone(&remote) as Arc<dyn RemoteTable>);

    let db = Database::open(
        Arc::clone(&backend) as Arc<dyn syncstore::StorageBackend>,
        DatabaseConfig {
            remote: Some(Remote::PerTable(tables.clone())),
            options: SyncOptions::default(),
        },
    )
    .unwrap();
    db.table("todos").unwrap().add(rec(json!({"title": "A"}))).unwrap();
    db.table("todos").unwrap().add(rec(json!({"title": "B"}))).unwrap();

    let reopened = Database::open(
        backend as Arc<dyn syncstore::StorageBackend>,
        DatabaseConfig { remote: Some(Remote::PerTable(tables)), options: SyncOptions::default() },
    )
    .unwrap();
    let queued = pending(&reopened);
    assert_eq!(queued.len(), 2);
    // Insertion order survives the restart.
    let titles: Vec<_> = queued
        .iter()
        .map(|c| c.changes.as_ref().unwrap().get("title").unwrap().clone())
        .collect();
    assert_eq!(titles, vec![json!("A"), json!("B")]);
}
