//! Coalescing sync scheduler: a single task owning a cancellable sleep,
//! driven by the periodic interval, local mutations, and visibility
//! flips.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::state::SyncStatus;
use crate::sync::{pull, push};

pub(crate) struct SyncRuntime {
    enabled: AtomicBool,
    visible: AtomicBool,
    syncing: AtomicBool,
    rerun: AtomicBool,
    wake: Notify,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Default for SyncRuntime {
    fn default() -> Self {
        SyncRuntime {
            enabled: AtomicBool::new(false),
            visible: AtomicBool::new(true),
            syncing: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            wake: Notify::new(),
            task: tokio::sync::Mutex::new(None),
        }
    }
}

/// Wake the loop early; called on local mutations while enabled.
pub(crate) fn poke(db: &DbInner) {
    if db.runtime.enabled.load(Ordering::SeqCst) {
        db.runtime.wake.notify_one();
    }
}

/// Pause on hidden, resume on visible.
pub(crate) fn set_visible(db: &DbInner, visible: bool) {
    db.runtime.visible.store(visible, Ordering::SeqCst);
    db.runtime.wake.notify_one();
}

pub(crate) async fn enable(db: &Arc<DbInner>, on: bool) -> Result<()> {
    let rt = &db.runtime;
    // Holding the task slot across the whole transition serializes
    // enable/disable, so an enable issued mid-disable waits for the old
    // loop to exit instead of racing a second one up.
    let mut task = rt.task.lock().await;
    if on {
        if rt.enabled.swap(true, Ordering::SeqCst) {
            // Already running; a second enable must not start a second
            // loop.
            return Ok(());
        }
        db.state.set_sync_status(SyncStatus::Idle);
        tracing::debug!("sync scheduler enabled");
        *task = Some(tokio::spawn(run_loop(Arc::clone(db))));
    } else {
        if !rt.enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        db.state.set_sync_status(SyncStatus::Disabling);
        rt.wake.notify_waiters();
        rt.wake.notify_one();
        if let Some(handle) = task.take() {
            let _ = handle.await;
        }
        db.state.set_sync_status(SyncStatus::Disabled);
        tracing::debug!("sync scheduler disabled");
    }
    Ok(())
}

async fn run_loop(db: Arc<DbInner>) {
    let rt = &db.runtime;
    loop {
        if !rt.enabled.load(Ordering::SeqCst) {
            break;
        }
        if !rt.visible.load(Ordering::SeqCst) {
            // Paused; wait for a visibility flip or disable.
            rt.wake.notified().await;
            continue;
        }
        if let Err(e) = sync_once(&db).await {
            tracing::warn!(error = %e, "sync cycle failed");
        }
        if !rt.enabled.load(Ordering::SeqCst) {
            break;
        }
        let interval = db.options.sync_interval;
        if interval.is_zero() {
            rt.wake.notified().await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = rt.wake.notified() => {}
            }
        }
    }
}

/// One pull-then-push cycle. Never concurrent with itself: a second
/// caller just flags a rerun and returns, and the running cycle goes
/// again once it finishes.
pub(crate) async fn sync_once(db: &Arc<DbInner>) -> Result<()> {
    let rt = &db.runtime;
    if rt
        .syncing
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        rt.rerun.store(true, Ordering::SeqCst);
        return Ok(());
    }

    let resting_status = db.state.sync_status();
    let mut first_err: Option<Error> = None;
    loop {
        rt.rerun.store(false, Ordering::SeqCst);
        db.state.set_sync_status(SyncStatus::Syncing);
        tracing::debug!("sync cycle start");

        let pull_result = pull::pull_once(db).await;
        let push_result = push::push_once(db).await;
        let cycle_err = pull_result.err().or(push_result.err());

        match &cycle_err {
            Some(e) => {
                db.state.set_api_error(Some(e.to_api_error()));
                if rt.enabled.load(Ordering::SeqCst) {
                    db.state.set_sync_status(SyncStatus::Error);
                }
            }
            None => {
                db.state.set_api_error(None);
                if rt.enabled.load(Ordering::SeqCst) {
                    db.state.set_sync_status(SyncStatus::Idle);
                }
            }
        }
        if !rt.enabled.load(Ordering::SeqCst) && resting_status == SyncStatus::Disabled {
            // Manual cycle with the scheduler off: restore the resting
            // status once results are applied.
            db.state.set_sync_status(resting_status);
        }
        if let Some(e) = cycle_err {
            first_err.get_or_insert(e);
        }

        if !rt.rerun.swap(false, Ordering::SeqCst) {
            break;
        }
        tracing::debug!("mutations arrived mid-cycle; running again");
    }
    rt.syncing.store(false, Ordering::SeqCst);
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
