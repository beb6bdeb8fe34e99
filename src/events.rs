use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// What kind of change a mutation event describes. `Pull` marks changes
/// applied from the remote; the rest are local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Add,
    Update,
    Delete,
    Pull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

impl MutationEvent {
    pub fn new(kind: MutationKind, table: impl Into<String>, keys: Vec<String>) -> Self {
        MutationEvent { kind, table: table.into(), keys: Some(keys) }
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Listener registry with explicit unsubscribe handles.
pub struct Bus<T> {
    listeners: Arc<Mutex<Vec<(u64, Listener<T>)>>>,
    next_id: AtomicU64,
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Bus { listeners: Arc::new(Mutex::new(Vec::new())), next_id: AtomicU64::new(1) }
    }
}

impl<T: 'static> Bus<T> {
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        let listeners = Arc::clone(&self.listeners);
        Subscription {
            cancel: Box::new(move || {
                listeners.lock().retain(|(i, _)| *i != id);
            }),
        }
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> =
            self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in snapshot {
            listener(value);
        }
    }
}

/// Handle returned by subscribe calls; dropping it keeps the
/// subscription alive, `unsubscribe` removes it.
pub struct Subscription {
    cancel: Box<dyn FnOnce() + Send>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        (self.cancel)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_subscribers_until_unsubscribed() {
        let bus: Bus<MutationEvent> = Bus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let event = MutationEvent::new(MutationKind::Add, "todos", vec!["a".into()]);
        bus.emit(&event);
        sub.unsubscribe();
        bus.emit(&event);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_serializes_with_lowercase_type() {
        let event = MutationEvent::new(MutationKind::Pull, "todos", vec!["a".into()]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "pull");
        assert_eq!(json["table"], "todos");
    }
}
