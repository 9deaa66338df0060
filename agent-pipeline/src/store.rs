//! Shared mutable state for one pipeline instance.
//!
//! The store is owned by the [`Pipeline`](crate::engine::Pipeline) and only
//! mutated from its control sequence, so mutation takes `&mut self` and no
//! locking is involved. Listeners run synchronously and completely before
//! `set_value` returns.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handle returned by [`WorkflowStore::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&str, &Value) + Send>;

/// Reactive key/value container scoped to one pipeline instance.
#[derive(Default)]
pub struct WorkflowStore {
    values: HashMap<String, Value>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Set a value and synchronously notify every subscriber before
    /// returning.
    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.values.insert(key.clone(), value.clone());
        for (_, listener) in self.listeners.iter_mut() {
            listener(&key, &value);
        }
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&str, &Value) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a subscription. Returns false when the id was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Immutable copy of the current values.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Point-in-time copy of the store, handed to plan builders, continuation
/// predicates and run reports. Keys iterate in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreSnapshot {
    values: BTreeMap<String, Value>,
}

impl StoreSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_set_and_get() {
        let mut store = WorkflowStore::new();
        assert!(store.get_value("answer").is_none());

        store.set_value("answer", json!(42));
        assert_eq!(store.get_value("answer"), Some(&json!(42)));

        store.set_value("answer", json!(43));
        assert_eq!(store.get_value("answer"), Some(&json!(43)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_listeners_run_before_set_value_returns() {
        let mut store = WorkflowStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        store.subscribe(move |key, value| {
            sink.lock().unwrap().push((key.to_string(), value.clone()));
        });

        store.set_value("a", json!(1));
        // Delivery is synchronous: the mutation is visible immediately.
        assert_eq!(seen.lock().unwrap().as_slice(), &[("a".to_string(), json!(1))]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut store = WorkflowStore::new();
        let count = Arc::new(Mutex::new(0usize));

        let sink = count.clone();
        let id = store.subscribe(move |_, _| *sink.lock().unwrap() += 1);

        store.set_value("a", json!(1));
        assert!(store.unsubscribe(id));
        store.set_value("b", json!(2));

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(!store.unsubscribe(id));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut store = WorkflowStore::new();
        store.set_value("k", json!("v1"));

        let snapshot = store.snapshot();
        store.set_value("k", json!("v2"));

        assert_eq!(snapshot.get("k"), Some(&json!("v1")));
        assert_eq!(store.get_value("k"), Some(&json!("v2")));
    }
}
