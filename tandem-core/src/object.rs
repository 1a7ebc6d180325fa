//! `LiveObject` state: a fixed-shape record with last-writer-wins fields.

use std::collections::BTreeMap;

use crate::value::Value;

#[derive(Debug, Clone)]
pub(crate) struct ObjectEntry {
    /// `None` once the field was deleted. The clock stays behind so that a
    /// stale `set` cannot bring the field back.
    pub value: Option<Value>,
    pub clock: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ObjectData {
    entries: BTreeMap<String, ObjectEntry>,
}

impl ObjectData {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    pub fn clock_of(&self, key: &str) -> u64 {
        self.entries.get(key).map_or(0, |e| e.clock)
    }

    /// LWW check: only a strictly newer clock wins. Ties are rejected.
    pub fn accepts(&self, key: &str, clock: u64) -> bool {
        clock > self.clock_of(key)
    }

    /// Store `value` and return whatever it displaced.
    pub fn put(&mut self, key: String, value: Value, clock: u64) -> Option<Value> {
        self.entries
            .insert(
                key,
                ObjectEntry {
                    value: Some(value),
                    clock,
                },
            )
            .and_then(|old| old.value)
    }

    pub fn remove(&mut self, key: &str, clock: u64) -> Option<Value> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert(ObjectEntry { value: None, clock });
        entry.clock = clock;
        entry.value.take()
    }

    /// Live fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_ref().map(|v| (k, v)))
    }

    /// Every value still held, for subtree release.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values().filter_map(|e| e.value.as_ref())
    }

    pub fn insert_loaded(&mut self, key: String, value: Value) {
        self.entries.insert(
            key,
            ObjectEntry {
                value: Some(value),
                clock: 0,
            },
        );
    }
}
