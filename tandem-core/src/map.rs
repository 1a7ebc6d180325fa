//! `LiveMap` state: dynamic keys with tombstoned deletes.

use std::collections::BTreeMap;

use crate::value::Value;

#[derive(Debug, Clone)]
pub(crate) struct MapEntry {
    pub value: Value,
    pub clock: u64,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MapData {
    entries: BTreeMap<String, MapEntry>,
    live_count: usize,
}

impl MapData {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .get(key)
            .filter(|e| !e.deleted)
            .map(|e| &e.value)
    }

    pub fn clock_of(&self, key: &str) -> u64 {
        self.entries.get(key).map_or(0, |e| e.clock)
    }

    pub fn accepts(&self, key: &str, clock: u64) -> bool {
        clock > self.clock_of(key)
    }

    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn put(&mut self, key: String, value: Value, clock: u64) -> Option<Value> {
        let old = self.entries.insert(
            key,
            MapEntry {
                value,
                clock,
                deleted: false,
            },
        );
        match old {
            Some(old) if !old.deleted => Some(old.value),
            _ => {
                self.live_count += 1;
                None
            }
        }
    }

    /// Turn `key` into a tombstone stamped with `clock`.
    pub fn remove(&mut self, key: &str, clock: u64) -> Option<Value> {
        let entry = self.entries.entry(key.to_string()).or_insert(MapEntry {
            value: Value::Null,
            clock,
            deleted: true,
        });
        entry.clock = clock;
        if entry.deleted {
            return None;
        }
        entry.deleted = true;
        self.live_count -= 1;
        Some(std::mem::replace(&mut entry.value, Value::Null))
    }

    /// Drop tombstones, returning how many were removed.
    pub fn compact(&mut self) -> usize {
        let removed = self.tombstone_count();
        self.entries.retain(|_, e| !e.deleted);
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.deleted)
            .map(|(k, e)| (k, &e.value))
    }

    pub fn tombstone_count(&self) -> usize {
        self.entries.len() - self.live_count
    }

    pub fn insert_loaded(&mut self, key: String, value: Value) {
        self.put(key, value, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_count_tracks_tombstones() {
        let mut map = MapData::default();
        map.put("a".into(), Value::Number(1.0), 1);
        map.put("b".into(), Value::Number(2.0), 2);
        assert_eq!(map.len(), 2);

        assert_eq!(map.remove("a", 3), Some(Value::Number(1.0)));
        assert_eq!(map.len(), 1);
        assert_eq!(map.tombstone_count(), 1);
        assert_eq!(map.remove("a", 4), None);
        assert_eq!(map.len(), 1);

        map.put("a".into(), Value::Number(9.0), 5);
        assert_eq!(map.len(), 2);
        assert_eq!(map.tombstone_count(), 0);
    }

    #[test]
    fn test_tombstone_for_unknown_key_blocks_stale_set() {
        let mut map = MapData::default();
        assert_eq!(map.remove("ghost", 7), None);
        assert_eq!(map.len(), 0);
        assert!(!map.accepts("ghost", 6));
        assert!(map.accepts("ghost", 8));
    }

    #[test]
    fn test_compact_preserves_visible_state() {
        let mut map = MapData::default();
        map.put("a".into(), Value::Bool(true), 1);
        map.put("b".into(), Value::Bool(false), 2);
        map.remove("b", 3);
        let visible: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        assert_eq!(map.compact(), 1);
        let after: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(visible, after);
        assert_eq!(map.get("b"), None);
        assert_eq!(map.len(), 1);
    }
}
