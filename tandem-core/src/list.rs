//! `LiveList` state: items ordered by fractional position.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{Result, StorageError};
use crate::fractional_index::generate_key_between;
use crate::value::Value;

#[derive(Debug, Clone)]
pub(crate) struct ListItem {
    pub position: String,
    pub value: Value,
    pub clock: u64,
    /// Serialized form of the inserted value. Breaks ties between
    /// concurrent inserts that landed on the same position and clock.
    pub tiebreak: String,
}

impl ListItem {
    fn order(&self, other: &ListItem) -> Ordering {
        self.position
            .cmp(&other.position)
            .then(self.clock.cmp(&other.clock))
            .then_with(|| self.tiebreak.cmp(&other.tiebreak))
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ListData {
    items: Vec<ListItem>,
    /// Old position -> new position for every applied move, so operations
    /// issued against a pre-move position still find their item.
    moved: HashMap<String, String>,
}

impl ListData {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, index: usize) -> Option<&ListItem> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListItem> {
        self.items.iter()
    }

    pub fn index_of_position(&self, position: &str) -> Option<usize> {
        self.find(position).or_else(|| {
            let current = self.moved.get(position)?;
            self.find(current)
        })
    }

    fn find(&self, position: &str) -> Option<usize> {
        self.items.iter().position(|i| i.position == position)
    }

    pub fn contains_exact(&self, position: &str, clock: u64) -> bool {
        self.items
            .iter()
            .any(|i| i.position == position && i.clock == clock)
    }

    /// Insert in sorted order, returning the resulting index.
    pub fn insert(&mut self, item: ListItem) -> usize {
        let index = self
            .items
            .partition_point(|existing| existing.order(&item) == Ordering::Less);
        self.items.insert(index, item);
        index
    }

    pub fn remove(&mut self, index: usize) -> ListItem {
        let item = self.items.remove(index);
        if self.find(&item.position).is_none() {
            self.moved.retain(|_, to| *to != item.position);
        }
        item
    }

    /// Reposition the item at `index`, returning its new index.
    pub fn move_item(&mut self, index: usize, position: String, clock: u64) -> usize {
        let mut item = self.items.remove(index);
        if item.position != position {
            // Aliases always point at a live position: one hop resolves.
            for to in self.moved.values_mut() {
                if *to == item.position {
                    *to = position.clone();
                }
            }
            self.moved.remove(&position);
            self.moved.insert(item.position.clone(), position.clone());
        }
        item.position = position;
        item.clock = clock;
        self.insert(item)
    }

    /// Position for a new item that should end up at `index`.
    pub fn position_for_insert(&self, index: usize) -> Result<String> {
        if index > self.items.len() {
            return Err(StorageError::IndexOutOfBounds {
                index,
                len: self.items.len(),
            });
        }
        let positions: Vec<&str> = self.items.iter().map(|i| i.position.as_str()).collect();
        let (before, after) = neighbours(&positions, index);
        Ok(generate_key_between(before, after)?)
    }

    /// Position that puts the item currently at `from` at index `to`.
    pub fn position_for_move(&self, from: usize, to: usize) -> Result<String> {
        let len = self.items.len();
        for index in [from, to] {
            if index >= len {
                return Err(StorageError::IndexOutOfBounds { index, len });
            }
        }
        let others: Vec<&str> = self
            .items
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != from)
            .map(|(_, item)| item.position.as_str())
            .collect();
        let (before, after) = neighbours(&others, to);
        Ok(generate_key_between(before, after)?)
    }

    pub fn insert_loaded(&mut self, position: String, value: Value, tiebreak: String) {
        self.insert(ListItem {
            position,
            value,
            clock: 0,
            tiebreak,
        });
    }
}

/// Bounds for a key landing at `index` in sorted `positions`.
///
/// Concurrent inserts can leave several items on one position. No key fits
/// between equal neighbours, so the upper bound skips past the run and the
/// new key lands right after it.
fn neighbours<'a>(positions: &[&'a str], index: usize) -> (Option<&'a str>, Option<&'a str>) {
    let before = index.checked_sub(1).and_then(|i| positions.get(i)).copied();
    let after = match before {
        Some(lower) => positions.iter().skip(index).copied().find(|p| *p > lower),
        None => positions.get(index).copied(),
    };
    (before, after)
}
