//! Undo/redo history.
//!
//! Every local mutation records its forward operation together with the
//! operation that reverts it. Entries are grouped by batch: everything
//! recorded between the outermost [`History::start_batch`] and its matching
//! [`History::end_batch`] undoes as one step.

use std::collections::VecDeque;

use crate::op::StorageOp;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryEntry {
    /// Operations in the order they were performed.
    pub forward: Vec<StorageOp>,
    /// Reverting operations, already in the order they must be applied.
    pub inverse: Vec<StorageOp>,
}

#[derive(Debug)]
pub struct History {
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
    pending: Option<HistoryEntry>,
    batch_depth: usize,
    limit: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl History {
    /// History keeping at most `limit` undo entries (oldest dropped first).
    pub fn new(limit: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            pending: None,
            batch_depth: 0,
            limit: limit.max(1),
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn is_batching(&self) -> bool {
        self.batch_depth > 0
    }

    pub fn start_batch(&mut self) {
        self.batch_depth += 1;
        if self.batch_depth == 1 {
            self.pending = Some(HistoryEntry::default());
        }
    }

    /// Close the innermost batch. Closing the outermost one commits the
    /// collected entry, unless nothing was recorded.
    pub fn end_batch(&mut self) {
        if self.batch_depth == 0 {
            return;
        }
        self.batch_depth -= 1;
        if self.batch_depth == 0 {
            if let Some(entry) = self.pending.take() {
                if !entry.forward.is_empty() {
                    self.commit(entry);
                }
            }
        }
    }

    /// Ops that revert the latest entry, or `None` with nothing to undo.
    pub fn undo(&mut self) -> Option<Vec<StorageOp>> {
        let entry = self.undo_stack.pop_back()?;
        let ops = entry.inverse.clone();
        self.redo_stack.push(entry);
        Some(ops)
    }

    /// Ops that re-apply the latest undone entry.
    pub fn redo(&mut self) -> Option<Vec<StorageOp>> {
        let entry = self.redo_stack.pop()?;
        let ops = entry.forward.clone();
        self.undo_stack.push_back(entry);
        Some(ops)
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.pending = None;
        self.batch_depth = 0;
    }

    pub(crate) fn record(&mut self, forward: StorageOp, inverse: StorageOp) {
        match self.pending.as_mut() {
            Some(entry) => {
                entry.forward.push(forward);
                entry.inverse.push(inverse);
            }
            None => self.commit(HistoryEntry {
                forward: vec![forward],
                inverse: vec![inverse],
            }),
        }
    }

    fn commit(&mut self, mut entry: HistoryEntry) {
        entry.inverse.reverse();
        self.undo_stack.push_back(entry);
        while self.undo_stack.len() > self.limit {
            self.undo_stack.pop_front();
        }
        self.redo_stack.clear();
    }
}
