//! The replicated document: container arena, op application, snapshots,
//! subscriptions and undo/redo.
//!
//! All containers of a document live in one arena and are addressed by
//! [`NodeId`]. Parents are plain handles, so a subtree is freed simply by
//! releasing its slots; handles held by callers then go stale and every
//! accessor reports [`StorageError::StaleNode`].
//!
//! Local mutations (`set`, `list_insert`, ...) tick the clock, apply, record
//! history, emit the op through the hook and notify subscribers. Remote
//! operations go through [`Document::apply_op`], which merges the clock and
//! leaves history and the hook alone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use log::{debug, trace};

use crate::arena::Arena;
use crate::clock::LamportClock;
use crate::error::{Result, StorageError};
use crate::history::History;
use crate::list::{ListData, ListItem};
use crate::map::MapData;
use crate::object::ObjectData;
use crate::op::{ApplyOutcome, StorageOp};
use crate::value::{
    ContainerKind, NodeId, SerializedContainer, SerializedCrdt, SerializedListItem, Value,
};

/// Receives every batch of locally generated operations.
pub type OpsHook = Box<dyn FnMut(&[StorageOp]) + Send>;

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    target: NodeId,
    deep: bool,
    callback: Callback,
}

/// Whether a local mutation enters the undo history. Undo/redo replay runs
/// with `Replay` so that undoing never creates a new undoable entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recording {
    Record,
    Replay,
}

enum NodeData {
    Object(ObjectData),
    Map(MapData),
    List(ListData),
}

impl NodeData {
    fn kind(&self) -> ContainerKind {
        match self {
            NodeData::Object(_) => ContainerKind::Object,
            NodeData::Map(_) => ContainerKind::Map,
            NodeData::List(_) => ContainerKind::List,
        }
    }

    fn children(&self) -> Vec<NodeId> {
        match self {
            NodeData::Object(o) => o.values().filter_map(Value::as_node).collect(),
            NodeData::Map(m) => m.iter().filter_map(|(_, v)| v.as_node()).collect(),
            NodeData::List(l) => l.iter().filter_map(|i| i.value.as_node()).collect(),
        }
    }

    fn keyed_get(&self, key: &str) -> Option<&Value> {
        match self {
            NodeData::Object(o) => o.get(key),
            NodeData::Map(m) => m.get(key),
            NodeData::List(_) => None,
        }
    }

    fn keyed_accepts(&self, key: &str, clock: u64) -> bool {
        match self {
            NodeData::Object(o) => o.accepts(key, clock),
            NodeData::Map(m) => m.accepts(key, clock),
            NodeData::List(_) => false,
        }
    }

    fn keyed_put(&mut self, key: String, value: Value, clock: u64) -> Option<Value> {
        match self {
            NodeData::Object(o) => o.put(key, value, clock),
            NodeData::Map(m) => m.put(key, value, clock),
            NodeData::List(_) => None,
        }
    }

    fn keyed_remove(&mut self, key: &str, clock: u64) -> Option<Value> {
        match self {
            NodeData::Object(o) => o.remove(key, clock),
            NodeData::Map(m) => m.remove(key, clock),
            NodeData::List(_) => None,
        }
    }

    fn keyed_iter(&self) -> Option<Box<dyn Iterator<Item = (&String, &Value)> + '_>> {
        match self {
            NodeData::Object(o) => Some(Box::new(o.iter())),
            NodeData::Map(m) => Some(Box::new(m.iter())),
            NodeData::List(_) => None,
        }
    }
}

struct Node {
    parent: Option<NodeId>,
    /// Key (object/map) or position (list) under the parent. Empty for the root.
    segment: String,
    data: NodeData,
    immutable: OnceLock<Arc<serde_json::Value>>,
}

pub struct Document {
    clock: LamportClock,
    arena: Arena<Node>,
    root: NodeId,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_subscription: u64,
    history: History,
    on_ops_generated: Option<OpsHook>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("clock", &self.clock.value())
            .field("root", &self.root)
            .field("nodes", &self.arena.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("history", &self.history)
            .finish()
    }
}

impl Document {
    /// Empty document whose root is an empty `LiveObject`.
    pub fn new() -> Self {
        let mut arena = Arena::default();
        let root = arena.insert(Node {
            parent: None,
            segment: String::new(),
            data: NodeData::Object(ObjectData::default()),
            immutable: OnceLock::new(),
        });
        Self {
            clock: LamportClock::new(),
            arena,
            root,
            subscriptions: BTreeMap::new(),
            next_subscription: 0,
            history: History::default(),
            on_ops_generated: None,
        }
    }

    /// Rehydrate a document from a snapshot. The clock stays at zero and no
    /// operations are emitted.
    pub fn deserialize(data: &SerializedCrdt) -> Result<Self> {
        let mut doc = Self::new();
        doc.replace_root(data)?;
        Ok(doc)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Current Lamport clock value.
    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.arena.get(id).is_some()
    }

    pub fn kind(&self, id: NodeId) -> Result<ContainerKind> {
        Ok(self.node(id)?.data.kind())
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.node(id)?.parent)
    }

    /// Keys and positions leading from the root to `id`.
    pub fn path(&self, id: NodeId) -> Result<Vec<String>> {
        let mut segments = Vec::new();
        let mut current = self.node(id)?;
        while let Some(parent) = current.parent {
            segments.push(current.segment.clone());
            current = self.node(parent)?;
        }
        segments.reverse();
        Ok(segments)
    }

    /// Walk `path` from the root. `None` if any segment no longer resolves.
    pub fn resolve(&self, path: &[String]) -> Option<NodeId> {
        path.iter()
            .try_fold(self.root, |current, segment| self.child(current, segment))
    }

    pub fn set_on_ops_generated<F>(&mut self, hook: F)
    where
        F: FnMut(&[StorageOp]) + Send + 'static,
    {
        self.on_ops_generated = Some(Box::new(hook));
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }

    // ─── Object / Map ───────────────────────────────────────────────

    pub fn get(&self, id: NodeId, key: &str) -> Result<Option<Value>> {
        Ok(self.keyed(id)?.keyed_get(key).cloned())
    }

    pub fn has(&self, id: NodeId, key: &str) -> Result<bool> {
        Ok(self.keyed(id)?.keyed_get(key).is_some())
    }

    /// Number of live entries. O(1) for maps.
    pub fn size(&self, id: NodeId) -> Result<usize> {
        Ok(match &self.node(id)?.data {
            NodeData::Object(o) => o.iter().count(),
            NodeData::Map(m) => m.len(),
            NodeData::List(l) => l.len(),
        })
    }

    pub fn keys(&self, id: NodeId) -> Result<Vec<String>> {
        Ok(self.keyed_iter(id)?.map(|(k, _)| k.clone()).collect())
    }

    pub fn values(&self, id: NodeId) -> Result<Vec<Value>> {
        Ok(self.keyed_iter(id)?.map(|(_, v)| v.clone()).collect())
    }

    pub fn entries(&self, id: NodeId) -> Result<Vec<(String, Value)>> {
        Ok(self
            .keyed_iter(id)?
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Live fields of a `LiveObject`.
    pub fn to_object(&self, id: NodeId) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .object(id)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub fn set(
        &mut self,
        id: NodeId,
        key: impl Into<String>,
        value: impl Into<SerializedCrdt>,
    ) -> Result<()> {
        self.keyed(id)?;
        let op = StorageOp::Set {
            path: self.path(id)?,
            key: key.into(),
            value: value.into(),
            clock: self.clock.tick(),
        };
        self.perform(id, op);
        Ok(())
    }

    /// Set several `LiveObject` fields as one undoable step.
    pub fn update<K, V, I>(&mut self, id: NodeId, fields: I) -> Result<()>
    where
        K: Into<String>,
        V: Into<SerializedCrdt>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.object(id)?;
        self.history.start_batch();
        let result = fields
            .into_iter()
            .try_for_each(|(key, value)| self.set(id, key, value));
        self.history.end_batch();
        result
    }

    /// Delete a key. Deleting a missing key does nothing.
    pub fn delete(&mut self, id: NodeId, key: &str) -> Result<()> {
        if self.keyed(id)?.keyed_get(key).is_none() {
            return Ok(());
        }
        let op = StorageOp::Delete {
            path: self.path(id)?,
            key: key.to_string(),
            clock: self.clock.tick(),
        };
        self.perform(id, op);
        Ok(())
    }

    /// Drop a map's tombstones. Returns how many were removed.
    pub fn compact(&mut self, id: NodeId) -> Result<usize> {
        match self.node_mut(id)?.data {
            NodeData::Map(ref mut m) => Ok(m.compact()),
            ref other => Err(StorageError::WrongContainer {
                expected: "LiveMap",
                found: other.kind(),
            }),
        }
    }

    // ─── List ───────────────────────────────────────────────────────

    pub fn list_len(&self, id: NodeId) -> Result<usize> {
        Ok(self.list(id)?.len())
    }

    pub fn list_get(&self, id: NodeId, index: usize) -> Result<Option<Value>> {
        Ok(self.list(id)?.get(index).map(|item| item.value.clone()))
    }

    pub fn to_array(&self, id: NodeId) -> Result<Vec<Value>> {
        Ok(self.list(id)?.iter().map(|item| item.value.clone()).collect())
    }

    pub fn list_push(&mut self, id: NodeId, value: impl Into<SerializedCrdt>) -> Result<()> {
        let len = self.list(id)?.len();
        self.list_insert(id, len, value)
    }

    pub fn list_insert(
        &mut self,
        id: NodeId,
        index: usize,
        value: impl Into<SerializedCrdt>,
    ) -> Result<()> {
        let position = self.list(id)?.position_for_insert(index)?;
        let op = StorageOp::ListInsert {
            path: self.path(id)?,
            position,
            value: value.into(),
            clock: self.clock.tick(),
        };
        self.perform(id, op);
        Ok(())
    }

    pub fn list_delete(&mut self, id: NodeId, index: usize) -> Result<()> {
        let list = self.list(id)?;
        let position = list
            .get(index)
            .map(|item| item.position.clone())
            .ok_or(StorageError::IndexOutOfBounds {
                index,
                len: list.len(),
            })?;
        let op = StorageOp::ListDelete {
            path: self.path(id)?,
            position,
            clock: self.clock.tick(),
        };
        self.perform(id, op);
        Ok(())
    }

    /// Move the item at `from` so that it ends up at index `to`.
    pub fn list_move(&mut self, id: NodeId, from: usize, to: usize) -> Result<()> {
        let list = self.list(id)?;
        let to_position = list.position_for_move(from, to)?;
        if from == to {
            return Ok(());
        }
        let from_position = list
            .get(from)
            .map(|item| item.position.clone())
            .ok_or(StorageError::IndexOutOfBounds {
                index: from,
                len: list.len(),
            })?;
        let op = StorageOp::ListMove {
            path: self.path(id)?,
            from_position,
            to_position,
            clock: self.clock.tick(),
        };
        self.perform(id, op);
        Ok(())
    }

    // ─── Snapshots ──────────────────────────────────────────────────

    pub fn serialize(&self) -> SerializedCrdt {
        self.serialize_node(self.root)
            .unwrap_or(SerializedCrdt::Null)
    }

    pub fn serialize_node(&self, id: NodeId) -> Result<SerializedCrdt> {
        let container = match &self.node(id)?.data {
            NodeData::Object(o) => SerializedContainer::LiveObject {
                data: o
                    .iter()
                    .map(|(k, v)| (k.clone(), self.serialize_value(v)))
                    .collect(),
            },
            NodeData::Map(m) => SerializedContainer::LiveMap {
                entries: m
                    .iter()
                    .map(|(k, v)| (k.clone(), self.serialize_value(v)))
                    .collect(),
            },
            NodeData::List(l) => SerializedContainer::LiveList {
                items: l
                    .iter()
                    .map(|item| SerializedListItem {
                        position: item.position.clone(),
                        value: self.serialize_value(&item.value),
                    })
                    .collect(),
            },
        };
        Ok(SerializedCrdt::Container(container))
    }

    /// Plain JSON view of a container. The returned `Arc` is the same
    /// allocation on every call until the container or one of its
    /// descendants changes.
    pub fn to_immutable(&self, id: NodeId) -> Result<Arc<serde_json::Value>> {
        let node = self.node(id)?;
        Ok(node
            .immutable
            .get_or_init(|| Arc::new(self.build_immutable(&node.data)))
            .clone())
    }

    /// Replace the whole tree. Subscriptions move to the node at the same
    /// path in the new tree (or the deepest ancestor of it that still
    /// exists) and each fires once. Subscriptions whose node was already
    /// removed are dropped. History is cleared.
    pub fn apply_snapshot(&mut self, data: &SerializedCrdt) -> Result<()> {
        let mut paths = Vec::with_capacity(self.subscriptions.len());
        let mut stale = Vec::new();
        for (id, sub) in &self.subscriptions {
            match self.path(sub.target) {
                Ok(path) => paths.push((*id, path)),
                Err(_) => stale.push(*id),
            }
        }

        self.replace_root(data)?;

        // Targets already gone have no path to follow into the new tree.
        for id in stale {
            self.subscriptions.remove(&id);
        }

        let mut callbacks = Vec::with_capacity(paths.len());
        for (id, path) in paths {
            let target = self.resolve_deepest(&path);
            if let Some(sub) = self.subscriptions.get_mut(&id) {
                sub.target = target;
                callbacks.push(sub.callback.clone());
            }
        }
        self.history.clear();
        debug!(
            "snapshot applied, {} subscriptions retargeted",
            callbacks.len()
        );
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    // ─── Remote operations ──────────────────────────────────────────

    /// Merge one remote operation.
    pub fn apply_op(&mut self, op: &StorageOp) -> ApplyOutcome {
        self.clock.merge(op.clock());
        let outcome = match self.resolve(op.path()) {
            Some(target) => self.apply_to(target, op),
            None => ApplyOutcome::Unresolved,
        };
        match outcome {
            ApplyOutcome::Applied => {}
            ApplyOutcome::Stale => debug!(
                "stale {} at {:?} (clock {})",
                op.type_name(),
                op.path(),
                op.clock()
            ),
            ApplyOutcome::Unresolved => debug!(
                "dropping {} for unresolved path {:?}",
                op.type_name(),
                op.path()
            ),
        }
        outcome
    }

    /// Merge remote operations in order. Returns how many applied.
    pub fn apply_ops(&mut self, ops: &[StorageOp]) -> usize {
        ops.iter()
            .filter(|op| self.apply_op(op) == ApplyOutcome::Applied)
            .count()
    }

    // ─── Subscriptions ──────────────────────────────────────────────

    /// Call `callback` whenever `target` or anything below it changes.
    ///
    /// Change notifications walk from the mutated container up to the root,
    /// so shallow subscriptions on an ancestor fire for descendant changes
    /// just like deep ones do. Each subscription fires at most once per
    /// mutation.
    pub fn subscribe<F>(&mut self, target: NodeId, callback: F, deep: bool) -> Result<SubscriptionId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.node(target)?;
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions.insert(
            id,
            Subscription {
                target,
                deep,
                callback: Arc::new(callback),
            },
        );
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    // ─── History ────────────────────────────────────────────────────

    /// Run `f` as one undoable step.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.history.start_batch();
        let result = f(self);
        self.history.end_batch();
        result
    }

    /// Re-stamp `ops` with fresh clocks and apply them as local mutations
    /// without recording history. Applied ops are emitted through the hook
    /// and returned.
    pub fn apply_local_ops(&mut self, ops: Vec<StorageOp>) -> Vec<StorageOp> {
        let mut applied = Vec::with_capacity(ops.len());
        for mut op in ops {
            op.set_clock(self.clock.tick());
            let Some(target) = self.resolve(op.path()) else {
                debug!("replay skipped {} at {:?}", op.type_name(), op.path());
                continue;
            };
            if self.commit_local(target, &op, Recording::Replay) {
                applied.push(op);
            }
        }
        if !applied.is_empty() {
            self.emit(&applied);
        }
        applied
    }

    pub fn undo(&mut self) -> Option<Vec<StorageOp>> {
        let ops = self.history.undo()?;
        Some(self.apply_local_ops(ops))
    }

    pub fn redo(&mut self) -> Option<Vec<StorageOp>> {
        let ops = self.history.redo()?;
        Some(self.apply_local_ops(ops))
    }

    // ─── Internals ──────────────────────────────────────────────────

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.arena.get(id).ok_or(StorageError::StaleNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.arena.get_mut(id).ok_or(StorageError::StaleNode(id))
    }

    fn object(&self, id: NodeId) -> Result<&ObjectData> {
        match &self.node(id)?.data {
            NodeData::Object(o) => Ok(o),
            other => Err(StorageError::WrongContainer {
                expected: "LiveObject",
                found: other.kind(),
            }),
        }
    }

    fn list(&self, id: NodeId) -> Result<&ListData> {
        match &self.node(id)?.data {
            NodeData::List(l) => Ok(l),
            other => Err(StorageError::WrongContainer {
                expected: "LiveList",
                found: other.kind(),
            }),
        }
    }

    fn keyed(&self, id: NodeId) -> Result<&NodeData> {
        let data = &self.node(id)?.data;
        match data {
            NodeData::List(_) => Err(StorageError::WrongContainer {
                expected: "LiveObject or LiveMap",
                found: ContainerKind::List,
            }),
            _ => Ok(data),
        }
    }

    fn keyed_iter(&self, id: NodeId) -> Result<Box<dyn Iterator<Item = (&String, &Value)> + '_>> {
        self.keyed(id)?
            .keyed_iter()
            .ok_or(StorageError::WrongContainer {
                expected: "LiveObject or LiveMap",
                found: ContainerKind::List,
            })
    }

    fn child(&self, id: NodeId, segment: &str) -> Option<NodeId> {
        match &self.arena.get(id)?.data {
            NodeData::Object(o) => o.get(segment)?.as_node(),
            NodeData::Map(m) => m.get(segment)?.as_node(),
            NodeData::List(l) => {
                let index = l.index_of_position(segment)?;
                l.get(index)?.value.as_node()
            }
        }
    }

    fn resolve_deepest(&self, path: &[String]) -> NodeId {
        let mut current = self.root;
        for segment in path {
            match self.child(current, segment) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    /// `id` followed by all of its ancestors.
    fn chain(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            chain.push(node_id);
            current = self.arena.get(node_id).and_then(|n| n.parent);
        }
        chain
    }

    fn replace_root(&mut self, data: &SerializedCrdt) -> Result<()> {
        let container = match data {
            SerializedCrdt::Container(c @ SerializedContainer::LiveObject { .. }) => c,
            _ => return Err(StorageError::InvalidRoot),
        };
        self.release_node(self.root);
        self.root = self.build_node(container, None, "");
        Ok(())
    }

    fn build_value(&mut self, value: &SerializedCrdt, parent: NodeId, segment: &str) -> Value {
        match value {
            SerializedCrdt::Container(container) => {
                Value::Node(self.build_node(container, Some(parent), segment))
            }
            scalar => scalar.as_scalar().unwrap_or(Value::Null),
        }
    }

    /// Attach a deserialized container. Nested entries start at clock 0.
    fn build_node(
        &mut self,
        container: &SerializedContainer,
        parent: Option<NodeId>,
        segment: &str,
    ) -> NodeId {
        let data = match container {
            SerializedContainer::LiveObject { .. } => NodeData::Object(ObjectData::default()),
            SerializedContainer::LiveMap { .. } => NodeData::Map(MapData::default()),
            SerializedContainer::LiveList { .. } => NodeData::List(ListData::default()),
        };
        let id = self.arena.insert(Node {
            parent,
            segment: segment.to_string(),
            data,
            immutable: OnceLock::new(),
        });

        match container {
            SerializedContainer::LiveObject { data } => {
                for (key, value) in data {
                    let built = self.build_value(value, id, key);
                    if let Some(NodeData::Object(o)) = self.data_mut(id) {
                        o.insert_loaded(key.clone(), built);
                    }
                }
            }
            SerializedContainer::LiveMap { entries } => {
                for (key, value) in entries {
                    let built = self.build_value(value, id, key);
                    if let Some(NodeData::Map(m)) = self.data_mut(id) {
                        m.insert_loaded(key.clone(), built);
                    }
                }
            }
            SerializedContainer::LiveList { items } => {
                for item in items {
                    let built = self.build_value(&item.value, id, &item.position);
                    let tiebreak = item.value.sort_key();
                    if let Some(NodeData::List(l)) = self.data_mut(id) {
                        l.insert_loaded(item.position.clone(), built, tiebreak);
                    }
                }
            }
        }
        id
    }

    fn data_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        self.arena.get_mut(id).map(|n| &mut n.data)
    }

    fn release_value(&mut self, value: &Value) {
        if let Value::Node(id) = value {
            self.release_node(*id);
        }
    }

    fn release_node(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.arena.remove(next) {
                stack.extend(node.data.children());
            }
        }
    }

    fn serialize_value(&self, value: &Value) -> SerializedCrdt {
        match value {
            Value::Null => SerializedCrdt::Null,
            Value::Bool(b) => SerializedCrdt::Bool(*b),
            Value::Number(n) => SerializedCrdt::Number(*n),
            Value::String(s) => SerializedCrdt::String(s.clone()),
            Value::Node(id) => self.serialize_node(*id).unwrap_or(SerializedCrdt::Null),
        }
    }

    fn build_immutable(&self, data: &NodeData) -> serde_json::Value {
        match data {
            NodeData::Object(o) => serde_json::Value::Object(
                o.iter()
                    .map(|(k, v)| (k.clone(), self.immutable_value(v)))
                    .collect(),
            ),
            NodeData::Map(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), self.immutable_value(v)))
                    .collect(),
            ),
            NodeData::List(l) => serde_json::Value::Array(
                l.iter().map(|item| self.immutable_value(&item.value)).collect(),
            ),
        }
    }

    fn immutable_value(&self, value: &Value) -> serde_json::Value {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Node(id) => self
                .to_immutable(*id)
                .map(|v| v.as_ref().clone())
                .unwrap_or(serde_json::Value::Null),
        }
    }

    fn invalidate(&mut self, id: NodeId) {
        for node_id in self.chain(id) {
            if let Some(node) = self.arena.get_mut(node_id) {
                node.immutable.take();
            }
        }
    }

    fn notify(&self, changed: NodeId) {
        let chain = self.chain(changed);
        let fired: Vec<&Subscription> = self
            .subscriptions
            .values()
            .filter(|sub| chain.contains(&sub.target))
            .collect();
        if fired.is_empty() {
            return;
        }
        trace!(
            "notify {changed}: {} deep, {} shallow",
            fired.iter().filter(|s| s.deep).count(),
            fired.iter().filter(|s| !s.deep).count()
        );
        let callbacks: Vec<Callback> = fired.into_iter().map(|s| s.callback.clone()).collect();
        for callback in callbacks {
            callback();
        }
    }

    fn emit(&mut self, ops: &[StorageOp]) {
        if let Some(hook) = self.on_ops_generated.as_mut() {
            hook(ops);
        }
    }

    /// Apply a freshly stamped local op, record it, and emit it.
    fn perform(&mut self, target: NodeId, op: StorageOp) {
        if self.commit_local(target, &op, Recording::Record) {
            self.emit(std::slice::from_ref(&op));
        }
    }

    fn commit_local(&mut self, target: NodeId, op: &StorageOp, recording: Recording) -> bool {
        let inverse = self.inverse_of(target, op);
        if self.apply_to(target, op) != ApplyOutcome::Applied {
            return false;
        }
        if recording == Recording::Record {
            if let Some(inverse) = inverse {
                self.history.record(op.clone(), inverse);
            }
        }
        true
    }

    /// The op that undoes `op` on `target`, captured before it applies.
    fn inverse_of(&self, target: NodeId, op: &StorageOp) -> Option<StorageOp> {
        let data = &self.arena.get(target)?.data;
        let path = op.path().to_vec();
        let inverse = match op {
            StorageOp::Set { key, .. } | StorageOp::Delete { key, .. } => {
                match data.keyed_get(key) {
                    Some(previous) => StorageOp::Set {
                        path,
                        key: key.clone(),
                        value: self.serialize_value(previous),
                        clock: 0,
                    },
                    None => StorageOp::Delete {
                        path,
                        key: key.clone(),
                        clock: 0,
                    },
                }
            }
            StorageOp::ListInsert { position, .. } => StorageOp::ListDelete {
                path,
                position: position.clone(),
                clock: 0,
            },
            StorageOp::ListDelete { position, .. } => {
                let NodeData::List(list) = data else {
                    return None;
                };
                let item = list.get(list.index_of_position(position)?)?;
                StorageOp::ListInsert {
                    path,
                    position: item.position.clone(),
                    value: self.serialize_value(&item.value),
                    clock: 0,
                }
            }
            StorageOp::ListMove {
                from_position,
                to_position,
                ..
            } => StorageOp::ListMove {
                path,
                from_position: to_position.clone(),
                to_position: from_position.clone(),
                clock: 0,
            },
        };
        Some(inverse)
    }

    /// Container-level merge of one op into the resolved `target`.
    fn apply_to(&mut self, target: NodeId, op: &StorageOp) -> ApplyOutcome {
        let Some(kind) = self.arena.get(target).map(|n| n.data.kind()) else {
            return ApplyOutcome::Unresolved;
        };

        let outcome = match (op, kind) {
            (
                StorageOp::Set {
                    key, value, clock, ..
                },
                ContainerKind::Object | ContainerKind::Map,
            ) => {
                let accepted = self
                    .data_mut(target)
                    .is_some_and(|d| d.keyed_accepts(key, *clock));
                if accepted {
                    let built = self.build_value(value, target, key);
                    let displaced = self
                        .data_mut(target)
                        .and_then(|d| d.keyed_put(key.clone(), built, *clock));
                    if let Some(old) = displaced {
                        self.release_value(&old);
                    }
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Stale
                }
            }
            (StorageOp::Delete { key, clock, .. }, ContainerKind::Object | ContainerKind::Map) => {
                let removed = match self.data_mut(target) {
                    Some(data) if data.keyed_accepts(key, *clock) => {
                        Some(data.keyed_remove(key, *clock))
                    }
                    _ => None,
                };
                match removed {
                    Some(displaced) => {
                        if let Some(old) = displaced {
                            self.release_value(&old);
                        }
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Stale,
                }
            }
            (
                StorageOp::ListInsert {
                    position,
                    value,
                    clock,
                    ..
                },
                ContainerKind::List,
            ) => {
                let duplicate = matches!(
                    self.data_mut(target),
                    Some(NodeData::List(l)) if l.contains_exact(position, *clock)
                );
                if duplicate {
                    ApplyOutcome::Stale
                } else {
                    let built = self.build_value(value, target, position);
                    if let Some(NodeData::List(l)) = self.data_mut(target) {
                        l.insert(ListItem {
                            position: position.clone(),
                            value: built,
                            clock: *clock,
                            tiebreak: value.sort_key(),
                        });
                    }
                    ApplyOutcome::Applied
                }
            }
            (StorageOp::ListDelete { position, .. }, ContainerKind::List) => {
                let removed = match self.data_mut(target) {
                    Some(NodeData::List(l)) => l
                        .index_of_position(position)
                        .map(|index| l.remove(index)),
                    _ => None,
                };
                match removed {
                    Some(item) => {
                        self.release_value(&item.value);
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Unresolved,
                }
            }
            (
                StorageOp::ListMove {
                    from_position,
                    to_position,
                    clock,
                    ..
                },
                ContainerKind::List,
            ) => {
                let Some(NodeData::List(list)) = self.data_mut(target) else {
                    return ApplyOutcome::Unresolved;
                };
                match list.index_of_position(from_position) {
                    None => ApplyOutcome::Unresolved,
                    // Equal clocks from different replicas fall back to the
                    // target position so both sides pick the same winner.
                    Some(index)
                        if list.get(index).is_some_and(|item| {
                            (*clock, to_position.as_str()) <= (item.clock, item.position.as_str())
                        }) =>
                    {
                        ApplyOutcome::Stale
                    }
                    Some(index) => {
                        let new_index = list.move_item(index, to_position.clone(), *clock);
                        let child = list.get(new_index).and_then(|item| item.value.as_node());
                        if let Some(node) = child.and_then(|c| self.arena.get_mut(c)) {
                            node.segment = to_position.clone();
                        }
                        ApplyOutcome::Applied
                    }
                }
            }
            _ => ApplyOutcome::Unresolved,
        };

        if outcome == ApplyOutcome::Applied {
            self.invalidate(target);
            self.notify(target);
        }
        outcome
    }
}
