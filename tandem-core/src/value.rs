//! Serialized and in-document value representations.
//!
//! [`SerializedCrdt`] is the wire/snapshot form: scalars as plain JSON and
//! containers as `{"type": "LiveObject" | "LiveMap" | "LiveList", ...}`.
//! [`Value`] is what a container slot holds once attached to a document,
//! with nested containers replaced by arena handles.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle to a container inside a [`Document`](crate::Document) arena.
///
/// Handles never own the node. Once the node is released (its subtree was
/// overwritten, deleted, or replaced by a snapshot) the slot's generation
/// moves on and the handle resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Container kinds, used for error reporting and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Object,
    Map,
    List,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerKind::Object => "LiveObject",
            ContainerKind::Map => "LiveMap",
            ContainerKind::List => "LiveList",
        };
        f.write_str(name)
    }
}

/// Value held by an attached container slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Node(NodeId),
}

impl Value {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::Node(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Serialized form of any value: a scalar or a whole container subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerializedCrdt {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Container(SerializedContainer),
}

/// One case per container kind, dispatched on the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SerializedContainer {
    LiveObject {
        data: BTreeMap<String, SerializedCrdt>,
    },
    LiveMap {
        entries: BTreeMap<String, SerializedCrdt>,
    },
    LiveList {
        items: Vec<SerializedListItem>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedListItem {
    pub position: String,
    pub value: SerializedCrdt,
}

impl SerializedCrdt {
    /// `LiveObject` from `(key, value)` pairs.
    pub fn object<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<SerializedCrdt>,
        I: IntoIterator<Item = (K, V)>,
    {
        SerializedCrdt::Container(SerializedContainer::LiveObject {
            data: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        })
    }

    /// `LiveMap` from `(key, value)` pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<SerializedCrdt>,
        I: IntoIterator<Item = (K, V)>,
    {
        SerializedCrdt::Container(SerializedContainer::LiveMap {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        })
    }

    /// `LiveList` holding `values` in order, with freshly generated positions.
    pub fn list<V, I>(values: I) -> Self
    where
        V: Into<SerializedCrdt>,
        I: IntoIterator<Item = V>,
    {
        let values: Vec<SerializedCrdt> = values.into_iter().map(Into::into).collect();
        let positions = crate::fractional_index::generate_n_keys_between(None, None, values.len())
            .unwrap_or_default();
        SerializedCrdt::Container(SerializedContainer::LiveList {
            items: positions
                .into_iter()
                .zip(values)
                .map(|(position, value)| SerializedListItem { position, value })
                .collect(),
        })
    }

    pub fn kind(&self) -> Option<ContainerKind> {
        match self {
            SerializedCrdt::Container(SerializedContainer::LiveObject { .. }) => {
                Some(ContainerKind::Object)
            }
            SerializedCrdt::Container(SerializedContainer::LiveMap { .. }) => {
                Some(ContainerKind::Map)
            }
            SerializedCrdt::Container(SerializedContainer::LiveList { .. }) => {
                Some(ContainerKind::List)
            }
            _ => None,
        }
    }

    /// Scalar value, or `None` for containers.
    pub(crate) fn as_scalar(&self) -> Option<Value> {
        match self {
            SerializedCrdt::Null => Some(Value::Null),
            SerializedCrdt::Bool(b) => Some(Value::Bool(*b)),
            SerializedCrdt::Number(n) => Some(Value::Number(*n)),
            SerializedCrdt::String(s) => Some(Value::String(s.clone())),
            SerializedCrdt::Container(_) => None,
        }
    }

    /// Canonical JSON text, used as the last tie-breaker in list ordering.
    pub(crate) fn sort_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<bool> for SerializedCrdt {
    fn from(v: bool) -> Self {
        SerializedCrdt::Bool(v)
    }
}

impl From<f64> for SerializedCrdt {
    fn from(v: f64) -> Self {
        SerializedCrdt::Number(v)
    }
}

impl From<i32> for SerializedCrdt {
    fn from(v: i32) -> Self {
        SerializedCrdt::Number(f64::from(v))
    }
}

impl From<u32> for SerializedCrdt {
    fn from(v: u32) -> Self {
        SerializedCrdt::Number(f64::from(v))
    }
}

impl From<&str> for SerializedCrdt {
    fn from(v: &str) -> Self {
        SerializedCrdt::String(v.to_string())
    }
}

impl From<String> for SerializedCrdt {
    fn from(v: String) -> Self {
        SerializedCrdt::String(v)
    }
}

impl From<()> for SerializedCrdt {
    fn from(_: ()) -> Self {
        SerializedCrdt::Null
    }
}

impl<T: Into<SerializedCrdt>> From<Option<T>> for SerializedCrdt {
    fn from(v: Option<T>) -> Self {
        v.map_or(SerializedCrdt::Null, Into::into)
    }
}

impl From<SerializedContainer> for SerializedCrdt {
    fn from(v: SerializedContainer) -> Self {
        SerializedCrdt::Container(v)
    }
}
