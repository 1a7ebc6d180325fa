//! Presence roster and live cursors.
//!
//! The server owns identity: it assigns each user a stable color, stamps
//! `userId`, `displayName` and `color` onto every relayed cursor, and
//! re-broadcasts the full roster whenever someone joins, leaves or changes
//! metadata. Clients only ever send a [`CursorPosition`] and metadata patches.
//!
//! ```text
//! client: cursor:update { x, y, .. }
//!       │
//!       ▼
//! server: CursorData::stamp(user, position)   (identity + lastUpdate)
//!       │
//!       ▼   (broadcast to everyone but the sender)
//! peers: cursors[userId] = cursor
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key holding the id of the user being followed.
pub const FOLLOWING_KEY: &str = "following";

// ───────────────────────────────────────────────────────────────────
// Roster
// ───────────────────────────────────────────────────────────────────

/// One connected user as seen in the `presence` roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    /// Milliseconds since the Unix epoch.
    pub connected_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl PresenceUser {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            color: color_for(&user_id),
            user_id,
            display_name: display_name.into(),
            connected_at: now_millis(),
            metadata: None,
        }
    }

    /// Id of the user this one follows, if any.
    pub fn following(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(FOLLOWING_KEY))
            .and_then(Value::as_str)
    }

    /// Shallow-merge `patch` into the metadata. `null` values are kept so
    /// peers can observe a cleared field.
    pub fn merge_metadata(&mut self, patch: Map<String, Value>) {
        let metadata = self.metadata.get_or_insert_with(Map::new);
        for (key, value) in patch {
            metadata.insert(key, value);
        }
    }
}

/// Ids of users in `roster` that currently follow `user_id`, sorted. A user
/// with several connections is listed once.
pub fn followers_of(roster: &[PresenceUser], user_id: &str) -> Vec<String> {
    let mut followers: Vec<String> = roster
        .iter()
        .filter(|u| u.user_id != user_id && u.following() == Some(user_id))
        .map(|u| u.user_id.clone())
        .collect();
    followers.sort();
    followers.dedup();
    followers
}

// ───────────────────────────────────────────────────────────────────
// Cursors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorType {
    #[default]
    Default,
    Text,
    Pointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportPos {
    pub x: f64,
    pub y: f64,
}

/// Rectangle a user is highlighting, in board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HighlightRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// What a client reports about its own pointer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_pos: Option<ViewportPos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_type: Option<CursorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_rect: Option<HighlightRect>,
}

impl CursorPosition {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }
}

/// A cursor as relayed to peers, with the owner's identity attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorData {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub x: f64,
    pub y: f64,
    pub last_update: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_pos: Option<ViewportPos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_type: Option<CursorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_rect: Option<HighlightRect>,
}

impl CursorData {
    /// Attach `user`'s identity to a reported position.
    pub fn stamp(user: &PresenceUser, position: CursorPosition) -> Self {
        Self {
            user_id: user.user_id.clone(),
            display_name: user.display_name.clone(),
            color: user.color.clone(),
            x: position.x,
            y: position.y,
            last_update: now_millis(),
            viewport_pos: position.viewport_pos,
            viewport_scale: position.viewport_scale,
            cursor_type: position.cursor_type,
            highlight_rect: position.highlight_rect,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable `#rrggbb` color for a user id.
///
/// Hue comes from an FNV-1a hash of the id; saturation and lightness are
/// fixed so every color reads well on a light canvas.
pub fn color_for(user_id: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        channel(r),
        channel(g),
        channel(b)
    )
}

fn channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
