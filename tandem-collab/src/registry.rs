//! Room registry: maps room ids to live rooms and retires idle ones.
//!
//! A room is removed only by an explicit [`RoomRegistry::remove`] or when a
//! cleanup timer fires while the room has no connections. Touching the room
//! through [`RoomRegistry::get_or_create`] before that disarms the timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::broadcast::BroadcastRoom;

struct PendingCleanup {
    token: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Rooms {
    rooms: HashMap<String, Arc<BroadcastRoom>>,
    cleanups: HashMap<String, PendingCleanup>,
}

pub struct RoomRegistry {
    inner: Arc<RwLock<Rooms>>,
    next_token: AtomicU64,
    capacity: usize,
    max_connections: usize,
}

impl RoomRegistry {
    pub fn new(capacity: usize, max_connections: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Rooms::default())),
            next_token: AtomicU64::new(0),
            capacity,
            max_connections,
        }
    }

    /// The room for `id`, created on first use. Disarms a pending cleanup.
    pub async fn get_or_create(&self, id: &str) -> Arc<BroadcastRoom> {
        // Fast path: room exists and nothing to cancel.
        {
            let inner = self.inner.read().await;
            if !inner.cleanups.contains_key(id) {
                if let Some(room) = inner.rooms.get(id) {
                    return room.clone();
                }
            }
        }

        let mut inner = self.inner.write().await;
        if let Some(pending) = inner.cleanups.remove(id) {
            pending.handle.abort();
            log::debug!("Room {id}: cleanup cancelled");
        }
        if let Some(room) = inner.rooms.get(id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastRoom::new(id, self.capacity, self.max_connections));
        inner.rooms.insert(id.to_string(), room.clone());
        log::info!("Room {id} created");
        room
    }

    /// Look up without creating.
    pub async fn get(&self, id: &str) -> Option<Arc<BroadcastRoom>> {
        self.inner.read().await.rooms.get(id).cloned()
    }

    /// Drop the room now, along with any pending cleanup.
    pub async fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(pending) = inner.cleanups.remove(id) {
            pending.handle.abort();
        }
        let removed = inner.rooms.remove(id).is_some();
        if removed {
            log::info!("Room {id} removed");
        }
        removed
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// Remove `id` after `timeout` unless it has connections by then or is
    /// touched through `get_or_create` first. Re-arming replaces the
    /// previous timer.
    pub async fn schedule_cleanup(&self, id: &str, timeout: Duration) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let room_id = id.to_string();

        // Hold the lock while arming so the timer cannot observe a missing
        // entry, even with a zero timeout.
        let mut inner = self.inner.write().await;
        let shared = self.inner.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let room = {
                let inner = shared.read().await;
                if inner.cleanups.get(&room_id).map(|p| p.token) != Some(token) {
                    return;
                }
                inner.rooms.get(&room_id).cloned()
            };
            // Counted outside the registry lock. A join in between goes
            // through `get_or_create`, which disarms this timer.
            let idle = match &room {
                Some(room) => room.connection_count().await == 0,
                None => false,
            };

            let mut inner = shared.write().await;
            if inner.cleanups.get(&room_id).map(|p| p.token) != Some(token) {
                return;
            }
            inner.cleanups.remove(&room_id);
            let same_room = match (&room, inner.rooms.get(&room_id)) {
                (Some(counted), Some(current)) => Arc::ptr_eq(counted, current),
                _ => false,
            };
            if !same_room {
                return;
            }
            if idle {
                inner.rooms.remove(&room_id);
                log::info!("Room {room_id} removed after idle timeout");
            } else {
                log::debug!("Room {room_id}: cleanup skipped, room is busy");
            }
        });

        if let Some(previous) = inner
            .cleanups
            .insert(id.to_string(), PendingCleanup { token, handle })
        {
            previous.handle.abort();
        }
        log::debug!("Room {id}: cleanup in {}ms", timeout.as_millis());
    }
}

impl Drop for RoomRegistry {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.try_read() {
            for pending in inner.cleanups.values() {
                pending.handle.abort();
            }
        }
    }
}
