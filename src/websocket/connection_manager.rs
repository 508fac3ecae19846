use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// One registered connection. The sender is the write side of that
/// connection's bounded outbound queue; the writer task owns the socket.
struct ConnectionHandle {
    user_id: Uuid,
    map_id: Uuid,
    sender: mpsc::Sender<String>,
    /// Guards against a reconnect race: a stale connection's teardown must
    /// not unregister its replacement.
    generation: u64,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<Uuid, ConnectionHandle>,
    /// map id -> session ids, for map-scoped broadcasts.
    maps: HashMap<Uuid, HashSet<Uuid>>,
    /// user id -> session ids, for targeted signaling delivery.
    users: HashMap<Uuid, HashSet<Uuid>>,
    next_generation: u64,
}

impl Registry {
    fn unlink(&mut self, session_id: Uuid) -> Option<ConnectionHandle> {
        let handle = self.sessions.remove(&session_id)?;
        if let Some(set) = self.maps.get_mut(&handle.map_id) {
            set.remove(&session_id);
            if set.is_empty() {
                self.maps.remove(&handle.map_id);
            }
        }
        if let Some(set) = self.users.get_mut(&handle.user_id) {
            set.remove(&session_id);
            if set.is_empty() {
                self.users.remove(&handle.user_id);
            }
        }
        Some(handle)
    }
}

/// Owns every live WebSocket, keyed by session id and indexed by map and by
/// user. Cheaply cloneable — all clones share the registry via `Arc`.
///
/// Enqueue order to a single connection is its delivery order; there is no
/// cross-connection ordering. Sends never block: a connection whose bounded
/// queue is full is closed (its sender is dropped, which ends the writer
/// task) rather than stalling the broadcast for everyone else.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    registry: Arc<RwLock<Registry>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. If the session already has one (a reconnect),
    /// the old sender is dropped, closing the previous connection's queue.
    /// Returns a generation token that must be passed back to [`remove`].
    pub async fn add(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        map_id: Uuid,
        sender: mpsc::Sender<String>,
    ) -> u64 {
        let mut registry = self.registry.write().await;
        registry.unlink(session_id);
        registry.next_generation += 1;
        let generation = registry.next_generation;
        registry.sessions.insert(
            session_id,
            ConnectionHandle {
                user_id,
                map_id,
                sender,
                generation,
            },
        );
        registry.maps.entry(map_id).or_default().insert(session_id);
        registry.users.entry(user_id).or_default().insert(session_id);
        generation
    }

    /// Unregister, but only if the registered connection is still the one
    /// identified by `generation`. Returns the (user, map) pair when the
    /// connection was actually removed, so the caller can announce the
    /// departure.
    pub async fn remove(&self, session_id: Uuid, generation: u64) -> Option<(Uuid, Uuid)> {
        let mut registry = self.registry.write().await;
        match registry.sessions.get(&session_id) {
            Some(handle) if handle.generation == generation => {
                let handle = registry.unlink(session_id)?;
                Some((handle.user_id, handle.map_id))
            }
            _ => None,
        }
    }

    /// Enqueue a message to one session. Returns whether delivery was
    /// attempted (not whether it succeeded).
    pub async fn send_to_session(&self, session_id: Uuid, message: &str) -> bool {
        let overflowed = {
            let registry = self.registry.read().await;
            match registry.sessions.get(&session_id) {
                Some(handle) => match handle.sender.try_send(message.to_owned()) {
                    Ok(()) => return true,
                    Err(TrySendError::Full(_)) => vec![session_id],
                    Err(TrySendError::Closed(_)) => return false,
                },
                None => return false,
            }
        };
        self.close_slow(overflowed).await;
        false
    }

    /// Enqueue to every session of one user on one map. Used for signaling:
    /// the recipient is addressed by user, delivery happens per connection.
    pub async fn send_to_user_on_map(&self, map_id: Uuid, user_id: Uuid, message: &str) -> usize {
        let (sent, overflowed) = {
            let registry = self.registry.read().await;
            let Some(session_ids) = registry.users.get(&user_id) else {
                return 0;
            };
            enqueue_all(&registry, session_ids.iter().copied(), message, |handle| {
                handle.map_id == map_id
            })
        };
        self.close_slow(overflowed).await;
        sent
    }

    /// Enqueue to every session on a map, minus the exclusion. The snapshot
    /// of the map's membership is taken under the registry lock, so a
    /// broadcast never sees a half-registered connection.
    pub async fn broadcast_to_map(
        &self,
        map_id: Uuid,
        message: &str,
        exclude_session: Option<Uuid>,
    ) -> usize {
        let (sent, overflowed) = {
            let registry = self.registry.read().await;
            let Some(session_ids) = registry.maps.get(&map_id) else {
                return 0;
            };
            let targets = session_ids
                .iter()
                .copied()
                .filter(|id| Some(*id) != exclude_session);
            enqueue_all(&registry, targets, message, |_| true)
        };
        self.close_slow(overflowed).await;
        sent
    }

    pub async fn sessions_on_map(&self, map_id: Uuid) -> Vec<Uuid> {
        let registry = self.registry.read().await;
        registry
            .maps
            .get(&map_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_connected(&self, session_id: Uuid) -> bool {
        self.registry.read().await.sessions.contains_key(&session_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    /// Drop connections whose queue overflowed. Dropping the sender closes
    /// the queue; the writer task drains what it already has and exits,
    /// which closes the socket.
    async fn close_slow(&self, session_ids: Vec<Uuid>) {
        if session_ids.is_empty() {
            return;
        }
        let mut registry = self.registry.write().await;
        for session_id in session_ids {
            if registry.unlink(session_id).is_some() {
                tracing::warn!(
                    session_id = %session_id,
                    "Write queue overflow; closing slow connection"
                );
            }
        }
    }
}

/// Try-send `message` to each target that passes the filter. Returns the
/// number of successful enqueues and the sessions whose queue was full.
fn enqueue_all(
    registry: &Registry,
    targets: impl Iterator<Item = Uuid>,
    message: &str,
    filter: impl Fn(&ConnectionHandle) -> bool,
) -> (usize, Vec<Uuid>) {
    let mut sent = 0;
    let mut overflowed = Vec::new();
    for session_id in targets {
        let Some(handle) = registry.sessions.get(&session_id) else {
            continue;
        };
        if !filter(handle) {
            continue;
        }
        match handle.sender.try_send(message.to_owned()) {
            Ok(()) => sent += 1,
            Err(TrySendError::Full(_)) => overflowed.push(session_id),
            Err(TrySendError::Closed(_)) => {}
        }
    }
    (sent, overflowed)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
