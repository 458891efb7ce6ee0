//! In-memory registry of live sessions per room, plus global presence.
//!
//! The hub owns the only strong sender of every registered session's
//! outbound queue. Removing a session from the hub drops that sender, which
//! lets the session's writer drain and close the socket. A session whose
//! queue is full or closed during a broadcast is evicted on the spot; the
//! broadcast never waits on a slow consumer.
//!
//! Lock discipline: one `tokio::sync::RwLock` guards both maps, so the room
//! table and the presence table can never disagree. Nothing awaits while the
//! lock is held; `try_send` is the only I/O.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeKind, Frame};

/// Identifies one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub room_id: i64,
    pub user_id: i64,
    pub session_id: Uuid,
}

impl SessionKey {
    /// A fresh key for a new connection by `user_id` to `room_id`.
    pub fn new(room_id: i64, user_id: i64) -> Self {
        Self {
            room_id,
            user_id,
            session_id: Uuid::new_v4(),
        }
    }
}

/// What the hub keeps for each registered session.
#[derive(Debug)]
pub struct SessionHandle {
    key: SessionKey,
    display_name: String,
    tx: mpsc::Sender<Frame>,
    shutdown: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(
        key: SessionKey,
        display_name: impl Into<String>,
        tx: mpsc::Sender<Frame>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            key,
            display_name: display_name.into(),
            tx,
            shutdown,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }
}

#[derive(Debug, Default)]
struct HubState {
    /// room_id -> session_id -> handle
    rooms: HashMap<i64, HashMap<Uuid, SessionHandle>>,
    /// user_id -> live session ids across all rooms
    presence: HashMap<i64, HashSet<Uuid>>,
}

/// A session taken out of the hub.
struct Removed {
    handle: SessionHandle,
    /// The user has no live session left anywhere.
    went_offline: bool,
}

impl HubState {
    fn insert(&mut self, handle: SessionHandle) -> Option<bool> {
        let key = handle.key;
        let sessions = self.rooms.entry(key.room_id).or_default();
        if sessions.contains_key(&key.session_id) {
            return None;
        }
        sessions.insert(key.session_id, handle);

        let live = self.presence.entry(key.user_id).or_default();
        let came_online = live.is_empty();
        live.insert(key.session_id);
        Some(came_online)
    }

    fn remove(&mut self, key: SessionKey) -> Option<Removed> {
        let sessions = self.rooms.get_mut(&key.room_id)?;
        let handle = sessions.remove(&key.session_id)?;
        if sessions.is_empty() {
            self.rooms.remove(&key.room_id);
        }

        let mut went_offline = false;
        if let Some(live) = self.presence.get_mut(&key.user_id) {
            live.remove(&key.session_id);
            if live.is_empty() {
                self.presence.remove(&key.user_id);
                went_offline = true;
            }
        }
        Some(Removed {
            handle,
            went_offline,
        })
    }

    /// Delivers `frame` to every session in `room_id` and evicts any session
    /// that cannot take it. Evictions that take a user offline enqueue a
    /// `leave` for the same room, delivered in the same pass.
    ///
    /// Returns the number of sessions that accepted the first frame.
    fn dispatch(&mut self, room_id: i64, frame: Frame) -> usize {
        let mut pending = VecDeque::from([(room_id, frame)]);
        let mut first_delivered = None;

        while let Some((room_id, frame)) = pending.pop_front() {
            let mut delivered = 0;
            let mut stalled = Vec::new();
            if let Some(sessions) = self.rooms.get(&room_id) {
                for handle in sessions.values() {
                    match handle.tx.try_send(frame.clone()) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => stalled.push((handle.key, "queue full")),
                        Err(TrySendError::Closed(_)) => stalled.push((handle.key, "queue closed")),
                    }
                }
            }
            first_delivered.get_or_insert(delivered);

            for (key, reason) in stalled {
                tracing::warn!(
                    room_id = key.room_id,
                    user_id = key.user_id,
                    session_id = %key.session_id,
                    reason,
                    "evicting stalled session"
                );
                if let Some(leave) = self.evict(key) {
                    pending.push_back((key.room_id, leave));
                }
            }
        }

        first_delivered.unwrap_or(0)
    }

    /// Removes a session and wakes its writer. Returns the encoded `leave`
    /// frame when the user went offline.
    fn evict(&mut self, key: SessionKey) -> Option<Frame> {
        let removed = self.remove(key)?;
        removed.handle.shutdown.notify_one();
        if !removed.went_offline {
            return None;
        }
        encode_or_warn(&Envelope::new(
            EnvelopeKind::Leave,
            key.room_id,
            key.user_id,
            removed.handle.display_name,
        ))
    }
}

fn encode_or_warn(envelope: &Envelope) -> Option<Frame> {
    match envelope.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(error = %e, kind = ?envelope.kind, room_id = envelope.room_id, "failed to encode envelope");
            None
        }
    }
}

/// Shared handle to the room registry. Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct RoomHub {
    state: Arc<RwLock<HubState>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session to its room. Registering the same session twice is a
    /// no-op and returns `false`.
    ///
    /// A user's first live session anywhere announces a `join` to the room.
    pub async fn register(&self, handle: SessionHandle) -> bool {
        let key = handle.key;
        let display_name = handle.display_name.clone();
        let mut state = self.state.write().await;
        let Some(came_online) = state.insert(handle) else {
            return false;
        };
        tracing::debug!(room_id = key.room_id, user_id = key.user_id, session_id = %key.session_id, "session registered");

        if came_online {
            let join = Envelope::new(EnvelopeKind::Join, key.room_id, key.user_id, display_name);
            if let Some(frame) = encode_or_warn(&join) {
                state.dispatch(key.room_id, frame);
            }
        }
        true
    }

    /// Removes a session. Unregistering an unknown or already removed
    /// session is a no-op and returns `false`.
    ///
    /// When the user has no live session left, presence is cleared and a
    /// `leave` goes to the room.
    pub async fn unregister(&self, key: SessionKey) -> bool {
        let mut state = self.state.write().await;
        let Some(removed) = state.remove(key) else {
            return false;
        };
        tracing::debug!(room_id = key.room_id, user_id = key.user_id, session_id = %key.session_id, "session unregistered");

        if removed.went_offline {
            let leave = Envelope::new(
                EnvelopeKind::Leave,
                key.room_id,
                key.user_id,
                removed.handle.display_name,
            );
            if let Some(frame) = encode_or_warn(&leave) {
                state.dispatch(key.room_id, frame);
            }
        }
        true
    }

    /// Sends `envelope` to every session in `room_id` and returns how many
    /// accepted it. The envelope is encoded once.
    pub async fn broadcast(&self, room_id: i64, envelope: &Envelope) -> usize {
        let Some(frame) = encode_or_warn(envelope) else {
            return 0;
        };
        self.state.write().await.dispatch(room_id, frame)
    }

    /// Every user with at least one live session, ascending.
    pub async fn online_users(&self) -> Vec<i64> {
        let state = self.state.read().await;
        let mut users: Vec<i64> = state.presence.keys().copied().collect();
        users.sort_unstable();
        users
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.state.read().await.presence.contains_key(&user_id)
    }

    /// Number of live sessions in `room_id`.
    pub async fn room_size(&self, room_id: i64) -> usize {
        self.state
            .read()
            .await
            .rooms
            .get(&room_id)
            .map_or(0, HashMap::len)
    }

    /// Distinct users connected to `room_id`, ascending.
    pub async fn room_users(&self, room_id: i64) -> Vec<i64> {
        let state = self.state.read().await;
        let mut users: Vec<i64> = state
            .rooms
            .get(&room_id)
            .map(|sessions| sessions.values().map(|h| h.key.user_id).collect::<HashSet<_>>())
            .unwrap_or_default()
            .into_iter()
            .collect();
        users.sort_unstable();
        users
    }

    /// Closes every session in `room_id`. Used when the room is deleted or
    /// deactivated. Returns the number of sessions closed.
    pub async fn disconnect_room(&self, room_id: i64) -> usize {
        let mut state = self.state.write().await;
        let keys: Vec<SessionKey> = state
            .rooms
            .get(&room_id)
            .map(|sessions| sessions.values().map(|h| h.key).collect())
            .unwrap_or_default();
        for key in &keys {
            state.evict(*key);
        }
        if !keys.is_empty() {
            tracing::info!(room_id, sessions = keys.len(), "disconnected room");
        }
        keys.len()
    }

    /// Closes every session `user_id` holds in `room_id`, announcing a
    /// `leave` to the rest of the room if that took the user offline.
    pub async fn disconnect_member(&self, room_id: i64, user_id: i64) -> usize {
        let mut state = self.state.write().await;
        let keys: Vec<SessionKey> = state
            .rooms
            .get(&room_id)
            .map(|sessions| {
                sessions
                    .values()
                    .map(|h| h.key)
                    .filter(|k| k.user_id == user_id)
                    .collect()
            })
            .unwrap_or_default();
        for key in &keys {
            if let Some(frame) = state.evict(*key) {
                state.dispatch(room_id, frame);
            }
        }
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(hub_room: i64, user_id: i64, capacity: usize) -> (SessionHandle, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = SessionHandle::new(
            SessionKey::new(hub_room, user_id),
            format!("user-{user_id}"),
            tx,
            Arc::new(Notify::new()),
        );
        (handle, rx)
    }

    fn kinds(rx: &mut mpsc::Receiver<Frame>) -> Vec<EnvelopeKind> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(Envelope::decode(frame.as_str()).unwrap().kind);
        }
        out
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let hub = RoomHub::new();
        let (handle, _rx) = session(1, 10, 8);
        let key = handle.key();
        let dup = SessionHandle::new(key, "user-10", handle.tx.clone(), Arc::new(Notify::new()));

        assert!(hub.register(handle).await);
        assert!(!hub.register(dup).await);
        assert_eq!(hub.room_size(1).await, 1);

        assert!(hub.unregister(key).await);
        assert!(!hub.unregister(key).await);
        assert_eq!(hub.room_size(1).await, 0);
        assert!(!hub.is_online(10).await);
    }

    #[tokio::test]
    async fn join_and_leave_follow_first_and_last_session() {
        let hub = RoomHub::new();
        let (watcher, mut watcher_rx) = session(1, 1, 16);
        hub.register(watcher).await;
        assert_eq!(kinds(&mut watcher_rx), vec![EnvelopeKind::Join]);

        let (first, _rx1) = session(1, 2, 16);
        let (second, _rx2) = session(1, 2, 16);
        let (first_key, second_key) = (first.key(), second.key());
        hub.register(first).await;
        hub.register(second).await;
        assert_eq!(kinds(&mut watcher_rx), vec![EnvelopeKind::Join]);
        assert_eq!(hub.room_users(1).await, vec![1, 2]);
        assert_eq!(hub.room_size(1).await, 3);

        hub.unregister(first_key).await;
        assert!(hub.is_online(2).await);
        assert!(kinds(&mut watcher_rx).is_empty());

        hub.unregister(second_key).await;
        assert!(!hub.is_online(2).await);
        assert_eq!(kinds(&mut watcher_rx), vec![EnvelopeKind::Leave]);
        assert_eq!(hub.online_users().await, vec![1]);
    }

    #[tokio::test]
    async fn unregistered_session_receives_nothing() {
        let hub = RoomHub::new();
        let (stay, mut stay_rx) = session(1, 1, 16);
        let (gone, mut gone_rx) = session(1, 2, 16);
        let gone_key = gone.key();
        hub.register(stay).await;
        hub.register(gone).await;
        kinds(&mut stay_rx);
        kinds(&mut gone_rx);

        assert!(hub.unregister(gone_key).await);
        let sent = hub
            .broadcast(1, &Envelope::new(EnvelopeKind::Typing, 1, 1, "user-1"))
            .await;
        assert_eq!(sent, 1);
        assert_eq!(
            kinds(&mut stay_rx),
            vec![EnvelopeKind::Leave, EnvelopeKind::Typing]
        );

        // The hub dropped the only sender, so the queue is closed and empty.
        assert!(matches!(
            gone_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn broadcast_is_scoped_to_room() {
        let hub = RoomHub::new();
        let (a, mut a_rx) = session(1, 1, 16);
        let (b, mut b_rx) = session(2, 2, 16);
        hub.register(a).await;
        hub.register(b).await;
        kinds(&mut a_rx);
        kinds(&mut b_rx);

        let sent = hub
            .broadcast(1, &Envelope::new(EnvelopeKind::Typing, 1, 1, "user-1"))
            .await;
        assert_eq!(sent, 1);
        assert_eq!(kinds(&mut a_rx), vec![EnvelopeKind::Typing]);
        assert!(kinds(&mut b_rx).is_empty());

        assert_eq!(
            hub.broadcast(99, &Envelope::new(EnvelopeKind::Typing, 99, 1, "x"))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn stalled_session_is_evicted_and_announced() {
        let hub = RoomHub::new();
        let (healthy, mut healthy_rx) = session(1, 1, 16);
        let (stalled, _stalled_rx) = session(1, 2, 1);
        let stalled_shutdown = stalled.shutdown.clone();
        hub.register(healthy).await;
        // Fills the stalled session's only slot with its own join.
        hub.register(stalled).await;
        kinds(&mut healthy_rx);

        let sent = hub
            .broadcast(1, &Envelope::new(EnvelopeKind::Typing, 1, 1, "user-1"))
            .await;
        assert_eq!(sent, 1);
        assert_eq!(
            kinds(&mut healthy_rx),
            vec![EnvelopeKind::Typing, EnvelopeKind::Leave]
        );
        assert!(!hub.is_online(2).await);
        assert_eq!(hub.room_size(1).await, 1);

        // The writer is woken even though nobody was waiting yet.
        tokio::time::timeout(std::time::Duration::from_secs(1), stalled_shutdown.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closed_receiver_is_evicted() {
        let hub = RoomHub::new();
        let (gone, gone_rx) = session(1, 5, 4);
        hub.register(gone).await;
        drop(gone_rx);

        let sent = hub
            .broadcast(1, &Envelope::new(EnvelopeKind::Typing, 1, 9, "x"))
            .await;
        assert_eq!(sent, 0);
        assert_eq!(hub.room_size(1).await, 0);
        assert!(hub.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_member_and_room() {
        let hub = RoomHub::new();
        let (a, mut a_rx) = session(1, 1, 16);
        let (b1, _b1_rx) = session(1, 2, 16);
        let (b2, _b2_rx) = session(1, 2, 16);
        let (b_elsewhere, _b3_rx) = session(2, 2, 16);
        hub.register(a).await;
        hub.register(b1).await;
        hub.register(b2).await;
        hub.register(b_elsewhere).await;
        kinds(&mut a_rx);

        assert_eq!(hub.disconnect_member(1, 2).await, 2);
        // Still online through room 2, so no leave.
        assert!(hub.is_online(2).await);
        assert!(kinds(&mut a_rx).is_empty());
        assert_eq!(hub.room_users(1).await, vec![1]);

        assert_eq!(hub.disconnect_room(1).await, 1);
        assert_eq!(hub.room_size(1).await, 0);
        assert!(!hub.is_online(1).await);
        assert_eq!(hub.online_users().await, vec![2]);
    }
}
