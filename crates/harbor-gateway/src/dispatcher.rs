use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use harbor_types::events::GatewayEvent;
use harbor_types::models::{ChatMessage, Identity};

pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;

/// Tracks live room membership and fans events out to member connections.
///
/// An explicitly owned, injectable instance — tests run several in
/// isolation. Rooms exist from first join to last leave. Each room has its
/// own lock so unrelated rooms never contend; the outer map lock is touched
/// only to create or unlink a room entry. Room locks guard in-memory
/// mutation and channel pushes only — never storage I/O.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
}

#[derive(Default)]
struct Room {
    /// Set when the entry is unlinked from the registry; a joiner that
    /// raced the removal retries against a fresh entry.
    closed: bool,
    members: HashMap<Uuid, Member>,
}

struct Member {
    identity: Identity,
    tx: EventSender,
    /// While the member is replaying history, room broadcasts park here
    /// instead of the channel. Flushed on `activate`, minus anything the
    /// history already covered.
    pending: Option<Vec<GatewayEvent>>,
}

impl Room {
    /// Unique usernames, sorted. Multiple connections of one identity
    /// count once.
    fn user_list(&self) -> Vec<String> {
        self.members
            .values()
            .map(|m| m.identity.username.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn has_identity(&self, id: Uuid) -> bool {
        self.members.values().any(|m| m.identity.id == id)
    }
}

pub struct JoinOutcome {
    /// True when this identity was not yet present in the room — the caller
    /// announces the membership delta only then.
    pub newly_present: bool,
    pub users: Vec<String>,
}

pub struct LeaveOutcome {
    /// True when no other connection of the same identity remains.
    pub identity_left: bool,
    pub username: String,
    /// Member list after the removal was committed.
    pub users: Vec<String>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room. Idempotent on the identity set; the
    /// member starts out buffering broadcasts until `activate`.
    pub async fn join(
        &self,
        room_name: &str,
        conn_id: Uuid,
        identity: Identity,
        tx: EventSender,
    ) -> JoinOutcome {
        loop {
            let room = self.get_or_create_room(room_name).await;
            let mut room = room.lock().await;
            if room.closed {
                // raced an empty-room removal; the registry has forgotten
                // this entry, so take a fresh one
                continue;
            }

            let newly_present = !room.has_identity(identity.id);
            room.members.insert(
                conn_id,
                Member {
                    identity: identity.clone(),
                    tx: tx.clone(),
                    pending: Some(Vec::new()),
                },
            );

            return JoinOutcome {
                newly_present,
                users: room.user_list(),
            };
        }
    }

    /// Finish a join: deliver history and the join confirmation, then flush
    /// broadcasts that parked while history was being read, dropping any
    /// message the history already delivered.
    pub async fn activate(&self, room_name: &str, conn_id: Uuid, history: Vec<ChatMessage>) {
        let Some(room) = self.get_room(room_name).await else {
            return;
        };
        let mut room = room.lock().await;
        let users = room.user_list();
        let Some(member) = room.members.get_mut(&conn_id) else {
            return;
        };

        let delivered: HashSet<Uuid> = history.iter().map(|m| m.id).collect();

        let _ = member.tx.send(GatewayEvent::RoomHistory {
            room: room_name.to_string(),
            messages: history,
        });
        let _ = member.tx.send(GatewayEvent::RoomJoined {
            room: room_name.to_string(),
            users,
        });

        if let Some(parked) = member.pending.take() {
            for event in parked {
                if let GatewayEvent::MessageNew { message } = &event {
                    if delivered.contains(&message.id) {
                        continue;
                    }
                }
                let _ = member.tx.send(event);
            }
        }
    }

    /// Remove a connection from a room; unlink the room once empty.
    /// Returns `None` when the connection was not a member.
    pub async fn leave(&self, room_name: &str, conn_id: Uuid) -> Option<LeaveOutcome> {
        let handle = self.get_room(room_name).await?;
        let mut room = handle.lock().await;

        let member = room.members.remove(&conn_id)?;
        let identity_left = !room.has_identity(member.identity.id);
        let users = room.user_list();

        let now_empty = room.members.is_empty();
        if now_empty {
            room.closed = true;
        }
        drop(room);

        if now_empty {
            let mut rooms = self.inner.rooms.write().await;
            if let Some(existing) = rooms.get(room_name) {
                if Arc::ptr_eq(existing, &handle) {
                    rooms.remove(room_name);
                }
            }
        }

        Some(LeaveOutcome {
            identity_left,
            username: member.identity.username,
            users,
        })
    }

    /// Fan an event out to every member of a room. Joining members buffer;
    /// a member whose channel is gone is simply skipped — one dead
    /// subscriber never affects delivery to the rest.
    pub async fn broadcast(&self, room_name: &str, event: GatewayEvent) {
        self.fan_out(room_name, None, event).await;
    }

    /// Like `broadcast`, but skips one connection — used for typing and
    /// read-marker signals, which the sender never receives back.
    pub async fn broadcast_except(&self, room_name: &str, skip: Uuid, event: GatewayEvent) {
        self.fan_out(room_name, Some(skip), event).await;
    }

    async fn fan_out(&self, room_name: &str, skip: Option<Uuid>, event: GatewayEvent) {
        let Some(room) = self.get_room(room_name).await else {
            return;
        };
        let mut room = room.lock().await;
        for (conn_id, member) in room.members.iter_mut() {
            if Some(*conn_id) == skip {
                continue;
            }
            match &mut member.pending {
                Some(parked) => parked.push(event.clone()),
                None => {
                    let _ = member.tx.send(event.clone());
                }
            }
        }
    }

    /// Current member list of a room; empty for unknown rooms.
    pub async fn members(&self, room_name: &str) -> Vec<String> {
        match self.get_room(room_name).await {
            Some(room) => room.lock().await.user_list(),
            None => Vec::new(),
        }
    }

    async fn get_room(&self, name: &str) -> Option<Arc<Mutex<Room>>> {
        self.inner.rooms.read().await.get(name).cloned()
    }

    async fn get_or_create_room(&self, name: &str) -> Arc<Mutex<Room>> {
        if let Some(room) = self.get_room(name).await {
            return room;
        }
        let mut rooms = self.inner.rooms.write().await;
        rooms.entry(name.to_string()).or_default().clone()
    }
}
