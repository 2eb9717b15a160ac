use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use harbor_db::Database;
use harbor_types::events::{GatewayCommand, GatewayEvent};
use harbor_types::models::{ChatMessage, Identity};

use crate::dispatcher::Dispatcher;

/// Server pings every 15 seconds; two missed pongs (~30s) drop the
/// connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub const HISTORY_LIMIT: u32 = 50;
pub const DEFAULT_ROOM: &str = "general";

/// Drive an authenticated WebSocket connection until it closes. Identity
/// was attached by the gatekeeper at the upgrade; it is trusted for the
/// connection's whole lifetime.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    identity: Identity,
) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<GatewayEvent>();

    info!("{} ({}) connected to gateway", identity.username, identity.id);

    // Current room, shared between the command handler and the cleanup path.
    let current_room: Arc<std::sync::Mutex<Option<String>>> = Arc::default();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward events to the client, interleaved with heartbeat pings.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match serde_json::to_string(&event) {
                        Ok(text) => {
                            if sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("failed to serialize gateway event: {}", e);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut ctx = ConnCtx {
        dispatcher: dispatcher.clone(),
        db: db.clone(),
        identity: identity.clone(),
        conn_id,
        tx,
        room: current_room.clone(),
    };

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => ctx.handle_command(cmd).await,
                    Err(e) => {
                        let preview: String = text.chars().take(200).collect();
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            ctx.identity.username, ctx.identity.id, e, preview
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Implicit leave, whichever way the connection went down.
    let room = current_room.lock().expect("room lock poisoned").take();
    if let Some(room) = room {
        leave_room(&dispatcher, &db, conn_id, &room).await;
    }

    info!("{} ({}) disconnected from gateway", identity.username, identity.id);
}

/// Per-connection command state. Split from the socket plumbing so the
/// command handlers can be exercised directly in tests.
struct ConnCtx {
    dispatcher: Dispatcher,
    db: Arc<Database>,
    identity: Identity,
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    room: Arc<std::sync::Mutex<Option<String>>>,
}

impl ConnCtx {
    async fn handle_command(&mut self, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::JoinRoom { room } => self.handle_join(room).await,
            GatewayCommand::SendMessage { room, text, client_id } => {
                self.handle_send(room, text, client_id).await
            }
            GatewayCommand::ReadUpTo { room, read_up_to } => {
                self.handle_read(room, read_up_to).await
            }
            GatewayCommand::Typing { room, is_typing } => {
                self.handle_typing(room, is_typing).await
            }
        }
    }

    async fn handle_join(&mut self, room: Option<String>) {
        let target = normalize_room(room.as_deref());

        // switching rooms performs a full leave first, so the old room's
        // member set never keeps a stale entry
        let previous = self.room.lock().expect("room lock poisoned").take();
        if let Some(previous) = previous {
            if previous != target {
                leave_room(&self.dispatcher, &self.db, self.conn_id, &previous).await;
            }
        }

        let outcome = self
            .dispatcher
            .join(&target, self.conn_id, self.identity.clone(), self.tx.clone())
            .await;

        let history = match recent_history(&self.db, &target).await {
            Ok(history) => history,
            Err(e) => {
                warn!("history read failed for room {}: {:#}", target, e);
                // nothing has been announced yet; quietly undo the join
                let _ = self.dispatcher.leave(&target, self.conn_id).await;
                self.send_self_error("HISTORY_FAILED", "could not load room history");
                return;
            }
        };

        self.dispatcher.activate(&target, self.conn_id, history).await;

        if outcome.newly_present {
            let notice = ChatMessage::system(
                &target,
                format!("{} joined", self.identity.username),
                Utc::now().timestamp_millis(),
            );
            match persist(&self.db, notice.clone()).await {
                Ok(()) => {
                    self.dispatcher
                        .broadcast(&target, GatewayEvent::MessageNew { message: notice })
                        .await;
                }
                Err(e) => warn!("failed to persist join notice for {}: {:#}", target, e),
            }
        }

        let users = self.dispatcher.members(&target).await;
        self.dispatcher
            .broadcast(&target, GatewayEvent::RoomUsers { room: target.clone(), users })
            .await;

        info!("{} ({}) joined room {}", self.identity.username, self.identity.id, target);
        *self.room.lock().expect("room lock poisoned") = Some(target);
    }

    async fn handle_send(&mut self, room: Option<String>, text: String, client_id: Option<String>) {
        let room = self.resolve_room(room);
        let text = text.trim().to_string();
        if text.is_empty() {
            // best-effort UX: not an error, just nothing to do
            return;
        }

        let message = ChatMessage::user(
            &room,
            &self.identity.username,
            text,
            client_id,
            Utc::now().timestamp_millis(),
        );

        // persist first; a message is never broadcast unless it is in the log
        if let Err(e) = persist(&self.db, message.clone()).await {
            warn!("failed to persist message in {}: {:#}", room, e);
            self.send_self_error("SEND_FAILED", "message could not be saved");
            return;
        }

        self.dispatcher
            .broadcast(&room, GatewayEvent::MessageNew { message: message.clone() })
            .await;

        // delivery acknowledgment goes to the sender only, carrying its
        // client id back for optimistic-echo reconciliation
        let _ = self.tx.send(GatewayEvent::MessageDelivered {
            client_id: message.client_id,
            message_id: message.id,
        });
    }

    async fn handle_read(&mut self, room: Option<String>, read_up_to: String) {
        if read_up_to.is_empty() {
            return;
        }
        let room = self.resolve_room(room);
        self.dispatcher
            .broadcast_except(
                &room,
                self.conn_id,
                GatewayEvent::MessageSeen {
                    room: room.clone(),
                    username: self.identity.username.clone(),
                    read_up_to,
                },
            )
            .await;
    }

    async fn handle_typing(&mut self, room: Option<String>, is_typing: bool) {
        let room = self.resolve_room(room);
        self.dispatcher
            .broadcast_except(
                &room,
                self.conn_id,
                GatewayEvent::Typing {
                    room: room.clone(),
                    username: self.identity.username.clone(),
                    is_typing,
                },
            )
            .await;
    }

    /// Explicit room, else the connection's current room, else the default.
    fn resolve_room(&self, room: Option<String>) -> String {
        room.as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from)
            .or_else(|| self.room.lock().expect("room lock poisoned").clone())
            .unwrap_or_else(|| DEFAULT_ROOM.to_string())
    }

    fn send_self_error(&self, code: &str, message: &str) {
        let _ = self.tx.send(GatewayEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
    }
}

/// Remove the connection from a room and announce the delta. The "left"
/// notice is only appended when the identity's last connection is gone.
async fn leave_room(dispatcher: &Dispatcher, db: &Arc<Database>, conn_id: Uuid, room: &str) {
    let Some(outcome) = dispatcher.leave(room, conn_id).await else {
        return;
    };

    if outcome.identity_left {
        let notice = ChatMessage::system(
            room,
            format!("{} left", outcome.username),
            Utc::now().timestamp_millis(),
        );
        match persist(db, notice.clone()).await {
            Ok(()) => {
                dispatcher
                    .broadcast(room, GatewayEvent::MessageNew { message: notice })
                    .await;
            }
            Err(e) => warn!("failed to persist leave notice for {}: {:#}", room, e),
        }
    }

    dispatcher
        .broadcast(
            room,
            GatewayEvent::RoomUsers {
                room: room.to_string(),
                users: outcome.users,
            },
        )
        .await;
}

fn normalize_room(room: Option<&str>) -> String {
    match room.map(str::trim) {
        Some(room) if !room.is_empty() => room.to_string(),
        _ => DEFAULT_ROOM.to_string(),
    }
}

/// Blocking storage calls run off the async runtime so no room lock or
/// executor thread is held across them.
async fn persist(db: &Arc<Database>, message: ChatMessage) -> anyhow::Result<()> {
    let db = db.clone();
    tokio::task::spawn_blocking(move || db.append_message(&message))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?
}

async fn recent_history(db: &Arc<Database>, room: &str) -> anyhow::Result<Vec<ChatMessage>> {
    let db = db.clone();
    let room = room.to_string();
    let rows = tokio::task::spawn_blocking(move || db.recent_messages(&room, HISTORY_LIMIT))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;
    Ok(rows.into_iter().map(|r| r.into_message()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct TestConn {
        ctx: ConnCtx,
        rx: UnboundedReceiver<GatewayEvent>,
    }

    fn conn(dispatcher: &Dispatcher, db: &Arc<Database>, username: &str) -> TestConn {
        let (tx, rx) = mpsc::unbounded_channel();
        TestConn {
            ctx: ConnCtx {
                dispatcher: dispatcher.clone(),
                db: db.clone(),
                identity: Identity {
                    id: Uuid::new_v4(),
                    username: username.into(),
                },
                conn_id: Uuid::new_v4(),
                tx,
                room: Arc::default(),
            },
            rx,
        }
    }

    impl TestConn {
        fn drain(&mut self) -> Vec<GatewayEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                out.push(event);
            }
            out
        }

        async fn join(&mut self, room: &str) {
            self.ctx.handle_join(Some(room.to_string())).await;
        }
    }

    fn setup() -> (Dispatcher, Arc<Database>) {
        (Dispatcher::new(), Arc::new(Database::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn join_replays_history_then_announces() {
        let (dispatcher, db) = setup();
        for i in 0..3 {
            db.append_message(&ChatMessage::user("general", "bob", format!("m{}", i), None, i))
                .unwrap();
        }

        let mut alice = conn(&dispatcher, &db, "alice");
        alice.join("general").await;

        let events = alice.drain();
        match &events[0] {
            GatewayEvent::RoomHistory { room, messages } => {
                assert_eq!(room, "general");
                let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
                assert_eq!(texts, vec!["m0", "m1", "m2"]);
            }
            other => panic!("expected RoomHistory first, got {:?}", other),
        }
        match &events[1] {
            GatewayEvent::RoomJoined { users, .. } => assert_eq!(users, &vec!["alice".to_string()]),
            other => panic!("expected RoomJoined second, got {:?}", other),
        }
        // the join notice is persisted and broadcast after history
        match &events[2] {
            GatewayEvent::MessageNew { message } => {
                assert!(message.system);
                assert_eq!(message.text, "alice joined");
            }
            other => panic!("expected join notice, got {:?}", other),
        }
        assert!(matches!(events[3], GatewayEvent::RoomUsers { .. }));

        // and it is in the log for the next joiner
        let rows = db.recent_messages("general", 10).unwrap();
        assert_eq!(rows.last().unwrap().text, "alice joined");
    }

    #[tokio::test]
    async fn send_broadcasts_to_all_and_acks_sender_only() {
        let (dispatcher, db) = setup();
        let mut alice = conn(&dispatcher, &db, "alice");
        let mut bob = conn(&dispatcher, &db, "bob");
        alice.join("general").await;
        bob.join("general").await;
        alice.drain();
        bob.drain();

        alice
            .ctx
            .handle_send(None, "hi".into(), Some("c1".into()))
            .await;

        let alice_events = alice.drain();
        let bob_events = bob.drain();

        let broadcast_id = match &bob_events[..] {
            [GatewayEvent::MessageNew { message }] => {
                assert_eq!(message.text, "hi");
                assert_eq!(message.username.as_deref(), Some("alice"));
                message.id
            }
            other => panic!("bob expected exactly the broadcast, got {:?}", other),
        };

        // sender sees the same broadcast plus the delivery ack with its
        // client id
        match &alice_events[..] {
            [
                GatewayEvent::MessageNew { message },
                GatewayEvent::MessageDelivered { client_id, message_id },
            ] => {
                assert_eq!(message.id, broadcast_id);
                assert_eq!(client_id.as_deref(), Some("c1"));
                assert_eq!(*message_id, broadcast_id);
            }
            other => panic!("alice expected broadcast + ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_text_is_a_silent_noop() {
        let (dispatcher, db) = setup();
        let mut alice = conn(&dispatcher, &db, "alice");
        alice.join("general").await;
        alice.drain();

        alice.ctx.handle_send(None, "   ".into(), Some("c1".into())).await;

        assert!(alice.drain().is_empty());
        // only the join notice is in the log
        assert_eq!(db.recent_messages("general", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_order_is_history_order() {
        let (dispatcher, db) = setup();
        let mut alice = conn(&dispatcher, &db, "alice");
        alice.join("general").await;

        alice.ctx.handle_send(None, "first".into(), None).await;
        alice.ctx.handle_send(None, "second".into(), None).await;

        let rows = db.recent_messages("general", 10).unwrap();
        let texts: Vec<_> = rows.iter().filter(|r| !r.system).map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn typing_and_read_markers_exclude_sender() {
        let (dispatcher, db) = setup();
        let mut alice = conn(&dispatcher, &db, "alice");
        let mut bob = conn(&dispatcher, &db, "bob");
        alice.join("general").await;
        bob.join("general").await;
        alice.drain();
        bob.drain();

        alice.ctx.handle_typing(None, true).await;
        alice.ctx.handle_read(None, "some-message-id".into()).await;

        assert!(alice.drain().is_empty());
        let bob_events = bob.drain();
        assert!(matches!(
            &bob_events[..],
            [
                GatewayEvent::Typing { username, is_typing: true, .. },
                GatewayEvent::MessageSeen { read_up_to, .. },
            ] if username == "alice" && read_up_to == "some-message-id"
        ));

        // ephemeral signals are never persisted
        assert_eq!(db.recent_messages("general", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn switching_rooms_leaves_the_previous_one() {
        let (dispatcher, db) = setup();
        let mut alice = conn(&dispatcher, &db, "alice");
        let mut bob = conn(&dispatcher, &db, "bob");
        alice.join("general").await;
        bob.join("general").await;
        alice.drain();
        bob.drain();

        alice.join("random").await;

        assert_eq!(dispatcher.members("general").await, vec!["bob"]);
        assert_eq!(dispatcher.members("random").await, vec!["alice"]);

        // bob sees the departure notice and the shrunk member list
        let bob_events = bob.drain();
        assert!(matches!(
            &bob_events[..],
            [
                GatewayEvent::MessageNew { message },
                GatewayEvent::RoomUsers { users, .. },
            ] if message.system && message.text == "alice left" && users == &vec!["bob".to_string()]
        ));
    }

    #[tokio::test]
    async fn rejoining_same_room_does_not_duplicate_presence() {
        let (dispatcher, db) = setup();
        let mut alice = conn(&dispatcher, &db, "alice");
        alice.join("general").await;
        alice.drain();

        alice.join("general").await;

        assert_eq!(dispatcher.members("general").await, vec!["alice"]);
        // no second "alice joined" notice was logged
        let notices = db
            .recent_messages("general", 10)
            .unwrap()
            .into_iter()
            .filter(|r| r.system)
            .count();
        assert_eq!(notices, 1);
    }

    #[tokio::test]
    async fn disconnect_cleanup_announces_and_forgets() {
        let (dispatcher, db) = setup();
        let mut alice = conn(&dispatcher, &db, "alice");
        let mut bob = conn(&dispatcher, &db, "bob");
        alice.join("general").await;
        bob.join("general").await;
        bob.drain();

        leave_room(&dispatcher, &db, alice.ctx.conn_id, "general").await;

        assert_eq!(dispatcher.members("general").await, vec!["bob"]);
        let bob_events = bob.drain();
        assert!(
            bob_events
                .iter()
                .any(|e| matches!(e, GatewayEvent::MessageNew { message } if message.text == "alice left"))
        );

        // last member out deletes the room entry entirely
        leave_room(&dispatcher, &db, bob.ctx.conn_id, "general").await;
        assert!(dispatcher.members("general").await.is_empty());
    }

    #[tokio::test]
    async fn room_defaults_and_normalization() {
        let (dispatcher, db) = setup();
        let mut alice = conn(&dispatcher, &db, "alice");

        // blank room falls back to the default
        alice.ctx.handle_join(Some("   ".into())).await;
        assert_eq!(dispatcher.members(DEFAULT_ROOM).await, vec!["alice"]);

        // a trimmed name is used as-is
        alice.ctx.handle_join(Some("  lounge  ".into())).await;
        assert_eq!(dispatcher.members("lounge").await, vec!["alice"]);
    }
}
