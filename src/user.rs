//! User actor: one per connection.
//!
//! The actor loop owns the write half of the connection, the user's room memberships and
//! its outbound queue. A separate reader task decodes inbound frames and hands them to the
//! loop; it never touches room or hub state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::hub::HubHandle;
use crate::messages::{Message, MessageType, UserStamp};
use crate::room::RoomHandle;
use crate::store::HistoryStore;
use crate::transport::Frame;

/// Control events addressed to a user by the hub or a room.
#[derive(Debug)]
pub enum UserEvent {
    Joined(RoomHandle),
    /// A room dropped this user; the connection must close.
    Kick,
}

/// Address of a running user actor, as held by rooms and the hub.
#[derive(Debug, Clone)]
pub struct UserHandle {
    id: Uuid,
    name: Arc<str>,
    send: mpsc::Sender<Message>,
    events: mpsc::UnboundedSender<UserEvent>,
}

impl UserHandle {
    pub fn new(
        id: Uuid,
        name: &str,
        send: mpsc::Sender<Message>,
        events: mpsc::UnboundedSender<UserEvent>,
    ) -> Self {
        UserHandle {
            id,
            name: Arc::from(name),
            send,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stamp(&self) -> UserStamp {
        UserStamp {
            name: self.name.to_string(),
            id: self.id.to_string(),
        }
    }

    /// Enqueues without waiting; used on every room fan-out path.
    pub fn try_deliver(&self, message: Message) -> std::result::Result<(), TrySendError<Message>> {
        self.send.try_send(message)
    }

    /// Enqueues, waiting for queue space. Only for detached reply tasks.
    pub async fn deliver(&self, message: Message) -> Result<()> {
        self.send
            .send(message)
            .await
            .map_err(|_| RelayError::UserGone(self.name.to_string()))
    }

    pub fn joined(&self, room: RoomHandle) -> Result<()> {
        self.events
            .send(UserEvent::Joined(room))
            .map_err(|_| RelayError::UserGone(self.name.to_string()))
    }

    pub fn kick(&self) {
        let _ = self.events.send(UserEvent::Kick);
    }
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug)]
enum Inbound {
    Read(Message),
    Die(RelayError),
}

pub struct User<S> {
    me: UserHandle,
    sink: S,
    rooms: HashMap<String, RoomHandle>,
    pending: HashSet<String>,
    events: mpsc::UnboundedReceiver<UserEvent>,
    outbound: mpsc::Receiver<Message>,
    inbound: mpsc::Receiver<Inbound>,
    hub: HubHandle,
    store: Arc<dyn HistoryStore>,
    config: Arc<Config>,
}

impl<S> User<S>
where
    S: Sink<Frame, Error = RelayError> + Unpin + Send + 'static,
{
    /// Starts the user actor and its reader task over an established connection.
    pub fn spawn<R>(
        sink: S,
        stream: R,
        profile: Profile,
        initial_room: Option<String>,
        hub: HubHandle,
        store: Arc<dyn HistoryStore>,
        config: Arc<Config>,
    ) -> (UserHandle, JoinHandle<()>)
    where
        R: Stream<Item = Result<Frame>> + Unpin + Send + 'static,
    {
        let (send, outbound) = mpsc::channel(config.send_queue_capacity);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::channel(config.inbound_capacity);
        let me = UserHandle::new(profile.id, &profile.name, send, events_tx);

        let reader = tokio::spawn(read_frames(
            stream,
            inbound_tx,
            config.read_wait(),
            Arc::clone(&me.name),
        ));

        let user = User {
            me: me.clone(),
            sink,
            rooms: HashMap::new(),
            pending: HashSet::new(),
            events,
            outbound,
            inbound,
            hub,
            store,
            config,
        };
        let task = tokio::spawn(user.run(initial_room, reader));
        (me, task)
    }

    async fn run(mut self, initial_room: Option<String>, reader: JoinHandle<()>) {
        info!("[user {}] connected as {}", self.me.name, self.me.id);
        if let Some(room) = initial_room {
            self.request_join(room);
        }

        let period = self.config.heartbeat();
        let mut heartbeat = interval_at(Instant::now() + period, period);

        let reason = loop {
            tokio::select! {
                Some(event) = self.events.recv() => match event {
                    UserEvent::Joined(room) => self.on_joined(room).await,
                    UserEvent::Kick => break RelayError::SlowConsumer,
                },
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Read(message)) => self.on_read(message).await,
                    Some(Inbound::Die(reason)) => break reason,
                    None => break RelayError::Closed,
                },
                Some(message) = self.outbound.recv() => {
                    if let Err(e) = self.write_message(&message).await {
                        break e;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.write(Frame::Ping(Vec::new())).await {
                        break e;
                    }
                }
            }
        };

        reader.abort();
        self.teardown(reason).await;
    }

    fn request_join(&mut self, room: String) {
        if room.is_empty() || self.rooms.contains_key(&room) || !self.pending.insert(room.clone()) {
            return;
        }
        debug!("[user {}] requesting join of {}", self.me.name, room);
        if let Err(e) = self.hub.join(self.me.clone(), room) {
            warn!("[user {}] join failed: {e}", self.me.name);
        }
    }

    async fn on_joined(&mut self, room: RoomHandle) {
        let name = room.name().to_string();
        // Not pending means the user parted before the reply arrived.
        if !self.pending.remove(&name) || self.rooms.contains_key(&name) {
            return;
        }
        match room.register(self.me.clone()).await {
            Ok(()) => {
                info!("[user {}] joined {}", self.me.name, name);
                self.rooms.insert(name, room);
            }
            Err(e) => {
                // The room closed between resolution and registration.
                debug!("[user {}] {e}, asking the hub again", self.me.name);
                self.request_join(name);
            }
        }
    }

    async fn on_read(&mut self, message: Message) {
        match message.kind {
            MessageType::Command => match message.name.as_str() {
                "join" => self.request_join(message.room),
                "part" => self.part(&message.room).await,
                "history" => self.send_history(&message),
                "log" => self.send_log(&message.room),
                other => debug!("[user {}] unknown command {other}", self.me.name),
            },
            MessageType::Event => {
                let Some(room) = self.rooms.get(&message.room).cloned() else {
                    debug!(
                        "[user {}] dropping event for {}, not a member",
                        self.me.name, message.room
                    );
                    return;
                };
                if room.broadcast(message.stamped(self.me.stamp())).await.is_err() {
                    self.rooms.remove(room.name());
                }
            }
        }
    }

    async fn part(&mut self, room: &str) {
        self.pending.remove(room);
        if let Some(room) = self.rooms.remove(room) {
            info!("[user {}] leaving {}", self.me.name, room.name());
            let _ = room.unregister(self.me.id).await;
        }
    }

    /// Answers from the durable store on a detached task, without going through the room.
    fn send_history(&self, request: &Message) {
        if request.room.is_empty() {
            return;
        }
        let room = request.room.clone();
        let limit = self.config.page_limit(request.data_u32("limit"));
        let offset = request.data_u32("offset").unwrap_or(0);
        let store = Arc::clone(&self.store);
        let me = self.me.clone();

        tokio::spawn(async move {
            match store.query(&room, limit, offset).await {
                Ok(page) => {
                    let _ = me.deliver(Message::history(&room, &page.messages, page.total)).await;
                }
                Err(e) => warn!("[user {}] history query for {room} failed: {e}", me.name),
            }
        });
    }

    fn send_log(&self, room: &str) {
        let Some(room) = self.rooms.get(room).cloned() else {
            return;
        };
        let me = self.me.clone();
        tokio::spawn(async move {
            if let Ok(recent) = room.recent().await {
                let _ = me.deliver(Message::log(room.name(), &recent)).await;
            }
        });
    }

    async fn write(&mut self, frame: Frame) -> Result<()> {
        let wait = self.config.write_wait();
        timeout(wait, self.sink.send(frame))
            .await
            .map_err(|_| RelayError::WriteTimeout(wait))?
    }

    async fn write_message(&mut self, message: &Message) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.write(Frame::Text(text)).await
    }

    /// Leaves every joined room, then closes the connection.
    async fn teardown(mut self, reason: RelayError) {
        if reason.is_disconnect() {
            info!("[user {}] disconnected", self.me.name);
        } else {
            info!("[user {}] closing: {reason}", self.me.name);
        }

        for (name, room) in self.rooms.drain() {
            debug!("[user {}] unregistering from {name}", self.me.name);
            if let Err(e) = room.unregister(self.me.id).await {
                debug!("[user {}] {e}", self.me.name);
            }
        }

        let wait = self.config.write_wait();
        let _ = timeout(wait, self.sink.close()).await;
    }
}

/// Decodes frames until the connection fails, then reports exactly one `Die`.
async fn read_frames<R>(
    mut stream: R,
    inbound: mpsc::Sender<Inbound>,
    read_wait: Duration,
    who: Arc<str>,
) where
    R: Stream<Item = Result<Frame>> + Unpin,
{
    let reason = loop {
        let frame = match timeout(read_wait, stream.next()).await {
            Err(_) => break RelayError::ReadTimeout(read_wait),
            Ok(None) => break RelayError::Closed,
            Ok(Some(Err(e))) => break e,
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Frame::Text(text) => match serde_json::from_str::<Message>(&text) {
                Ok(message) => {
                    if inbound.send(Inbound::Read(message)).await.is_err() {
                        return;
                    }
                }
                Err(e) => break e.into(),
            },
            Frame::Ping(_) | Frame::Pong(_) => {}
            Frame::Binary(_) => break RelayError::Binary,
            Frame::Close => break RelayError::Closed,
        }
    };
    debug!("[user {who}] reader stopping: {reason}");
    let _ = inbound.send(Inbound::Die(reason)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubCommand};
    use crate::room::Room;
    use crate::store::MemoryStore;
    use crate::testing::{test_config, Client};
    use serde_json::json;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// A connection whose writes never complete.
    struct Stalled;

    impl Sink<Frame> for Stalled {
        type Error = RelayError;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Frame) -> Result<()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn user_list(message: &Message) -> Vec<String> {
        serde_json::from_value(message.data["user_list"].clone()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn join_then_event_reaches_every_member_stamped() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::spawn(store.clone(), test_config());
        let mut a = Client::connect(&hub, store.clone(), "A", Some("lobby"));
        let mut b = Client::connect(&hub, store.clone(), "B", Some("lobby"));

        a.expect_status("lobby").await;
        b.expect_status("lobby").await;

        a.send(json!({
            "type": "event", "room": "lobby", "name": "text",
            "data": { "body": "hi" },
            "user": { "name": "mallory", "id": "forged" }
        }));

        for client in [&mut a, &mut b] {
            let got = client.next_named("text").await;
            assert_eq!(got.data["body"], "hi");
            assert_eq!(got.user.name, "A");
            assert_ne!(got.user.id, "forged");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn events_for_rooms_not_joined_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::spawn(store.clone(), test_config());
        let mut a = Client::connect(&hub, store.clone(), "A", Some("lobby"));
        let mut b = Client::connect(&hub, store.clone(), "B", Some("other"));
        a.expect_status("lobby").await;
        b.expect_status("other").await;

        b.send(json!({ "type": "event", "room": "lobby", "name": "text" }));
        assert!(a.try_next_named("text", Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_leaves_every_joined_room() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::spawn(store.clone(), test_config());
        let mut watcher_a = Client::connect(&hub, store.clone(), "WA", Some("a"));
        let mut watcher_b = Client::connect(&hub, store.clone(), "WB", Some("b"));
        let mut u = Client::connect(&hub, store.clone(), "U", Some("a"));
        u.send(json!({ "type": "command", "name": "join", "room": "b" }));

        let status = watcher_a.expect_status("a").await;
        assert_eq!(user_list(&status), ["U", "WA"]);
        let status = watcher_b.expect_status("b").await;
        assert_eq!(user_list(&status), ["U", "WB"]);

        u.disconnect();
        assert_eq!(user_list(&watcher_a.expect_status("a").await), ["WA"]);
        assert_eq!(user_list(&watcher_b.expect_status("b").await), ["WB"]);
    }

    #[tokio::test(start_paused = true)]
    async fn part_removes_membership() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::spawn(store.clone(), test_config());
        let mut a = Client::connect(&hub, store.clone(), "A", Some("lobby"));
        let mut b = Client::connect(&hub, store.clone(), "B", Some("lobby"));
        assert_eq!(user_list(&a.expect_status("lobby").await), ["A", "B"]);
        b.expect_status("lobby").await;

        b.send(json!({ "type": "command", "name": "part", "room": "lobby" }));
        assert_eq!(user_list(&a.expect_status("lobby").await), ["A"]);

        b.send(json!({ "type": "event", "room": "lobby", "name": "text" }));
        assert!(a.try_next_named("text", Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn history_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::spawn(store.clone(), test_config());
        let mut a = Client::connect(&hub, store.clone(), "A", Some("lobby"));
        a.expect_status("lobby").await;

        for n in 0..3 {
            a.send(json!({ "type": "event", "room": "lobby", "name": "text", "data": { "n": n } }));
            a.next_named("text").await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        a.send(json!({
            "type": "command", "name": "history", "room": "lobby",
            "data": { "limit": 2, "offset": 1 }
        }));
        let reply = a.next_named("history").await;
        assert_eq!(reply.room, "lobby");
        assert_eq!(reply.data["total"], 3);
        let messages = reply.data["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["data"]["n"], 1);
        assert_eq!(messages[0]["user"]["name"], "A");
    }

    #[tokio::test(start_paused = true)]
    async fn log_returns_recent_room_events() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::spawn(store.clone(), test_config());
        let mut a = Client::connect(&hub, store.clone(), "A", Some("lobby"));
        a.expect_status("lobby").await;

        a.send(json!({ "type": "event", "room": "lobby", "name": "text", "data": { "body": "x" } }));
        a.next_named("text").await;
        a.send(json!({ "type": "command", "name": "log", "room": "lobby" }));

        let reply = a.next_named("log").await;
        let messages = reply.data["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["data"]["body"], "x");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_closes_connection() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::spawn(store.clone(), test_config());
        let mut watcher = Client::connect(&hub, store.clone(), "W", Some("lobby"));
        let mut bad = Client::connect(&hub, store.clone(), "bad", Some("lobby"));
        assert_eq!(user_list(&watcher.expect_status("lobby").await), ["W", "bad"]);

        bad.send_raw("{not json");
        assert!(bad.closed().await);
        assert_eq!(user_list(&watcher.expect_status("lobby").await), ["W"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_reader_times_out() {
        let store = Arc::new(MemoryStore::new());
        let config = Config {
            read_wait_secs: 30,
            ..(*test_config()).clone()
        };
        let hub = Hub::spawn(store.clone(), Arc::new(config.clone()));
        let mut idle = Client::connect_with(&hub, store, Arc::new(config), "idle", None);
        assert!(idle.closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out_and_leaves_rooms() {
        let store = Arc::new(MemoryStore::new());
        let config = test_config();
        let hub = Hub::spawn(store.clone(), config.clone());
        let mut watcher = Client::connect(&hub, store.clone(), "W", Some("lobby"));

        let (_keep_open, stream) = futures::channel::mpsc::unbounded::<Result<Frame>>();
        let profile = Profile {
            id: Uuid::new_v4(),
            name: "S".to_string(),
        };
        let started = Instant::now();
        let (_, task) = User::spawn(
            Stalled,
            stream,
            profile,
            Some("lobby".to_string()),
            hub.clone(),
            store,
            config.clone(),
        );

        assert_eq!(user_list(&watcher.expect_status("lobby").await), ["S", "W"]);
        task.await.unwrap();
        assert!(started.elapsed() <= config.status_debounce() + config.write_wait() + Duration::from_secs(1));
        assert_eq!(user_list(&watcher.expect_status("lobby").await), ["W"]);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_every_period() {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(Config {
            heartbeat_secs: 5,
            ..(*test_config()).clone()
        });
        let hub = Hub::spawn(store.clone(), config.clone());
        let started = Instant::now();
        let mut client = Client::connect_with(&hub, store, config, "idle", None);

        for n in 1..=3 {
            let frame = client.next_frame(Duration::from_secs(30)).await;
            assert!(matches!(frame, Some(Frame::Ping(_))), "expected ping, got {frame:?}");
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_secs(5 * n) && elapsed < Duration::from_secs(5 * n + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn part_before_join_reply_cancels_the_join() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();
        let hub = HubHandle::new(hub_tx);
        let client = Client::connect(&hub, store.clone(), "A", None);

        client.send(json!({ "type": "command", "name": "join", "room": "lobby" }));
        let HubCommand::Join { user, room } = hub_rx.recv().await.unwrap() else {
            panic!("expected a join request");
        };
        assert_eq!(room, "lobby");

        client.send(json!({ "type": "command", "name": "part", "room": "lobby" }));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lobby = Room::spawn("lobby", true, hub.clone(), store, test_config());
        user.joined(lobby.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(user_list(&lobby.status().await.unwrap()).is_empty());
    }
}
