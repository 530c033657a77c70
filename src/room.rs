//! Room actor: sole owner of one room's membership.
//!
//! Registration, unregistration, broadcasts and queries are serialized through the
//! room's mailbox, so every member observes broadcasts in the same order. Delivery to
//! members never blocks: a member whose send queue is full is handled according to
//! the configured [`Backpressure`] policy.

use std::collections::HashMap;
use std::future;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{Backpressure, Config};
use crate::error::{RelayError, Result};
use crate::history::RecentHistory;
use crate::hub::HubHandle;
use crate::messages::Message;
use crate::store::HistoryStore;
use crate::user::UserHandle;

pub const GLOBAL: &str = "global";

#[derive(Debug)]
pub enum RoomCommand {
    /// `ack` is answered once the user is a member. A closing room drops it unanswered.
    Register {
        user: UserHandle,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        user: Uuid,
    },
    Broadcast(Message),
    Status {
        reply: oneshot::Sender<Message>,
    },
    Recent {
        reply: oneshot::Sender<Vec<Message>>,
    },
}

/// Address of a running room. Cloning it does not keep the room alive.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    name: Arc<str>,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether both handles address the same room instance.
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn send(&self, cmd: RoomCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| RelayError::RoomClosed(self.name.to_string()))
    }

    pub async fn register(&self, user: UserHandle) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(RoomCommand::Register { user, ack }).await?;
        done.await
            .map_err(|_| RelayError::RoomClosed(self.name.to_string()))
    }

    pub async fn unregister(&self, user: Uuid) -> Result<()> {
        self.send(RoomCommand::Unregister { user }).await
    }

    pub async fn broadcast(&self, message: Message) -> Result<()> {
        self.send(RoomCommand::Broadcast(message)).await
    }

    pub async fn status(&self) -> Result<Message> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Status { reply }).await?;
        rx.await
            .map_err(|_| RelayError::RoomClosed(self.name.to_string()))
    }

    pub async fn recent(&self) -> Result<Vec<Message>> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Recent { reply }).await?;
        rx.await
            .map_err(|_| RelayError::RoomClosed(self.name.to_string()))
    }
}

pub struct Room {
    name: Arc<str>,
    autoclose: bool,
    members: HashMap<Uuid, UserHandle>,
    /// Set once anyone has registered; only such rooms announce their closing roster.
    occupied: bool,
    recent: RecentHistory,
    status_due: Option<Instant>,
    rx: mpsc::Receiver<RoomCommand>,
    me: RoomHandle,
    hub: HubHandle,
    persist: mpsc::UnboundedSender<Message>,
    config: Arc<Config>,
}

impl Room {
    /// Starts a room actor and its persistence task.
    pub fn spawn(
        name: &str,
        autoclose: bool,
        hub: HubHandle,
        store: Arc<dyn HistoryStore>,
        config: Arc<Config>,
    ) -> RoomHandle {
        let name: Arc<str> = Arc::from(name);
        let (tx, rx) = mpsc::channel(config.room_mailbox_capacity);
        let me = RoomHandle {
            name: Arc::clone(&name),
            tx,
        };

        let (persist, queue) = mpsc::unbounded_channel();
        tokio::spawn(persist_events(Arc::clone(&name), store, queue));

        let room = Room {
            name,
            autoclose,
            members: HashMap::new(),
            occupied: false,
            recent: RecentHistory::new(config.recent_history),
            // A room nobody registers with closes once this first deadline passes.
            status_due: autoclose.then(|| Instant::now() + config.status_debounce()),
            rx,
            me: me.clone(),
            hub,
            persist,
            config,
        };
        tokio::spawn(room.run());
        me
    }

    async fn run(mut self) {
        info!("[room {}] opened (autoclose: {})", self.name, self.autoclose);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.handle(cmd) && self.should_close() {
                        break;
                    }
                }
                () = status_timer(self.status_due) => {
                    self.status_due = None;
                    if self.should_close() {
                        break;
                    }
                    if self.publish_status() && self.should_close() {
                        break;
                    }
                }
            }
        }

        // The debounced status is abandoned with the room; observers still need the
        // empty roster.
        if self.occupied && self.members.is_empty() {
            self.hub.status_update(Message::status(&self.name, Vec::new()));
        }
        // Pending registrations are dropped with the mailbox, so their users re-join
        // through the hub, which has already removed this instance.
        self.hub.unregister_room(self.me.clone());
        info!("[room {}] closed", self.name);
    }

    /// Applies one command; returns whether membership shrank.
    fn handle(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::Register { user, ack } => {
                debug!("[room {}] register {}", self.name, user.name());
                self.members.insert(user.id(), user);
                self.occupied = true;
                self.schedule_status();
                let _ = ack.send(());
                false
            }
            RoomCommand::Unregister { user } => {
                let Some(user) = self.members.remove(&user) else {
                    return false;
                };
                debug!("[room {}] unregister {}", self.name, user.name());
                self.schedule_status();
                true
            }
            RoomCommand::Broadcast(message) => {
                let shrank = self.deliver(&message);
                if message.is_event() {
                    self.recent.push(message.clone());
                    if self.persist.send(message).is_err() {
                        warn!("[room {}] persistence task is gone", self.name);
                    }
                }
                shrank
            }
            RoomCommand::Status { reply } => {
                let _ = reply.send(self.status_message());
                false
            }
            RoomCommand::Recent { reply } => {
                let _ = reply.send(self.recent.snapshot());
                false
            }
        }
    }

    fn should_close(&self) -> bool {
        self.autoclose && self.members.is_empty()
    }

    /// (Re)arms the single debounce deadline.
    fn schedule_status(&mut self) {
        self.status_due = Some(Instant::now() + self.config.status_debounce());
    }

    fn status_message(&self) -> Message {
        let mut names: Vec<String> = self.members.values().map(|u| u.name().to_string()).collect();
        names.sort();
        Message::status(&self.name, names)
    }

    fn publish_status(&mut self) -> bool {
        let status = self.status_message();
        debug!("[room {}] status: {} members", self.name, self.members.len());
        let shrank = self.deliver(&status);
        self.hub.status_update(status);
        shrank
    }

    /// Fans a message out without ever waiting on a member. Returns whether any member
    /// was dropped.
    fn deliver(&mut self, message: &Message) -> bool {
        let mut dead = Vec::new();
        for (id, member) in &self.members {
            match member.try_deliver(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => match self.config.backpressure {
                    Backpressure::Disconnect => {
                        warn!("[room {}] {} is not keeping up, dropping", self.name, member.name());
                        dead.push(*id);
                    }
                    Backpressure::Drop => {
                        debug!("[room {}] queue full for {}, skipped", self.name, member.name());
                    }
                },
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        if dead.is_empty() {
            return false;
        }
        for id in dead {
            if let Some(member) = self.members.remove(&id) {
                member.kick();
            }
        }
        self.schedule_status();
        true
    }
}

async fn status_timer(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => future::pending().await,
    }
}

/// Appends events in broadcast order; failures are logged and never reach the room.
async fn persist_events(
    room: Arc<str>,
    store: Arc<dyn HistoryStore>,
    mut queue: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = store.append(message).await {
            warn!("[room {room}] failed to persist event: {e}");
        }
    }
}
