//! Hub actor: the process-wide room registry.
//!
//! Only the hub loop reads or writes the registry. Join requests for an unknown room
//! create it inside the loop, so concurrent joins for the same name resolve to one room.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::messages::Message;
use crate::room::{Room, RoomHandle, GLOBAL};
use crate::store::HistoryStore;
use crate::user::UserHandle;

#[derive(Debug)]
pub enum HubCommand {
    /// Sent by a room that closed itself; removes it only if it is still the registered one.
    Unregister(RoomHandle),
    Join { user: UserHandle, room: String },
    StatusUpdate(Message),
    Rooms { reply: oneshot::Sender<Vec<String>> },
}

#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn new(tx: mpsc::UnboundedSender<HubCommand>) -> Self {
        HubHandle { tx }
    }

    fn send(&self, cmd: HubCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| RelayError::HubGone)
    }

    /// The room arrives later on the user's event channel as `UserEvent::Joined`.
    pub fn join(&self, user: UserHandle, room: String) -> Result<()> {
        self.send(HubCommand::Join { user, room })
    }

    pub fn unregister_room(&self, room: RoomHandle) {
        if self.send(HubCommand::Unregister(room)).is_err() {
            error!("[hub] gone, cannot unregister room");
        }
    }

    pub fn status_update(&self, status: Message) {
        if self.send(HubCommand::StatusUpdate(status)).is_err() {
            error!("[hub] gone, dropping status update");
        }
    }

    /// Names of all registered rooms, sorted.
    pub async fn rooms(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Rooms { reply })?;
        rx.await.map_err(|_| RelayError::HubGone)
    }
}

pub struct Hub {
    rooms: HashMap<String, RoomHandle>,
    global: RoomHandle,
    rx: mpsc::UnboundedReceiver<HubCommand>,
    me: HubHandle,
    store: Arc<dyn HistoryStore>,
    config: Arc<Config>,
}

impl Hub {
    /// Starts the hub with its global room.
    pub fn spawn(store: Arc<dyn HistoryStore>, config: Arc<Config>) -> HubHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let me = HubHandle::new(tx);

        let global = Room::spawn(GLOBAL, false, me.clone(), Arc::clone(&store), Arc::clone(&config));
        let mut rooms = HashMap::new();
        rooms.insert(GLOBAL.to_string(), global.clone());

        let hub = Hub {
            rooms,
            global,
            rx,
            me: me.clone(),
            store,
            config,
        };
        tokio::spawn(hub.run());
        me
    }

    async fn run(mut self) {
        info!("[hub] running");
        // `self.me` keeps the mailbox open, so this loop only ends with the runtime.
        while let Some(cmd) = self.rx.recv().await {
            let handled = AssertUnwindSafe(self.handle(cmd)).catch_unwind().await;
            if handled.is_err() {
                error!("[hub] request handler panicked, continuing");
            }
        }
        error!("[hub] mailbox closed");
    }

    async fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Unregister(room) => {
                let registered = self
                    .rooms
                    .get(room.name())
                    .is_some_and(|current| current.same_room(&room));
                if registered {
                    self.rooms.remove(room.name());
                    info!("[hub] removed room {} ({} rooms)", room.name(), self.rooms.len());
                }
            }
            HubCommand::Join { user, room } => {
                let handle = self.resolve(&room);
                if let Err(e) = user.joined(handle) {
                    debug!("[hub] join reply for {room} not delivered: {e}");
                }
                if room == GLOBAL {
                    self.send_snapshot(user);
                }
            }
            HubCommand::StatusUpdate(status) => {
                if self.global.broadcast(status).await.is_err() {
                    warn!("[hub] global room is not accepting messages");
                }
            }
            HubCommand::Rooms { reply } => {
                let mut names: Vec<String> = self.rooms.keys().cloned().collect();
                names.sort();
                let _ = reply.send(names);
            }
        }
    }

    fn resolve(&mut self, name: &str) -> RoomHandle {
        if let Some(room) = self.rooms.get(name) {
            return room.clone();
        }
        self.create_room(name, true)
    }

    fn create_room(&mut self, name: &str, autoclose: bool) -> RoomHandle {
        let room = Room::spawn(
            name,
            autoclose,
            self.me.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        );
        self.rooms.insert(name.to_string(), room.clone());
        info!("[hub] created room {name} ({} rooms)", self.rooms.len());
        room
    }

    /// Queues the current roster of every room for a user that joined the global room.
    fn send_snapshot(&self, user: UserHandle) {
        let rooms: Vec<RoomHandle> = self.rooms.values().cloned().collect();
        tokio::spawn(async move {
            for room in rooms {
                let Ok(status) = room.status().await else {
                    continue;
                };
                if user.deliver(status).await.is_err() {
                    break;
                }
            }
        });
    }
}
