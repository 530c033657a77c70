//! In-process connections for driving user actors without a socket.

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::hub::HubHandle;
use crate::messages::{Message, STATUS};
use crate::store::HistoryStore;
use crate::transport::Frame;
use crate::user::{Profile, User};

/// Defaults with timers long enough that only the status debounce fires in a test.
pub fn test_config() -> Arc<Config> {
    Arc::new(Config {
        heartbeat_secs: 3600,
        read_wait_secs: 86_400,
        ..Config::default()
    })
}

fn sink_error(err: mpsc::SendError) -> RelayError {
    RelayError::Transport(err.to_string())
}

pub struct Client {
    to_server: Option<mpsc::UnboundedSender<Result<Frame>>>,
    from_server: mpsc::UnboundedReceiver<Frame>,
}

impl Client {
    pub fn connect(
        hub: &HubHandle,
        store: Arc<dyn HistoryStore>,
        name: &str,
        room: Option<&str>,
    ) -> Self {
        Self::connect_with(hub, store, test_config(), name, room)
    }

    pub fn connect_with(
        hub: &HubHandle,
        store: Arc<dyn HistoryStore>,
        config: Arc<Config>,
        name: &str,
        room: Option<&str>,
    ) -> Self {
        let (to_server, server_rx) = mpsc::unbounded();
        let (server_tx, from_server) = mpsc::unbounded();
        let profile = Profile {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        User::spawn(
            server_tx.sink_map_err(sink_error),
            server_rx,
            profile,
            room.map(str::to_string),
            hub.clone(),
            store,
            config,
        );
        Client {
            to_server: Some(to_server),
            from_server,
        }
    }

    pub fn send(&self, value: serde_json::Value) {
        self.send_raw(&value.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        self.to_server
            .as_ref()
            .expect("client is disconnected")
            .unbounded_send(Ok(Frame::Text(text.to_string())))
            .expect("user actor stopped reading");
    }

    /// Ends the inbound stream, as a dropped socket would.
    pub fn disconnect(&mut self) {
        self.to_server = None;
    }

    /// Next frame of any kind, or `None` if nothing arrives within `wait`.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<Frame> {
        timeout(wait, self.from_server.next()).await.ok().flatten()
    }

    async fn next_message(&mut self, wait: Duration) -> Option<Message> {
        loop {
            match timeout(wait, self.from_server.next()).await {
                Ok(Some(Frame::Text(text))) => {
                    return Some(serde_json::from_str(&text).expect("server sent invalid json"))
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    pub async fn try_next_named(&mut self, name: &str, wait: Duration) -> Option<Message> {
        while let Some(message) = self.next_message(wait).await {
            if message.name == name {
                return Some(message);
            }
        }
        None
    }

    pub async fn next_named(&mut self, name: &str) -> Message {
        self.try_next_named(name, Duration::from_secs(30))
            .await
            .unwrap_or_else(|| panic!("no {name} message arrived"))
    }

    pub async fn expect_status(&mut self, room: &str) -> Message {
        loop {
            let message = self.next_named(STATUS).await;
            if message.room == room {
                return message;
            }
        }
    }

    /// Whether the server closed the connection within a generous deadline.
    pub async fn closed(&mut self) -> bool {
        loop {
            match timeout(Duration::from_secs(300), self.from_server.next()).await {
                Ok(None) => return true,
                Ok(Some(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}
