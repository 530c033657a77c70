//! Durable message log queried for paginated history.
//!
//! Rooms append every broadcast event; users query pages directly, bypassing the room,
//! so a page can trail the newest broadcasts that are still being persisted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::history::RecentHistory;
use crate::messages::{Data, Message, MessageType, UserStamp};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub total: u64,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, message: Message) -> Result<()>;

    /// Events of `room` in insertion order, skipping server generated control events.
    async fn query(&self, room: &str, limit: u32, offset: u32) -> Result<HistoryPage>;
}

/// Whether a stored message shows up in history pages.
fn is_listed(message: &Message) -> bool {
    message.is_event() && !message.is_control()
}

/// Store used when no database is configured. Keeps only listed events, at most
/// `per_room` of them for each room.
#[derive(Debug)]
pub struct MemoryStore {
    per_room: usize,
    rooms: Mutex<HashMap<String, RecentHistory>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(Config::default().memory_history)
    }

    pub fn with_capacity(per_room: usize) -> Self {
        MemoryStore {
            per_room,
            rooms: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, message: Message) -> Result<()> {
        if !is_listed(&message) {
            return Ok(());
        }
        let mut rooms = self.rooms.lock().map_err(|_| RelayError::StorePoisoned)?;
        rooms
            .entry(message.room.clone())
            .or_insert_with(|| RecentHistory::new(self.per_room))
            .push(message);
        Ok(())
    }

    async fn query(&self, room: &str, limit: u32, offset: u32) -> Result<HistoryPage> {
        let rooms = self.rooms.lock().map_err(|_| RelayError::StorePoisoned)?;
        let Some(history) = rooms.get(room) else {
            return Ok(HistoryPage::default());
        };
        let page = history
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        let total = history.iter().len() as u64;
        Ok(HistoryPage {
            messages: page,
            total,
        })
    }
}

const LISTED: &str = "room = ?1 AND type = 'event' AND name NOT IN ('status', 'history', 'log')";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                type TEXT NOT NULL,
                room TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                username TEXT NOT NULL,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room)",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| RelayError::StorePoisoned)?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn append(&self, message: Message) -> Result<()> {
        let data = serde_json::to_string(&message.data)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (type, room, name, data, username, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.kind.as_str(),
                    message.room,
                    message.name,
                    data,
                    message.user.name,
                    message.user.id
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn query(&self, room: &str, limit: u32, offset: u32) -> Result<HistoryPage> {
        let room = room.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT room, name, data, username, user_id FROM messages
                 WHERE {LISTED} ORDER BY rowid LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(params![room, limit, offset], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut messages = Vec::new();
            for row in rows {
                let (room, name, data, username, user_id) = row?;
                let data: Data = serde_json::from_str(&data)?;
                messages.push(Message {
                    kind: MessageType::Event,
                    room,
                    name,
                    data,
                    user: UserStamp {
                        name: username,
                        id: user_id,
                    },
                });
            }

            let total: i64 = conn.query_row(
                &format!("SELECT count(*) FROM messages WHERE {LISTED}"),
                params![room],
                |row| row.get(0),
            )?;

            Ok(HistoryPage {
                messages,
                total: u64::try_from(total).unwrap_or_default(),
            })
        })
        .await
    }
}
