//! SQLite-backed `ChatStore`.
//!
//! rusqlite is synchronous, so every call locks the shared connection inside
//! `tokio::task::spawn_blocking`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{ChatStore, StoreError, StoreResult};
use crate::chat::models::{
    pair_key, Conversation, ConversationSummary, Message, User, UserSummary,
};
use crate::db::DbPool;

const USER_COLUMNS: &str = "id, username, password_hash, is_online, last_seen, created_at";

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, m.content, m.timestamp, m.is_read,
        u.id, u.username, u.is_online, u.last_seen
 FROM messages m
 LEFT JOIN users u ON u.id = m.sender_id";

#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&conn)
        })
        .await?
    }
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        password_hash: row.get(2)?,
        online: row.get(3)?,
        last_seen: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let sender = match row.get::<_, Option<String>>(6)? {
        Some(id) => Some(UserSummary {
            id,
            name: row.get(7)?,
            online: row.get(8)?,
            last_seen: row.get(9)?,
        }),
        None => None,
    };
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        is_read: row.get(5)?,
        sender,
    })
}

fn load_participants(conn: &Connection, conversation_id: &str) -> rusqlite::Result<Vec<UserSummary>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, u.is_online, u.last_seen
         FROM users u
         JOIN conversation_users cu ON cu.user_id = u.id
         WHERE cu.conversation_id = ?1
         ORDER BY cu.position",
    )?;
    let participants = stmt
        .query_map(rusqlite::params![conversation_id], |row| {
            Ok(UserSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                online: row.get(2)?,
                last_seen: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(participants)
}

fn load_conversation(conn: &Connection, conversation_id: &str) -> rusqlite::Result<Option<Conversation>> {
    let row: Option<(String, DateTime<Utc>, DateTime<Utc>)> = conn
        .query_row(
            "SELECT id, created_at, updated_at FROM conversations WHERE id = ?1",
            rusqlite::params![conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match row {
        Some((id, created_at, updated_at)) => {
            let participants = load_participants(conn, &id)?;
            Ok(Some(Conversation {
                id,
                participants,
                created_at,
                updated_at,
            }))
        }
        None => Ok(None),
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                    rusqlite::params![user_id],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn find_user_by_name(&self, name: &str) -> StoreResult<Option<User>> {
        let name = name.to_string();
        self.run(move |conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                    rusqlite::params![name],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn create_user(&self, name: &str, password_hash: &str) -> StoreResult<User> {
        let user = User {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            password_hash: password_hash.to_string(),
            online: false,
            last_seen: None,
            created_at: Utc::now(),
        };
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users (id, username, password_hash, is_online, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
                rusqlite::params![user.id, user.name, user.password_hash, user.created_at],
            )?;
            Ok(user)
        })
        .await
    }

    async fn find_users(&self, user_ids: &[String]) -> StoreResult<Vec<User>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = user_ids.to_vec();
        self.run(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM users WHERE id IN ({})",
                USER_COLUMNS, placeholders
            ))?;
            let users = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(users)
        })
        .await
    }

    async fn list_online_users(&self) -> StoreResult<Vec<User>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM users WHERE is_online = 1 ORDER BY username",
                USER_COLUMNS
            ))?;
            let users = stmt
                .query_map([], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(users)
        })
        .await
    }

    async fn set_online_status(&self, user_id: &str, online: bool) -> StoreResult<()> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            if online {
                conn.execute(
                    "UPDATE users SET is_online = 1 WHERE id = ?1",
                    rusqlite::params![user_id],
                )?;
            } else {
                conn.execute(
                    "UPDATE users SET is_online = 0, last_seen = ?2 WHERE id = ?1",
                    rusqlite::params![user_id, Utc::now()],
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn find_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        let conversation_id = conversation_id.to_string();
        self.run(move |conn| Ok(load_conversation(conn, &conversation_id)?))
            .await
    }

    async fn find_pair_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> StoreResult<Option<Conversation>> {
        let key = pair_key(user_a, user_b);
        self.run(move |conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM conversations WHERE pair_key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()?;
            match id {
                Some(id) => Ok(load_conversation(conn, &id)?),
                None => Ok(None),
            }
        })
        .await
    }

    async fn create_conversation(&self, initiator: &str, other: &str) -> StoreResult<Conversation> {
        let initiator = initiator.to_string();
        let other = other.to_string();
        self.run(move |conn| {
            let key = pair_key(&initiator, &other);
            let now = Utc::now();
            let tx = conn.unchecked_transaction()?;

            let inserted = tx.execute(
                "INSERT INTO conversations (id, pair_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(pair_key) DO NOTHING",
                rusqlite::params![Uuid::now_v7().to_string(), key, now],
            )?;

            let conversation_id: String = tx.query_row(
                "SELECT id FROM conversations WHERE pair_key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )?;

            if inserted == 1 {
                for (position, user_id) in [&initiator, &other].into_iter().enumerate() {
                    tx.execute(
                        "INSERT INTO conversation_users (conversation_id, user_id, position) VALUES (?1, ?2, ?3)",
                        rusqlite::params![conversation_id, user_id, position as i64],
                    )?;
                }
            }
            tx.commit()?;

            load_conversation(conn, &conversation_id)?.ok_or_else(|| {
                StoreError::Integrity(format!("conversation {} vanished after insert", conversation_id))
            })
        })
        .await
    }

    async fn list_conversations(&self, user_id: &str) -> StoreResult<Vec<ConversationSummary>> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_at, c.updated_at
                 FROM conversations c
                 JOIN conversation_users cu ON cu.conversation_id = c.id
                 WHERE cu.user_id = ?1
                 ORDER BY c.updated_at DESC, c.rowid DESC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, DateTime<Utc>>(1)?,
                        row.get::<_, DateTime<Utc>>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut summaries = Vec::with_capacity(rows.len());
            for (id, created_at, updated_at) in rows {
                let participants = load_participants(conn, &id)?;
                let last_message = conn
                    .query_row(
                        &format!(
                            "{} WHERE m.conversation_id = ?1 ORDER BY m.timestamp DESC, m.rowid DESC LIMIT 1",
                            MESSAGE_SELECT
                        ),
                        rusqlite::params![id],
                        message_from_row,
                    )
                    .optional()?;
                let unread_count: u32 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND is_read = 0 AND sender_id != ?2",
                    rusqlite::params![id, user_id],
                    |row| row.get(0),
                )?;
                summaries.push(ConversationSummary {
                    id,
                    participants,
                    last_message,
                    unread_count,
                    created_at,
                    updated_at,
                });
            }
            Ok(summaries)
        })
        .await
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> StoreResult<Message> {
        let message = Message {
            id: Uuid::now_v7().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            is_read: false,
            sender: None,
        };
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, is_read, timestamp)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                rusqlite::params![
                    message.id,
                    message.conversation_id,
                    message.sender_id,
                    message.content,
                    message.timestamp
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                rusqlite::params![message.conversation_id, message.timestamp],
            )?;
            tx.commit()?;
            Ok(message)
        })
        .await
    }

    async fn find_message(&self, message_id: &str) -> StoreResult<Option<Message>> {
        let message_id = message_id.to_string();
        self.run(move |conn| {
            let message = conn
                .query_row(
                    &format!("{} WHERE m.id = ?1", MESSAGE_SELECT),
                    rusqlite::params![message_id],
                    message_from_row,
                )
                .optional()?;
            Ok(message)
        })
        .await
    }

    async fn mark_message_read(&self, message_id: &str) -> StoreResult<()> {
        let message_id = message_id.to_string();
        self.run(move |conn| {
            // Only ever sets the flag; there is no path back to unread.
            conn.execute(
                "UPDATE messages SET is_read = 1 WHERE id = ?1",
                rusqlite::params![message_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE m.conversation_id = ?1 ORDER BY m.timestamp ASC, m.rowid ASC",
                MESSAGE_SELECT
            ))?;
            let messages = stmt
                .query_map(rusqlite::params![conversation_id], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }
}
