//! Messages and their trust-scored, persistent store (spec §3 "Message",
//! §4.2 "MessageStore").

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::{map_sqlite, Db};
use crate::error::{Error, Result};

/// Opaque 128-bit+ random message identifier.
pub type MessageId = Uuid;

/// A message circulating through the mesh, annotated with the trust score
/// this device has assigned it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: MessageId,
    pub text: String,
    pub timestamp: u64,
    pub hop_count: u32,
    /// 0 or 1, "heart count" in the original design's terms.
    pub priority: u8,
    pub trust_score: f64,
}

impl Message {
    pub fn new(text: impl Into<String>, timestamp: u64, priority: u8) -> Result<Self> {
        let text = text.into();
        if text.is_empty() {
            return Err(Error::InvalidData("message text must not be empty".into()));
        }
        Ok(Self {
            message_id: Uuid::new_v4(),
            text,
            timestamp,
            hop_count: 0,
            priority,
            trust_score: 0.0,
        })
    }
}

/// Persistent, trust-ranked set of messages (spec §4.2).
pub struct MessageStore {
    db: Db,
    /// Minimum trust required to surface a message to a peer with zero
    /// shared friends (installer-configured gate, spec §4.2).
    min_trust_gate: f64,
}

impl MessageStore {
    pub async fn open(db: Db, min_trust_gate: f64) -> Result<Self> {
        db.write(|tx| {
            tx.execute(
                "CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    text TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    hop_count INTEGER NOT NULL,
                    priority INTEGER NOT NULL,
                    trust_score REAL NOT NULL
                )",
                [],
            )
            .map_err(map_sqlite)?;
            Ok(())
        })
        .await?;
        Ok(Self { db, min_trust_gate })
    }

    /// Insert a message. Rejected if `text` is empty; idempotent on
    /// `message_id` collision (spec §4.2).
    pub async fn insert(&self, msg: Message) -> Result<()> {
        if msg.text.is_empty() {
            return Err(Error::InvalidData("message text must not be empty".into()));
        }
        self.db
            .write(move |tx| {
                tx.execute(
                    "INSERT OR IGNORE INTO messages
                        (message_id, text, timestamp, hop_count, priority, trust_score)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        msg.message_id.to_string(),
                        msg.text,
                        msg.timestamp as i64,
                        msg.hop_count,
                        msg.priority,
                        msg.trust_score,
                    ],
                )
                .map_err(map_sqlite)?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        self.db
            .read(move |conn| {
                conn.query_row(
                    "SELECT message_id, text, timestamp, hop_count, priority, trust_score
                     FROM messages WHERE message_id = ?1",
                    [id.to_string()],
                    row_to_message,
                )
                .optional()
                .map_err(map_sqlite)
            })
            .await
    }

    /// Set trust to `max(old, new)`; trust never decreases (spec §4.2,
    /// §9 "deliberate asymmetry").
    pub async fn update_trust(&self, id: MessageId, new_trust: f64) -> Result<()> {
        self.db
            .write(move |tx| {
                tx.execute(
                    "UPDATE messages SET trust_score = MAX(trust_score, ?2)
                     WHERE message_id = ?1",
                    rusqlite::params![id.to_string(), new_trust],
                )
                .map_err(map_sqlite)?;
                Ok(())
            })
            .await
    }

    /// Up to `limit` messages ordered by trust desc, then priority desc,
    /// then recency, filtered by the minimum-trust gate when
    /// `common_friends == 0` (spec §4.2).
    pub async fn candidates_for_exchange(
        &self,
        common_friends: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let min_trust = if common_friends == 0 {
            self.min_trust_gate
        } else {
            0.0
        };
        self.db
            .read(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT message_id, text, timestamp, hop_count, priority, trust_score
                         FROM messages
                         WHERE trust_score >= ?1
                         ORDER BY trust_score DESC, priority DESC, timestamp DESC
                         LIMIT ?2",
                    )
                    .map_err(map_sqlite)?;
                let rows = stmt
                    .query_map(rusqlite::params![min_trust, limit], row_to_message)
                    .map_err(map_sqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(map_sqlite)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn len(&self) -> Result<u32> {
        self.db
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM messages", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as u32)
                .map_err(map_sqlite)
            })
            .await
    }
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let message_id = Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil());
    Ok(Message {
        message_id,
        text: row.get(1)?,
        timestamp: row.get::<_, i64>(2)? as u64,
        hop_count: row.get(3)?,
        priority: row.get(4)?,
        trust_score: row.get(5)?,
    })
}
