//! Friend identifiers and their persistent store (spec §3 "FriendId", §4
//! "FriendStore").
//!
//! A `FriendId` is a normalized E.164 phone number. Normalization is
//! intentionally narrow: the engine only needs a handful of supported
//! regions to turn locally-formatted numbers into the canonical form used
//! as the PSI-Ca set element and as the friend store's primary key.

use rusqlite::OptionalExtension;

use crate::database::{map_sqlite, Db};
use crate::error::Result;

/// A normalized E.164 phone number, e.g. `+15551234567`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FriendId(String);

impl FriendId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<[u8]> for FriendId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for FriendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a locally-formatted phone number to E.164 for the given
/// two-letter region code. Returns `None` if `raw` cannot be parsed as a
/// number for that region (spec §8 scenario 4).
pub fn normalize(raw: &str, region: &str) -> Option<FriendId> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let e164 = match region.to_ascii_uppercase().as_str() {
        "US" | "CA" => normalize_north_american(&digits)?,
        "GB" => normalize_uk(&digits)?,
        _ => return None,
    };

    Some(FriendId(e164))
}

fn normalize_north_american(digits: &str) -> Option<String> {
    let national = match digits.len() {
        10 => digits.to_string(),
        11 if digits.starts_with('1') => digits[1..].to_string(),
        _ => return None,
    };
    Some(format!("+1{national}"))
}

fn normalize_uk(digits: &str) -> Option<String> {
    let national = if let Some(stripped) = digits.strip_prefix('0') {
        stripped.to_string()
    } else if let Some(stripped) = digits.strip_prefix("44") {
        stripped.to_string()
    } else {
        digits.to_string()
    };
    if national.len() != 10 {
        return None;
    }
    Some(format!("+44{national}"))
}

/// Persistent set of normalized friend identifiers, keyed by the
/// normalized string (spec §6 "friend store").
pub struct FriendStore {
    db: Db,
}

impl FriendStore {
    pub async fn open(db: Db) -> Result<Self> {
        db.write(|tx| {
            tx.execute(
                "CREATE TABLE IF NOT EXISTS friends (
                    friend_id TEXT PRIMARY KEY
                )",
                [],
            )
            .map_err(map_sqlite)?;
            Ok(())
        })
        .await?;
        Ok(Self { db })
    }

    /// Idempotent insert: adding the same friend twice has no further
    /// effect.
    pub async fn add(&self, friend: &FriendId) -> Result<()> {
        let id = friend.as_str().to_string();
        self.db
            .write(move |tx| {
                tx.execute(
                    "INSERT OR IGNORE INTO friends (friend_id) VALUES (?1)",
                    [&id],
                )
                .map_err(map_sqlite)?;
                Ok(())
            })
            .await
    }

    pub async fn remove(&self, friend: &FriendId) -> Result<()> {
        let id = friend.as_str().to_string();
        self.db
            .write(move |tx| {
                tx.execute("DELETE FROM friends WHERE friend_id = ?1", [&id])
                    .map_err(map_sqlite)?;
                Ok(())
            })
            .await
    }

    pub async fn contains(&self, friend: &FriendId) -> Result<bool> {
        let id = friend.as_str().to_string();
        self.db
            .read(move |conn| {
                conn.query_row(
                    "SELECT 1 FROM friends WHERE friend_id = ?1",
                    [&id],
                    |_| Ok(()),
                )
                .optional()
                .map_err(map_sqlite)
                .map(|row| row.is_some())
            })
            .await
    }

    /// All friends currently in the store, as raw byte references, ready
    /// to feed a PSI-Ca [`crate::crypto::ClientPsi`] context.
    pub async fn all(&self) -> Result<Vec<FriendId>> {
        self.db
            .read(|conn| {
                let mut stmt = conn
                    .prepare("SELECT friend_id FROM friends ORDER BY friend_id")
                    .map_err(map_sqlite)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(map_sqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(FriendId(row.map_err(map_sqlite)?));
                }
                Ok(out)
            })
            .await
    }

    pub async fn len(&self) -> Result<u32> {
        self.db
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM friends", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as u32)
                .map_err(map_sqlite)
            })
            .await
    }
}
