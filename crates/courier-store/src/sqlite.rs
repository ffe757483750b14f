//! SQLite store — contacts, link tokens, and the delivery log in one file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Mutex;

use courier_core::error::{CourierError, Result};
use courier_core::traits::{DeliveryLog, Directory, LinkTokenStore};
use courier_core::types::{ContactRecord, DeliveryLogEntry, LinkToken};

/// Courier's persistent storage. One SQLite connection behind a mutex; every
/// query is short and none holds the lock across an await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CourierError::Store(format!("open {}: {e}", path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, used by tests and as a last-resort fallback.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS contacts (
                user_id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL DEFAULT '',
                email TEXT,
                chat_id TEXT,
                chat_notifications_enabled INTEGER NOT NULL DEFAULT 0,
                chat_username TEXT,
                chat_linked_at TEXT
            );

            CREATE TABLE IF NOT EXISTS link_tokens (
                id TEXT PRIMARY KEY,
                owner_user_id INTEGER NOT NULL,
                token TEXT NOT NULL UNIQUE,
                expires_at TEXT,
                consumed_at TEXT,
                chat_id TEXT,
                last_used_at TEXT
            );

            CREATE TABLE IF NOT EXISTS delivery_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_kind TEXT NOT NULL,
                channel TEXT NOT NULL,
                recipients_json TEXT NOT NULL DEFAULT '[]',
                rendered_text TEXT NOT NULL DEFAULT '',
                sent_at TEXT NOT NULL,
                successful_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                payload_json TEXT NOT NULL DEFAULT 'null'
            );
            ",
        )
        .map_err(|e| CourierError::Store(format!("migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CourierError::Store(format!("lock: {e}")))
    }

    /// Create or replace a directory row. Operator/seeding helper.
    pub fn upsert_contact(&self, contact: &ContactRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO contacts (user_id, display_name, role, email, chat_id, chat_notifications_enabled, chat_username, chat_linked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id) DO UPDATE SET
               display_name=?2, role=?3, email=?4, chat_id=?5,
               chat_notifications_enabled=?6, chat_username=?7, chat_linked_at=?8",
            params![
                contact.user_id,
                contact.display_name,
                contact.role,
                contact.email,
                contact.chat_id,
                contact.chat_notifications_enabled as i64,
                contact.chat_username,
                contact.chat_linked_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| CourierError::Store(format!("upsert contact: {e}")))?;
        Ok(())
    }

    /// Issue a fresh single-use link token for a user. `ttl_hours` of `None`
    /// means the token never expires.
    pub fn issue_link_token(&self, owner_user_id: i64, ttl_hours: Option<i64>) -> Result<LinkToken> {
        let token = LinkToken {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id,
            token: rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect(),
            expires_at: ttl_hours.map(|h| Utc::now() + chrono::Duration::hours(h)),
            consumed_at: None,
            chat_id: None,
            last_used_at: None,
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO link_tokens (id, owner_user_id, token, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                token.id,
                token.owner_user_id,
                token.token,
                token.expires_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| CourierError::Store(format!("issue token: {e}")))?;
        Ok(token)
    }

    /// Most recent delivery-log rows, newest first. Operator helper; the log
    /// itself is append-only.
    pub fn recent_deliveries(&self, limit: usize) -> Result<Vec<DeliveryLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT event_kind, channel, recipients_json, rendered_text, sent_at,
                        successful_count, failed_count, payload_json
                 FROM delivery_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| CourierError::Store(format!("prepare: {e}")))?;
        let entries = stmt
            .query_map(params![limit as i64], |row| {
                let recipients_json: String = row.get(2)?;
                let sent_at: String = row.get(4)?;
                let payload_json: String = row.get(7)?;
                Ok(DeliveryLogEntry {
                    event_kind: row.get(0)?,
                    channel: row.get(1)?,
                    recipients: serde_json::from_str(&recipients_json).unwrap_or_default(),
                    rendered_text: row.get(3)?,
                    sent_at: parse_ts(Some(sent_at)).unwrap_or_else(Utc::now),
                    successful_count: row.get::<_, i64>(5)? as usize,
                    failed_count: row.get::<_, i64>(6)? as usize,
                    payload: serde_json::from_str(&payload_json)
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .map_err(|e| CourierError::Store(format!("query: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }
}

fn contact_from_row(row: &Row) -> rusqlite::Result<ContactRecord> {
    Ok(ContactRecord {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        role: row.get(2)?,
        email: row.get(3)?,
        chat_id: row.get(4)?,
        chat_notifications_enabled: row.get::<_, i64>(5)? != 0,
        chat_username: row.get(6)?,
        chat_linked_at: parse_ts(row.get(7)?),
    })
}

const CONTACT_COLUMNS: &str = "user_id, display_name, role, email, chat_id, \
     chat_notifications_enabled, chat_username, chat_linked_at";

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl Directory for SqliteStore {
    async fn contacts_by_ids(&self, user_ids: &[i64]) -> Result<Vec<ContactRecord>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; user_ids.len()].join(",");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts WHERE user_id IN ({placeholders})"
            ))
            .map_err(|e| CourierError::Store(format!("prepare: {e}")))?;
        let contacts = stmt
            .query_map(rusqlite::params_from_iter(user_ids), contact_from_row)
            .map_err(|e| CourierError::Store(format!("query: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(contacts)
    }

    async fn contacts_by_role(&self, role: &str) -> Result<Vec<ContactRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts WHERE role = ?1"
            ))
            .map_err(|e| CourierError::Store(format!("prepare: {e}")))?;
        let contacts = stmt
            .query_map(params![role], contact_from_row)
            .map_err(|e| CourierError::Store(format!("query: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(contacts)
    }

    async fn find_by_chat_username(&self, username: &str) -> Result<Option<ContactRecord>> {
        let conn = self.lock()?;
        // Stored handles may carry a leading "@"; strip it on the stored side
        // before comparing. "=" keeps the comparison case-sensitive.
        conn.query_row(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts WHERE ltrim(chat_username, '@') = ?1"
            ),
            params![username],
            contact_from_row,
        )
        .optional()
        .map_err(|e| CourierError::Store(format!("find by username: {e}")))
    }

    async fn link_chat(
        &self,
        user_id: i64,
        chat_id: &str,
        username: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE contacts SET chat_id = ?1, chat_notifications_enabled = 1,
                    chat_username = COALESCE(?2, chat_username), chat_linked_at = ?3
                 WHERE user_id = ?4",
                params![chat_id, username, now.to_rfc3339(), user_id],
            )
            .map_err(|e| CourierError::Store(format!("link chat: {e}")))?;
        if updated == 0 {
            return Err(CourierError::Store(format!("no contact for user {user_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl LinkTokenStore for SqliteStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<LinkToken>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, owner_user_id, token, expires_at, consumed_at, chat_id, last_used_at
             FROM link_tokens WHERE token = ?1",
            params![token],
            |row| {
                Ok(LinkToken {
                    id: row.get(0)?,
                    owner_user_id: row.get(1)?,
                    token: row.get(2)?,
                    expires_at: parse_ts(row.get(3)?),
                    consumed_at: parse_ts(row.get(4)?),
                    chat_id: row.get(5)?,
                    last_used_at: parse_ts(row.get(6)?),
                })
            },
        )
        .optional()
        .map_err(|e| CourierError::Store(format!("find token: {e}")))
    }

    async fn consume(&self, token: &str, chat_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        // Conditional on consumed_at still being NULL: of two near-simultaneous
        // redemptions only one update takes effect, the other sees 0 rows.
        let updated = conn
            .execute(
                "UPDATE link_tokens SET consumed_at = ?1, chat_id = ?2, last_used_at = ?1
                 WHERE token = ?3 AND consumed_at IS NULL",
                params![now.to_rfc3339(), chat_id, token],
            )
            .map_err(|e| CourierError::Store(format!("consume token: {e}")))?;
        Ok(updated == 1)
    }
}

#[async_trait]
impl DeliveryLog for SqliteStore {
    async fn append(&self, entry: DeliveryLogEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO delivery_log (event_kind, channel, recipients_json, rendered_text,
                sent_at, successful_count, failed_count, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.event_kind,
                entry.channel,
                serde_json::to_string(&entry.recipients).unwrap_or_else(|_| "[]".into()),
                entry.rendered_text,
                entry.sent_at.to_rfc3339(),
                entry.successful_count as i64,
                entry.failed_count as i64,
                entry.payload.to_string(),
            ],
        )
        .map_err(|e| CourierError::Store(format!("append delivery log: {e}")))?;
        Ok(())
    }
}
