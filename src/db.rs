use crate::models::{ContextMessage, LanguageChoice, StoredMessage};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::{Arc, Mutex};

/// Embedded SQLite store shared across event workers.
///
/// Cross-invocation coordination happens only through this store: workers
/// have no affinity, so every consistency guarantee lives in the SQL here.
/// Counters use atomic upserts, the enrollment gate uses an immediate
/// transaction across its read-modify-write, and everything else is
/// replaced wholesale rather than diffed.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database and create tables
    pub fn new(database_path: &str) -> Result<Self> {
        let conn = Connection::open(database_path)
            .context(format!("Failed to open database at {}", database_path))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenant_settings (
                tenant_id TEXT PRIMARY KEY,
                translation_enabled INTEGER NOT NULL DEFAULT 1,
                bot_joined_at TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tenant_members (
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, user_id)
            );
            CREATE TABLE IF NOT EXISTS tenant_languages (
                tenant_id TEXT NOT NULL,
                lang_code TEXT NOT NULL,
                lang_name TEXT NOT NULL,
                PRIMARY KEY (tenant_id, lang_code)
            );
            CREATE TABLE IF NOT EXISTS enrollment_gates (
                tenant_id TEXT PRIMARY KEY,
                prompted_at TEXT,
                completed_at TEXT
            );
            CREATE TABLE IF NOT EXISTS usage_counters (
                tenant_id TEXT NOT NULL,
                period_key TEXT NOT NULL,
                translation_count INTEGER NOT NULL DEFAULT 0,
                notified_plan TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, period_key)
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_tenant_ts
                ON messages (tenant_id, timestamp DESC);",
        )
        .context("Failed to create tables")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- tenant membership ----

    /// Register a (tenant, user) pair, refreshing the join timestamp.
    /// Tenants are created implicitly on their first event.
    pub fn ensure_member(&self, tenant_id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tenant_members (tenant_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (tenant_id, user_id) DO UPDATE SET joined_at = excluded.joined_at",
            params![tenant_id, user_id, now],
        )
        .context("Failed to upsert tenant member")?;
        Ok(())
    }

    pub fn record_bot_joined_at(&self, tenant_id: &str, joined_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tenant_settings (tenant_id, translation_enabled, bot_joined_at, updated_at)
             VALUES (?1, 1, ?2, ?3)
             ON CONFLICT (tenant_id)
             DO UPDATE SET bot_joined_at = excluded.bot_joined_at, updated_at = excluded.updated_at",
            params![tenant_id, joined_at.to_rfc3339(), now],
        )
        .context("Failed to record bot join timestamp")?;
        Ok(())
    }

    pub fn fetch_bot_joined_at(&self, tenant_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let joined: Option<Option<String>> = conn
            .query_row(
                "SELECT bot_joined_at FROM tenant_settings WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(joined.flatten().and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    // ---- language set ----

    /// Ordered language codes configured for the tenant.
    pub fn fetch_languages(&self, tenant_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT lang_code FROM tenant_languages WHERE tenant_id = ?1 ORDER BY lang_code",
        )?;
        let codes = stmt
            .query_map(params![tenant_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(codes)
    }

    pub fn add_languages(&self, tenant_id: &str, languages: &[LanguageChoice]) -> Result<()> {
        if languages.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "INSERT INTO tenant_languages (tenant_id, lang_code, lang_name)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (tenant_id, lang_code) DO UPDATE SET lang_name = excluded.lang_name",
        )?;
        for lang in languages {
            stmt.execute(params![tenant_id, lang.code.to_lowercase(), lang.name])?;
        }
        Ok(())
    }

    pub fn remove_languages(&self, tenant_id: &str, lang_codes: &[String]) -> Result<()> {
        if lang_codes.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("DELETE FROM tenant_languages WHERE tenant_id = ?1 AND lang_code = ?2")?;
        for code in lang_codes {
            stmt.execute(params![tenant_id, code.to_lowercase()])?;
        }
        Ok(())
    }

    /// Clear the language set and re-arm the enrollment gate. Used when the
    /// bot is re-invited to a group.
    pub fn reset_language_settings(&self, tenant_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM tenant_languages WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        conn.execute(
            "UPDATE enrollment_gates SET prompted_at = NULL, completed_at = NULL
             WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        Ok(())
    }

    // ---- enrollment gate ----

    /// Mark the tenant as prompted and re-open the gate for a fresh
    /// confirm/cancel resolution.
    pub fn record_prompt(&self, tenant_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO enrollment_gates (tenant_id, prompted_at, completed_at)
             VALUES (?1, ?2, NULL)
             ON CONFLICT (tenant_id)
             DO UPDATE SET prompted_at = excluded.prompted_at, completed_at = NULL",
            params![tenant_id, now],
        )
        .context("Failed to record enrollment prompt")?;
        Ok(())
    }

    /// Consume the enrollment gate and replace the tenant's language set.
    ///
    /// Returns `false` when the gate was already consumed (a redelivered
    /// confirm); in that case nothing is mutated. The immediate transaction
    /// holds the write lock across the whole read-modify-write, so two
    /// concurrent redeliveries serialize and exactly one observes an open
    /// gate.
    pub fn try_complete(&self, tenant_id: &str, languages: &[LanguageChoice]) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO enrollment_gates (tenant_id) VALUES (?1)
             ON CONFLICT (tenant_id) DO NOTHING",
            params![tenant_id],
        )?;

        let completed_at: Option<String> = tx.query_row(
            "SELECT completed_at FROM enrollment_gates WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        if completed_at.is_some() {
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM tenant_languages WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO tenant_languages (tenant_id, lang_code, lang_name)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (tenant_id, lang_code) DO UPDATE SET lang_name = excluded.lang_name",
            )?;
            for lang in languages {
                stmt.execute(params![tenant_id, lang.code.to_lowercase(), lang.name])?;
            }
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE enrollment_gates SET completed_at = ?2 WHERE tenant_id = ?1",
            params![tenant_id, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Consume the gate for a cancellation. Same locking discipline as
    /// `try_complete`, no language mutation.
    pub fn try_cancel(&self, tenant_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO enrollment_gates (tenant_id) VALUES (?1)
             ON CONFLICT (tenant_id) DO NOTHING",
            params![tenant_id],
        )?;

        let completed_at: Option<String> = tx.query_row(
            "SELECT completed_at FROM enrollment_gates WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        if completed_at.is_some() {
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE enrollment_gates SET completed_at = ?2 WHERE tenant_id = ?1",
            params![tenant_id, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ---- translation-enabled flag ----

    pub fn set_translation_enabled(&self, tenant_id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tenant_settings (tenant_id, translation_enabled, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (tenant_id)
             DO UPDATE SET translation_enabled = excluded.translation_enabled,
                           updated_at = excluded.updated_at",
            params![tenant_id, enabled as i64, now],
        )
        .context("Failed to set translation-enabled flag")?;
        Ok(())
    }

    /// Tenants with no settings row are enabled.
    pub fn is_translation_enabled(&self, tenant_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let enabled: Option<i64> = conn
            .query_row(
                "SELECT translation_enabled FROM tenant_settings WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(enabled.map(|v| v != 0).unwrap_or(true))
    }

    // ---- usage counters ----

    pub fn get_usage(&self, tenant_id: &str, period_key: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: Option<i64> = conn
            .query_row(
                "SELECT translation_count FROM usage_counters
                 WHERE tenant_id = ?1 AND period_key = ?2",
                params![tenant_id, period_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Atomically add `delta` to the counter and return the new value.
    /// Rollbacks pass a negative delta equal to the original increment.
    pub fn increment_usage(&self, tenant_id: &str, period_key: &str, delta: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let count: i64 = conn
            .query_row(
                "INSERT INTO usage_counters (tenant_id, period_key, translation_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (tenant_id, period_key)
                 DO UPDATE SET translation_count = translation_count + excluded.translation_count,
                               updated_at = excluded.updated_at
                 RETURNING translation_count",
                params![tenant_id, period_key, delta, now],
                |row| row.get(0),
            )
            .context("Failed to increment usage counter")?;
        Ok(count)
    }

    pub fn notified_plan(&self, tenant_id: &str, period_key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let plan: Option<Option<String>> = conn
            .query_row(
                "SELECT notified_plan FROM usage_counters
                 WHERE tenant_id = ?1 AND period_key = ?2",
                params![tenant_id, period_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(plan.flatten())
    }

    pub fn set_notified_plan(&self, tenant_id: &str, period_key: &str, plan: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO usage_counters (tenant_id, period_key, translation_count, notified_plan, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4)
             ON CONFLICT (tenant_id, period_key)
             DO UPDATE SET notified_plan = excluded.notified_plan, updated_at = excluded.updated_at",
            params![tenant_id, period_key, plan, now],
        )
        .context("Failed to set notified plan marker")?;
        Ok(())
    }

    // ---- message history ----

    pub fn insert_message(&self, message: &StoredMessage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (tenant_id, user_id, sender_name, text, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.tenant_id,
                message.user_id,
                message.sender_name,
                message.text,
                message.timestamp.to_rfc3339()
            ],
        )
        .context("Failed to insert message")?;
        Ok(())
    }

    /// Most recent `limit` messages, oldest first.
    pub fn fetch_recent_messages(&self, tenant_id: &str, limit: usize) -> Result<Vec<ContextMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sender_name, text, timestamp FROM messages
             WHERE tenant_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let mut messages = stmt
            .query_map(params![tenant_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|(sender_name, text, ts)| {
                DateTime::parse_from_rfc3339(&ts).ok().map(|dt| ContextMessage {
                    sender_name,
                    text,
                    timestamp: dt.with_timezone(&Utc),
                })
            })
            .collect::<Vec<_>>();
        messages.reverse();
        Ok(messages)
    }
}
