use crate::error::StoreError;
use crate::store::{CardStore, RecipientStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Recipient entitled to a fixed total amount.
/// `claimed_at` is set iff `has_claimed` is true.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recipient {
    pub id: i64,

    /// Unique, immutable after creation
    pub identity: String,

    pub nickname: String,

    /// Stored form of the secret as produced by the credential scheme
    #[serde(skip_serializing)]
    pub secret: String,

    /// Total value owed
    pub target: i64,

    pub has_claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Single-use redemption code of one denomination.
/// `used_by` and `used_at` are set iff `is_used` is true.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Card {
    pub id: i64,

    /// Globally unique
    pub code: String,

    pub denomination: u32,
    pub is_used: bool,
    pub used_by: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Event for audit trail: every claim and override is recorded
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    /// Stamp the event with an explicit time (e.g. the commit time of a claim)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================================================
// CONNECTION & SCHEMA
// ============================================================================

/// Open (or create) the database file, apply pragmas and create the schema
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;

    // Bounded wait for the write lock held by a concurrent claim
    conn.busy_timeout(busy_timeout)?;

    // Enable WAL mode for crash recovery
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(path = %path.display(), journal_mode = %mode, "database opened");

    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Recipients Table
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS recipients (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identity TEXT UNIQUE NOT NULL,
            nickname TEXT NOT NULL,
            secret TEXT NOT NULL,
            target INTEGER NOT NULL DEFAULT 0 CHECK (target >= 0),
            has_claimed INTEGER NOT NULL DEFAULT 0,
            claimed_at TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            CHECK ((has_claimed = 0) = (claimed_at IS NULL))
        )",
        [],
    )?;

    // ==========================================================================
    // Cards Table (inventory)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cards (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT UNIQUE NOT NULL,
            denomination INTEGER NOT NULL CHECK (denomination > 0),
            is_used INTEGER NOT NULL DEFAULT 0,
            used_by TEXT,
            used_at TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            CHECK (
                (is_used = 0 AND used_by IS NULL AND used_at IS NULL)
                OR (is_used = 1 AND used_by IS NOT NULL AND used_at IS NOT NULL)
            )
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cards_stock ON cards(denomination, is_used)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cards_used_by ON cards(used_by)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

pub(crate) const RECIPIENT_COLUMNS: &str =
    "id, identity, nickname, secret, target, has_claimed, claimed_at";

pub(crate) const CARD_COLUMNS: &str = "id, code, denomination, is_used, used_by, used_at";

pub(crate) fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<Recipient> {
    Ok(Recipient {
        id: row.get(0)?,
        identity: row.get(1)?,
        nickname: row.get(2)?,
        secret: row.get(3)?,
        target: row.get(4)?,
        has_claimed: row.get(5)?,
        claimed_at: parse_timestamp(6, row.get(6)?)?,
    })
}

pub(crate) fn card_from_row(row: &Row<'_>) -> rusqlite::Result<Card> {
    Ok(Card {
        id: row.get(0)?,
        code: row.get(1)?,
        denomination: row.get(2)?,
        is_used: row.get(3)?,
        used_by: row.get(4)?,
        used_at: parse_timestamp(5, row.get(5)?)?,
    })
}

fn parse_timestamp(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
        })
        .transpose()
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<(), StoreError> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp = parse_timestamp(1, Some(row.get(1)?))?.unwrap_or_default();
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// UNIT OF WORK
// ============================================================================

/// One serialised claim transaction.
///
/// `begin` takes the SQLite write lock up front (`BEGIN IMMEDIATE`), so every
/// read made through this object already sees the final state for the
/// duration of the transaction. Dropping without `commit` rolls back.
pub struct UnitOfWork<'conn> {
    tx: rusqlite::Transaction<'conn>,
    started_at: DateTime<Utc>,
}

impl<'conn> UnitOfWork<'conn> {
    pub fn begin(conn: &'conn mut Connection) -> Result<Self, StoreError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(UnitOfWork {
            tx,
            started_at: Utc::now(),
        })
    }

    /// Time stamped onto every row this unit of work changes
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        insert_event(&self.tx, event)
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit()?;
        Ok(())
    }
}

impl RecipientStore for UnitOfWork<'_> {
    fn find_by_identity(&self, identity: &str) -> Result<Option<Recipient>, StoreError> {
        let recipient = self
            .tx
            .query_row(
                &format!("SELECT {} FROM recipients WHERE identity = ?1", RECIPIENT_COLUMNS),
                [identity],
                recipient_from_row,
            )
            .optional()?;

        Ok(recipient)
    }

    fn mark_claimed(&self, identity: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = self.tx.execute(
            "UPDATE recipients
             SET has_claimed = 1, claimed_at = ?2
             WHERE identity = ?1 AND has_claimed = 0",
            params![identity, at.to_rfc3339()],
        )?;

        Ok(changed == 1)
    }
}

impl CardStore for UnitOfWork<'_> {
    fn reserve_unused(&self, denomination: u32, count: u64) -> Result<Vec<Card>, StoreError> {
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        let mut stmt = self.tx.prepare_cached(&format!(
            "SELECT {} FROM cards
             WHERE denomination = ?1 AND is_used = 0
             ORDER BY id
             LIMIT ?2",
            CARD_COLUMNS
        ))?;

        let cards = stmt
            .query_map(params![denomination, limit], card_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(cards)
    }

    fn mark_used(&self, code: &str, owner: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = self.tx.execute(
            "UPDATE cards
             SET is_used = 1, used_by = ?2, used_at = ?3
             WHERE code = ?1 AND is_used = 0",
            params![code, owner, at.to_rfc3339()],
        )?;

        Ok(changed == 1)
    }
}
