// 🗄️ Storage Layer - SQLite schema, shared handle, audit trail
//
// All invariant-bearing constraints live here as SQL constraints:
// - one active listing per collectible  -> partial UNIQUE index
// - one pending purchase intent per listing -> partial UNIQUE index
// so race closure never depends on application-level read-then-insert.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to the persisted store.
///
/// One connection behind a mutex: every operation takes the lock for a
/// single statement or transaction, so SQLite linearizes all status writes.
/// Clones share the same connection (and the same in-memory database in
/// tests).
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database file and install the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        setup_database(&conn)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests and the demo CLI.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        setup_database(&conn)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection for one statement or transaction.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Profiles (external telegram identity -> internal profile)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            telegram_id INTEGER UNIQUE NOT NULL,
            username TEXT,
            first_name TEXT,
            last_name TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Collectibles (immutable metadata; owner mutates only via purchase)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS collectibles (
            id TEXT PRIMARY KEY,
            owner_profile_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            media_url TEXT NOT NULL,
            media_kind TEXT NOT NULL,
            attributes TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Listings (status owned exclusively by ListingLedger)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS listings (
            id TEXT PRIMARY KEY,
            collectible_id TEXT NOT NULL,
            seller_profile_id TEXT NOT NULL,
            price REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // At most one ACTIVE listing per collectible, enforced by the store.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_listing_per_collectible
         ON listings(collectible_id) WHERE status = 'active'",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_listings_status_created
         ON listings(status, created_at)",
        [],
    )?;

    // ==========================================================================
    // Purchase intents (idempotency records, double as the reservation)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS purchase_intents (
            intent_hash TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL,
            listing_id TEXT NOT NULL,
            buyer_profile_id TEXT NOT NULL,
            state TEXT NOT NULL,
            outcome TEXT,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )",
        [],
    )?;

    // At most one PENDING intent per listing: only one buyer is ever in the
    // paid-but-uncommitted window; everyone else conflicts before payment.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_one_pending_intent_per_listing
         ON purchase_intents(listing_id) WHERE state = 'pending'",
        [],
    )?;

    // ==========================================================================
    // Purchase records (append-only, written inside the commit transaction)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS purchase_records (
            id TEXT PRIMARY KEY,
            listing_id TEXT NOT NULL,
            buyer_profile_id TEXT NOT NULL,
            seller_profile_id TEXT NOT NULL,
            price_paid REAL NOT NULL,
            payment_reference TEXT NOT NULL,
            completed_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_purchases_buyer
         ON purchase_records(buyer_profile_id, completed_at)",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail / operational channel)
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

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Event for the audit trail. Every listing transition, failed purchase,
/// and reconciliation case lands here; operational tooling reads it back.
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
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
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

/// Get events for a specific entity
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(&timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Parse an RFC 3339 timestamp column back into `DateTime<Utc>`.
pub(crate) fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

/// True when a rusqlite error is a UNIQUE/constraint violation. Callers
/// pre-check referenced rows, so a violation maps to a domain Conflict.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
