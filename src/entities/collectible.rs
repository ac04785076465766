// 🖼️ Collectible Entity - sellable digital item with descriptive metadata
//
// Descriptive fields are immutable once created. The owner field is the
// single exception and mutates only as the result of a completed purchase,
// which is why the owner transfer is crate-private: the purchase
// coordinator is its only caller.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::db::{parse_timestamp, Db};
use crate::error::{MarketError, MarketResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Animation,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Animation => "animation",
        }
    }

    /// Unknown kinds degrade to Image rather than failing the row read;
    /// the store only ever writes the three known values.
    pub fn parse(raw: &str) -> MediaKind {
        match raw {
            "video" => MediaKind::Video,
            "animation" => MediaKind::Animation,
            _ => MediaKind::Image,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collectible {
    pub id: String,
    pub owner_profile_id: String,
    pub title: String,
    pub description: String,
    pub media_url: String,
    pub media_kind: MediaKind,
    /// Free-form attribute map (rarity, edition, original mint, ...).
    /// Persisted as JSON text so new attributes never need a migration.
    pub attributes: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Stores collectibles and tracks their current owner.
#[derive(Clone)]
pub struct CollectibleRegistry {
    db: Db,
}

impl CollectibleRegistry {
    pub fn new(db: Db) -> Self {
        CollectibleRegistry { db }
    }

    /// Create a collectible owned by `owner_profile_id`.
    pub fn create(
        &self,
        owner_profile_id: &str,
        title: &str,
        description: &str,
        media_url: &str,
        media_kind: MediaKind,
        attributes: HashMap<String, serde_json::Value>,
    ) -> MarketResult<Collectible> {
        if title.trim().is_empty() {
            return Err(MarketError::Validation(
                "Collectible title must not be empty".to_string(),
            ));
        }

        let owner_exists: bool = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT COUNT(*) FROM profiles WHERE id = ?1",
                params![owner_profile_id],
                |row| row.get::<_, i64>(0),
            )? > 0
        };
        if !owner_exists {
            return Err(MarketError::profile_not_found(owner_profile_id));
        }

        let collectible = Collectible {
            id: uuid::Uuid::new_v4().to_string(),
            owner_profile_id: owner_profile_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            media_url: media_url.to_string(),
            media_kind,
            attributes,
            created_at: Utc::now(),
        };

        let attributes_json = serde_json::to_string(&collectible.attributes)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO collectibles (
                id, owner_profile_id, title, description, media_url, media_kind,
                attributes, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                collectible.id,
                collectible.owner_profile_id,
                collectible.title,
                collectible.description,
                collectible.media_url,
                collectible.media_kind.as_str(),
                attributes_json,
                collectible.created_at.to_rfc3339(),
            ],
        )?;

        Ok(collectible)
    }

    pub fn find_by_id(&self, collectible_id: &str) -> MarketResult<Option<Collectible>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, owner_profile_id, title, description, media_url, media_kind,
                    attributes, created_at
             FROM collectibles WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![collectible_id], row_to_collectible)?;
        match rows.next() {
            Some(collectible) => Ok(Some(collectible?)),
            None => Ok(None),
        }
    }

    pub fn by_owner(&self, owner_profile_id: &str) -> MarketResult<Vec<Collectible>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, owner_profile_id, title, description, media_url, media_kind,
                    attributes, created_at
             FROM collectibles WHERE owner_profile_id = ?1
             ORDER BY created_at DESC",
        )?;
        let collectibles = stmt
            .query_map(params![owner_profile_id], row_to_collectible)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(collectibles)
    }

    pub fn count(&self) -> MarketResult<i64> {
        let conn = self.db.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM collectibles", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Move ownership to the buyer, against the open purchase-commit
    /// transaction. Invoked only by the purchase coordinator once the
    /// listing transitioned to sold; not exposed for direct external use.
    pub(crate) fn transfer_owner_in(
        tx: &rusqlite::Transaction<'_>,
        collectible_id: &str,
        new_owner_profile_id: &str,
    ) -> MarketResult<()> {
        let changed = tx.execute(
            "UPDATE collectibles SET owner_profile_id = ?1 WHERE id = ?2",
            params![new_owner_profile_id, collectible_id],
        )?;
        if changed == 0 {
            return Err(MarketError::collectible_not_found(collectible_id));
        }
        Ok(())
    }
}

fn row_to_collectible(row: &rusqlite::Row<'_>) -> rusqlite::Result<Collectible> {
    let media_kind_str: String = row.get(5)?;
    let attributes_json: String = row.get(6)?;
    let created_at_str: String = row.get(7)?;

    Ok(Collectible {
        id: row.get(0)?,
        owner_profile_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        media_url: row.get(4)?,
        media_kind: MediaKind::parse(&media_kind_str),
        attributes: serde_json::from_str(&attributes_json).unwrap_or_default(),
        created_at: parse_timestamp(&created_at_str)?,
    })
}
