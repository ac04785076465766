// 👤 Profile Entity - external telegram identity resolved to an internal id
//
// Identity: UUID (never changes). The telegram id is the unique external
// key; the display-name fields are the only values that may change, and
// they are refreshed from whatever identity the platform presents.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::{parse_timestamp, Db};
use crate::error::{MarketError, MarketResult};

/// The identity payload the platform hands to the caller context.
/// `None` at the API edge means the request was not authenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramIdentity {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Best display name available: username, then "first last", then a
    /// stable fallback derived from the telegram id.
    pub fn display_name(&self) -> String {
        if let Some(username) = &self.username {
            if !username.is_empty() {
                return username.clone();
            }
        }

        let full_name = match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => String::new(),
        };
        if !full_name.trim().is_empty() {
            return full_name;
        }

        format!("user{}", self.telegram_id)
    }
}

/// Resolves external identities to profiles, creating them on first sight.
#[derive(Clone)]
pub struct ProfileDirectory {
    db: Db,
}

impl ProfileDirectory {
    pub fn new(db: Db) -> Self {
        ProfileDirectory { db }
    }

    /// Resolve the presented identity to a profile, creating one on first
    /// sight. An absent identity is an authentication failure, not a lookup
    /// miss.
    pub fn resolve(&self, identity: Option<&TelegramIdentity>) -> MarketResult<Profile> {
        let identity = identity.ok_or_else(|| {
            MarketError::Authentication("No external identity presented by caller".to_string())
        })?;

        if let Some(existing) = self.find_by_telegram_id(identity.telegram_id)? {
            // Display name is the one mutable aspect of a profile
            self.refresh_display_fields(&existing.id, identity)?;
            return self
                .find_by_id(&existing.id)?
                .ok_or_else(|| MarketError::profile_not_found(&existing.id));
        }

        let profile = Profile {
            id: uuid::Uuid::new_v4().to_string(),
            telegram_id: identity.telegram_id,
            username: identity.username.clone(),
            first_name: identity.first_name.clone(),
            last_name: identity.last_name.clone(),
            created_at: Utc::now(),
        };

        let conn = self.db.conn();
        let result = conn.execute(
            "INSERT INTO profiles (id, telegram_id, username, first_name, last_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                profile.id,
                profile.telegram_id,
                profile.username,
                profile.first_name,
                profile.last_name,
                profile.created_at.to_rfc3339(),
            ],
        );
        drop(conn);

        match result {
            Ok(_) => Ok(profile),
            // Lost a first-sight race on telegram_id: the other writer's row wins
            Err(err) if crate::db::is_constraint_violation(&err) => self
                .find_by_telegram_id(identity.telegram_id)?
                .ok_or_else(|| MarketError::Storage("profile insert race lost twice".to_string())),
            Err(err) => Err(err.into()),
        }
    }

    pub fn find_by_id(&self, profile_id: &str) -> MarketResult<Option<Profile>> {
        self.query_one("SELECT id, telegram_id, username, first_name, last_name, created_at
                        FROM profiles WHERE id = ?1", profile_id)
    }

    pub fn find_by_telegram_id(&self, telegram_id: i64) -> MarketResult<Option<Profile>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, telegram_id, username, first_name, last_name, created_at
             FROM profiles WHERE telegram_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![telegram_id], row_to_profile)?;
        match rows.next() {
            Some(profile) => Ok(Some(profile?)),
            None => Ok(None),
        }
    }

    pub fn count(&self) -> MarketResult<i64> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))?;
        Ok(count)
    }

    fn refresh_display_fields(
        &self,
        profile_id: &str,
        identity: &TelegramIdentity,
    ) -> MarketResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE profiles SET username = ?1, first_name = ?2, last_name = ?3 WHERE id = ?4",
            params![
                identity.username,
                identity.first_name,
                identity.last_name,
                profile_id,
            ],
        )?;
        Ok(())
    }

    fn query_one(&self, sql: &str, id: &str) -> MarketResult<Option<Profile>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query_map(params![id], row_to_profile)?;
        match rows.next() {
            Some(profile) => Ok(Some(profile?)),
            None => Ok(None),
        }
    }
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let created_at_str: String = row.get(5)?;
    Ok(Profile {
        id: row.get(0)?,
        telegram_id: row.get(1)?,
        username: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        created_at: parse_timestamp(&created_at_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_directory() -> ProfileDirectory {
        ProfileDirectory::new(Db::open_in_memory().unwrap())
    }

    fn identity(telegram_id: i64, username: &str) -> TelegramIdentity {
        TelegramIdentity {
            telegram_id,
            username: Some(username.to_string()),
            first_name: None,
            last_name: None,
        }
    }

    #[test]
    fn test_resolve_creates_profile_on_first_sight() {
        let directory = test_directory();

        let profile = directory.resolve(Some(&identity(42, "alice"))).unwrap();
        assert_eq!(profile.telegram_id, 42);
        assert_eq!(profile.display_name(), "alice");
        assert_eq!(directory.count().unwrap(), 1);
    }

    #[test]
    fn test_resolve_is_stable_across_calls() {
        let directory = test_directory();

        let first = directory.resolve(Some(&identity(42, "alice"))).unwrap();
        let second = directory.resolve(Some(&identity(42, "alice"))).unwrap();

        assert_eq!(first.id, second.id, "same telegram id must map to one profile");
        assert_eq!(directory.count().unwrap(), 1);
    }

    #[test]
    fn test_resolve_refreshes_display_name_only() {
        let directory = test_directory();

        let created = directory.resolve(Some(&identity(42, "alice"))).unwrap();
        let renamed = directory.resolve(Some(&identity(42, "alice_2026"))).unwrap();

        assert_eq!(created.id, renamed.id);
        assert_eq!(renamed.display_name(), "alice_2026");
    }

    #[test]
    fn test_resolve_without_identity_fails_authentication() {
        let directory = test_directory();

        let err = directory.resolve(None).unwrap_err();
        assert!(matches!(err, MarketError::Authentication(_)));
        assert_eq!(directory.count().unwrap(), 0);
    }

    #[test]
    fn test_display_name_fallbacks() {
        let profile = Profile {
            id: "p1".into(),
            telegram_id: 99,
            username: None,
            first_name: Some("Ana".into()),
            last_name: Some("Lopez".into()),
            created_at: Utc::now(),
        };
        assert_eq!(profile.display_name(), "Ana Lopez");

        let bare = Profile {
            username: None,
            first_name: None,
            last_name: None,
            ..profile
        };
        assert_eq!(bare.display_name(), "user99");
    }
}
