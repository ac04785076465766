// 📒 Listing Ledger - owns the set of listings and their status
//
// This module is the SOLE writer of Listing.status. Transitions are
// monotonic: active -> sold or active -> cancelled, both terminal. The
// transition itself is one conditional UPDATE (compare-and-set against the
// persisted row), never a read-then-write pair.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::{insert_event, is_constraint_violation, parse_timestamp, Db, Event};
use crate::entities::{Collectible, MediaKind, Profile};
use crate::error::{MarketError, MarketResult};

/// Fixed currency unit for all listing prices.
pub const CURRENCY: &str = "TON";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Sold,
    Cancelled,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Sold => "sold",
            ListingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> ListingStatus {
        match raw {
            "sold" => ListingStatus::Sold,
            "cancelled" => ListingStatus::Cancelled,
            _ => ListingStatus::Active,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ListingStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub collectible_id: String,
    pub seller_profile_id: String,
    pub price: f64,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
}

/// Optional filters for the marketplace list view.
#[derive(Debug, Clone, Default)]
pub struct ListingFilter {
    pub seller_profile_id: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

/// Row shape for the marketplace list view: listing plus the collectible
/// and seller fields the cards render.
#[derive(Debug, Clone, Serialize)]
pub struct ListingSummary {
    pub id: String,
    pub price: f64,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub media_url: String,
    pub media_kind: MediaKind,
    pub seller: Profile,
}

/// Full projection for the listing detail view.
#[derive(Debug, Clone, Serialize)]
pub struct ListingDetail {
    pub listing: Listing,
    pub collectible: Collectible,
    pub seller: Profile,
}

#[derive(Clone)]
pub struct ListingLedger {
    db: Db,
}

impl ListingLedger {
    pub fn new(db: Db) -> Self {
        ListingLedger { db }
    }

    /// Create a new active listing for a collectible the seller owns.
    ///
    /// The "one active listing per collectible" invariant is enforced by
    /// the store's partial unique index; a violation surfaces as Conflict.
    pub fn create_listing(
        &self,
        collectible_id: &str,
        seller_profile_id: &str,
        price: f64,
    ) -> MarketResult<Listing> {
        if !(price > 0.0) {
            return Err(MarketError::Validation(format!(
                "Listing price must be positive, got {}",
                price
            )));
        }

        let owner: Option<String> = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT owner_profile_id FROM collectibles WHERE id = ?1",
                params![collectible_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
        };

        match owner {
            None => return Err(MarketError::collectible_not_found(collectible_id)),
            Some(owner_id) if owner_id != seller_profile_id => {
                return Err(MarketError::Authorization(format!(
                    "Profile {} does not own collectible {}",
                    seller_profile_id, collectible_id
                )));
            }
            Some(_) => {}
        }

        let listing = Listing {
            id: uuid::Uuid::new_v4().to_string(),
            collectible_id: collectible_id.to_string(),
            seller_profile_id: seller_profile_id.to_string(),
            price,
            status: ListingStatus::Active,
            created_at: Utc::now(),
        };

        let conn = self.db.conn();
        let result = conn.execute(
            "INSERT INTO listings (id, collectible_id, seller_profile_id, price, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                listing.id,
                listing.collectible_id,
                listing.seller_profile_id,
                listing.price,
                listing.status.as_str(),
                listing.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {
                let event = Event::new(
                    "listing_created",
                    "listing",
                    &listing.id,
                    serde_json::json!({
                        "collectible_id": listing.collectible_id,
                        "seller_profile_id": listing.seller_profile_id,
                        "price": listing.price,
                        "currency": CURRENCY,
                    }),
                    "listing_ledger",
                );
                let _ = insert_event(&conn, &event);
                Ok(listing)
            }
            Err(err) if is_constraint_violation(&err) => Err(MarketError::Conflict(format!(
                "An active listing already exists for collectible {}",
                collectible_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Load a listing regardless of status.
    pub fn get_listing(&self, listing_id: &str) -> MarketResult<Option<Listing>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, collectible_id, seller_profile_id, price, status, created_at
             FROM listings WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![listing_id], row_to_listing)?;
        match rows.next() {
            Some(listing) => Ok(Some(listing?)),
            None => Ok(None),
        }
    }

    /// Load a listing that must still be purchasable. Unknown id is
    /// NotFound; a terminal listing (already sold or cancelled) is Conflict.
    pub fn get_active_listing(&self, listing_id: &str) -> MarketResult<Listing> {
        let listing = self
            .get_listing(listing_id)?
            .ok_or_else(|| MarketError::listing_not_found(listing_id))?;

        if listing.status.is_terminal() {
            return Err(MarketError::listing_not_active(
                listing_id,
                listing.status.as_str(),
            ));
        }
        Ok(listing)
    }

    /// Atomically set status=sold iff the current status still equals
    /// `expected`. Returns whether this caller won the transition. This
    /// single conditional UPDATE is the serialization point that prevents
    /// double sale.
    pub fn transition_to_sold(
        &self,
        listing_id: &str,
        expected: ListingStatus,
    ) -> MarketResult<bool> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE listings SET status = 'sold' WHERE id = ?1 AND status = ?2",
            params![listing_id, expected.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Same compare-and-set, against an open purchase-commit transaction.
    pub(crate) fn transition_to_sold_in(
        tx: &rusqlite::Transaction<'_>,
        listing_id: &str,
        expected: ListingStatus,
    ) -> MarketResult<bool> {
        let changed = tx.execute(
            "UPDATE listings SET status = 'sold' WHERE id = ?1 AND status = ?2",
            params![listing_id, expected.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Transition active -> cancelled. Only the seller may cancel.
    pub fn cancel_listing(
        &self,
        listing_id: &str,
        requester_profile_id: &str,
    ) -> MarketResult<()> {
        let listing = self
            .get_listing(listing_id)?
            .ok_or_else(|| MarketError::listing_not_found(listing_id))?;

        if listing.seller_profile_id != requester_profile_id {
            return Err(MarketError::only_seller("cancel this listing"));
        }

        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE listings SET status = 'cancelled' WHERE id = ?1 AND status = 'active'",
            params![listing_id],
        )?;
        if changed == 0 {
            return Err(MarketError::listing_not_active(
                listing_id,
                listing.status.as_str(),
            ));
        }

        let event = Event::new(
            "listing_cancelled",
            "listing",
            listing_id,
            serde_json::json!({ "seller_profile_id": requester_profile_id }),
            "listing_ledger",
        );
        let _ = insert_event(&conn, &event);

        Ok(())
    }

    /// Marketplace list view: active listings, newest first, joined with
    /// the collectible and seller fields the cards render.
    pub fn list_active(&self, filter: &ListingFilter) -> MarketResult<Vec<ListingSummary>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT l.id, l.price, l.created_at,
                    c.title, c.media_url, c.media_kind,
                    p.id, p.telegram_id, p.username, p.first_name, p.last_name, p.created_at
             FROM listings l
             JOIN collectibles c ON c.id = l.collectible_id
             JOIN profiles p ON p.id = l.seller_profile_id
             WHERE l.status = 'active'
               AND (?1 IS NULL OR l.seller_profile_id = ?1)
               AND (?2 IS NULL OR l.price >= ?2)
               AND (?3 IS NULL OR l.price <= ?3)
             ORDER BY l.created_at DESC",
        )?;

        let summaries = stmt
            .query_map(
                params![filter.seller_profile_id, filter.min_price, filter.max_price],
                |row| {
                    let listing_created: String = row.get(2)?;
                    let media_kind_str: String = row.get(5)?;
                    let seller_created: String = row.get(11)?;

                    Ok(ListingSummary {
                        id: row.get(0)?,
                        price: row.get(1)?,
                        created_at: parse_timestamp(&listing_created)?,
                        title: row.get(3)?,
                        media_url: row.get(4)?,
                        media_kind: MediaKind::parse(&media_kind_str),
                        seller: Profile {
                            id: row.get(6)?,
                            telegram_id: row.get(7)?,
                            username: row.get(8)?,
                            first_name: row.get(9)?,
                            last_name: row.get(10)?,
                            created_at: parse_timestamp(&seller_created)?,
                        },
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(summaries)
    }

    /// Listing detail view: the listing plus full collectible and seller
    /// projections. Only active listings are shown in detail, matching the
    /// marketplace surface.
    pub fn listing_detail(
        &self,
        listing_id: &str,
        collectibles: &crate::entities::CollectibleRegistry,
        profiles: &crate::entities::ProfileDirectory,
    ) -> MarketResult<ListingDetail> {
        let listing = self.get_active_listing(listing_id)?;

        let collectible = collectibles
            .find_by_id(&listing.collectible_id)?
            .ok_or_else(|| MarketError::collectible_not_found(&listing.collectible_id))?;
        let seller = profiles
            .find_by_id(&listing.seller_profile_id)?
            .ok_or_else(|| MarketError::profile_not_found(&listing.seller_profile_id))?;

        Ok(ListingDetail {
            listing,
            collectible,
            seller,
        })
    }
}

fn row_to_listing(row: &rusqlite::Row<'_>) -> rusqlite::Result<Listing> {
    let status_str: String = row.get(4)?;
    let created_at_str: String = row.get(5)?;
    Ok(Listing {
        id: row.get(0)?,
        collectible_id: row.get(1)?,
        seller_profile_id: row.get(2)?,
        price: row.get(3)?,
        status: ListingStatus::parse(&status_str),
        created_at: parse_timestamp(&created_at_str)?,
    })
}
