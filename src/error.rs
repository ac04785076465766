// Error taxonomy for the marketplace core.
//
// Every domain operation returns one of these variants to its immediate
// caller. Nothing is retried automatically; PaymentVerification failures may
// be retried by the caller with the same idempotency key, and
// ReconciliationRequired is surfaced on the events channel for manual
// recovery.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MarketError {
    /// Malformed input: non-positive price, empty title, self-purchase.
    Validation(String),

    /// Unknown id (profile, collectible, listing).
    NotFound(String),

    /// Listing not active, duplicate active listing, or a purchase already
    /// in flight for the listing.
    Conflict(String),

    /// Actor lacks rights over the entity (not the owner / not the seller).
    Authorization(String),

    /// No resolvable external identity was presented by the caller context.
    Authentication(String),

    /// External payment confirmation failed, timed out, or settled short.
    /// Payment was not linked to the listing; the caller may retry with the
    /// same idempotency key.
    PaymentVerification(String),

    /// Payment confirmed but the sold-state commit failed. Fatal to the
    /// request; logged to the events channel, never silently absorbed.
    ReconciliationRequired {
        listing_id: String,
        payment_reference: String,
        detail: String,
    },

    /// Internal store fault (SQL error, corrupted row). Not part of the
    /// request taxonomy; maps to a 500 at the API edge.
    Storage(String),
}

impl MarketError {
    /// Stable code string used in API payloads and event rows.
    pub fn code(&self) -> &'static str {
        match self {
            MarketError::Validation(_) => "validation_error",
            MarketError::NotFound(_) => "not_found",
            MarketError::Conflict(_) => "conflict",
            MarketError::Authorization(_) => "authorization_error",
            MarketError::Authentication(_) => "authentication_error",
            MarketError::PaymentVerification(_) => "payment_verification_error",
            MarketError::ReconciliationRequired { .. } => "reconciliation_required",
            MarketError::Storage(_) => "storage_error",
        }
    }

    pub fn listing_not_found(listing_id: &str) -> Self {
        MarketError::NotFound(format!("Listing not found: {}", listing_id))
    }

    pub fn collectible_not_found(collectible_id: &str) -> Self {
        MarketError::NotFound(format!("Collectible not found: {}", collectible_id))
    }

    pub fn profile_not_found(profile_id: &str) -> Self {
        MarketError::NotFound(format!("Profile not found: {}", profile_id))
    }

    pub fn listing_not_active(listing_id: &str, status: &str) -> Self {
        MarketError::Conflict(format!(
            "Listing {} is no longer active (status: {})",
            listing_id, status
        ))
    }

    pub fn only_seller(action: &str) -> Self {
        MarketError::Authorization(format!("Only the seller can {}", action))
    }
}

impl std::fmt::Display for MarketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketError::Validation(msg) => write!(f, "Validation error: {}", msg),
            MarketError::NotFound(msg) => write!(f, "Not found: {}", msg),
            MarketError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            MarketError::Authorization(msg) => write!(f, "Authorization error: {}", msg),
            MarketError::Authentication(msg) => write!(f, "Authentication error: {}", msg),
            MarketError::PaymentVerification(msg) => {
                write!(f, "Payment verification failed: {}", msg)
            }
            MarketError::ReconciliationRequired {
                listing_id,
                payment_reference,
                detail,
            } => write!(
                f,
                "Reconciliation required for listing {} (payment {}): {}",
                listing_id, payment_reference, detail
            ),
            MarketError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for MarketError {}

impl From<rusqlite::Error> for MarketError {
    fn from(err: rusqlite::Error) -> Self {
        MarketError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::Storage(format!("JSON encoding failed: {}", err))
    }
}

pub type MarketResult<T> = Result<T, MarketError>;
