// Collectible Market - Core Library
// Exposes the listing lifecycle and purchase coordination modules for use
// in the CLI, API server, and tests

pub mod coordinator;
pub mod db;
pub mod entities;
pub mod error;
pub mod ledger;
pub mod payment;

// Re-export commonly used types
pub use coordinator::{PurchaseCoordinator, PurchaseRecord};
pub use db::{get_events_for_entity, insert_event, setup_database, Db, Event};
pub use entities::{
    Collectible, CollectibleRegistry, MediaKind, Profile, ProfileDirectory, TelegramIdentity,
};
pub use error::{MarketError, MarketResult};
pub use ledger::{
    Listing, ListingDetail, ListingFilter, ListingLedger, ListingStatus, ListingSummary, CURRENCY,
};
pub use payment::{AcceptAllVerifier, PaymentConfirmation, PaymentVerifier, WalletRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
