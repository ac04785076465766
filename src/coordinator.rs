// ⚖️ Purchase Coordinator - orchestrates payment-to-ownership linkage
//
// Ordering contract: the listing is never marked sold before payment is
// confirmed, and payment is never verified twice for the same idempotency
// key. The pending purchase intent doubles as the reservation: at most one
// buyer per listing is ever between "paid" and "committed", so concurrent
// buyers fail with Conflict before any funds move. The commit itself is one
// SQLite transaction across listing status, collectible owner, purchase
// record, and intent state.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::db::{insert_event, is_constraint_violation, parse_timestamp, Db, Event};
use crate::entities::CollectibleRegistry;
use crate::error::{MarketError, MarketResult};
use crate::ledger::{Listing, ListingLedger, ListingStatus, CURRENCY};
use crate::payment::{PaymentVerifier, WalletRef};

/// How long a pending intent may sit before it lapses. Bounds the window a
/// crashed purchase can hold the reservation.
const INTENT_TTL_MINUTES: i64 = 15;

/// Created only on successful commit. Append-only; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub id: String,
    pub listing_id: String,
    pub buyer_profile_id: String,
    pub seller_profile_id: String,
    pub price_paid: f64,
    pub payment_reference: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentState {
    Pending,
    Completed,
    Failed,
}

impl IntentState {
    fn as_str(&self) -> &'static str {
        match self {
            IntentState::Pending => "pending",
            IntentState::Completed => "completed",
            IntentState::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> IntentState {
        match raw {
            "completed" => IntentState::Completed,
            "failed" => IntentState::Failed,
            _ => IntentState::Pending,
        }
    }
}

struct StoredIntent {
    state: IntentState,
    outcome: Option<String>,
}

/// Deterministic intent identity: the same key against the same listing is
/// the same intent; the same key against another listing is not.
fn intent_fingerprint(idempotency_key: &str, listing_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(idempotency_key.as_bytes());
    hasher.update(b"/");
    hasher.update(listing_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct PurchaseCoordinator {
    db: Db,
    ledger: ListingLedger,
    collectibles: CollectibleRegistry,
    verifier: Arc<dyn PaymentVerifier>,
}

impl PurchaseCoordinator {
    pub fn new(
        db: Db,
        ledger: ListingLedger,
        collectibles: CollectibleRegistry,
        verifier: Arc<dyn PaymentVerifier>,
    ) -> Self {
        PurchaseCoordinator {
            db,
            ledger,
            collectibles,
            verifier,
        }
    }

    /// Purchase `listing_id` for `buyer_profile_id`, paying through the
    /// wallet transaction in `wallet`. Repeating the call with the same
    /// idempotency key replays the prior outcome instead of re-verifying.
    pub fn purchase(
        &self,
        listing_id: &str,
        buyer_profile_id: &str,
        wallet: &WalletRef,
        idempotency_key: &str,
    ) -> MarketResult<PurchaseRecord> {
        let fingerprint = intent_fingerprint(idempotency_key, listing_id);

        self.lapse_expired_intents()?;

        if let Some(intent) = self.find_intent(&fingerprint)? {
            match intent.state {
                IntentState::Completed => {
                    let outcome = intent.outcome.ok_or_else(|| {
                        MarketError::Storage("completed intent without outcome".to_string())
                    })?;
                    let record: PurchaseRecord = serde_json::from_str(&outcome)?;
                    return Ok(record);
                }
                IntentState::Pending => {
                    return Err(MarketError::Conflict(format!(
                        "A purchase with this idempotency key is already in flight for listing {}",
                        listing_id
                    )));
                }
                // Failed verification is retryable with the same key
                IntentState::Failed => self.discard_intent(&fingerprint)?,
            }
        }

        let listing = self.ledger.get_active_listing(listing_id)?;

        if listing.seller_profile_id == buyer_profile_id {
            return Err(MarketError::Validation(
                "Sellers cannot purchase their own listing".to_string(),
            ));
        }
        self.require_profile(buyer_profile_id)?;

        self.reserve_intent(&fingerprint, idempotency_key, listing_id, buyer_profile_id)?;

        // Payment verification may block on the chain; it runs with the
        // store lock released so other listings keep moving.
        let failure = match self
            .verifier
            .confirm(&wallet.address, listing.price, &wallet.tx_reference)
        {
            Err(err) => Some(format!("verifier unavailable: {}", err)),
            Ok(confirmation) if !confirmation.confirmed => Some(
                confirmation
                    .error
                    .unwrap_or_else(|| "transfer not confirmed".to_string()),
            ),
            Ok(confirmation) if confirmation.settled_amount < listing.price => Some(format!(
                "settled amount {} is below listing price {}",
                confirmation.settled_amount, listing.price
            )),
            Ok(_) => None,
        };

        if let Some(reason) = failure {
            self.fail_intent(&fingerprint, &reason)?;
            let conn = self.db.conn();
            let event = Event::new(
                "purchase_failed",
                "listing",
                listing_id,
                serde_json::json!({
                    "buyer_profile_id": buyer_profile_id,
                    "tx_reference": wallet.tx_reference,
                    "reason": reason,
                }),
                "purchase_coordinator",
            );
            let _ = insert_event(&conn, &event);
            return Err(MarketError::PaymentVerification(reason));
        }

        self.commit(&listing, buyer_profile_id, wallet, &fingerprint)
    }

    /// Append-only purchase history for a buyer, newest first.
    pub fn purchases_for_buyer(&self, buyer_profile_id: &str) -> MarketResult<Vec<PurchaseRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, listing_id, buyer_profile_id, seller_profile_id, price_paid,
                    payment_reference, completed_at
             FROM purchase_records
             WHERE buyer_profile_id = ?1
             ORDER BY completed_at DESC",
        )?;
        let records = stmt
            .query_map(params![buyer_profile_id], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Payment is confirmed at this point. One transaction: CAS the listing
    /// to sold, move ownership, append the record, complete the intent.
    fn commit(
        &self,
        listing: &Listing,
        buyer_profile_id: &str,
        wallet: &WalletRef,
        fingerprint: &str,
    ) -> MarketResult<PurchaseRecord> {
        let record = PurchaseRecord {
            id: uuid::Uuid::new_v4().to_string(),
            listing_id: listing.id.clone(),
            buyer_profile_id: buyer_profile_id.to_string(),
            seller_profile_id: listing.seller_profile_id.clone(),
            price_paid: listing.price,
            payment_reference: wallet.tx_reference.clone(),
            completed_at: Utc::now(),
        };
        let outcome_json = serde_json::to_string(&record)?;

        let mut conn = self.db.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let won = ListingLedger::transition_to_sold_in(&tx, &listing.id, ListingStatus::Active)?;
        if !won {
            // Payment was already taken for this buyer; the listing left
            // the active state under us (seller cancel during verification).
            // Compensatable anomaly: flag it, never swallow it.
            drop(tx);
            let detail = format!(
                "payment {} confirmed for buyer {} but listing {} was no longer active",
                wallet.tx_reference, buyer_profile_id, listing.id
            );
            conn.execute(
                "UPDATE purchase_intents SET state = 'failed', outcome = ?1 WHERE intent_hash = ?2",
                params![detail, fingerprint],
            )?;
            let event = Event::new(
                "reconciliation_required",
                "listing",
                &listing.id,
                serde_json::json!({
                    "buyer_profile_id": buyer_profile_id,
                    "tx_reference": wallet.tx_reference,
                    "price": listing.price,
                    "currency": CURRENCY,
                    "detail": detail,
                }),
                "purchase_coordinator",
            );
            let _ = insert_event(&conn, &event);
            eprintln!("⚠️  Reconciliation required: {}", detail);

            return Err(MarketError::ReconciliationRequired {
                listing_id: listing.id.clone(),
                payment_reference: wallet.tx_reference.clone(),
                detail,
            });
        }

        CollectibleRegistry::transfer_owner_in(&tx, &listing.collectible_id, buyer_profile_id)?;

        tx.execute(
            "INSERT INTO purchase_records (
                id, listing_id, buyer_profile_id, seller_profile_id, price_paid,
                payment_reference, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.listing_id,
                record.buyer_profile_id,
                record.seller_profile_id,
                record.price_paid,
                record.payment_reference,
                record.completed_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "UPDATE purchase_intents SET state = 'completed', outcome = ?1 WHERE intent_hash = ?2",
            params![outcome_json, fingerprint],
        )?;

        let event = Event::new(
            "listing_sold",
            "listing",
            &listing.id,
            serde_json::json!({
                "buyer_profile_id": buyer_profile_id,
                "price": listing.price,
                "currency": CURRENCY,
                "tx_reference": wallet.tx_reference,
            }),
            "purchase_coordinator",
        );
        let _ = insert_event(&tx, &event);

        tx.commit()?;
        Ok(record)
    }

    // ========================================================================
    // Intent bookkeeping
    // ========================================================================

    fn lapse_expired_intents(&self) -> MarketResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE purchase_intents SET state = 'failed', outcome = 'expired'
             WHERE state = 'pending' AND expires_at < ?1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn find_intent(&self, fingerprint: &str) -> MarketResult<Option<StoredIntent>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT state, outcome FROM purchase_intents WHERE intent_hash = ?1",
        )?;
        let mut rows = stmt.query_map(params![fingerprint], |row| {
            let state_str: String = row.get(0)?;
            Ok(StoredIntent {
                state: IntentState::parse(&state_str),
                outcome: row.get(1)?,
            })
        })?;
        match rows.next() {
            Some(intent) => Ok(Some(intent?)),
            None => Ok(None),
        }
    }

    /// Insert the pending reservation, re-checking inside the same
    /// statement that the listing is still active. The winner's commit
    /// flips status and completes its intent in one transaction, so a
    /// buyer arriving after the sale fails here instead of reaching the
    /// paid-but-uncommitted path.
    fn reserve_intent(
        &self,
        fingerprint: &str,
        idempotency_key: &str,
        listing_id: &str,
        buyer_profile_id: &str,
    ) -> MarketResult<()> {
        let now = Utc::now();
        let expires_at = now + Duration::minutes(INTENT_TTL_MINUTES);

        let conn = self.db.conn();
        let result = conn.execute(
            "INSERT INTO purchase_intents (
                intent_hash, idempotency_key, listing_id, buyer_profile_id,
                state, outcome, created_at, expires_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7
            WHERE EXISTS (SELECT 1 FROM listings WHERE id = ?3 AND status = 'active')",
            params![
                fingerprint,
                idempotency_key,
                listing_id,
                buyer_profile_id,
                IntentState::Pending.as_str(),
                now.to_rfc3339(),
                expires_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(1) => Ok(()),
            // The listing left the active state since it was loaded
            Ok(_) => Err(MarketError::Conflict(format!(
                "Listing {} is no longer active",
                listing_id
            ))),
            // Either another buyer holds the pending reservation for this
            // listing, or the same key raced itself. Both conflict, and
            // neither has taken payment.
            Err(err) if is_constraint_violation(&err) => Err(MarketError::Conflict(format!(
                "A purchase is already in flight for listing {}",
                listing_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn fail_intent(&self, fingerprint: &str, reason: &str) -> MarketResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE purchase_intents SET state = 'failed', outcome = ?1 WHERE intent_hash = ?2",
            params![reason, fingerprint],
        )?;
        Ok(())
    }

    fn discard_intent(&self, fingerprint: &str) -> MarketResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "DELETE FROM purchase_intents WHERE intent_hash = ?1",
            params![fingerprint],
        )?;
        Ok(())
    }

    fn require_profile(&self, profile_id: &str) -> MarketResult<()> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM profiles WHERE id = ?1",
            params![profile_id],
            |row| row.get(0),
        )?;
        if count == 0 {
            return Err(MarketError::profile_not_found(profile_id));
        }
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PurchaseRecord> {
    let completed_at_str: String = row.get(6)?;
    Ok(PurchaseRecord {
        id: row.get(0)?,
        listing_id: row.get(1)?,
        buyer_profile_id: row.get(2)?,
        seller_profile_id: row.get(3)?,
        price_paid: row.get(4)?,
        payment_reference: row.get(5)?,
        completed_at: parse_timestamp(&completed_at_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::get_events_for_entity;
    use crate::entities::{MediaKind, ProfileDirectory, TelegramIdentity};
    use crate::ledger::ListingFilter;
    use crate::payment::{AcceptAllVerifier, PaymentConfirmation};
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    struct Fixture {
        db: Db,
        profiles: ProfileDirectory,
        collectibles: CollectibleRegistry,
        ledger: ListingLedger,
        seller_id: String,
        buyer_id: String,
        collectible_id: String,
        listing_id: String,
    }

    fn fixture() -> Fixture {
        let db = Db::open_in_memory().unwrap();
        let profiles = ProfileDirectory::new(db.clone());
        let collectibles = CollectibleRegistry::new(db.clone());
        let ledger = ListingLedger::new(db.clone());

        let seller = profiles
            .resolve(Some(&TelegramIdentity {
                telegram_id: 1,
                username: Some("seller".into()),
                first_name: None,
                last_name: None,
            }))
            .unwrap();
        let buyer = profiles
            .resolve(Some(&TelegramIdentity {
                telegram_id: 2,
                username: Some("buyer".into()),
                first_name: None,
                last_name: None,
            }))
            .unwrap();
        let collectible = collectibles
            .create(
                &seller.id,
                "Rare Sticker Pack",
                "Limited run",
                "https://example.com/sticker.png",
                MediaKind::Image,
                HashMap::new(),
            )
            .unwrap();
        let listing = ledger
            .create_listing(&collectible.id, &seller.id, 10.5)
            .unwrap();

        Fixture {
            db,
            profiles,
            collectibles,
            ledger,
            seller_id: seller.id,
            buyer_id: buyer.id,
            collectible_id: collectible.id,
            listing_id: listing.id,
        }
    }

    fn coordinator_with(fx: &Fixture, verifier: Arc<dyn PaymentVerifier>) -> PurchaseCoordinator {
        PurchaseCoordinator::new(
            fx.db.clone(),
            fx.ledger.clone(),
            fx.collectibles.clone(),
            verifier,
        )
    }

    fn wallet(tx_reference: &str) -> WalletRef {
        WalletRef {
            address: "EQbuyer-wallet".to_string(),
            tx_reference: tx_reference.to_string(),
        }
    }

    /// Counts confirmations; settles at the expected amount.
    struct CountingVerifier {
        calls: AtomicUsize,
    }

    impl CountingVerifier {
        fn new() -> Arc<Self> {
            Arc::new(CountingVerifier {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl PaymentVerifier for CountingVerifier {
        fn confirm(
            &self,
            _wallet_address: &str,
            expected_amount: f64,
            _tx_reference: &str,
        ) -> anyhow::Result<PaymentConfirmation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentConfirmation::settled(expected_amount))
        }
    }

    /// Simulates a verifier that never answers in time.
    struct TimeoutVerifier;

    impl PaymentVerifier for TimeoutVerifier {
        fn confirm(
            &self,
            _wallet_address: &str,
            _expected_amount: f64,
            _tx_reference: &str,
        ) -> anyhow::Result<PaymentConfirmation> {
            Err(anyhow!("confirmation timed out after 30s"))
        }
    }

    /// Settles slowly, widening the paid-but-uncommitted window.
    struct SlowVerifier {
        delay: StdDuration,
    }

    impl PaymentVerifier for SlowVerifier {
        fn confirm(
            &self,
            _wallet_address: &str,
            expected_amount: f64,
            _tx_reference: &str,
        ) -> anyhow::Result<PaymentConfirmation> {
            std::thread::sleep(self.delay);
            Ok(PaymentConfirmation::settled(expected_amount))
        }
    }

    /// The seller cancels while the buyer's payment is being verified.
    struct CancellingVerifier {
        ledger: ListingLedger,
        listing_id: String,
        seller_id: String,
    }

    impl PaymentVerifier for CancellingVerifier {
        fn confirm(
            &self,
            _wallet_address: &str,
            expected_amount: f64,
            _tx_reference: &str,
        ) -> anyhow::Result<PaymentConfirmation> {
            self.ledger
                .cancel_listing(&self.listing_id, &self.seller_id)
                .unwrap();
            Ok(PaymentConfirmation::settled(expected_amount))
        }
    }

    #[test]
    fn test_purchase_happy_path() {
        let fx = fixture();
        let coordinator = coordinator_with(&fx, Arc::new(AcceptAllVerifier));

        let record = coordinator
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap();

        assert_eq!(record.price_paid, 10.5);
        assert_eq!(record.listing_id, fx.listing_id);
        assert_eq!(record.buyer_profile_id, fx.buyer_id);
        assert_eq!(record.seller_profile_id, fx.seller_id);
        assert_eq!(record.payment_reference, "tx-1");

        // Listing is sold, ownership moved to the buyer
        let listing = fx.ledger.get_listing(&fx.listing_id).unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Sold);
        let collectible = fx
            .collectibles
            .find_by_id(&fx.collectible_id)
            .unwrap()
            .unwrap();
        assert_eq!(collectible.owner_profile_id, fx.buyer_id);

        // Sold listings leave the marketplace view
        assert!(fx.ledger.list_active(&ListingFilter::default()).unwrap().is_empty());

        // Audit trail captured the sale
        let events = get_events_for_entity(&fx.db.conn(), "listing", &fx.listing_id).unwrap();
        assert!(events.iter().any(|e| e.event_type == "listing_sold"));
    }

    #[test]
    fn test_self_purchase_is_rejected_without_state_change() {
        let fx = fixture();
        let verifier = CountingVerifier::new();
        let coordinator = coordinator_with(&fx, verifier.clone());

        let err = coordinator
            .purchase(&fx.listing_id, &fx.seller_id, &wallet("tx-1"), "key-1")
            .unwrap_err();

        assert!(matches!(err, MarketError::Validation(_)));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
        let listing = fx.ledger.get_listing(&fx.listing_id).unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Active);
    }

    #[test]
    fn test_unknown_listing_is_not_found() {
        let fx = fixture();
        let coordinator = coordinator_with(&fx, Arc::new(AcceptAllVerifier));

        let err = coordinator
            .purchase("no-such-listing", &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap_err();
        assert!(matches!(err, MarketError::NotFound(_)));
    }

    #[test]
    fn test_unknown_buyer_is_not_found() {
        let fx = fixture();
        let coordinator = coordinator_with(&fx, Arc::new(AcceptAllVerifier));

        let err = coordinator
            .purchase(&fx.listing_id, "no-such-profile", &wallet("tx-1"), "key-1")
            .unwrap_err();
        assert!(matches!(err, MarketError::NotFound(_)));
    }

    #[test]
    fn test_sold_listing_conflicts_for_later_buyers() {
        let fx = fixture();
        let coordinator = coordinator_with(&fx, Arc::new(AcceptAllVerifier));
        coordinator
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap();

        let late_buyer = fx
            .profiles
            .resolve(Some(&TelegramIdentity {
                telegram_id: 3,
                username: Some("late".into()),
                first_name: None,
                last_name: None,
            }))
            .unwrap();
        let err = coordinator
            .purchase(&fx.listing_id, &late_buyer.id, &wallet("tx-2"), "key-2")
            .unwrap_err();
        assert!(matches!(err, MarketError::Conflict(_)));
    }

    #[test]
    fn test_verifier_timeout_leaves_listing_active() {
        let fx = fixture();
        let coordinator = coordinator_with(&fx, Arc::new(TimeoutVerifier));

        let err = coordinator
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap_err();
        assert!(matches!(err, MarketError::PaymentVerification(_)));

        // No partial state is visible: still active, still seller-owned
        let listing = fx.ledger.get_listing(&fx.listing_id).unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Active);
        let collectible = fx
            .collectibles
            .find_by_id(&fx.collectible_id)
            .unwrap()
            .unwrap();
        assert_eq!(collectible.owner_profile_id, fx.seller_id);
    }

    #[test]
    fn test_retry_with_same_key_after_transient_failure_succeeds() {
        let fx = fixture();

        let flaky = coordinator_with(&fx, Arc::new(TimeoutVerifier));
        let err = flaky
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap_err();
        assert!(matches!(err, MarketError::PaymentVerification(_)));

        // Same idempotency key, network recovered: re-verification is allowed
        let recovered = coordinator_with(&fx, Arc::new(AcceptAllVerifier));
        let record = recovered
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap();
        assert_eq!(record.price_paid, 10.5);
    }

    #[test]
    fn test_short_settlement_fails_verification() {
        struct ShortVerifier;
        impl PaymentVerifier for ShortVerifier {
            fn confirm(
                &self,
                _wallet_address: &str,
                _expected_amount: f64,
                _tx_reference: &str,
            ) -> anyhow::Result<PaymentConfirmation> {
                Ok(PaymentConfirmation {
                    confirmed: true,
                    settled_amount: 5.0,
                    error: None,
                })
            }
        }

        let fx = fixture();
        let coordinator = coordinator_with(&fx, Arc::new(ShortVerifier));

        let err = coordinator
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap_err();
        assert!(matches!(err, MarketError::PaymentVerification(_)));
        assert_eq!(
            fx.ledger.get_listing(&fx.listing_id).unwrap().unwrap().status,
            ListingStatus::Active
        );
    }

    #[test]
    fn test_idempotent_replay_invokes_verifier_once() {
        let fx = fixture();
        let verifier = CountingVerifier::new();
        let coordinator = coordinator_with(&fx, verifier.clone());

        let first = coordinator
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap();
        let replay = coordinator
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap();

        assert_eq!(first.id, replay.id, "replay must return the prior record");
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);

        // Still exactly one purchase on the books
        assert_eq!(coordinator.purchases_for_buyer(&fx.buyer_id).unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_purchases_have_exactly_one_winner() {
        let fx = fixture();
        let coordinator = Arc::new(coordinator_with(
            &fx,
            Arc::new(SlowVerifier {
                delay: StdDuration::from_millis(40),
            }),
        ));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                let listing_id = fx.listing_id.clone();
                let buyer_id = fx.buyer_id.clone();
                std::thread::spawn(move || {
                    coordinator.purchase(
                        &listing_id,
                        &buyer_id,
                        &wallet(&format!("tx-{}", i)),
                        &format!("key-{}", i),
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(MarketError::Conflict(_))))
            .count();

        assert_eq!(winners.len(), 1, "exactly one purchase must return a record");
        assert_eq!(conflicts, results.len() - 1, "all others must observe Conflict");

        let records: i64 = fx
            .db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM purchase_records WHERE listing_id = ?1",
                params![fx.listing_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(records, 1);

        let collectible = fx
            .collectibles
            .find_by_id(&fx.collectible_id)
            .unwrap()
            .unwrap();
        assert_eq!(collectible.owner_profile_id, fx.buyer_id);
    }

    #[test]
    fn test_cancel_during_verification_flags_reconciliation() {
        let fx = fixture();
        let coordinator = coordinator_with(
            &fx,
            Arc::new(CancellingVerifier {
                ledger: fx.ledger.clone(),
                listing_id: fx.listing_id.clone(),
                seller_id: fx.seller_id.clone(),
            }),
        );

        let err = coordinator
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap_err();
        match &err {
            MarketError::ReconciliationRequired {
                listing_id,
                payment_reference,
                ..
            } => {
                assert_eq!(listing_id, &fx.listing_id);
                assert_eq!(payment_reference, "tx-1");
            }
            other => panic!("expected ReconciliationRequired, got {:?}", other),
        }

        // The anomaly is on the operational channel, not swallowed
        let events = get_events_for_entity(&fx.db.conn(), "listing", &fx.listing_id).unwrap();
        assert!(events.iter().any(|e| e.event_type == "reconciliation_required"));

        // No ownership transfer, no record
        let collectible = fx
            .collectibles
            .find_by_id(&fx.collectible_id)
            .unwrap()
            .unwrap();
        assert_eq!(collectible.owner_profile_id, fx.seller_id);
        assert!(coordinator.purchases_for_buyer(&fx.buyer_id).unwrap().is_empty());
    }

    #[test]
    fn test_expired_pending_intent_does_not_wedge_listing() {
        let fx = fixture();
        let coordinator = coordinator_with(&fx, Arc::new(AcceptAllVerifier));

        // A crashed purchase left a pending reservation behind, past its TTL
        let stale_created = Utc::now() - Duration::minutes(INTENT_TTL_MINUTES * 2);
        let stale_expiry = Utc::now() - Duration::minutes(INTENT_TTL_MINUTES);
        fx.db
            .conn()
            .execute(
                "INSERT INTO purchase_intents (
                    intent_hash, idempotency_key, listing_id, buyer_profile_id,
                    state, outcome, created_at, expires_at
                ) VALUES ('stale-hash', 'stale-key', ?1, ?2, 'pending', NULL, ?3, ?4)",
                params![
                    fx.listing_id,
                    fx.buyer_id,
                    stale_created.to_rfc3339(),
                    stale_expiry.to_rfc3339(),
                ],
            )
            .unwrap();

        let record = coordinator
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap();
        assert_eq!(record.price_paid, 10.5);
    }

    #[test]
    fn test_purchase_history_is_newest_first() {
        let fx = fixture();
        let coordinator = coordinator_with(&fx, Arc::new(AcceptAllVerifier));

        coordinator
            .purchase(&fx.listing_id, &fx.buyer_id, &wallet("tx-1"), "key-1")
            .unwrap();

        // Second sale: another collectible from the same seller
        let second_collectible = fx
            .collectibles
            .create(
                &fx.seller_id,
                "Pin",
                "",
                "https://example.com/pin.png",
                MediaKind::Image,
                HashMap::new(),
            )
            .unwrap();
        let second_listing = fx
            .ledger
            .create_listing(&second_collectible.id, &fx.seller_id, 3.0)
            .unwrap();
        std::thread::sleep(StdDuration::from_millis(5));
        coordinator
            .purchase(&second_listing.id, &fx.buyer_id, &wallet("tx-2"), "key-2")
            .unwrap();

        let history = coordinator.purchases_for_buyer(&fx.buyer_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].listing_id, second_listing.id, "newest first");
        assert_eq!(history[1].listing_id, fx.listing_id);
    }
}
