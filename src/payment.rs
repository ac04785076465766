// 💸 Payment Verification - external collaborator seam
//
// The marketplace never settles funds itself; it asks a verifier whether
// the on-chain transfer referenced by the buyer's wallet actually occurred
// and settled for at least the listing price. Implementations must be
// idempotent per tx_reference: confirming the same reference twice reports
// the same settlement.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// The buyer's wallet context for one purchase: where the funds came from
/// and which on-chain transaction carries them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRef {
    pub address: String,
    pub tx_reference: String,
}

/// Outcome of an on-chain confirmation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub confirmed: bool,
    pub settled_amount: f64,
    /// Verifier-side detail when confirmed is false (not found, reverted,
    /// amount mismatch, ...).
    pub error: Option<String>,
}

impl PaymentConfirmation {
    pub fn settled(amount: f64) -> Self {
        PaymentConfirmation {
            confirmed: true,
            settled_amount: amount,
            error: None,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        PaymentConfirmation {
            confirmed: false,
            settled_amount: 0.0,
            error: Some(reason.to_string()),
        }
    }
}

/// External payment confirmation.
///
/// `Err` means the verifier itself could not answer (network failure,
/// timeout); a clean negative answer comes back as `confirmed: false`.
/// Both map to PaymentVerification at the coordinator, and neither has
/// taken payment against the listing, so the caller may retry with the
/// same idempotency key.
pub trait PaymentVerifier: Send + Sync {
    fn confirm(
        &self,
        wallet_address: &str,
        expected_amount: f64,
        tx_reference: &str,
    ) -> Result<PaymentConfirmation>;
}

/// Confirms every transfer at exactly the expected amount.
///
/// Wired into the demo CLI and the dev server; a deployment implements
/// `PaymentVerifier` against a chain indexer instead.
pub struct AcceptAllVerifier;

impl PaymentVerifier for AcceptAllVerifier {
    fn confirm(
        &self,
        _wallet_address: &str,
        expected_amount: f64,
        _tx_reference: &str,
    ) -> Result<PaymentConfirmation> {
        Ok(PaymentConfirmation::settled(expected_amount))
    }
}
