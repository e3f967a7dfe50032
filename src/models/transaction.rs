//! Payme transaction entity and lifecycle state.
//!
//! This module defines:
//! - `PaymeTransaction`: database entity representing the provider's view of
//!   one payment transaction, bound to one internal order reference
//! - `TransactionState`: the signed state codes fixed by the Payme protocol

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Provider discriminator stored on every row this engine manages.
pub const PROVIDER_PAYME: &str = "payme";

/// Cancellation reason recorded when the pending window expires.
pub const REASON_PENDING_EXPIRED: i32 = 4;

/// Transaction lifecycle states.
///
/// The numeric values are part of the Payme wire contract and must never be
/// renumbered: `0` checkout-only, `1` pending, `2` paid, `-1`
/// pending-canceled, `-2` paid-canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum TransactionState {
    Created = 0,
    Pending = 1,
    Paid = 2,
    PendingCanceled = -1,
    PaidCanceled = -2,
}

impl TransactionState {
    /// Wire-level numeric code for this state.
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Created),
            1 => Some(Self::Pending),
            2 => Some(Self::Paid),
            -1 => Some(Self::PendingCanceled),
            -2 => Some(Self::PaidCanceled),
            _ => None,
        }
    }
}

/// Cancellation of a state `s` always yields `-|s|`: pending becomes
/// pending-canceled, paid becomes paid-canceled, already-negative states are
/// unchanged in magnitude.
pub fn canceled_code(code: i16) -> i16 {
    -code.abs()
}

/// Represents a Payme transaction record from the database.
///
/// # Database Table
///
/// Maps to the `payme_transactions` table. Each row:
/// - Is created in state `0` when a checkout session starts
/// - Receives its provider-assigned `transaction_id` at most once
/// - Moves only along `0 -> 1 -> 2`, `1 -> -1`, `2 -> -2`
/// - Once `billz_order_id` is non-empty, has been dispatched to Billz and
///   must never be dispatched again
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct PaymeTransaction {
    /// Internal row id; doubles as the account reference in checkout URLs
    pub id: Uuid,

    /// Provider-assigned external reference; empty until CreateTransaction
    pub transaction_id: String,

    /// Customer the checkout belongs to, when known
    pub user_id: Option<Uuid>,

    /// Serialized order contents needed for downstream dispatch.
    ///
    /// Web clients send `JSON.stringify(payload)`, so this column may hold a
    /// JSON string whose contents are themselves JSON (handled at dispatch
    /// time).
    pub order_details: Option<serde_json::Value>,

    /// Signed state code, see [`TransactionState`]
    pub status: i16,

    /// Amount in major units (the provider reports minor units; they are
    /// divided by 100 at validation time)
    pub amount: i64,

    /// Internal order/checkout reference
    pub order_id: String,

    /// Epoch milliseconds, stamped by the provider's CreateTransaction call
    pub create_time: i64,

    /// Epoch milliseconds, stamped when the transaction is confirmed paid
    pub perform_time: i64,

    /// Epoch milliseconds, stamped on cancellation
    pub cancel_time: i64,

    /// Cancellation reason code; only surfaced on the wire when non-zero
    pub reason: Option<i32>,

    /// Always `payme` for rows this engine manages
    pub provider: String,

    /// Billz order id recorded by a successful dispatch (idempotency mark)
    pub billz_order_id: String,

    pub billz_order_number: String,

    pub billz_order_type: String,

    /// When the Billz dispatch succeeded
    pub billz_synced_at: Option<DateTime<Utc>>,

    /// Last dispatch failure, truncated; cleared on success
    pub billz_sync_error: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_match_wire_contract() {
        assert_eq!(TransactionState::Created.code(), 0);
        assert_eq!(TransactionState::Pending.code(), 1);
        assert_eq!(TransactionState::Paid.code(), 2);
        assert_eq!(TransactionState::PendingCanceled.code(), -1);
        assert_eq!(TransactionState::PaidCanceled.code(), -2);
    }

    #[test]
    fn from_code_round_trips_known_states() {
        for code in [-2, -1, 0, 1, 2] {
            let state = TransactionState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert!(TransactionState::from_code(3).is_none());
    }

    #[test]
    fn cancellation_flips_positive_states() {
        assert_eq!(canceled_code(TransactionState::Pending.code()), -1);
        assert_eq!(canceled_code(TransactionState::Paid.code()), -2);
    }

    #[test]
    fn cancellation_is_idempotent_on_negative_states() {
        assert_eq!(canceled_code(-1), -1);
        assert_eq!(canceled_code(-2), -2);
        assert_eq!(canceled_code(0), 0);
    }
}
