//! Wire-level types for the Payme JSON-RPC callback protocol.
//!
//! One POST endpoint receives `{ "method": ..., "params": ..., "id": ... }`
//! envelopes; the `id` is an opaque correlation value that must be echoed in
//! every response and error.

use serde::{Deserialize, Serialize};

/// JSON-RPC style request envelope.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,

    #[serde(default)]
    pub params: serde_json::Value,

    /// Caller-supplied correlation id, echoed verbatim in responses/errors.
    #[serde(default)]
    pub id: serde_json::Value,
}

/// Account reference correlating a transaction to an order/checkout session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymeAccount {
    pub order_id: String,
}

/// The provider sends transaction ids either as strings or as bare numbers.
///
/// The union is resolved to its decimal string form exactly once, at the top
/// of the operation; anything that is neither a string nor a number
/// normalizes to `None` and surfaces as `TransactionNotFound`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TransactionRef {
    Text(String),
    Number(f64),
    Other(serde_json::Value),
}

impl TransactionRef {
    pub fn normalize(&self) -> Option<String> {
        match self {
            TransactionRef::Text(id) => Some(id.clone()),
            TransactionRef::Number(n) => Some(format!("{}", *n as i64)),
            TransactionRef::Other(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckPerformParams {
    /// Amount in provider minor units (divided by 100 for validation).
    pub amount: i64,
    pub account: PaymeAccount,
}

#[derive(Debug, Deserialize)]
pub struct CheckTransactionParams {
    pub id: TransactionRef,
}

#[derive(Debug, Deserialize)]
pub struct CreateTransactionParams {
    pub account: PaymeAccount,
    /// Provider-side creation timestamp, epoch milliseconds.
    pub time: i64,
    pub amount: i64,
    /// Provider-assigned external transaction id.
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct PerformTransactionParams {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelTransactionParams {
    pub id: String,
    #[serde(default)]
    pub reason: i32,
}

#[derive(Debug, Deserialize)]
pub struct StatementParams {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Serialize)]
pub struct CheckTransactionResult {
    pub create_time: i64,
    pub perform_time: i64,
    pub cancel_time: i64,
    pub transaction: String,
    pub state: i16,
    pub reason: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct CreateTransactionResult {
    pub create_time: i64,
    pub transaction: String,
    pub state: i16,
}

#[derive(Debug, Serialize)]
pub struct PerformTransactionResult {
    pub perform_time: i64,
    pub transaction: String,
    pub state: i16,
}

#[derive(Debug, Serialize)]
pub struct CancelTransactionResult {
    pub cancel_time: i64,
    pub transaction: String,
    pub state: i16,
}

/// One transaction projected into the GetStatement wire shape.
#[derive(Debug, Serialize)]
pub struct StatementEntry {
    pub transaction_id: String,
    pub time: i64,
    pub amount: i64,
    pub account: PaymeAccount,
    pub create_time: i64,
    pub perform_time: i64,
    pub cancel_time: i64,
    pub transaction: String,
    pub state: i16,
    pub reason: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ref(raw: &str) -> TransactionRef {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn string_ids_pass_through() {
        assert_eq!(
            parse_ref(r#""63e9a0b1c2d3e4f5a6b7c8d9""#).normalize(),
            Some("63e9a0b1c2d3e4f5a6b7c8d9".to_string())
        );
    }

    #[test]
    fn numeric_ids_coerce_to_decimal_strings() {
        assert_eq!(parse_ref("42").normalize(), Some("42".to_string()));
        assert_eq!(parse_ref("42.9").normalize(), Some("42".to_string()));
    }

    #[test]
    fn other_json_types_do_not_normalize() {
        assert_eq!(parse_ref("null").normalize(), None);
        assert_eq!(parse_ref(r#"{"id": 1}"#).normalize(), None);
        assert_eq!(parse_ref("[1, 2]").normalize(), None);
        assert_eq!(parse_ref("true").normalize(), None);
    }

    #[test]
    fn cancel_params_default_reason_to_zero() {
        let params: CancelTransactionParams =
            serde_json::from_str(r#"{"id": "T1"}"#).unwrap();
        assert_eq!(params.reason, 0);
    }
}
