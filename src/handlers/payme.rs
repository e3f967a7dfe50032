//! Payme HTTP handlers.
//!
//! This module implements the provider-facing endpoints:
//! - POST /payme/pay - JSON-RPC callback endpoint (behind merchant auth)
//! - POST /api/v1/payme/checkout - start a checkout session
//!
//! Protocol outcomes on the callback endpoint answer HTTP 200 with the
//! caller's `id` echoed verbatim; only the six taxonomy errors travel in
//! that envelope. Storage failures are not part of the provider contract
//! and surface as plain HTTP errors instead.

use axum::{Json, extract::State};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        payme::{
            CancelTransactionParams, CheckPerformParams, CheckTransactionParams,
            CreateTransactionParams, PerformTransactionParams, RpcRequest, StatementParams,
        },
        transaction::{PROVIDER_PAYME, PaymeTransaction, TransactionState},
    },
    services::payme_service::{PaymeError, PaymeServiceError},
    state::AppState,
};

/// Base URL the encoded checkout payload is appended to.
const CHECKOUT_BASE: &str = "https://checkout.payme.uz/";

/// JSON-RPC callback endpoint.
///
/// # Request Body
///
/// ```json
/// {
///   "method": "CreateTransaction",
///   "params": { "id": "63e9...", "time": 1700000000000, "amount": 150000,
///               "account": { "order_id": "550e8400-..." } },
///   "id": 17
/// }
/// ```
///
/// Protocol responses are HTTP 200 carrying either `{"result": ..., "id": ...}`
/// or `{"error": {"code", "message", "data"}, "id": ...}`.
pub async fn pay(
    State(state): State<AppState>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<Value>, AppError> {
    let id = request.id;

    match request.method.as_str() {
        "CheckPerformTransaction" => {
            let params: CheckPerformParams = match parse_params(request.params, &id) {
                Ok(params) => params,
                Err(response) => return Ok(response),
            };
            let outcome = state
                .payme
                .check_perform_transaction(&params)
                .await
                .map(|()| json!({ "allow": true }));
            rpc_outcome(outcome, &id)
        }
        "CheckTransaction" => {
            let params: CheckTransactionParams = match parse_params(request.params, &id) {
                Ok(params) => params,
                Err(response) => return Ok(response),
            };
            rpc_outcome(state.payme.check_transaction(&params).await, &id)
        }
        "CreateTransaction" => {
            let params: CreateTransactionParams = match parse_params(request.params, &id) {
                Ok(params) => params,
                Err(response) => return Ok(response),
            };
            rpc_outcome(state.payme.create_transaction(&params).await, &id)
        }
        "PerformTransaction" => {
            let params: PerformTransactionParams = match parse_params(request.params, &id) {
                Ok(params) => params,
                Err(response) => return Ok(response),
            };
            rpc_outcome(state.payme.perform_transaction(&params).await, &id)
        }
        "CancelTransaction" => {
            let params: CancelTransactionParams = match parse_params(request.params, &id) {
                Ok(params) => params,
                Err(response) => return Ok(response),
            };
            rpc_outcome(state.payme.cancel_transaction(&params).await, &id)
        }
        "GetStatement" => {
            let params: StatementParams = match parse_params(request.params, &id) {
                Ok(params) => params,
                Err(response) => return Ok(response),
            };
            let outcome = state
                .payme
                .get_statement(&params)
                .await
                .map(|entries| json!({ "transactions": entries }));
            rpc_outcome(outcome, &id)
        }
        other => {
            tracing::warn!(method = other, "unknown payme method");
            Ok(rpc_error(PaymeError::CantDoOperation, &id))
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Value,
    id: &Value,
) -> Result<T, Json<Value>> {
    serde_json::from_value(params).map_err(|err| {
        tracing::warn!("malformed payme params: {err}");
        rpc_error(PaymeError::CantDoOperation, id)
    })
}

fn rpc_result<T: Serialize>(result: T, id: &Value) -> Json<Value> {
    Json(json!({ "result": result, "id": id }))
}

fn rpc_error(err: PaymeError, id: &Value) -> Json<Value> {
    Json(json!({
        "error": {
            "code": err.code(),
            "message": err.message(),
            "data": Value::Null,
        },
        "id": id,
    }))
}

/// Protocol rejections stay inside the RPC envelope; anything else is not
/// part of the provider taxonomy and propagates as an HTTP-level error.
fn rpc_outcome<T: Serialize>(
    outcome: Result<T, PaymeServiceError>,
    id: &Value,
) -> Result<Json<Value>, AppError> {
    match outcome {
        Ok(result) => Ok(rpc_result(result, id)),
        Err(PaymeServiceError::Protocol(kind)) => Ok(rpc_error(kind, id)),
        Err(PaymeServiceError::Database(err)) => Err(AppError::Database(err)),
    }
}

/// Checkout session request from the storefront.
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    /// Order total in major units.
    pub amount: f64,

    /// Where the provider redirects the customer after payment.
    pub redirect_url: String,

    #[serde(default)]
    pub user_id: Option<Uuid>,

    /// Order contents, stored verbatim for the post-payment Billz dispatch.
    /// Also carries the optional `service_mode` flag controlling the
    /// redirect shape.
    #[serde(default)]
    pub order_details: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
    pub order_id: Uuid,
}

/// Start a checkout session.
///
/// Creates a state-`0` transaction row, drops the user's previous pending
/// sessions, and returns the provider checkout URL with the base64 payload
/// `m=<merchant>;ac.order_id=<row id>;a=<minor units>;c=<redirect>`.
pub async fn checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, AppError> {
    if request.amount <= 0.0 {
        return Err(AppError::InvalidRequest("amount must be positive".into()));
    }
    if request.redirect_url.trim().is_empty() {
        return Err(AppError::InvalidRequest("redirect_url is required".into()));
    }

    // One active checkout per user: stale pending sessions are dropped so
    // the provider cannot bind a transaction to an abandoned row.
    if let Some(user_id) = request.user_id {
        sqlx::query(
            "DELETE FROM payme_transactions WHERE user_id = $1 AND status = $2 AND provider = $3",
        )
        .bind(user_id)
        .bind(TransactionState::Pending.code())
        .bind(PROVIDER_PAYME)
        .execute(&state.pool)
        .await?;
    }

    let order_id = request
        .order_details
        .as_ref()
        .and_then(extract_internal_order_id)
        .unwrap_or_default();

    let txn = sqlx::query_as::<_, PaymeTransaction>(
        r#"
        INSERT INTO payme_transactions (user_id, order_details, status, amount, order_id, provider)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(request.user_id)
    .bind(&request.order_details)
    .bind(TransactionState::Created.code())
    .bind(request.amount.floor() as i64)
    .bind(&order_id)
    .bind(PROVIDER_PAYME)
    .fetch_one(&state.pool)
    .await?;

    let redirect = checkout_redirect(
        &request.redirect_url,
        request.order_details.as_ref(),
        txn.id,
    );

    let payload = checkout_payload(
        &state.config.payme_merchant_id,
        &txn.id.to_string(),
        request.amount,
        &redirect,
    );
    let url = format!("{CHECKOUT_BASE}{}", BASE64.encode(payload));

    tracing::info!(txn_id = %txn.id, amount = request.amount, "payme checkout session created");

    Ok(Json(CheckoutResponse {
        url,
        order_id: txn.id,
    }))
}

/// Pull the storefront's own order reference out of the details payload.
fn extract_internal_order_id(details: &Value) -> Option<String> {
    let object = details.as_object()?;
    for key in ["internalOrderId", "internal_order_id", "order_id", "orderId"] {
        if let Some(value) = object.get(key) {
            match value {
                Value::String(s) if !s.is_empty() => return Some(s.clone()),
                Value::Number(n) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}

/// Resolve the post-payment redirect.
///
/// When the details payload carries a numeric `service_mode` other than 1,
/// the customer lands on a per-transaction status page, so the row id is
/// appended. An absent key, mode 1, or a non-numeric value leaves the
/// redirect as given.
fn checkout_redirect(base: &str, details: Option<&Value>, txn_id: Uuid) -> String {
    let base = base.trim_end_matches('/');

    let mode = details
        .and_then(|details| details.get("service_mode"))
        .and_then(Value::as_f64)
        .map(|mode| mode as i64);

    match mode {
        Some(mode) if mode != 1 => format!("{base}/{txn_id}"),
        _ => base.to_string(),
    }
}

/// Semicolon-separated parameter string the provider expects, pre-base64.
/// The amount is converted to minor units here.
fn checkout_payload(merchant_id: &str, account_ref: &str, amount: f64, redirect: &str) -> String {
    format!(
        "m={merchant_id};ac.order_id={account_ref};a={};c={redirect}",
        (amount * 100.0).round() as i64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_converts_amount_to_minor_units() {
        let payload = checkout_payload("merch", "row-1", 1500.0, "https://shop.example/done");
        assert_eq!(
            payload,
            "m=merch;ac.order_id=row-1;a=150000;c=https://shop.example/done"
        );
    }

    #[test]
    fn payload_rounds_fractional_amounts() {
        let payload = checkout_payload("m1", "r1", 10.005, "https://x");
        assert!(payload.contains(";a=1001;"));
    }

    #[test]
    fn internal_order_id_is_read_from_known_keys() {
        let details = json!({ "internalOrderId": "ORD-17" });
        assert_eq!(
            extract_internal_order_id(&details),
            Some("ORD-17".to_string())
        );

        let details = json!({ "order_id": 42 });
        assert_eq!(extract_internal_order_id(&details), Some("42".to_string()));
    }

    #[test]
    fn missing_or_empty_order_id_yields_none() {
        assert_eq!(extract_internal_order_id(&json!({})), None);
        assert_eq!(extract_internal_order_id(&json!({ "order_id": "" })), None);
        assert_eq!(extract_internal_order_id(&json!("just a string")), None);
    }

    #[test]
    fn redirect_is_untouched_without_a_service_mode() {
        let id = Uuid::nil();
        assert_eq!(
            checkout_redirect("https://shop.example/done/", None, id),
            "https://shop.example/done"
        );
        assert_eq!(
            checkout_redirect("https://shop.example/done", Some(&json!({})), id),
            "https://shop.example/done"
        );
    }

    #[test]
    fn service_mode_other_than_one_appends_the_transaction_id() {
        let id = Uuid::nil();
        assert_eq!(
            checkout_redirect("https://shop.example/done", Some(&json!({ "service_mode": 2 })), id),
            format!("https://shop.example/done/{id}")
        );
        assert_eq!(
            checkout_redirect("https://shop.example/done", Some(&json!({ "service_mode": 0 })), id),
            format!("https://shop.example/done/{id}")
        );
    }

    #[test]
    fn hosted_mode_and_non_numeric_modes_keep_the_redirect() {
        let id = Uuid::nil();
        assert_eq!(
            checkout_redirect("https://shop.example/done", Some(&json!({ "service_mode": 1 })), id),
            "https://shop.example/done"
        );
        assert_eq!(
            checkout_redirect("https://shop.example/done", Some(&json!({ "service_mode": "2" })), id),
            "https://shop.example/done"
        );
    }

    #[test]
    fn rpc_error_echoes_the_correlation_id() {
        let Json(body) = rpc_error(PaymeError::TransactionNotFound, &json!(17));
        assert_eq!(body["id"], json!(17));
        assert_eq!(body["error"]["code"], json!(-31050));
        assert_eq!(body["error"]["message"]["en"], json!("Transaction not found"));
    }

    #[test]
    fn rpc_result_echoes_the_correlation_id() {
        let Json(body) = rpc_result(json!({ "allow": true }), &json!("abc"));
        assert_eq!(body["id"], json!("abc"));
        assert_eq!(body["result"]["allow"], json!(true));
    }

    #[test]
    fn protocol_rejections_stay_in_the_rpc_envelope() {
        let outcome: Result<Value, PaymeServiceError> =
            Err(PaymeServiceError::Protocol(PaymeError::AlreadyDone));
        let Json(body) = rpc_outcome(outcome, &json!(5)).unwrap();
        assert_eq!(body["error"]["code"], json!(-31060));
        assert_eq!(body["id"], json!(5));
    }

    #[test]
    fn storage_failures_bypass_the_protocol_taxonomy() {
        let outcome: Result<Value, PaymeServiceError> =
            Err(PaymeServiceError::Database(sqlx::Error::PoolTimedOut));
        let err = rpc_outcome(outcome, &json!(5)).unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
    }
}
