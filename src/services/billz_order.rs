//! Billz dispatch orchestration.
//!
//! Converts a paid Payme transaction into exactly one Billz order. The
//! locked path runs under `SELECT ... FOR UPDATE` inside one database
//! transaction so concurrent confirmation callbacks cannot double-create
//! the order; the row lock is intentionally held across the Billz calls,
//! since dispatch is infrequent and per-transaction and the lock is what
//! carries the idempotency guarantee.
//!
//! A structurally identical direct path serves cash orders created outside
//! the provider callback flow; it runs synchronously during order creation
//! and needs no lock wrapper.

use reqwest::Method;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    db::DbPool,
    models::transaction::{PROVIDER_PAYME, PaymeTransaction},
    services::billz_client::{BillzClient, BillzError, BillzRequest},
};

/// Marker appended to order comments so downstream systems can recognize
/// provider-originated orders.
const PAYME_PAYMENT_COMMENT: &str = "Payment completed via Payme";

/// Billz response-channel discriminator, sent as both header and query.
const RESPONSE_CHANNEL: &str = "HTTP";

/// Upper bound for the sync-error text persisted on the transaction row.
const MAX_SYNC_ERROR_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid JSON payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("order details missing items")]
    MissingItems,

    #[error("no valid products in order details")]
    NoValidItems,

    #[error("customer id missing")]
    MissingCustomer,

    #[error("payment amount missing")]
    MissingAmount,

    #[error("invalid payment amount")]
    InvalidPaymentAmount,

    #[error(transparent)]
    Billz(#[from] BillzError),
}

/// Essential identifiers of an order created in Billz.
#[derive(Debug, Clone)]
pub struct BillzOrderResult {
    pub order_id: String,
    pub order_number: String,
    pub order_type: String,
}

/// Dispatch the Billz order for a paid transaction, exactly once.
///
/// # Process
///
/// 1. Re-read the row under a `FOR UPDATE` lock
/// 2. Short-circuit with the recorded result if already dispatched
/// 3. Build the order from the stored payload and the Billz API
/// 4. Persist the result (or the truncated failure) in the same database
///    transaction
///
/// The provider is permitted to retry its confirmation call, possibly
/// concurrently: the row lock serializes those retries and the recorded
/// `billz_order_id` makes every later call a cheap read.
///
/// Returns `Ok(None)` when the row carries no order payload (nothing to
/// dispatch). On failure the external order id stays empty, so the next
/// perform call is still eligible to retry the dispatch.
pub async fn dispatch_paid_transaction(
    pool: &DbPool,
    billz: &BillzClient,
    txn_id: Uuid,
) -> Result<Option<BillzOrderResult>, DispatchError> {
    let mut tx = pool.begin().await?;

    let txn = sqlx::query_as::<_, PaymeTransaction>(
        "SELECT * FROM payme_transactions WHERE id = $1 AND provider = $2 FOR UPDATE",
    )
    .bind(txn_id)
    .bind(PROVIDER_PAYME)
    .fetch_one(&mut *tx)
    .await?;

    if !txn.billz_order_id.is_empty() {
        // Already dispatched; return the recorded result without touching
        // Billz again.
        return Ok(Some(BillzOrderResult {
            order_id: txn.billz_order_id,
            order_number: txn.billz_order_number,
            order_type: txn.billz_order_type,
        }));
    }

    match create_order_from_transaction(billz, &txn).await {
        Ok(None) => {
            tx.commit().await?;
            Ok(None)
        }
        Ok(Some(result)) => {
            sqlx::query(
                r#"
                UPDATE payme_transactions
                SET billz_order_id = $1,
                    billz_order_number = $2,
                    billz_order_type = $3,
                    billz_synced_at = NOW(),
                    billz_sync_error = '',
                    updated_at = NOW()
                WHERE id = $4
                "#,
            )
            .bind(&result.order_id)
            .bind(&result.order_number)
            .bind(&result.order_type)
            .bind(txn_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(Some(result))
        }
        Err(err) => {
            // Record the failure for later remediation; the order id stays
            // empty so the row remains eligible for a retry.
            sqlx::query(
                "UPDATE payme_transactions SET billz_sync_error = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(truncate_sync_error(&err))
            .bind(txn_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Err(err)
        }
    }
}

/// Build a Billz order from the payload saved with the transaction.
async fn create_order_from_transaction(
    billz: &BillzClient,
    txn: &PaymeTransaction,
) -> Result<Option<BillzOrderResult>, DispatchError> {
    let Some(raw) = &txn.order_details else {
        tracing::warn!(txn_id = %txn.id, "transaction has no order details, nothing to dispatch");
        return Ok(None);
    };

    let details = parse_order_details(raw)?;

    if details.items.is_empty() {
        return Err(DispatchError::MissingItems);
    }

    let valid_items: Vec<&OrderItem> = details
        .items
        .iter()
        .filter_map(|item| item.as_ref())
        .collect();
    if valid_items.is_empty() {
        return Err(DispatchError::NoValidItems);
    }

    let customer_id = details
        .customer_id
        .clone()
        .or_else(|| txn.user_id.map(|id| id.to_string()))
        .ok_or(DispatchError::MissingCustomer)?;

    let draft = create_draft_order(billz).await?;

    for item in &valid_items {
        add_order_product(billz, &draft.id, &item.product_id, item.quantity).await?;
    }

    attach_order_customer(billz, &draft.id, &customer_id).await?;

    let payment_amount = details
        .total_amount
        .filter(|amount| *amount > 0.0)
        .unwrap_or(txn.amount as f64);
    if payment_amount <= 0.0 {
        return Err(DispatchError::MissingAmount);
    }

    let comment = payment_comment(details.comment.as_deref().unwrap_or(""));
    register_order_payment(
        billz,
        &draft.id,
        payment_amount,
        details.payment_method.as_deref().unwrap_or(""),
        &comment,
    )
    .await?;

    tracing::info!(
        txn_id = %txn.id,
        order_id = %draft.id,
        order_number = %draft.data.order_number,
        "billz order completed"
    );

    Ok(Some(BillzOrderResult {
        order_id: draft.id,
        order_number: draft.data.order_number,
        order_type: draft.data.order_type,
    }))
}

/// A single item for direct order creation.
#[derive(Debug, Clone)]
pub struct DirectOrderItem {
    pub product_id: String,
    pub quantity: f64,
}

/// Inputs for creating a Billz order outside the provider callback flow.
#[derive(Debug, Clone)]
pub struct DirectOrder {
    pub items: Vec<DirectOrderItem>,
    pub customer_id: String,
    pub payment_method: String,
    pub total_amount: f64,
    pub comment: String,
}

/// Create a Billz order directly from a locally-built payload (cash orders).
///
/// Same draft/items/customer/payment sequence as the locked path, but driven
/// from in-process data: no double-encoding unwrap and no idempotency lock,
/// since each such order is created exactly once, synchronously, during
/// order creation. A missing customer id skips attachment instead of
/// failing; attachment failures are logged and tolerated.
pub async fn create_order_direct(
    billz: &BillzClient,
    payload: DirectOrder,
) -> Result<BillzOrderResult, DispatchError> {
    if payload.items.is_empty() {
        return Err(DispatchError::MissingItems);
    }

    let draft = create_draft_order(billz).await?;

    let mut added_product = false;
    for item in &payload.items {
        let product_id = item.product_id.trim();
        if product_id.is_empty() {
            continue;
        }
        let quantity = if item.quantity > 0.0 { item.quantity } else { 1.0 };
        add_order_product(billz, &draft.id, product_id, quantity).await?;
        added_product = true;
    }
    if !added_product {
        return Err(DispatchError::NoValidItems);
    }

    if !payload.customer_id.is_empty() {
        if let Err(err) = attach_order_customer(billz, &draft.id, &payload.customer_id).await {
            tracing::warn!(
                order_id = %draft.id,
                customer_id = %payload.customer_id,
                "failed to attach customer to billz order: {err}"
            );
        }
    }

    if payload.total_amount <= 0.0 {
        return Err(DispatchError::InvalidPaymentAmount);
    }
    register_order_payment(
        billz,
        &draft.id,
        payload.total_amount,
        &payload.payment_method,
        payload.comment.trim(),
    )
    .await?;

    Ok(BillzOrderResult {
        order_id: draft.id,
        order_number: draft.data.order_number,
        order_type: draft.data.order_type,
    })
}

// ---------------------------------------------------------------------------
// Order payload parsing

/// Order payload after one-time normalization of the duck-typed fields.
///
/// `items` keeps one slot per raw item so "no items at all" and "items, but
/// none valid" stay distinguishable.
#[derive(Debug)]
struct OrderPayload {
    items: Vec<Option<OrderItem>>,
    customer_id: Option<String>,
    payment_method: Option<String>,
    comment: Option<String>,
    total_amount: Option<f64>,
}

#[derive(Debug, PartialEq)]
struct OrderItem {
    product_id: String,
    quantity: f64,
}

#[derive(Debug, Default, Deserialize)]
struct RawOrderDetails {
    #[serde(default)]
    items: Vec<RawOrderItem>,
    #[serde(default)]
    checkout: RawCheckout,
    #[serde(default)]
    totals: RawTotals,
    #[serde(default)]
    user: RawUser,
}

/// Item identifiers arrive under either of two equivalent spellings, and the
/// quantity under `quantity` or `qty`.
#[derive(Debug, Default, Deserialize)]
struct RawOrderItem {
    #[serde(default, rename = "productId")]
    product_id_camel: Option<String>,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    quantity: f64,
    #[serde(default)]
    qty: f64,
}

impl RawOrderItem {
    /// Resolve the field-spelling union; `None` means the item is skipped.
    fn resolve(&self) -> Option<OrderItem> {
        let product_id = [&self.product_id_camel, &self.product_id]
            .into_iter()
            .flatten()
            .map(|id| id.trim())
            .find(|id| !id.is_empty())?
            .to_string();

        let quantity = if self.quantity > 0.0 {
            self.quantity
        } else {
            self.qty
        };
        (quantity > 0.0).then_some(OrderItem {
            product_id,
            quantity,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawCheckout {
    #[serde(default, rename = "paymentMethod")]
    payment_method_camel: Option<String>,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTotals {
    #[serde(default)]
    amount: f64,
    #[serde(default)]
    total: f64,
    #[serde(default)]
    total_amount: f64,
}

impl RawTotals {
    fn resolve(&self) -> Option<f64> {
        [self.amount, self.total, self.total_amount]
            .into_iter()
            .find(|amount| *amount > 0.0)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawUser {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

fn first_non_empty(candidates: [&Option<String>; 2]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Parse the stored order payload, unwrapping one level of double-encoding.
///
/// Web checkouts send `JSON.stringify(payload)`, so the column may hold a
/// JSON string whose contents are themselves JSON text. All duck-typed
/// fields are resolved here, once; nothing downstream re-inspects them.
fn parse_order_details(raw: &serde_json::Value) -> Result<OrderPayload, serde_json::Error> {
    let details: RawOrderDetails = match raw {
        serde_json::Value::String(inner) => serde_json::from_str(inner)?,
        other => serde_json::from_value(other.clone())?,
    };

    Ok(OrderPayload {
        items: details.items.iter().map(RawOrderItem::resolve).collect(),
        customer_id: first_non_empty([&details.user.id, &details.user.user_id]),
        payment_method: first_non_empty([
            &details.checkout.payment_method_camel,
            &details.checkout.payment_method,
        ]),
        comment: first_non_empty([&details.checkout.comment, &details.checkout.notes]),
        total_amount: details.totals.resolve(),
    })
}

// ---------------------------------------------------------------------------
// Billz API calls

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    data: CreateOrderData,
}

#[derive(Debug, Default, Deserialize)]
struct CreateOrderData {
    #[serde(default)]
    order_number: String,
    #[serde(default)]
    order_type: String,
}

fn channel_request(method: Method, path: String, body: serde_json::Value) -> BillzRequest {
    let mut request = BillzRequest::new(method, path);
    request.query = vec![("Billz-Response-Channel".to_string(), RESPONSE_CHANNEL.to_string())];
    request.headers = vec![("Billz-Response-Channel".to_string(), RESPONSE_CHANNEL.to_string())];
    request.body = Some(body);
    request
}

async fn create_draft_order(billz: &BillzClient) -> Result<CreateOrderResponse, DispatchError> {
    let config = billz.config();
    let response = billz
        .request(channel_request(
            Method::POST,
            "v2/order".to_string(),
            serde_json::json!({
                "shop_id": config.shop_id,
                "cashbox_id": config.cashbox_id,
            }),
        ))
        .await?
        .ensure_success("create billz order")?;

    let draft: CreateOrderResponse = serde_json::from_str(&response.body)?;
    if draft.id.is_empty() {
        return Err(BillzError::UnexpectedStatus {
            action: "create billz order",
            status: response.status,
            body: response.body,
        }
        .into());
    }
    Ok(draft)
}

async fn add_order_product(
    billz: &BillzClient,
    order_id: &str,
    product_id: &str,
    quantity: f64,
) -> Result<(), DispatchError> {
    billz
        .request(channel_request(
            Method::POST,
            format!("v2/order-product/{order_id}"),
            serde_json::json!({
                "sold_measurement_value": quantity,
                "product_id": product_id,
                "used_wholesale_price": false,
                "is_manual": false,
                "response_type": RESPONSE_CHANNEL,
            }),
        ))
        .await?
        .ensure_success("add product to billz order")?;
    Ok(())
}

async fn attach_order_customer(
    billz: &BillzClient,
    order_id: &str,
    customer_id: &str,
) -> Result<(), DispatchError> {
    billz
        .request(channel_request(
            Method::PUT,
            format!("v2/order-customer-new/{order_id}"),
            serde_json::json!({
                "customer_id": customer_id,
                "check_auth_code": false,
            }),
        ))
        .await?
        .ensure_success("attach customer to billz order")?;
    Ok(())
}

async fn register_order_payment(
    billz: &BillzClient,
    order_id: &str,
    amount: f64,
    payment_method: &str,
    comment: &str,
) -> Result<(), DispatchError> {
    let paid_amount = amount.round() as i64;
    if paid_amount <= 0 {
        return Err(DispatchError::InvalidPaymentAmount);
    }

    let config = billz.config();
    billz
        .request(channel_request(
            Method::POST,
            format!("v2/order-payment/{order_id}"),
            serde_json::json!({
                "payments": [{
                    "company_payment_type_id": config.payment_type_id,
                    "paid_amount": paid_amount,
                    "company_payment_type": { "name": payment_type_name(payment_method) },
                    "returned_amount": 0,
                }],
                "comment": comment,
                "with_cashback": 0,
                "without_cashback": false,
                "skip_ofd": false,
            }),
        ))
        .await?
        .ensure_success("register billz order payment")?;
    Ok(())
}

/// Billz payment-type label: known cash synonyms map to the cash label,
/// everything else is the generic non-cash one.
pub fn payment_type_name(method: &str) -> &'static str {
    match method.trim().to_lowercase().as_str() {
        "cash" | "nalichniy" | "наличные" => "Наличные",
        _ => "Безналичный расчет",
    }
}

/// Suffix the order comment with the Payme marker, exactly once.
fn payment_comment(existing: &str) -> String {
    let trimmed = existing.trim();
    if trimmed.is_empty() {
        PAYME_PAYMENT_COMMENT.to_string()
    } else if trimmed.contains(PAYME_PAYMENT_COMMENT) {
        trimmed.to_string()
    } else {
        format!("{trimmed} | {PAYME_PAYMENT_COMMENT}")
    }
}

fn truncate_sync_error(err: &DispatchError) -> String {
    let mut message = err.to_string();
    if message.len() > MAX_SYNC_ERROR_LEN {
        // Cut on a char boundary at or below the limit.
        let mut cut = MAX_SYNC_ERROR_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::billz_client::BillzConfig;

    const PAYLOAD: &str = r#"{
        "items": [
            {"productId": "prod-1", "quantity": 2},
            {"product_id": "prod-2", "qty": 1.5},
            {"product_id": "", "quantity": 3},
            {"productId": "prod-3", "quantity": 0}
        ],
        "checkout": {"paymentMethod": "payme", "comment": "leave at door"},
        "totals": {"total": 150000},
        "user": {"user_id": "user-9"}
    }"#;

    #[test]
    fn plain_and_double_encoded_payloads_parse_identically() {
        let plain: serde_json::Value = serde_json::from_str(PAYLOAD).unwrap();
        let double_encoded = serde_json::Value::String(PAYLOAD.to_string());

        let a = parse_order_details(&plain).unwrap();
        let b = parse_order_details(&double_encoded).unwrap();

        assert_eq!(a.items, b.items);
        assert_eq!(a.customer_id, b.customer_id);
        assert_eq!(a.total_amount, b.total_amount);
    }

    #[test]
    fn items_resolve_either_spelling_and_skip_invalid_ones() {
        let raw: serde_json::Value = serde_json::from_str(PAYLOAD).unwrap();
        let payload = parse_order_details(&raw).unwrap();

        assert_eq!(payload.items.len(), 4);
        assert_eq!(
            payload.items[0],
            Some(OrderItem { product_id: "prod-1".to_string(), quantity: 2.0 })
        );
        assert_eq!(
            payload.items[1],
            Some(OrderItem { product_id: "prod-2".to_string(), quantity: 1.5 })
        );
        // Empty product id and zero quantity are skipped, not fatal.
        assert_eq!(payload.items[2], None);
        assert_eq!(payload.items[3], None);
    }

    #[test]
    fn customer_and_payment_fields_resolve_once() {
        let raw: serde_json::Value = serde_json::from_str(PAYLOAD).unwrap();
        let payload = parse_order_details(&raw).unwrap();

        assert_eq!(payload.customer_id.as_deref(), Some("user-9"));
        assert_eq!(payload.payment_method.as_deref(), Some("payme"));
        assert_eq!(payload.comment.as_deref(), Some("leave at door"));
        assert_eq!(payload.total_amount, Some(150000.0));
    }

    #[test]
    fn totals_fall_back_across_field_names() {
        let raw: serde_json::Value =
            serde_json::from_str(r#"{"totals": {"total_amount": 900}}"#).unwrap();
        assert_eq!(parse_order_details(&raw).unwrap().total_amount, Some(900.0));

        let raw: serde_json::Value = serde_json::from_str(r#"{"totals": {}}"#).unwrap();
        assert_eq!(parse_order_details(&raw).unwrap().total_amount, None);
    }

    #[test]
    fn garbled_double_encoding_is_an_error() {
        let bad = serde_json::Value::String("{not json".to_string());
        assert!(parse_order_details(&bad).is_err());
    }

    #[test]
    fn cash_synonyms_map_to_the_cash_label() {
        assert_eq!(payment_type_name("cash"), "Наличные");
        assert_eq!(payment_type_name("  CASH "), "Наличные");
        assert_eq!(payment_type_name("nalichniy"), "Наличные");
        assert_eq!(payment_type_name("наличные"), "Наличные");
        assert_eq!(payment_type_name("payme"), "Безналичный расчет");
        assert_eq!(payment_type_name(""), "Безналичный расчет");
    }

    #[test]
    fn payment_comment_is_appended_exactly_once() {
        assert_eq!(payment_comment(""), PAYME_PAYMENT_COMMENT);
        assert_eq!(
            payment_comment("gift wrap"),
            format!("gift wrap | {PAYME_PAYMENT_COMMENT}")
        );
        let already = format!("gift wrap | {PAYME_PAYMENT_COMMENT}");
        assert_eq!(payment_comment(&already), already);
    }

    #[test]
    fn sync_errors_are_bounded() {
        let err = DispatchError::Billz(BillzError::UnexpectedStatus {
            action: "add product to billz order",
            status: reqwest::StatusCode::BAD_REQUEST,
            body: "x".repeat(4096),
        });
        let message = truncate_sync_error(&err);
        assert!(message.len() <= MAX_SYNC_ERROR_LEN);
        assert!(message.starts_with("add product to billz order"));
    }

    fn test_client(server: &mockito::Server) -> BillzClient {
        BillzClient::new(BillzConfig {
            auth_url: format!("{}/auth/login", server.url()),
            base_url: server.url(),
            api_secret_key: "test-secret".to_string(),
            shop_id: "shop-1".to_string(),
            cashbox_id: "cashbox-1".to_string(),
            payment_type_id: "ptype-1".to_string(),
        })
    }

    async fn mock_auth(server: &mut mockito::ServerGuard) {
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(r#"{"data": {"access_token": "tok", "expires_in": 3600}}"#)
            .create_async()
            .await;
    }

    fn direct_order(items: Vec<DirectOrderItem>) -> DirectOrder {
        DirectOrder {
            items,
            customer_id: "cust-1".to_string(),
            payment_method: "cash".to_string(),
            total_amount: 1500.0,
            comment: String::new(),
        }
    }

    #[tokio::test]
    async fn direct_order_runs_draft_then_items_then_customer_then_payment() {
        let mut server = mockito::Server::new_async().await;
        mock_auth(&mut server).await;

        // The item/customer/payment paths embed the draft's id, so these
        // mocks can only match after the draft call returned it.
        let draft = server
            .mock("POST", "/v2/order")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"id": "ord-1", "data": {"order_number": "N-7", "order_type": "sale"}}"#)
            .expect(1)
            .create_async()
            .await;
        let items = server
            .mock("POST", "/v2/order-product/ord-1")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("{}")
            .expect(2)
            .create_async()
            .await;
        let customer = server
            .mock("PUT", "/v2/order-customer-new/ord-1")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;
        let payment = server
            .mock("POST", "/v2/order-payment/ord-1")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let result = create_order_direct(
            &test_client(&server),
            direct_order(vec![
                DirectOrderItem { product_id: "p-1".to_string(), quantity: 2.0 },
                DirectOrderItem { product_id: "p-2".to_string(), quantity: 1.0 },
            ]),
        )
        .await
        .unwrap();

        assert_eq!(result.order_id, "ord-1");
        assert_eq!(result.order_number, "N-7");
        assert_eq!(result.order_type, "sale");

        draft.assert_async().await;
        items.assert_async().await;
        customer.assert_async().await;
        payment.assert_async().await;
    }

    #[tokio::test]
    async fn failed_item_add_aborts_before_customer_and_payment() {
        let mut server = mockito::Server::new_async().await;
        mock_auth(&mut server).await;

        server
            .mock("POST", "/v2/order")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"id": "ord-1", "data": {}}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/v2/order-product/ord-1")
            .match_query(mockito::Matcher::Any)
            .with_status(422)
            .with_body("out of stock")
            .expect(1)
            .create_async()
            .await;
        let customer = server
            .mock("PUT", "/v2/order-customer-new/ord-1")
            .match_query(mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let payment = server
            .mock("POST", "/v2/order-payment/ord-1")
            .match_query(mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let err = create_order_direct(
            &test_client(&server),
            direct_order(vec![DirectOrderItem {
                product_id: "p-1".to_string(),
                quantity: 2.0,
            }]),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Billz(BillzError::UnexpectedStatus {
                action: "add product to billz order",
                ..
            })
        ));
        customer.assert_async().await;
        payment.assert_async().await;
    }

    #[tokio::test]
    async fn failed_customer_attach_is_tolerated() {
        let mut server = mockito::Server::new_async().await;
        mock_auth(&mut server).await;

        server
            .mock("POST", "/v2/order")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"id": "ord-1", "data": {"order_number": "N-8", "order_type": "sale"}}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/v2/order-product/ord-1")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;
        server
            .mock("PUT", "/v2/order-customer-new/ord-1")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .expect(1)
            .create_async()
            .await;
        let payment = server
            .mock("POST", "/v2/order-payment/ord-1")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let result = create_order_direct(
            &test_client(&server),
            direct_order(vec![DirectOrderItem {
                product_id: "p-1".to_string(),
                quantity: 2.0,
            }]),
        )
        .await
        .unwrap();

        assert_eq!(result.order_number, "N-8");
        payment.assert_async().await;
    }
}
