//! Direct order HTTP handlers.
//!
//! This module implements:
//! - POST /api/v1/orders - create a cash/offline order
//!
//! Cash orders skip the provider callback flow entirely: the Billz order is
//! created synchronously before responding, and the admin notification plus
//! the optional customer SMS run as fire-and-forget background tasks.

use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};

use crate::{
    error::AppError,
    services::{
        billz_order::{self, DirectOrder, DirectOrderItem},
        telegram::{OrderItemNotification, OrderNotification},
    },
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct OrderProductRequest {
    pub product_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_quantity")]
    pub quantity: f64,

    #[serde(default)]
    pub price: f64,
}

fn default_quantity() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub products: Vec<OrderProductRequest>,

    /// Order total in major units.
    pub total_amount: f64,

    #[serde(default)]
    pub customer_id: String,

    #[serde(default)]
    pub customer_name: String,

    #[serde(default)]
    pub customer_phone: String,

    /// Free-form label; cash synonyms select the cash payment type.
    #[serde(default)]
    pub payment_method: String,

    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub success: bool,
    pub data: CreateOrderData,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderData {
    pub billz_order_id: String,
    pub billz_order_number: String,
    pub billz_order_type: String,
}

/// Create an order paid outside the provider flow.
///
/// # Response (201)
///
/// ```json
/// {
///   "success": true,
///   "data": {
///     "billz_order_id": "a1b2...",
///     "billz_order_number": "12345",
///     "billz_order_type": "sale"
///   }
/// }
/// ```
pub async fn create_cash_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), AppError> {
    if request.products.is_empty() {
        return Err(AppError::InvalidRequest(
            "order must contain at least one product".into(),
        ));
    }
    if request.total_amount <= 0.0 {
        return Err(AppError::InvalidRequest(
            "total_amount must be positive".into(),
        ));
    }

    let order = DirectOrder {
        items: request
            .products
            .iter()
            .map(|product| DirectOrderItem {
                product_id: product.product_id.clone(),
                quantity: product.quantity,
            })
            .collect(),
        customer_id: request.customer_id.clone(),
        payment_method: request.payment_method.clone(),
        total_amount: request.total_amount,
        comment: request.comment.clone(),
    };

    let result = billz_order::create_order_direct(&state.billz, order).await?;

    notify_in_background(&state, &request, &result.order_number);

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            success: true,
            data: CreateOrderData {
                billz_order_id: result.order_id,
                billz_order_number: result.order_number,
                billz_order_type: result.order_type,
            },
        }),
    ))
}

/// Spawn the admin notification and the customer SMS; neither outcome can
/// affect the already-committed order.
fn notify_in_background(state: &AppState, request: &CreateOrderRequest, order_number: &str) {
    let notification = OrderNotification {
        order_number: order_number.to_string(),
        customer_name: request.customer_name.clone(),
        customer_phone: request.customer_phone.clone(),
        payment_label: billz_order::payment_type_name(&request.payment_method).to_string(),
        total: request.total_amount,
        items: request
            .products
            .iter()
            .map(|product| OrderItemNotification {
                name: if product.name.is_empty() {
                    product.product_id.clone()
                } else {
                    product.name.clone()
                },
                quantity: product.quantity,
                price: product.price,
            })
            .collect(),
    };

    let telegram = state.telegram.clone();
    tokio::spawn(async move {
        if let Err(err) = telegram.notify_new_order(&notification).await {
            tracing::error!("telegram order notification failed: {err}");
        }
    });

    if state.sms.is_enabled() && !request.customer_phone.is_empty() {
        let sms = state.sms.clone();
        let phone = request.customer_phone.clone();
        let message = format!("Your order {order_number} has been accepted. Thank you!");
        tokio::spawn(async move {
            if let Err(err) = sms.send_sms(&phone, &message).await {
                tracing::error!("order confirmation sms failed: {err}");
            }
        });
    }
}
