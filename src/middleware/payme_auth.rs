//! Merchant authentication for the Payme callback endpoint.
//!
//! The provider signs every call with an `Authorization` header whose
//! base64-decoded credential must contain the configured merchant key. A
//! failed check still answers HTTP 200: the rejection travels in the
//! protocol error body (code `-32504`) with the request's correlation id
//! echoed back, which requires buffering the body before the handler runs.

use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use serde_json::json;

use crate::{services::payme_service::PaymeError, state::AppState};

/// Upper bound on a buffered RPC body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Minimal envelope read ahead of the handler to recover the correlation id.
#[derive(Deserialize)]
struct RpcId {
    #[serde(default)]
    id: serde_json::Value,
}

pub async fn payme_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return unauthorized(serde_json::Value::Null),
    };

    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if !credential_is_valid(header, &state.config.payme_merchant_key) {
        let id = serde_json::from_slice::<RpcId>(&bytes)
            .map(|envelope| envelope.id)
            .unwrap_or(serde_json::Value::Null);
        return unauthorized(id);
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

/// Decode the header's credential and require the merchant key inside it.
fn credential_is_valid(header: &str, merchant_key: &str) -> bool {
    if merchant_key.is_empty() {
        return false;
    }

    let credential = header.split_whitespace().last().unwrap_or("");
    if credential.is_empty() {
        return false;
    }

    let Ok(decoded) = BASE64.decode(credential) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };

    decoded.contains(merchant_key)
}

/// Protocol-level rejection: HTTP 200 with the fixed `-32504` error body.
fn unauthorized(id: serde_json::Value) -> Response {
    let err = PaymeError::InvalidAuthorization;
    Json(json!({
        "error": {
            "code": err.code(),
            "message": err.message(),
            "data": serde_json::Value::Null,
        },
        "id": id,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(credential: &str) -> String {
        format!("Basic {}", BASE64.encode(credential))
    }

    #[test]
    fn credential_containing_the_key_is_accepted() {
        assert!(credential_is_valid(&basic("Paycom:merchant-key"), "merchant-key"));
        assert!(credential_is_valid(&basic("merchant-key"), "merchant-key"));
    }

    #[test]
    fn wrong_or_missing_credential_is_rejected() {
        assert!(!credential_is_valid(&basic("Paycom:other-key"), "merchant-key"));
        assert!(!credential_is_valid("", "merchant-key"));
        assert!(!credential_is_valid("Basic", "merchant-key"));
        assert!(!credential_is_valid("Basic not-base64!!!", "merchant-key"));
    }

    #[test]
    fn empty_merchant_key_never_authenticates() {
        assert!(!credential_is_valid(&basic("anything"), ""));
    }
}
