//! Payme transaction state machine.
//!
//! Implements the six provider callback operations over the transaction
//! rows, enforcing the protocol invariants: the external id binds at most
//! once, states only move along `0 -> 1 -> 2`, `1 -> -1`, `2 -> -2`, a
//! pending transaction older than 12 minutes is lazily auto-canceled, and a
//! transition into `paid` triggers the exactly-once Billz dispatch.
//!
//! Only the protocol error taxonomy is expressed in the RPC envelope. Billz
//! dispatch failures are logged and recorded on the row, never surfaced;
//! storage failures propagate outside the protocol envelope as plain HTTP
//! errors, never as taxonomy codes.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::DbPool,
    models::{
        payme::{
            CancelTransactionParams, CancelTransactionResult, CheckPerformParams,
            CheckTransactionParams, CheckTransactionResult, CreateTransactionParams,
            CreateTransactionResult, PaymeAccount, PerformTransactionParams,
            PerformTransactionResult, StatementEntry, StatementParams,
        },
        transaction::{
            PROVIDER_PAYME, PaymeTransaction, REASON_PENDING_EXPIRED, TransactionState,
            canceled_code,
        },
    },
    services::{
        billz_client::BillzClient,
        billz_order,
        telegram::{PaymentSuccessNotification, TelegramClient},
    },
};

/// A pending transaction neither confirmed nor canceled within this window
/// is auto-canceled the next time any operation inspects it.
pub const PENDING_WINDOW_MS: i64 = 12 * 60 * 1000;

/// Trilingual error message fixed by the provider contract.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ErrorMessage {
    pub uz: &'static str,
    pub ru: &'static str,
    pub en: &'static str,
}

/// The only errors returned across the RPC boundary.
///
/// Codes and messages are part of the provider contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymeError {
    InvalidAmount,
    CantDoOperation,
    TransactionNotFound,
    AlreadyDone,
    Pending,
    InvalidAuthorization,
}

impl PaymeError {
    pub fn code(self) -> i32 {
        match self {
            PaymeError::InvalidAmount => -31001,
            PaymeError::CantDoOperation => -31008,
            PaymeError::TransactionNotFound => -31050,
            PaymeError::AlreadyDone => -31060,
            PaymeError::Pending => -31050,
            PaymeError::InvalidAuthorization => -32504,
        }
    }

    pub fn message(self) -> ErrorMessage {
        match self {
            PaymeError::InvalidAmount => ErrorMessage {
                uz: "Noto'g'ri summa",
                ru: "Недопустимая сумма",
                en: "Invalid amount",
            },
            PaymeError::CantDoOperation => ErrorMessage {
                uz: "Biz operatsiyani bajara olmaymiz",
                ru: "Мы не можем сделать операцию",
                en: "We can't do operation",
            },
            PaymeError::TransactionNotFound => ErrorMessage {
                uz: "Tranzaktsiya topilmadi",
                ru: "Транзакция не найдена",
                en: "Transaction not found",
            },
            PaymeError::AlreadyDone => ErrorMessage {
                uz: "Mahsulot uchun to'lov qilingan",
                ru: "Оплачено за товар",
                en: "Paid for the product",
            },
            PaymeError::Pending => ErrorMessage {
                uz: "Mahsulot uchun to'lov kutilayapti",
                ru: "Ожидается оплата товар",
                en: "Payment for the product is pending",
            },
            PaymeError::InvalidAuthorization => ErrorMessage {
                uz: "Avtorizatsiya yaroqsiz",
                ru: "Авторизация недействительна",
                en: "Authorization invalid",
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaymeServiceError {
    /// Protocol-level rejection, serialized into the Payme error shape.
    #[error("payme protocol error: {0:?}")]
    Protocol(PaymeError),

    /// Storage failure; surfaced as an internal error, never translated
    /// into the protocol taxonomy.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Divide the provider-reported minor-unit amount down to major units.
fn normalized_amount(minor_units: i64) -> i64 {
    minor_units / 100
}

/// True once a pending transaction's age reaches the 12-minute window.
fn pending_expired(create_time: i64, now: i64) -> bool {
    now - create_time >= PENDING_WINDOW_MS
}

#[derive(Clone)]
pub struct PaymeService {
    pool: DbPool,
    billz: BillzClient,
    telegram: TelegramClient,
}

impl PaymeService {
    pub fn new(pool: DbPool, billz: BillzClient, telegram: TelegramClient) -> Self {
        Self {
            pool,
            billz,
            telegram,
        }
    }

    /// Validate that the referenced order exists and the amount matches.
    ///
    /// Pure validation gate: no state change. Also re-run by
    /// CreateTransaction before binding an external id.
    pub async fn check_perform_transaction(
        &self,
        params: &CheckPerformParams,
    ) -> Result<(), PaymeServiceError> {
        let amount = normalized_amount(params.amount);

        let txn = self
            .find_by_order_ref(&params.account.order_id)
            .await?
            .ok_or(PaymeServiceError::Protocol(PaymeError::TransactionNotFound))?;

        if txn.amount != amount {
            return Err(PaymeServiceError::Protocol(PaymeError::InvalidAmount));
        }

        Ok(())
    }

    /// Return transaction state by external transaction id. No state change.
    pub async fn check_transaction(
        &self,
        params: &CheckTransactionParams,
    ) -> Result<CheckTransactionResult, PaymeServiceError> {
        let lookup_id = params
            .id
            .normalize()
            .ok_or(PaymeServiceError::Protocol(PaymeError::TransactionNotFound))?;

        let txn = self
            .find_by_transaction_id(&lookup_id)
            .await?
            .ok_or(PaymeServiceError::Protocol(PaymeError::TransactionNotFound))?;

        Ok(CheckTransactionResult {
            create_time: txn.create_time,
            perform_time: txn.perform_time,
            cancel_time: txn.cancel_time,
            transaction: txn.transaction_id,
            state: txn.status,
            // The wire only carries a reason once one has been recorded.
            reason: txn.reason.filter(|reason| *reason != 0),
        })
    }

    /// Create or reuse a pending transaction for the given order.
    ///
    /// Idempotent for a fixed external id while the bound row is pending
    /// and inside the 12-minute window: repeated calls return the same
    /// create time and state. Stale pending rows are canceled and then
    /// still rejected, never silently revived.
    pub async fn create_transaction(
        &self,
        params: &CreateTransactionParams,
    ) -> Result<CreateTransactionResult, PaymeServiceError> {
        self.check_perform_transaction(&CheckPerformParams {
            amount: params.amount,
            account: params.account.clone(),
        })
        .await?;

        let now = Utc::now().timestamp_millis();

        if let Some(existing) = self.find_by_transaction_id(&params.id).await? {
            if existing.status != TransactionState::Pending.code() {
                return Err(PaymeServiceError::Protocol(PaymeError::CantDoOperation));
            }

            if pending_expired(existing.create_time, now) {
                sqlx::query(
                    "UPDATE payme_transactions SET status = $1, reason = $2, updated_at = NOW() WHERE transaction_id = $3",
                )
                .bind(TransactionState::PendingCanceled.code())
                .bind(REASON_PENDING_EXPIRED)
                .bind(&params.id)
                .execute(&self.pool)
                .await?;

                return Err(PaymeServiceError::Protocol(PaymeError::CantDoOperation));
            }

            return Ok(CreateTransactionResult {
                create_time: existing.create_time,
                transaction: params.id.clone(),
                state: TransactionState::Pending.code(),
            });
        }

        if let Some(order) = self.find_by_order_ref(&params.account.order_id).await? {
            if order.status == TransactionState::Paid.code() {
                return Err(PaymeServiceError::Protocol(PaymeError::AlreadyDone));
            }
            if order.status == TransactionState::Pending.code() {
                return Err(PaymeServiceError::Protocol(PaymeError::Pending));
            }
        }

        // Bind the external id to the checkout row and move it to pending.
        // The create_time comes from the provider-supplied param.
        if let Ok(row_id) = Uuid::parse_str(&params.account.order_id) {
            sqlx::query(
                r#"
                UPDATE payme_transactions
                SET transaction_id = $1, status = $2, create_time = $3, updated_at = NOW()
                WHERE provider = $4 AND (id = $5 OR order_id = $6)
                "#,
            )
            .bind(&params.id)
            .bind(TransactionState::Pending.code())
            .bind(params.time)
            .bind(PROVIDER_PAYME)
            .bind(row_id)
            .bind(&params.account.order_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE payme_transactions
                SET transaction_id = $1, status = $2, create_time = $3, updated_at = NOW()
                WHERE provider = $4 AND order_id = $5
                "#,
            )
            .bind(&params.id)
            .bind(TransactionState::Pending.code())
            .bind(params.time)
            .bind(PROVIDER_PAYME)
            .bind(&params.account.order_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(CreateTransactionResult {
            create_time: params.time,
            transaction: params.id.clone(),
            state: TransactionState::Pending.code(),
        })
    }

    /// Mark a pending transaction as paid and dispatch the Billz order.
    ///
    /// The provider retries this call after network timeouts, so an
    /// already-paid transaction is an idempotent success: the stored result
    /// is echoed and the dispatch is re-triggered (it short-circuits on the
    /// recorded order id, and it is the retry avenue for a dispatch that
    /// failed earlier). Dispatch failures never fail the RPC; the payment
    /// is already confirmed and must not be contested.
    pub async fn perform_transaction(
        &self,
        params: &PerformTransactionParams,
    ) -> Result<PerformTransactionResult, PaymeServiceError> {
        let now = Utc::now().timestamp_millis();

        let txn = self
            .find_by_transaction_id(&params.id)
            .await?
            .ok_or(PaymeServiceError::Protocol(PaymeError::TransactionNotFound))?;

        if txn.status != TransactionState::Pending.code() {
            if txn.status != TransactionState::Paid.code() {
                return Err(PaymeServiceError::Protocol(PaymeError::CantDoOperation));
            }

            match billz_order::dispatch_paid_transaction(&self.pool, &self.billz, txn.id).await {
                Ok(Some(result)) => {
                    tracing::info!(txn_id = %txn.id, order_id = %result.order_id, "billz order ready for retried perform");
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(txn_id = %txn.id, "billz dispatch failed: {err}");
                }
            }

            return Ok(PerformTransactionResult {
                perform_time: txn.perform_time,
                transaction: txn.transaction_id,
                state: TransactionState::Paid.code(),
            });
        }

        if pending_expired(txn.create_time, now) {
            sqlx::query(
                "UPDATE payme_transactions SET status = $1, reason = $2, cancel_time = $3, updated_at = NOW() WHERE transaction_id = $4",
            )
            .bind(TransactionState::PendingCanceled.code())
            .bind(REASON_PENDING_EXPIRED)
            .bind(now)
            .bind(&params.id)
            .execute(&self.pool)
            .await?;

            return Err(PaymeServiceError::Protocol(PaymeError::CantDoOperation));
        }

        sqlx::query(
            "UPDATE payme_transactions SET status = $1, perform_time = $2, updated_at = NOW() WHERE transaction_id = $3",
        )
        .bind(TransactionState::Paid.code())
        .bind(now)
        .bind(&params.id)
        .execute(&self.pool)
        .await?;

        self.dispatch_and_notify(&txn).await;

        Ok(PerformTransactionResult {
            perform_time: now,
            transaction: txn.transaction_id,
            state: TransactionState::Paid.code(),
        })
    }

    /// Cancel an existing transaction.
    ///
    /// A positive state flips its sign (pending to pending-canceled, paid
    /// to paid-canceled) and records the reason; an already-canceled row is
    /// a no-op returning the existing cancel time.
    pub async fn cancel_transaction(
        &self,
        params: &CancelTransactionParams,
    ) -> Result<CancelTransactionResult, PaymeServiceError> {
        let txn = self
            .find_by_transaction_id(&params.id)
            .await?
            .ok_or(PaymeServiceError::Protocol(PaymeError::TransactionNotFound))?;

        let now = Utc::now().timestamp_millis();

        let (state, cancel_time) = if txn.status > 0 {
            let state = canceled_code(txn.status);
            sqlx::query(
                "UPDATE payme_transactions SET status = $1, reason = $2, cancel_time = $3, updated_at = NOW() WHERE transaction_id = $4",
            )
            .bind(state)
            .bind(params.reason)
            .bind(now)
            .bind(&params.id)
            .execute(&self.pool)
            .await?;
            (state, now)
        } else {
            let cancel_time = if txn.cancel_time == 0 {
                now
            } else {
                txn.cancel_time
            };
            (canceled_code(txn.status), cancel_time)
        };

        Ok(CancelTransactionResult {
            cancel_time,
            transaction: txn.transaction_id,
            state,
        })
    }

    /// Return all of this provider's transactions with a create time in
    /// `[from, to]`, projected into the statement wire shape.
    pub async fn get_statement(
        &self,
        params: &StatementParams,
    ) -> Result<Vec<StatementEntry>, PaymeServiceError> {
        let txns = sqlx::query_as::<_, PaymeTransaction>(
            r#"
            SELECT * FROM payme_transactions
            WHERE create_time >= $1 AND create_time <= $2 AND provider = $3
            ORDER BY create_time
            "#,
        )
        .bind(params.from)
        .bind(params.to)
        .bind(PROVIDER_PAYME)
        .fetch_all(&self.pool)
        .await?;

        Ok(txns
            .into_iter()
            .map(|txn| StatementEntry {
                transaction_id: txn.transaction_id.clone(),
                time: txn.create_time,
                amount: txn.amount,
                account: PaymeAccount {
                    order_id: txn.id.to_string(),
                },
                create_time: txn.create_time,
                perform_time: txn.perform_time,
                cancel_time: txn.cancel_time,
                transaction: txn.transaction_id,
                state: txn.status,
                reason: txn.reason,
            })
            .collect())
    }

    /// Dispatch the Billz order for a freshly paid transaction and, on
    /// success, hand the admin notification to a fire-and-forget task.
    async fn dispatch_and_notify(&self, txn: &PaymeTransaction) {
        match billz_order::dispatch_paid_transaction(&self.pool, &self.billz, txn.id).await {
            Ok(Some(result)) => {
                tracing::info!(txn_id = %txn.id, order_id = %result.order_id, "billz order created");

                let telegram = self.telegram.clone();
                let notification = PaymentSuccessNotification {
                    order_id: txn.order_id.clone(),
                    order_number: txn.order_id.clone(),
                    billz_order_id: result.order_id,
                    amount: txn.amount as f64,
                    currency: "UZS".to_string(),
                };
                tokio::spawn(async move {
                    if let Err(err) = telegram.notify_payment_success(&notification).await {
                        tracing::error!("telegram payment notification failed: {err}");
                    }
                });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(txn_id = %txn.id, "billz dispatch failed: {err}");
            }
        }
    }

    /// Look up the transaction bound to an account reference: tried as the
    /// row UUID first, then as the internal order id.
    async fn find_by_order_ref(
        &self,
        order_ref: &str,
    ) -> Result<Option<PaymeTransaction>, sqlx::Error> {
        if let Ok(row_id) = Uuid::parse_str(order_ref) {
            let txn = sqlx::query_as::<_, PaymeTransaction>(
                "SELECT * FROM payme_transactions WHERE provider = $1 AND id = $2",
            )
            .bind(PROVIDER_PAYME)
            .bind(row_id)
            .fetch_optional(&self.pool)
            .await?;

            if txn.is_some() {
                return Ok(txn);
            }
        }

        sqlx::query_as::<_, PaymeTransaction>(
            "SELECT * FROM payme_transactions WHERE provider = $1 AND order_id = $2",
        )
        .bind(PROVIDER_PAYME)
        .bind(order_ref)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PaymeTransaction>, sqlx::Error> {
        sqlx::query_as::<_, PaymeTransaction>(
            "SELECT * FROM payme_transactions WHERE provider = $1 AND transaction_id = $2",
        )
        .bind(PROVIDER_PAYME)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_are_divided_by_one_hundred() {
        assert_eq!(normalized_amount(150_000), 1500);
        assert_eq!(normalized_amount(150_050), 1500);
        assert_eq!(normalized_amount(99), 0);
    }

    #[test]
    fn amount_of_150000_matches_order_of_1500_but_not_1400() {
        assert_eq!(normalized_amount(150_000), 1500);
        assert_ne!(normalized_amount(150_000), 1400);
    }

    #[test]
    fn pending_window_is_inclusive_at_twelve_minutes() {
        let created = 1_700_000_000_000;
        assert!(!pending_expired(created, created + PENDING_WINDOW_MS - 1));
        assert!(pending_expired(created, created + PENDING_WINDOW_MS));
        assert!(pending_expired(created, created + PENDING_WINDOW_MS + 1));
    }

    #[test]
    fn error_codes_match_the_provider_contract() {
        assert_eq!(PaymeError::InvalidAmount.code(), -31001);
        assert_eq!(PaymeError::CantDoOperation.code(), -31008);
        assert_eq!(PaymeError::TransactionNotFound.code(), -31050);
        assert_eq!(PaymeError::AlreadyDone.code(), -31060);
        assert_eq!(PaymeError::Pending.code(), -31050);
        assert_eq!(PaymeError::InvalidAuthorization.code(), -32504);
    }

    #[test]
    fn every_error_carries_all_three_languages() {
        for err in [
            PaymeError::InvalidAmount,
            PaymeError::CantDoOperation,
            PaymeError::TransactionNotFound,
            PaymeError::AlreadyDone,
            PaymeError::Pending,
            PaymeError::InvalidAuthorization,
        ] {
            let message = err.message();
            assert!(!message.uz.is_empty());
            assert!(!message.ru.is_empty());
            assert!(!message.en.is_empty());
        }
    }
}
