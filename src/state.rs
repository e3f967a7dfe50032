//! Shared application state handed to every handler via Axum `State`.

use std::sync::Arc;

use crate::{
    config::Config,
    db::DbPool,
    services::{
        billz_client::BillzClient, payme_service::PaymeService, sms::SmsClient,
        telegram::TelegramClient,
    },
};

/// Everything a request handler may need: the connection pool, the loaded
/// configuration and the long-lived external-system clients. Cloning is
/// cheap: the pool and clients are reference-counted internally.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: Arc<Config>,
    pub payme: PaymeService,
    pub billz: BillzClient,
    pub telegram: TelegramClient,
    pub sms: SmsClient,
}
