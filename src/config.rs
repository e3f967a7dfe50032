//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to automatically deserialize environment variables into a type-safe struct.

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `PAYME_MERCHANT_ID` (required): merchant id embedded in checkout URLs
/// - `PAYME_MERCHANT_KEY` (required): shared secret the provider sends in
///   the Authorization header of callback requests
/// - `BILLZ_AUTH_URL` / `BILLZ_URL` (optional): Billz login and API base URLs
/// - `BILLZ_API_SECRET_KEY` (optional): secret token for the Billz login call
/// - `BILLZ_SHOP_ID` / `BILLZ_CASHBOX_ID` / `BILLZ_PAYMENT_TYPE_ID`
///   (optional): tenant identifiers used when creating orders
/// - `TELEGRAM_BOT_TOKEN` / `TELEGRAM_ADMIN_CHAT_ID` (optional): admin
///   notification target; notifications are skipped when unset
/// - `SMS_BASE_URL` / `SMS_USERNAME` / `SMS_PASSWORD` / `SMS_ENABLED`
///   (optional): SMS provider credentials, disabled by default
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    pub payme_merchant_id: String,
    pub payme_merchant_key: String,

    #[serde(default = "default_billz_auth_url")]
    pub billz_auth_url: String,

    #[serde(default = "default_billz_base_url", rename = "billz_url")]
    pub billz_base_url: String,

    #[serde(default)]
    pub billz_api_secret_key: String,

    #[serde(default)]
    pub billz_shop_id: String,

    #[serde(default)]
    pub billz_cashbox_id: String,

    #[serde(default)]
    pub billz_payment_type_id: String,

    #[serde(default)]
    pub telegram_bot_token: String,

    #[serde(default)]
    pub telegram_admin_chat_id: String,

    #[serde(default = "default_sms_base_url")]
    pub sms_base_url: String,

    #[serde(default)]
    pub sms_username: String,

    #[serde(default)]
    pub sms_password: String,

    #[serde(default)]
    pub sms_enabled: bool,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_billz_auth_url() -> String {
    "https://api-admin.billz.ai/v1/auth/login".to_string()
}

fn default_billz_base_url() -> String {
    "https://api-admin.billz.ai/v2".to_string()
}

fn default_sms_base_url() -> String {
    "https://pay.myuzcard.uz/api".to_string()
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing (e.g., DATABASE_URL)
    /// - Environment variable values cannot be parsed into expected types
    pub fn from_env() -> Result<Self, envy::Error> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Parse environment variables into Config struct
        // Field names are automatically converted: database_url -> DATABASE_URL
        envy::from_env::<Config>()
    }
}
