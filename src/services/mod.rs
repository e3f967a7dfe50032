pub mod billz_client;
pub mod billz_order;
pub mod payme_service;
pub mod sms;
pub mod telegram;
