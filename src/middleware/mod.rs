pub mod payme_auth;
