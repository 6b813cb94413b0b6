pub mod stripe_client;
pub mod webhook_signature;
