pub mod checkout;
pub mod session_verify;
pub mod stripe_webhook;
pub mod subscriptions;
