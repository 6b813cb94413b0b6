pub mod checkout;
pub mod subscriptions;
pub mod webhooks;
