pub mod b2b_webhooks;
pub mod checkout;
pub mod health;
pub mod orders;
pub mod payments;
