pub mod cart_splitter;
pub mod checkout;
pub mod inventory_sync;
pub mod orders;
pub mod payments;
