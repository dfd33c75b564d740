pub mod cart;
pub mod cart_item;
pub mod external_product_mapping;
pub mod order;
pub mod order_item;
pub mod payment_session;
pub mod product;
pub mod shipping_address;

pub use cart::Entity as Cart;
pub use cart_item::Entity as CartItem;
pub use external_product_mapping::Entity as ExternalProductMapping;
pub use order::Entity as Order;
pub use order_item::Entity as OrderItem;
pub use payment_session::Entity as PaymentSession;
pub use product::Entity as Product;
pub use shipping_address::Entity as ShippingAddress;
