//! Order domain: the order record, its items and the order state machine.

pub mod model;
pub mod state;

pub use model::{Customer, DeliveryType, Order, OrderItem, OrderOwner, OrderTotals};
pub use state::{BuyerStatus, OrderStatus};
