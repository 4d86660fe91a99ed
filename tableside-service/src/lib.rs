pub mod app;
pub mod config;
pub mod detector;
pub mod device;
pub mod error;
pub mod events;
pub mod models;
pub mod order;
pub mod query;
pub mod schema;
pub mod session;
pub mod store;

pub const SESSION_EVENT_TOPIC: &str = "tableside.session.event";
pub const ORDER_EVENT_TOPIC: &str = "tableside.order.event";
