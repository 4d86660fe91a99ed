pub mod api;
pub mod producer;
pub mod sweeper;
