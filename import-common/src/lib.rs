pub mod event;
pub mod filter;
pub mod health;
pub mod journal;
pub mod metrics;
pub mod model;
pub mod store;
