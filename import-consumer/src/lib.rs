pub mod config;
pub mod consumer;
pub mod error;
pub mod error_handler;
pub mod journal_handler;
pub mod kafka;
pub mod orchestrator;
pub mod parser;
pub mod sensor;
pub mod sink;
