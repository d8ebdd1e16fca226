//! Core domain + application logic for the chat forwarder.
//!
//! This crate is intentionally framework-agnostic. The source network, the
//! Telegram Bot API and the completion backend live behind ports (traits)
//! implemented in adapter crates.

pub mod aggregation;
pub mod buffer;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod history;
pub mod logging;
pub mod messaging;
pub mod migration;
pub mod recovery;
pub mod relay;
pub mod resolver;
pub mod service;
pub mod source;
pub mod store;

#[cfg(test)]
mod test_support;

pub use errors::{Error, Result};
