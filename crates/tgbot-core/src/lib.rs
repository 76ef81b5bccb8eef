//! Post-send completion engine for the Telegram bot framework.
//!
//! After the transport layer sends (or fails to send) a message, a [`finish::Finisher`]
//! notifies the registered callbacks with the outcome and then closes the session and
//! chat transactions that were opened for that message. Transport, persistence and
//! bot logic live in other crates and reach this one only through ports.

pub mod chat;
pub mod config;
pub mod domain;
pub mod errors;
pub mod finish;
pub mod logging;

pub use errors::{Error, Result};
