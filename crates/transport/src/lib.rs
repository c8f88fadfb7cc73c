//! In-memory mailbox transport for InfiniSQL actors
//!
//! Every actor owns a `Mailbox` registered under an address in a `Registry`.
//! Delivery between any sender and one receiver preserves send order; there
//! is no ordering across different receivers.

use thiserror::Error;

pub mod mailbox;
pub mod registry;
pub mod request;

pub use mailbox::Mailbox;
pub use registry::Registry;
pub use request::request;

/// Transport errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No mailbox registered for {0}")]
    NotRegistered(String),

    #[error("Mailbox closed: {0}")]
    ChannelClosed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Reply channel dropped")]
    ReplyDropped,
}

pub type Result<T> = std::result::Result<T, TransportError>;
