//! Courier error type.
//!
//! Every fallible collaborator (directory, token store, transports, delivery
//! log) returns `Result<T, CourierError>`. The dispatch facade and the webhook
//! handler are the outermost boundaries: they convert these errors into
//! counts, log lines, or chat replies and never let them escape.

use thiserror::Error;

/// All errors produced inside Courier.
#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CourierError>;
