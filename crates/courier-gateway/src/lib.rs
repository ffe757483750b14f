//! # Courier Gateway
//! The inbound side of the chat integration: an HTTP server that receives
//! chat-platform webhook updates and binds chat sessions to portal accounts,
//! either through a single-use link token or a passive username match.

pub mod link;
pub mod server;
pub mod update;

pub use link::{LinkOutcome, LinkService};
pub use server::{AppState, build_router, start};
pub use update::{InboundUpdate, classify_update};
