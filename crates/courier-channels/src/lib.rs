//! # Courier Channels
//! Channel transport implementations: SMTP mail and the chat platform's
//! Bot API. Both are constructed once and injected where they are used.

pub mod chat;
pub mod mail;

pub use chat::ChatTransport;
pub use mail::MailTransport;
