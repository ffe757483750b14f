//! Collaborator traits.
//!
//! The directory, the link-token store, the delivery log, and the reminder
//! scheduler are external collaborators; Courier talks to them through these
//! seams. The channel traits are the delivery seams the dispatch facade and
//! the webhook handler hold, constructed once at process start and injected.
//! No module-level singletons.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::error::Result;
use crate::types::{
    ChatMessage, ContactRecord, DeliveryLogEntry, FanoutOutcome, LinkToken, NotificationEvent,
    RenderedEmail,
};

/// The user directory. Courier reads contact rows and writes chat-link state.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn contacts_by_ids(&self, user_ids: &[i64]) -> Result<Vec<ContactRecord>>;

    async fn contacts_by_role(&self, role: &str) -> Result<Vec<ContactRecord>>;

    /// Look up a contact by stored chat handle. The stored value may carry a
    /// leading `@`; implementations strip it before comparing. Comparison is
    /// case-sensitive.
    async fn find_by_chat_username(&self, username: &str) -> Result<Option<ContactRecord>>;

    /// Bind a chat session to a user: set `chat_id`, `chat_username` (when
    /// given), enable chat notifications, and stamp `chat_linked_at`.
    async fn link_chat(
        &self,
        user_id: i64,
        chat_id: &str,
        username: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

/// Store of single-use link tokens. Tokens are issued out-of-band by an
/// administrative action; Courier only reads and consumes them.
#[async_trait]
pub trait LinkTokenStore: Send + Sync {
    async fn find_by_token(&self, token: &str) -> Result<Option<LinkToken>>;

    /// Conditionally consume: stamp `consumed_at`/`last_used_at` and record
    /// the chat id, but only if the token is still unconsumed. Returns false
    /// when another redemption won the race.
    async fn consume(&self, token: &str, chat_id: &str, now: DateTime<Utc>) -> Result<bool>;
}

/// Append-only delivery audit log.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn append(&self, entry: DeliveryLogEntry) -> Result<()>;
}

/// Collaborator that schedules a follow-up reminder after a task assignment.
/// Invoked fire-and-forget; its outcome never affects a dispatch result.
#[async_trait]
pub trait ReminderScheduler: Send + Sync {
    async fn schedule_followup(
        &self,
        event: &NotificationEvent,
        assignee_names: &[String],
    ) -> Result<()>;
}

/// Outbound electronic mail. One call delivers to the whole recipient list.
#[async_trait]
pub trait MailChannel: Send + Sync {
    async fn send(&self, to: &[String], message: &RenderedEmail) -> Result<()>;
}

/// Outbound chat-platform messaging.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// One send-message call to one chat. Errors are per-recipient failures.
    async fn send(&self, chat_id: &str, message: &ChatMessage) -> Result<()>;

    /// Number of sends issued concurrently within one fan-out batch.
    fn batch_width(&self) -> usize {
        5
    }

    /// Fan a message out to many chats with bounded concurrency.
    ///
    /// Recipients are de-duplicated first. Sends are grouped into batches of
    /// `batch_width()`; within a batch all sends run concurrently and the
    /// batch fully settles before the next one starts. A single recipient's
    /// failure never aborts its batch or later batches.
    async fn send_to_many(&self, chat_ids: &[String], message: &ChatMessage) -> FanoutOutcome {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = chat_ids.iter().filter(|id| seen.insert(*id)).collect();

        let width = self.batch_width().max(1);
        let mut outcome = FanoutOutcome::default();

        for batch in unique.chunks(width) {
            let results =
                futures::future::join_all(batch.iter().map(|id| self.send(id, message))).await;
            for (chat_id, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => outcome.successful += 1,
                    Err(e) => {
                        tracing::warn!("chat send to {chat_id} failed: {e}");
                        outcome.failed += 1;
                    }
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CourierError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Chat double: configurable batch width, failure set, and a gauge of
    /// peak concurrent in-flight sends.
    struct ChatDouble {
        width: usize,
        fail_for: Vec<String>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        sent: Mutex<Vec<String>>,
    }

    impl ChatDouble {
        fn new(width: usize) -> Self {
            Self {
                width,
                fail_for: Vec::new(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatChannel for ChatDouble {
        async fn send(&self, chat_id: &str, _message: &ChatMessage) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.sent.lock().unwrap().push(chat_id.to_string());
            if self.fail_for.iter().any(|f| f == chat_id) {
                return Err(CourierError::Channel(format!("simulated failure: {chat_id}")));
            }
            Ok(())
        }

        fn batch_width(&self) -> usize {
            self.width
        }
    }

    fn message() -> ChatMessage {
        ChatMessage {
            text: "hello".into(),
            parse_mode: None,
            action: None,
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("chat-{i}")).collect()
    }

    #[tokio::test]
    async fn test_fanout_counts_mixed_results() {
        let mut double = ChatDouble::new(5);
        double.fail_for = vec!["chat-1".into()];
        let outcome = double.send_to_many(&ids(3), &message()).await;
        assert_eq!(outcome, FanoutOutcome { successful: 2, failed: 1 });
        assert!(outcome.any_success());
    }

    #[tokio::test]
    async fn test_fanout_all_fail() {
        let mut double = ChatDouble::new(2);
        double.fail_for = ids(3);
        let outcome = double.send_to_many(&ids(3), &message()).await;
        assert_eq!(outcome, FanoutOutcome { successful: 0, failed: 3 });
        assert!(!outcome.any_success());
    }

    #[tokio::test]
    async fn test_fanout_deduplicates_recipients() {
        let double = ChatDouble::new(5);
        let recipients = vec!["a".to_string(), "b".into(), "a".into(), "b".into()];
        let outcome = double.send_to_many(&recipients, &message()).await;
        assert_eq!(outcome.successful, 2);
        assert_eq!(double.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fanout_bounds_concurrency() {
        let double = ChatDouble::new(5);
        let outcome = double.send_to_many(&ids(12), &message()).await;
        assert_eq!(outcome.successful, 12);
        let peak = double.peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak concurrent sends was {peak}");
        assert!(peak >= 2, "batches should overlap internally, peak was {peak}");
    }

    #[tokio::test]
    async fn test_fanout_empty_recipient_list() {
        let double = ChatDouble::new(5);
        let outcome = double.send_to_many(&[], &message()).await;
        assert_eq!(outcome, FanoutOutcome::default());
    }

    #[tokio::test]
    async fn test_fanout_width_floor_is_one() {
        let double = ChatDouble::new(0);
        let outcome = double.send_to_many(&ids(3), &message()).await;
        assert_eq!(outcome.successful, 3);
        assert!(double.peak.load(Ordering::SeqCst) <= 1);
    }
}
