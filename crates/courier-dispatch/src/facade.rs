//! Dispatch facade — one call notifies a set of users about one event across
//! every eligible channel.
//!
//! Nothing here propagates an error to the caller: a dispatch returns a plain
//! bool ("at least one delivery succeeded") and everything else becomes a log
//! line. A task assignment must still succeed even when notifying about it
//! fails.

use std::sync::Arc;

use chrono::Utc;
use courier_core::traits::{ChatChannel, DeliveryLog, Directory, MailChannel, ReminderScheduler};
use courier_core::types::{DeliveryLogEntry, NotificationEvent};

use crate::resolver::ContactResolver;
use crate::templates::TemplateRegistry;

/// Orchestrates resolver → templates → transports for one event, fans out per
/// recipient, and writes one delivery-log row per attempted channel.
///
/// Constructed once at process start with its collaborators injected; absent
/// channels are skipped for all events.
pub struct Dispatcher {
    directory: Arc<dyn Directory>,
    resolver: ContactResolver,
    mail: Option<Arc<dyn MailChannel>>,
    chat: Option<Arc<dyn ChatChannel>>,
    delivery_log: Arc<dyn DeliveryLog>,
    reminders: Option<Arc<dyn ReminderScheduler>>,
    templates: TemplateRegistry,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn Directory>,
        mail: Option<Arc<dyn MailChannel>>,
        chat: Option<Arc<dyn ChatChannel>>,
        delivery_log: Arc<dyn DeliveryLog>,
        reminders: Option<Arc<dyn ReminderScheduler>>,
        templates: TemplateRegistry,
    ) -> Self {
        if mail.is_none() {
            tracing::warn!("mail channel not configured, mail deliveries disabled");
        }
        if chat.is_none() {
            tracing::warn!("chat channel not configured, chat deliveries disabled");
        }
        Self {
            resolver: ContactResolver::new(directory.clone()),
            directory,
            mail,
            chat,
            delivery_log,
            reminders,
            templates,
        }
    }

    /// Notify an explicit set of users. Returns true when at least one
    /// delivery on at least one channel succeeded.
    pub async fn dispatch(&self, event: &NotificationEvent, recipient_ids: &[i64]) -> bool {
        let (emails, chat_ids) = tokio::join!(
            async {
                if self.mail.is_some() {
                    self.resolver.resolve_email(recipient_ids).await
                } else {
                    Vec::new()
                }
            },
            async {
                if self.chat.is_some() {
                    self.resolver.resolve_chat(recipient_ids).await
                } else {
                    Vec::new()
                }
            },
        );
        let delivered = self.deliver(event, emails, chat_ids).await;
        self.schedule_followup(event, recipient_ids);
        delivered
    }

    /// Notify every member of an organizational role. Same contract as
    /// `dispatch`, with the chat channel additionally gated on the event type
    /// having a chat template at all.
    pub async fn dispatch_to_role(&self, event: &NotificationEvent, role: &str) -> bool {
        let chat_eligible = self.chat.is_some() && self.templates.chat_supports(event);
        let (emails, chat_ids) = tokio::join!(
            async {
                if self.mail.is_some() {
                    self.resolver.resolve_email_by_role(role).await
                } else {
                    Vec::new()
                }
            },
            async {
                if chat_eligible {
                    self.resolver.resolve_chat_by_role(role).await
                } else {
                    Vec::new()
                }
            },
        );
        self.deliver(event, emails, chat_ids).await
    }

    async fn deliver(
        &self,
        event: &NotificationEvent,
        emails: Vec<String>,
        chat_ids: Vec<String>,
    ) -> bool {
        if emails.is_empty() && chat_ids.is_empty() {
            tracing::warn!("no reachable recipients for {}", event.kind());
            return false;
        }
        let (mail_ok, chat_ok) = tokio::join!(
            self.deliver_email(event, &emails),
            self.deliver_chat(event, &chat_ids),
        );
        mail_ok || chat_ok
    }

    async fn deliver_email(&self, event: &NotificationEvent, emails: &[String]) -> bool {
        let Some(mail) = &self.mail else { return false };
        if emails.is_empty() {
            return false;
        }
        let Some(rendered) = self.templates.render_email(event) else {
            return false;
        };
        let (successful, failed) = match mail.send(emails, &rendered).await {
            Ok(()) => (emails.len(), 0),
            Err(e) => {
                tracing::warn!("mail delivery for {} failed: {e}", event.kind());
                (0, emails.len())
            }
        };
        self.log_delivery(event, "email", emails.to_vec(), rendered.text, successful, failed)
            .await;
        successful > 0
    }

    async fn deliver_chat(&self, event: &NotificationEvent, chat_ids: &[String]) -> bool {
        let Some(chat) = &self.chat else { return false };
        if chat_ids.is_empty() {
            return false;
        }
        let Some(message) = self.templates.render_chat(event) else {
            return false;
        };
        let outcome = chat.send_to_many(chat_ids, &message).await;
        self.log_delivery(
            event,
            "chat",
            chat_ids.to_vec(),
            message.text,
            outcome.successful,
            outcome.failed,
        )
        .await;
        outcome.any_success()
    }

    /// One append per attempted channel. Append failures are swallowed; the
    /// audit trail must never break a dispatch.
    async fn log_delivery(
        &self,
        event: &NotificationEvent,
        channel: &str,
        recipients: Vec<String>,
        rendered_text: String,
        successful: usize,
        failed: usize,
    ) {
        let entry = DeliveryLogEntry {
            event_kind: event.kind().into(),
            channel: channel.into(),
            recipients,
            rendered_text,
            sent_at: Utc::now(),
            successful_count: successful,
            failed_count: failed,
            payload: event.payload_json(),
        };
        if let Err(e) = self.delivery_log.append(entry).await {
            tracing::warn!("delivery log append failed: {e}");
        }
    }

    /// Task assignments get a follow-up reminder scheduled with the external
    /// scheduling collaborator. Fire-and-forget: the spawned task's outcome is
    /// logged for operability and never affects the dispatch result.
    fn schedule_followup(&self, event: &NotificationEvent, recipient_ids: &[i64]) {
        if !matches!(event, NotificationEvent::TaskAssigned { .. }) || recipient_ids.is_empty() {
            return;
        }
        let Some(scheduler) = self.reminders.clone() else {
            return;
        };
        let directory = self.directory.clone();
        let event = event.clone();
        let ids = recipient_ids.to_vec();
        tokio::spawn(async move {
            let names = match directory.contacts_by_ids(&ids).await {
                Ok(contacts) => contacts
                    .into_iter()
                    .map(|c| c.display_name)
                    .filter(|n| !n.is_empty())
                    .collect::<Vec<_>>(),
                Err(e) => {
                    tracing::warn!("could not fetch assignee names for follow-up reminder: {e}");
                    Vec::new()
                }
            };
            match scheduler.schedule_followup(&event, &names).await {
                Ok(()) => tracing::debug!("follow-up reminder scheduled for {}", event.kind()),
                Err(e) => tracing::warn!("follow-up reminder scheduling failed: {e}"),
            }
        });
    }
}
