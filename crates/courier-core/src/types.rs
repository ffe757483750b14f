//! Courier domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A business event to notify internal users about.
///
/// One variant per event type, each with explicitly optional payload fields.
/// Templates tolerate any subset of fields being `None`: a missing field is
/// omitted from the rendered message, never rendered as a placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    TaskAssigned {
        title: Option<String>,
        assigner: Option<String>,
        priority: Option<String>,
        due_date: Option<String>,
        description: Option<String>,
        #[serde(default)]
        assignees: Vec<String>,
    },
    TaskAssignedReminder {
        title: Option<String>,
        priority: Option<String>,
        due_date: Option<String>,
    },
    TaskStatusUpdate {
        title: Option<String>,
        status: Option<String>,
        changed_by: Option<String>,
        comment: Option<String>,
    },
    EventReminder {
        title: Option<String>,
        starts_at: Option<String>,
        location: Option<String>,
        organizer: Option<String>,
    },
    ProjectAssigned {
        project: Option<String>,
        role: Option<String>,
        assigner: Option<String>,
        #[serde(default)]
        teammates: Vec<String>,
    },
    UserWelcome {
        display_name: Option<String>,
        username: Option<String>,
    },
    PasswordReset {
        display_name: Option<String>,
        reset_link: Option<String>,
    },
}

impl NotificationEvent {
    /// Stable snake_case event name, used in logs and the delivery log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskAssigned { .. } => "task_assigned",
            Self::TaskAssignedReminder { .. } => "task_assigned_reminder",
            Self::TaskStatusUpdate { .. } => "task_status_update",
            Self::EventReminder { .. } => "event_reminder",
            Self::ProjectAssigned { .. } => "project_assigned",
            Self::UserWelcome { .. } => "user_welcome",
            Self::PasswordReset { .. } => "password_reset",
        }
    }

    /// JSON copy of the full event, kept on delivery-log rows for audit.
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A directory row for one internal user, as seen by this subsystem.
///
/// Owned by the directory collaborator; Courier reads all fields and writes
/// only the chat-link fields (`chat_id`, `chat_username`,
/// `chat_notifications_enabled`, `chat_linked_at`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactRecord {
    pub user_id: i64,
    pub display_name: String,
    pub role: String,
    pub email: Option<String>,
    /// Opaque platform identifier. Stored as a string even though the
    /// originating platform uses numeric ids.
    pub chat_id: Option<String>,
    #[serde(default)]
    pub chat_notifications_enabled: bool,
    /// Sanitized handle, no leading `@`.
    pub chat_username: Option<String>,
    pub chat_linked_at: Option<DateTime<Utc>>,
}

/// Single-use credential binding an external chat session to a portal user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkToken {
    pub id: String,
    pub owner_user_id: i64,
    pub token: String,
    /// Absent means the token never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
    /// Set on consumption.
    pub chat_id: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Append-only audit record for one dispatch attempt on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub event_kind: String,
    /// "email" or "chat".
    pub channel: String,
    /// Addresses or chat ids actually targeted.
    pub recipients: Vec<String>,
    pub rendered_text: String,
    pub sent_at: DateTime<Utc>,
    pub successful_count: usize,
    pub failed_count: usize,
    pub payload: serde_json::Value,
}

/// A rendered email, ready for one SMTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Single inline action button (label + URL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionButton {
    pub label: String,
    pub url: String,
}

/// A rendered chat message, ready for one send-message call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub text: String,
    pub parse_mode: Option<String>,
    pub action: Option<ActionButton>,
}

/// Aggregate result of a multi-recipient chat fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FanoutOutcome {
    pub successful: usize,
    pub failed: usize,
}

impl FanoutOutcome {
    pub fn any_success(&self) -> bool {
        self.successful > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_names() {
        let ev = NotificationEvent::TaskAssigned {
            title: Some("Quarterly report".into()),
            assigner: None,
            priority: None,
            due_date: None,
            description: None,
            assignees: vec![],
        };
        assert_eq!(ev.kind(), "task_assigned");

        let ev = NotificationEvent::PasswordReset {
            display_name: None,
            reset_link: None,
        };
        assert_eq!(ev.kind(), "password_reset");
    }

    #[test]
    fn test_payload_json_carries_tag() {
        let ev = NotificationEvent::EventReminder {
            title: Some("All hands".into()),
            starts_at: None,
            location: None,
            organizer: None,
        };
        let json = ev.payload_json();
        assert_eq!(json["event"], "event_reminder");
        assert_eq!(json["title"], "All hands");
    }

    #[test]
    fn test_event_deserializes_with_missing_fields() {
        let ev: NotificationEvent =
            serde_json::from_value(serde_json::json!({"event": "task_assigned"})).unwrap();
        match ev {
            NotificationEvent::TaskAssigned {
                title, assignees, ..
            } => {
                assert!(title.is_none());
                assert!(assignees.is_empty());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
