//! Template registry — pure event-to-message rendering.
//!
//! `render_email`/`render_chat` return `None` when an event has no template
//! on that channel family; callers treat that as "nothing to send", not a
//! fault. Rendering is plain string assembly, so no failure can escape it.
//!
//! Every interpolated payload field passes a "non-empty string or omit" rule:
//! blank values drop out of the rendered message instead of appearing as a
//! placeholder, and string lists are joined with ", " before interpolation.

use courier_core::types::{ActionButton, ChatMessage, NotificationEvent, RenderedEmail};

/// Registry of per-event message templates, constructed once with the portal
/// base URL used for inline action links.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    portal_url: Option<String>,
}

impl TemplateRegistry {
    pub fn new(portal_url: Option<String>) -> Self {
        Self { portal_url }
    }

    /// Render the mail form of an event. All event types carry a mail
    /// template.
    pub fn render_email(&self, event: &NotificationEvent) -> Option<RenderedEmail> {
        use NotificationEvent::*;
        let rendered = match event {
            TaskAssigned {
                title,
                assigner,
                priority,
                due_date,
                description,
                assignees,
            } => self.compose_email(
                subject_with("New task", title, "You have been assigned a new task"),
                "You have been assigned a new task.",
                &[
                    ("Task", opt(title)),
                    ("Assigned by", opt(assigner)),
                    ("Priority", opt(priority)),
                    ("Due", opt(due_date)),
                    ("Also assigned", joined(assignees)),
                    ("Details", opt(description)),
                ],
            ),
            TaskAssignedReminder {
                title,
                priority,
                due_date,
            } => self.compose_email(
                subject_with("Reminder", title, "Reminder: you have an open task"),
                "A task assigned to you is still open.",
                &[
                    ("Task", opt(title)),
                    ("Priority", opt(priority)),
                    ("Due", opt(due_date)),
                ],
            ),
            TaskStatusUpdate {
                title,
                status,
                changed_by,
                comment,
            } => self.compose_email(
                subject_with("Task update", title, "A task you follow was updated"),
                "A task you follow changed status.",
                &[
                    ("Task", opt(title)),
                    ("New status", opt(status)),
                    ("Changed by", opt(changed_by)),
                    ("Comment", opt(comment)),
                ],
            ),
            EventReminder {
                title,
                starts_at,
                location,
                organizer,
            } => self.compose_email(
                subject_with("Event reminder", title, "Upcoming event reminder"),
                "An event on your calendar is coming up.",
                &[
                    ("Event", opt(title)),
                    ("Starts", opt(starts_at)),
                    ("Location", opt(location)),
                    ("Organizer", opt(organizer)),
                ],
            ),
            ProjectAssigned {
                project,
                role,
                assigner,
                teammates,
            } => self.compose_email(
                subject_with("Project assignment", project, "You have been added to a project"),
                "You have been added to a project.",
                &[
                    ("Project", opt(project)),
                    ("Your role", opt(role)),
                    ("Added by", opt(assigner)),
                    ("Teammates", joined(teammates)),
                ],
            ),
            UserWelcome {
                display_name,
                username,
            } => self.compose_email(
                "Welcome to the portal".into(),
                "Your portal account is ready.",
                &[("Name", opt(display_name)), ("Login", opt(username))],
            ),
            PasswordReset {
                display_name,
                reset_link,
            } => self.compose_email(
                "Password reset".into(),
                "A password reset was requested for your account.",
                &[
                    ("Name", opt(display_name)),
                    ("Reset link", opt(reset_link)),
                ],
            ),
        };
        Some(rendered)
    }

    /// Render the chat form of an event. Account-lifecycle events are
    /// mail-only: a user without portal credentials cannot have a linked
    /// chat yet.
    pub fn render_chat(&self, event: &NotificationEvent) -> Option<ChatMessage> {
        use NotificationEvent::*;
        let message = match event {
            TaskAssigned {
                title,
                assigner,
                priority,
                due_date,
                description,
                assignees,
            } => self.compose_chat(
                "New task assigned",
                &[
                    ("Task", opt(title)),
                    ("Assigned by", opt(assigner)),
                    ("Priority", opt(priority)),
                    ("Due", opt(due_date)),
                    ("Also assigned", joined(assignees)),
                    ("Details", opt(description)),
                ],
                Some(("Open task", "tasks")),
            ),
            TaskAssignedReminder {
                title,
                priority,
                due_date,
            } => self.compose_chat(
                "Task reminder",
                &[
                    ("Task", opt(title)),
                    ("Priority", opt(priority)),
                    ("Due", opt(due_date)),
                ],
                Some(("Open task", "tasks")),
            ),
            TaskStatusUpdate {
                title,
                status,
                changed_by,
                comment,
            } => self.compose_chat(
                "Task updated",
                &[
                    ("Task", opt(title)),
                    ("New status", opt(status)),
                    ("Changed by", opt(changed_by)),
                    ("Comment", opt(comment)),
                ],
                Some(("Open task", "tasks")),
            ),
            EventReminder {
                title,
                starts_at,
                location,
                organizer,
            } => self.compose_chat(
                "Event reminder",
                &[
                    ("Event", opt(title)),
                    ("Starts", opt(starts_at)),
                    ("Location", opt(location)),
                    ("Organizer", opt(organizer)),
                ],
                Some(("View calendar", "calendar")),
            ),
            ProjectAssigned {
                project,
                role,
                assigner,
                teammates,
            } => self.compose_chat(
                "Added to a project",
                &[
                    ("Project", opt(project)),
                    ("Your role", opt(role)),
                    ("Added by", opt(assigner)),
                    ("Teammates", joined(teammates)),
                ],
                Some(("Open project", "projects")),
            ),
            UserWelcome { .. } | PasswordReset { .. } => return None,
        };
        Some(message)
    }

    /// Whether the chat channel has a template for this event type. Used by
    /// role dispatch to skip chat resolution entirely.
    pub fn chat_supports(&self, event: &NotificationEvent) -> bool {
        use NotificationEvent::*;
        !matches!(event, UserWelcome { .. } | PasswordReset { .. })
    }

    fn compose_email(
        &self,
        subject: String,
        heading: &str,
        fields: &[(&str, Option<String>)],
    ) -> RenderedEmail {
        let mut text = String::from(heading);
        let mut html = format!("<p><strong>{}</strong></p>\n<ul>\n", escape_html(heading));
        for (label, value) in fields {
            let Some(value) = value else { continue };
            text.push_str(&format!("\n{label}: {value}"));
            html.push_str(&format!(
                "  <li><strong>{}:</strong> {}</li>\n",
                escape_html(label),
                escape_html(value)
            ));
        }
        html.push_str("</ul>\n");
        if let Some(base) = &self.portal_url {
            text.push_str(&format!("\n\nOpen the portal: {base}"));
            html.push_str(&format!(
                "<p><a href=\"{}\">Open the portal</a></p>\n",
                escape_html(base)
            ));
        }
        RenderedEmail {
            subject,
            html,
            text,
        }
    }

    fn compose_chat(
        &self,
        heading: &str,
        fields: &[(&str, Option<String>)],
        action: Option<(&str, &str)>,
    ) -> ChatMessage {
        let mut text = format!("<b>{}</b>", escape_html(heading));
        for (label, value) in fields {
            let Some(value) = value else { continue };
            text.push_str(&format!(
                "\n{}: {}",
                escape_html(label),
                escape_html(value)
            ));
        }
        let action = action.and_then(|(label, path)| self.portal_link(label, path));
        ChatMessage {
            text,
            parse_mode: Some("HTML".into()),
            action,
        }
    }

    fn portal_link(&self, label: &str, path: &str) -> Option<ActionButton> {
        self.portal_url.as_ref().map(|base| ActionButton {
            label: label.into(),
            url: format!("{}/{path}", base.trim_end_matches('/')),
        })
    }
}

fn subject_with(prefix: &str, value: &Option<String>, fallback: &str) -> String {
    match opt(value) {
        Some(v) => format!("{prefix}: {v}"),
        None => fallback.to_string(),
    }
}

/// "Non-empty string or omit": trims the value and drops blanks.
fn opt(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Join a string list with ", ", omitting blanks; an empty list is omitted
/// entirely.
fn joined(values: &[String]) -> Option<String> {
    let parts: Vec<&str> = values
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
