//! Contact resolution — which addresses and chat ids a set of users is
//! actually reachable on.
//!
//! A directory failure yields an empty list and a warning, never an error:
//! the dispatch facade must be able to proceed on the surviving channel.

use std::collections::HashSet;
use std::sync::Arc;

use courier_core::error::Result;
use courier_core::traits::Directory;
use courier_core::types::ContactRecord;

/// Resolves internal user ids (or a role) to per-channel recipient lists.
pub struct ContactResolver {
    directory: Arc<dyn Directory>,
}

impl ContactResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    pub async fn resolve_email(&self, user_ids: &[i64]) -> Vec<String> {
        email_addresses(&self.fetch(self.directory.contacts_by_ids(user_ids).await))
    }

    pub async fn resolve_chat(&self, user_ids: &[i64]) -> Vec<String> {
        chat_ids(&self.fetch(self.directory.contacts_by_ids(user_ids).await))
    }

    pub async fn resolve_email_by_role(&self, role: &str) -> Vec<String> {
        email_addresses(&self.fetch(self.directory.contacts_by_role(role).await))
    }

    pub async fn resolve_chat_by_role(&self, role: &str) -> Vec<String> {
        chat_ids(&self.fetch(self.directory.contacts_by_role(role).await))
    }

    fn fetch(&self, result: Result<Vec<ContactRecord>>) -> Vec<ContactRecord> {
        match result {
            Ok(contacts) => contacts,
            Err(e) => {
                tracing::warn!("directory lookup failed, treating as no recipients: {e}");
                Vec::new()
            }
        }
    }
}

/// Usable mail addresses: non-empty, de-duplicated, unordered.
pub fn email_addresses(contacts: &[ContactRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for contact in contacts {
        if let Some(email) = contact.email.as_deref() {
            let email = email.trim();
            if !email.is_empty() && seen.insert(email.to_string()) {
                out.push(email.to_string());
            }
        }
    }
    out
}

/// Usable chat ids: the notification flag must be on AND the id non-empty.
/// Both conditions are re-checked here even when the backing query already
/// filtered on the flag, to guard against stale or partial records.
pub fn chat_ids(contacts: &[ContactRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for contact in contacts {
        if !contact.chat_notifications_enabled {
            continue;
        }
        if let Some(chat_id) = contact.chat_id.as_deref() {
            let chat_id = chat_id.trim();
            if !chat_id.is_empty() && seen.insert(chat_id.to_string()) {
                out.push(chat_id.to_string());
            }
        }
    }
    out
}
