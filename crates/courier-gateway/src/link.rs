//! Account linking — binds an inbound chat session to a portal user.
//!
//! Two paths: an explicit `/start <token>` redemption, and a passive fallback
//! that matches the sender's platform username against a stored handle. Every
//! outcome, success or failure, is reported to the user as a chat message;
//! nothing here surfaces an error to the webhook caller.

use std::sync::Arc;

use chrono::Utc;
use courier_core::traits::{ChatChannel, Directory, LinkTokenStore};
use courier_core::types::ChatMessage;

use crate::update::classify_update;

const REPLY_TOKEN_INVALID: &str =
    "This link is invalid. Ask an administrator for a new one.";
const REPLY_TOKEN_CONSUMED: &str = "This link has already been used.";
const REPLY_TOKEN_EXPIRED: &str =
    "This link has expired. Ask an administrator for a new one.";
const REPLY_LINK_FAILED: &str = "Linking failed, please try again.";
const REPLY_USERNAME_MISSING: &str =
    "Your chat profile has no username. Set one in your messaging app, or ask an administrator for a link.";
const REPLY_USERNAME_INVALID: &str =
    "That username cannot be matched: usernames use letters, digits, and underscores, at least 5 characters.";
const REPLY_USERNAME_UNMATCHED: &str =
    "No portal account matches your username. Ask an administrator for a link.";

/// Terminal state of one inbound update. Success acknowledgment to the
/// platform is unconditional; this is for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    /// A chat session was bound to this portal user.
    Linked { user_id: i64 },
    TokenInvalid,
    TokenConsumed,
    TokenExpired,
    /// Token or directory write failed; user was told to retry.
    LinkFailed,
    UsernameMissing,
    UsernameInvalid,
    UsernameUnmatched,
    /// Update carried no usable chat or sender; nothing was done.
    Ignored,
}

/// Handles inbound chat-platform updates against the directory and the
/// link-token store. Constructed once and shared by the webhook routes.
pub struct LinkService {
    directory: Arc<dyn Directory>,
    tokens: Arc<dyn LinkTokenStore>,
    chat: Option<Arc<dyn ChatChannel>>,
}

impl LinkService {
    pub fn new(
        directory: Arc<dyn Directory>,
        tokens: Arc<dyn LinkTokenStore>,
        chat: Option<Arc<dyn ChatChannel>>,
    ) -> Self {
        Self {
            directory,
            tokens,
            chat,
        }
    }

    /// Process one raw webhook update to a terminal outcome.
    pub async fn handle_update(&self, update: &serde_json::Value) -> LinkOutcome {
        let Some(inbound) = classify_update(update) else {
            return LinkOutcome::Ignored;
        };
        let outcome = match start_token(&inbound.text) {
            Some(token) => {
                self.redeem_token(token, &inbound.chat_id, inbound.username.as_deref())
                    .await
            }
            None => {
                self.link_by_username(&inbound.chat_id, inbound.username.as_deref())
                    .await
            }
        };
        tracing::info!("link update for chat {} -> {:?}", inbound.chat_id, outcome);
        outcome
    }

    /// Explicit linking: redeem a single-use token.
    async fn redeem_token(
        &self,
        token: &str,
        chat_id: &str,
        username: Option<&str>,
    ) -> LinkOutcome {
        let record = match self.tokens.find_by_token(token).await {
            Ok(Some(record)) => record,
            Ok(None) => return self.reply(chat_id, REPLY_TOKEN_INVALID, LinkOutcome::TokenInvalid).await,
            Err(e) => {
                tracing::warn!("token lookup failed: {e}");
                return self.reply(chat_id, REPLY_LINK_FAILED, LinkOutcome::LinkFailed).await;
            }
        };

        if record.consumed_at.is_some() {
            return self.reply(chat_id, REPLY_TOKEN_CONSUMED, LinkOutcome::TokenConsumed).await;
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at < Utc::now() {
                return self.reply(chat_id, REPLY_TOKEN_EXPIRED, LinkOutcome::TokenExpired).await;
            }
        }

        let now = Utc::now();
        match self.tokens.consume(token, chat_id, now).await {
            // A concurrent redemption got there first.
            Ok(false) => {
                return self.reply(chat_id, REPLY_TOKEN_CONSUMED, LinkOutcome::TokenConsumed).await;
            }
            Err(e) => {
                tracing::warn!("token consume failed: {e}");
                return self.reply(chat_id, REPLY_LINK_FAILED, LinkOutcome::LinkFailed).await;
            }
            Ok(true) => {}
        }

        let username = username.map(sanitize_username).filter(|u| !u.is_empty());
        if let Err(e) = self
            .directory
            .link_chat(record.owner_user_id, chat_id, username.as_deref(), now)
            .await
        {
            tracing::warn!("directory update after token consume failed: {e}");
            return self.reply(chat_id, REPLY_LINK_FAILED, LinkOutcome::LinkFailed).await;
        }

        let display_name = match self.directory.contacts_by_ids(&[record.owner_user_id]).await {
            Ok(contacts) => contacts
                .into_iter()
                .next()
                .map(|c| c.display_name)
                .unwrap_or_default(),
            Err(_) => String::new(),
        };
        self.confirm(chat_id, &display_name, record.owner_user_id).await
    }

    /// Passive fallback: match the sender's username against a stored handle.
    async fn link_by_username(&self, chat_id: &str, username: Option<&str>) -> LinkOutcome {
        let username = username.map(sanitize_username).unwrap_or_default();
        if username.is_empty() {
            return self.reply(chat_id, REPLY_USERNAME_MISSING, LinkOutcome::UsernameMissing).await;
        }
        if !is_valid_username(&username) {
            return self.reply(chat_id, REPLY_USERNAME_INVALID, LinkOutcome::UsernameInvalid).await;
        }

        let contact = match self.directory.find_by_chat_username(&username).await {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                return self
                    .reply(chat_id, REPLY_USERNAME_UNMATCHED, LinkOutcome::UsernameUnmatched)
                    .await;
            }
            Err(e) => {
                tracing::warn!("username lookup failed: {e}");
                return self.reply(chat_id, REPLY_LINK_FAILED, LinkOutcome::LinkFailed).await;
            }
        };

        if let Err(e) = self
            .directory
            .link_chat(contact.user_id, chat_id, Some(&username), Utc::now())
            .await
        {
            tracing::warn!("directory update for username link failed: {e}");
            return self.reply(chat_id, REPLY_LINK_FAILED, LinkOutcome::LinkFailed).await;
        }
        self.confirm(chat_id, &contact.display_name, contact.user_id).await
    }

    async fn confirm(&self, chat_id: &str, display_name: &str, user_id: i64) -> LinkOutcome {
        let text = if display_name.is_empty() {
            "Your chat is now linked to your portal account. Notifications will arrive here.".to_string()
        } else {
            format!(
                "Hi {display_name}! Your chat is now linked to your portal account. Notifications will arrive here."
            )
        };
        self.reply(chat_id, &text, LinkOutcome::Linked { user_id }).await
    }

    /// Best-effort reply. A failed reply never changes the outcome.
    async fn reply(&self, chat_id: &str, text: &str, outcome: LinkOutcome) -> LinkOutcome {
        if let Some(chat) = &self.chat {
            let message = ChatMessage {
                text: text.to_string(),
                parse_mode: None,
                action: None,
            };
            if let Err(e) = chat.send(chat_id, &message).await {
                tracing::warn!("link reply to chat {chat_id} failed: {e}");
            }
        }
        outcome
    }
}

/// Token from a `/start <token>` command, if the text is one.
fn start_token(text: &str) -> Option<&str> {
    let rest = text.trim().strip_prefix("/start")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let token = rest.trim();
    (!token.is_empty()).then_some(token)
}

/// Strip a leading `@` and surrounding whitespace.
pub fn sanitize_username(raw: &str) -> String {
    raw.trim().trim_start_matches('@').trim().to_string()
}

/// Letters, digits, underscore; at least 5 characters.
pub fn is_valid_username(username: &str) -> bool {
    username.len() >= 5
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use courier_core::error::{CourierError, Result};
    use courier_core::types::{ContactRecord, LinkToken};
    use serde_json::json;
    use std::sync::Mutex;

    struct DirectoryDouble {
        contacts: Mutex<Vec<ContactRecord>>,
        fail_writes: bool,
    }

    impl DirectoryDouble {
        fn new(contacts: Vec<ContactRecord>) -> Self {
            Self {
                contacts: Mutex::new(contacts),
                fail_writes: false,
            }
        }

        fn get(&self, user_id: i64) -> Option<ContactRecord> {
            self.contacts
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.user_id == user_id)
                .cloned()
        }
    }

    #[async_trait]
    impl Directory for DirectoryDouble {
        async fn contacts_by_ids(&self, user_ids: &[i64]) -> Result<Vec<ContactRecord>> {
            Ok(self
                .contacts
                .lock()
                .unwrap()
                .iter()
                .filter(|c| user_ids.contains(&c.user_id))
                .cloned()
                .collect())
        }
        async fn contacts_by_role(&self, _role: &str) -> Result<Vec<ContactRecord>> {
            Ok(Vec::new())
        }
        async fn find_by_chat_username(&self, username: &str) -> Result<Option<ContactRecord>> {
            Ok(self
                .contacts
                .lock()
                .unwrap()
                .iter()
                .find(|c| {
                    c.chat_username
                        .as_deref()
                        .map(|u| u.trim_start_matches('@'))
                        == Some(username)
                })
                .cloned())
        }
        async fn link_chat(
            &self,
            user_id: i64,
            chat_id: &str,
            username: Option<&str>,
            now: DateTime<Utc>,
        ) -> Result<()> {
            if self.fail_writes {
                return Err(CourierError::Directory("write refused".into()));
            }
            let mut contacts = self.contacts.lock().unwrap();
            let contact = contacts
                .iter_mut()
                .find(|c| c.user_id == user_id)
                .ok_or_else(|| CourierError::Directory("no such user".into()))?;
            contact.chat_id = Some(chat_id.to_string());
            contact.chat_notifications_enabled = true;
            if let Some(username) = username {
                contact.chat_username = Some(username.to_string());
            }
            contact.chat_linked_at = Some(now);
            Ok(())
        }
    }

    struct TokenStoreDouble {
        tokens: Mutex<Vec<LinkToken>>,
    }

    #[async_trait]
    impl LinkTokenStore for TokenStoreDouble {
        async fn find_by_token(&self, token: &str) -> Result<Option<LinkToken>> {
            Ok(self
                .tokens
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.token == token)
                .cloned())
        }
        async fn consume(&self, token: &str, chat_id: &str, now: DateTime<Utc>) -> Result<bool> {
            let mut tokens = self.tokens.lock().unwrap();
            match tokens
                .iter_mut()
                .find(|t| t.token == token && t.consumed_at.is_none())
            {
                Some(t) => {
                    t.consumed_at = Some(now);
                    t.last_used_at = Some(now);
                    t.chat_id = Some(chat_id.to_string());
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    struct ReplyRecorder {
        replies: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatChannel for ReplyRecorder {
        async fn send(&self, chat_id: &str, message: &ChatMessage) -> Result<()> {
            self.replies
                .lock()
                .unwrap()
                .push((chat_id.to_string(), message.text.clone()));
            Ok(())
        }
    }

    fn contact(user_id: i64, name: &str, username: Option<&str>) -> ContactRecord {
        ContactRecord {
            user_id,
            display_name: name.into(),
            chat_username: username.map(String::from),
            ..Default::default()
        }
    }

    fn token(value: &str, owner: i64, expires_at: Option<DateTime<Utc>>) -> LinkToken {
        LinkToken {
            id: format!("id-{value}"),
            owner_user_id: owner,
            token: value.into(),
            expires_at,
            consumed_at: None,
            chat_id: None,
            last_used_at: None,
        }
    }

    struct Fixture {
        service: LinkService,
        directory: Arc<DirectoryDouble>,
        tokens: Arc<TokenStoreDouble>,
        replies: Arc<ReplyRecorder>,
    }

    fn fixture(contacts: Vec<ContactRecord>, tokens: Vec<LinkToken>) -> Fixture {
        fixture_with(DirectoryDouble::new(contacts), tokens)
    }

    fn fixture_with(directory: DirectoryDouble, tokens: Vec<LinkToken>) -> Fixture {
        let directory = Arc::new(directory);
        let tokens = Arc::new(TokenStoreDouble {
            tokens: Mutex::new(tokens),
        });
        let replies = Arc::new(ReplyRecorder {
            replies: Mutex::new(Vec::new()),
        });
        Fixture {
            service: LinkService::new(directory.clone(), tokens.clone(), Some(replies.clone())),
            directory,
            tokens,
            replies,
        }
    }

    fn start_update(chat_id: i64, username: Option<&str>, text: &str) -> serde_json::Value {
        let mut from = json!({"id": chat_id});
        if let Some(u) = username {
            from["username"] = json!(u);
        }
        json!({"message": {"chat": {"id": chat_id}, "from": from, "text": text}})
    }

    fn last_reply(f: &Fixture) -> String {
        f.replies.replies.lock().unwrap().last().unwrap().1.clone()
    }

    #[tokio::test]
    async fn test_valid_token_links_and_confirms_by_name() {
        let f = fixture(
            vec![contact(7, "Kim Dao", None)],
            vec![token("tok123", 7, Some(Utc::now() + Duration::hours(1)))],
        );

        let outcome = f
            .service
            .handle_update(&start_update(555001, Some("kim_dao"), "/start tok123"))
            .await;

        assert_eq!(outcome, LinkOutcome::Linked { user_id: 7 });
        let linked = f.directory.get(7).unwrap();
        assert_eq!(linked.chat_id.as_deref(), Some("555001"));
        assert!(linked.chat_notifications_enabled);
        assert_eq!(linked.chat_username.as_deref(), Some("kim_dao"));
        assert!(linked.chat_linked_at.is_some());
        assert!(last_reply(&f).contains("Kim Dao"));
    }

    #[tokio::test]
    async fn test_second_redemption_is_rejected_without_mutation() {
        let f = fixture(
            vec![contact(7, "Kim Dao", None), contact(8, "An Tran", None)],
            vec![token("tok123", 7, None)],
        );

        let first = f
            .service
            .handle_update(&start_update(555001, None, "/start tok123"))
            .await;
        assert_eq!(first, LinkOutcome::Linked { user_id: 7 });

        // Replay from another chat: token state and directory must not move.
        let second = f
            .service
            .handle_update(&start_update(666002, None, "/start tok123"))
            .await;
        assert_eq!(second, LinkOutcome::TokenConsumed);

        let stored = f.tokens.tokens.lock().unwrap()[0].clone();
        assert_eq!(stored.chat_id.as_deref(), Some("555001"));
        assert_eq!(f.directory.get(7).unwrap().chat_id.as_deref(), Some("555001"));
        assert!(last_reply(&f).contains("already been used"));
    }

    #[tokio::test]
    async fn test_expired_token_never_mutates() {
        let f = fixture(
            vec![contact(7, "Kim Dao", None)],
            vec![token("tok123", 7, Some(Utc::now() - Duration::hours(1)))],
        );

        let outcome = f
            .service
            .handle_update(&start_update(555001, None, "/start tok123"))
            .await;

        assert_eq!(outcome, LinkOutcome::TokenExpired);
        let stored = f.tokens.tokens.lock().unwrap()[0].clone();
        assert!(stored.consumed_at.is_none());
        assert!(stored.chat_id.is_none());
        assert!(f.directory.get(7).unwrap().chat_id.is_none());
        assert!(last_reply(&f).contains("expired"));
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let f = fixture(vec![contact(7, "Kim Dao", None)], vec![]);
        let outcome = f
            .service
            .handle_update(&start_update(555001, None, "/start nope"))
            .await;
        assert_eq!(outcome, LinkOutcome::TokenInvalid);
        assert!(last_reply(&f).contains("invalid"));
    }

    #[tokio::test]
    async fn test_directory_write_failure_reports_generic_failure() {
        let mut directory = DirectoryDouble::new(vec![contact(7, "Kim Dao", None)]);
        directory.fail_writes = true;
        let f = fixture_with(directory, vec![token("tok123", 7, None)]);

        let outcome = f
            .service
            .handle_update(&start_update(555001, None, "/start tok123"))
            .await;

        assert_eq!(outcome, LinkOutcome::LinkFailed);
        assert!(last_reply(&f).contains("try again"));
    }

    #[tokio::test]
    async fn test_passive_username_match_links() {
        let f = fixture(vec![contact(9, "An Tran", Some("@an_tran_99"))], vec![]);

        let outcome = f
            .service
            .handle_update(&start_update(666002, Some("an_tran_99"), "hello"))
            .await;

        assert_eq!(outcome, LinkOutcome::Linked { user_id: 9 });
        let linked = f.directory.get(9).unwrap();
        assert_eq!(linked.chat_id.as_deref(), Some("666002"));
        assert!(linked.chat_notifications_enabled);
        assert!(last_reply(&f).contains("An Tran"));
    }

    #[tokio::test]
    async fn test_username_match_is_case_sensitive() {
        let f = fixture(vec![contact(9, "An Tran", Some("an_tran_99"))], vec![]);

        let outcome = f
            .service
            .handle_update(&start_update(666002, Some("An_Tran_99"), "hello"))
            .await;

        assert_eq!(outcome, LinkOutcome::UsernameUnmatched);
        assert!(f.directory.get(9).unwrap().chat_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_username_gets_instructions() {
        let f = fixture(vec![contact(9, "An Tran", Some("an_tran_99"))], vec![]);
        let outcome = f.service.handle_update(&start_update(666002, None, "hi")).await;
        assert_eq!(outcome, LinkOutcome::UsernameMissing);
        assert!(last_reply(&f).contains("no username"));
    }

    #[tokio::test]
    async fn test_invalid_username_skips_directory_lookup() {
        let f = fixture(vec![contact(9, "An Tran", Some("a!b"))], vec![]);

        assert_eq!(
            f.service.handle_update(&start_update(666002, Some("a!b"), "hi")).await,
            LinkOutcome::UsernameInvalid
        );
        assert_eq!(
            f.service.handle_update(&start_update(666002, Some("abcd"), "hi")).await,
            LinkOutcome::UsernameInvalid
        );
        assert!(f.directory.get(9).unwrap().chat_id.is_none());
    }

    #[tokio::test]
    async fn test_bare_start_falls_back_to_username_path() {
        let f = fixture(vec![contact(9, "An Tran", Some("an_tran_99"))], vec![]);
        let outcome = f
            .service
            .handle_update(&start_update(666002, Some("an_tran_99"), "/start"))
            .await;
        assert_eq!(outcome, LinkOutcome::Linked { user_id: 9 });
    }

    #[tokio::test]
    async fn test_unclassifiable_update_is_ignored_silently() {
        let f = fixture(vec![], vec![]);
        let outcome = f.service.handle_update(&json!({"poll": {"id": "1"}})).await;
        assert_eq!(outcome, LinkOutcome::Ignored);
        assert!(f.replies.replies.lock().unwrap().is_empty());
    }

    #[test]
    fn test_start_token_parsing() {
        assert_eq!(start_token("/start abc123"), Some("abc123"));
        assert_eq!(start_token("  /start   abc123  "), Some("abc123"));
        assert_eq!(start_token("/start"), None);
        assert_eq!(start_token("/startabc"), None);
        assert_eq!(start_token("hello"), None);
    }

    #[test]
    fn test_username_sanitize_and_validity() {
        assert_eq!(sanitize_username(" @kim_dao "), "kim_dao");
        assert_eq!(sanitize_username("kim_dao"), "kim_dao");
        assert!(is_valid_username("kim_dao"));
        assert!(is_valid_username("abc12"));
        assert!(!is_valid_username("abcd"));
        assert!(!is_valid_username("kim dao"));
        assert!(!is_valid_username("kim-dao"));
    }
}
