//! Inbound update classification.
//!
//! The chat platform delivers webhook updates in three shapes: a new message,
//! an edited message, or a callback query. All three reduce to the same
//! triple for linking purposes; anything else is ignored.

/// The parts of an inbound update the linking handler acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundUpdate {
    pub chat_id: String,
    pub username: Option<String>,
    pub text: String,
}

/// Extract `(chat_id, username, text)` from a raw update. Returns `None` when
/// no chat or sender can be found; the webhook acknowledges such updates
/// without acting on them.
pub fn classify_update(update: &serde_json::Value) -> Option<InboundUpdate> {
    let (chat, from, text) = if let Some(msg) = update
        .get("message")
        .or_else(|| update.get("edited_message"))
    {
        (msg.get("chat"), msg.get("from"), msg.get("text"))
    } else if let Some(query) = update.get("callback_query") {
        // A callback query nests the chat under the message it was attached
        // to; the tapped button's payload stands in for message text.
        (
            query.pointer("/message/chat"),
            query.get("from"),
            query.get("data"),
        )
    } else {
        return None;
    };

    // The platform sends numeric chat ids; tolerate strings too.
    let chat_id = match chat?.get("id")? {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => return None,
    };
    let username = from
        .and_then(|f| f.get("username"))
        .and_then(|u| u.as_str())
        .map(String::from);
    let text = text.and_then(|t| t.as_str()).unwrap_or("").to_string();

    Some(InboundUpdate {
        chat_id,
        username,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_new_message() {
        let update = json!({
            "update_id": 900001,
            "message": {
                "message_id": 17,
                "chat": {"id": 555001, "type": "private"},
                "from": {"id": 555001, "username": "kim_dao"},
                "text": "/start abc123"
            }
        });
        let inbound = classify_update(&update).unwrap();
        assert_eq!(inbound.chat_id, "555001");
        assert_eq!(inbound.username.as_deref(), Some("kim_dao"));
        assert_eq!(inbound.text, "/start abc123");
    }

    #[test]
    fn test_classify_edited_message() {
        let update = json!({
            "edited_message": {
                "chat": {"id": 555001},
                "from": {"username": "kim_dao"},
                "text": "hello again"
            }
        });
        let inbound = classify_update(&update).unwrap();
        assert_eq!(inbound.chat_id, "555001");
        assert_eq!(inbound.text, "hello again");
    }

    #[test]
    fn test_classify_callback_query() {
        let update = json!({
            "callback_query": {
                "id": "4382",
                "from": {"id": 555001, "username": "kim_dao"},
                "message": {"chat": {"id": 555001}},
                "data": "confirm"
            }
        });
        let inbound = classify_update(&update).unwrap();
        assert_eq!(inbound.chat_id, "555001");
        assert_eq!(inbound.text, "confirm");
    }

    #[test]
    fn test_classify_without_username_or_text() {
        let update = json!({
            "message": {"chat": {"id": 555001}, "from": {"id": 555001}}
        });
        let inbound = classify_update(&update).unwrap();
        assert!(inbound.username.is_none());
        assert_eq!(inbound.text, "");
    }

    #[test]
    fn test_unclassifiable_updates_yield_none() {
        assert!(classify_update(&json!({"channel_post": {"text": "hi"}})).is_none());
        assert!(classify_update(&json!({"message": {"text": "no chat"}})).is_none());
        assert!(classify_update(&json!({})).is_none());
        assert!(classify_update(&json!(null)).is_none());
    }

    #[test]
    fn test_string_chat_id_is_accepted() {
        let update = json!({
            "message": {"chat": {"id": "group-77"}, "text": "hi"}
        });
        assert_eq!(classify_update(&update).unwrap().chat_id, "group-77");
    }
}
