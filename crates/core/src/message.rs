use parley_llm::{ProviderMessage, Role};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId};

pub const NEW_CHAT_TITLE: &str = "New Chat";

const TITLE_PREVIEW_LIMIT: usize = 30;
const TITLE_PREVIEW_KEEP: usize = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    // Older saves wrote the remote role name.
    #[serde(alias = "model")]
    Assistant,
}

impl Sender {
    pub fn role(self) -> Role {
        match self {
            Self::User => Role::User,
            Self::Assistant => Role::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub text: String,
    /// Set on replies whose request failed; the text is then a fixed notice.
    #[serde(default, skip_serializing_if = "is_false")]
    pub failed: bool,
}

impl Message {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            sender,
            text: text.into(),
            failed: false,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Sender::Assistant, text)
    }

    pub fn to_provider_message(&self) -> ProviderMessage {
        ProviderMessage::new(self.sender.role(), self.text.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: ConversationId::new_v7(),
            title: title.into(),
            messages: Vec::new(),
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Ordered conversations, newest first, plus the current selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppState {
    pub conversations: Vec<Conversation>,
    pub active_conversation_id: Option<ConversationId>,
}

impl AppState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, conversation_id: ConversationId) -> bool {
        self.conversations
            .iter()
            .any(|conversation| conversation.id == conversation_id)
    }

    pub fn front_id(&self) -> Option<ConversationId> {
        self.conversations.first().map(|conversation| conversation.id)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Placeholder title for a conversation opened by its first message.
pub fn preview_title(text: &str) -> String {
    if text.chars().count() > TITLE_PREVIEW_LIMIT {
        let kept = text.chars().take(TITLE_PREVIEW_KEEP).collect::<String>();
        format!("{kept}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_title_truncates_long_text() {
        assert_eq!(preview_title("short question"), "short question");
        assert_eq!(preview_title(&"a".repeat(30)), "a".repeat(30));
        assert_eq!(preview_title(&"b".repeat(31)), format!("{}...", "b".repeat(27)));
    }

    #[test]
    fn preview_title_counts_characters_not_bytes() {
        let text = "Giải thích về điện toán lượng tử một cách đơn giản";
        let title = preview_title(text);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), 30);
    }

    #[test]
    fn legacy_model_sender_reads_as_assistant() {
        let message: Message = serde_json::from_str(
            r#"{"id":"00000000-0000-0000-0000-000000000001","sender":"model","text":"hi"}"#,
        )
        .unwrap();
        assert_eq!(message.sender, Sender::Assistant);

        let encoded = serde_json::to_string(&message).unwrap();
        assert!(encoded.contains(r#""sender":"assistant""#));
        assert!(!encoded.contains("failed"));
    }

    #[test]
    fn failure_flag_round_trips() {
        let mut message = Message::assistant("Error: Could not get a response from the model.");
        message.failed = true;

        let decoded: Message =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();

        assert!(decoded.failed);
        assert!(!Message::assistant("plain").failed);
    }
}
