use parley_core::ConversationId;

/// Emitted when sidebar selection changes the active conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationSelected {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationDeleted {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewChatRequested;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThemeToggled;

/// Emitted when the user sends text, either typed or picked from a suggestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submit {
    pub content: String,
}

impl Submit {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}
