use super::provider::{ProviderMessage, Role, StreamRequest, StreamTarget};

/// Remote chat session scoped to exactly one exchange.
///
/// A session is seeded with the target conversation's prior turns and consumed
/// by [`ChatSession::into_request`], so no session state outlives its exchange
/// or leaks into another conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    target: StreamTarget,
    model_id: String,
    history: Vec<ProviderMessage>,
}

impl ChatSession {
    pub fn seeded(
        target: StreamTarget,
        model_id: impl Into<String>,
        history: impl IntoIterator<Item = ProviderMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            history: history.into_iter().collect(),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub fn history(&self) -> &[ProviderMessage] {
        &self.history
    }

    pub fn into_request(self, message: impl Into<String>) -> StreamRequest {
        let mut messages = self.history;
        messages.push(ProviderMessage::new(Role::User, message));

        StreamRequest::new(self.target, self.model_id, messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_appends_new_message_after_seeded_history() {
        let target = StreamTarget::new(1, 3);
        let session = ChatSession::seeded(
            target,
            "gemini-2.5-flash",
            [
                ProviderMessage::new(Role::User, "hi"),
                ProviderMessage::new(Role::Assistant, "hello"),
            ],
        );

        let request = session.into_request("how are you?");

        assert_eq!(request.target, target);
        assert_eq!(request.model_id, "gemini-2.5-flash");
        assert_eq!(
            request.messages,
            vec![
                ProviderMessage::new(Role::User, "hi"),
                ProviderMessage::new(Role::Assistant, "hello"),
                ProviderMessage::new(Role::User, "how are you?"),
            ]
        );
    }

    #[test]
    fn empty_history_yields_single_turn_request() {
        let session = ChatSession::seeded(StreamTarget::new(9, 1), "m", Vec::new());
        assert!(session.history().is_empty());

        let request = session.into_request("first");
        assert_eq!(request.messages, vec![ProviderMessage::new(Role::User, "first")]);
    }
}
