use crate::error::{NotFoundSnafu, StoreResult};
use crate::ids::ConversationId;
use crate::message::{AppState, Conversation, Message};
use crate::persistence::PersistenceAdapter;

/// How a streamed message lands in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageUpdate {
    Append(Message),
    ReplaceLast(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageUpdateKind {
    Appended,
    Replaced,
}

impl MessageUpdate {
    /// Replaces the trailing message when it carries the same id, appends otherwise.
    pub fn resolve(conversation: &Conversation, message: Message) -> Self {
        match conversation.last_message() {
            Some(last) if last.id == message.id => Self::ReplaceLast(message),
            _ => Self::Append(message),
        }
    }

    pub fn kind(&self) -> MessageUpdateKind {
        match self {
            Self::Append(_) => MessageUpdateKind::Appended,
            Self::ReplaceLast(_) => MessageUpdateKind::Replaced,
        }
    }
}

/// Owner of [`AppState`]. Every mutation is mirrored to persistence when attached.
pub struct ConversationStore {
    state: AppState,
    persistence: Option<PersistenceAdapter>,
}

impl ConversationStore {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            persistence: None,
        }
    }

    pub fn load(persistence: PersistenceAdapter) -> Self {
        let state = persistence.load();
        Self {
            state,
            persistence: Some(persistence),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.state.conversations
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<&Conversation> {
        self.state
            .conversations
            .iter()
            .find(|conversation| conversation.id == conversation_id)
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.state.active_conversation_id
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active_conversation_id()
            .and_then(|conversation_id| self.conversation(conversation_id))
    }

    pub fn create_conversation(&mut self, title: impl Into<String>) -> ConversationId {
        let conversation = Conversation::new(title);
        let conversation_id = conversation.id;
        self.state.conversations.insert(0, conversation);
        self.state.active_conversation_id = Some(conversation_id);
        self.persist();

        tracing::debug!(conversation_id = %conversation_id, "created conversation");
        conversation_id
    }

    pub fn select_conversation(&mut self, conversation_id: ConversationId) -> StoreResult<()> {
        self.ensure_exists(conversation_id, "select-conversation")?;
        self.state.active_conversation_id = Some(conversation_id);
        self.persist();
        Ok(())
    }

    pub fn delete_conversation(&mut self, conversation_id: ConversationId) -> StoreResult<()> {
        let index = self.position(conversation_id, "delete-conversation")?;
        self.state.conversations.remove(index);

        if self.state.active_conversation_id == Some(conversation_id) {
            self.state.active_conversation_id = self.state.front_id();
        }
        self.persist();

        tracing::debug!(
            conversation_id = %conversation_id,
            active_conversation_id = ?self.state.active_conversation_id,
            "deleted conversation"
        );
        Ok(())
    }

    pub fn append_message(
        &mut self,
        conversation_id: ConversationId,
        message: Message,
    ) -> StoreResult<()> {
        self.apply_message_update(conversation_id, MessageUpdate::Append(message))
            .map(|_| ())
    }

    pub fn upsert_last_assistant_message(
        &mut self,
        conversation_id: ConversationId,
        message: Message,
    ) -> StoreResult<MessageUpdateKind> {
        let index = self.position(conversation_id, "upsert-last-message")?;
        let update = MessageUpdate::resolve(&self.state.conversations[index], message);
        self.apply_message_update(conversation_id, update)
    }

    pub fn apply_message_update(
        &mut self,
        conversation_id: ConversationId,
        update: MessageUpdate,
    ) -> StoreResult<MessageUpdateKind> {
        let kind = update.kind();
        let conversation = self.conversation_mut(conversation_id, "apply-message-update")?;

        match update {
            MessageUpdate::Append(message) => conversation.messages.push(message),
            MessageUpdate::ReplaceLast(message) => match conversation.messages.last_mut() {
                Some(last) => *last = message,
                None => conversation.messages.push(message),
            },
        }
        self.persist();

        Ok(kind)
    }

    pub fn rename_conversation(
        &mut self,
        conversation_id: ConversationId,
        title: impl Into<String>,
    ) -> StoreResult<()> {
        let conversation = self.conversation_mut(conversation_id, "rename-conversation")?;
        conversation.title = title.into();
        self.persist();
        Ok(())
    }

    fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.save(&self.state);
        }
    }

    fn position(&self, conversation_id: ConversationId, stage: &'static str) -> StoreResult<usize> {
        self.state
            .conversations
            .iter()
            .position(|conversation| conversation.id == conversation_id)
            .ok_or_else(|| {
                NotFoundSnafu {
                    stage,
                    conversation_id,
                }
                .build()
            })
    }

    fn ensure_exists(&self, conversation_id: ConversationId, stage: &'static str) -> StoreResult<()> {
        self.position(conversation_id, stage).map(|_| ())
    }

    fn conversation_mut(
        &mut self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> StoreResult<&mut Conversation> {
        let index = self.position(conversation_id, stage)?;
        Ok(&mut self.state.conversations[index])
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(AppState::empty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_storage::MemoryKeyValueStore;

    use super::*;
    use crate::error::StoreError;
    use crate::message::{NEW_CHAT_TITLE, Sender};

    fn assert_selection_valid(store: &ConversationStore) {
        if let Some(active) = store.active_conversation_id() {
            assert!(store.conversation(active).is_some());
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Create,
        Select(usize),
        Delete(usize),
        SelectMissing,
        DeleteMissing,
    }

    const STEPS: [Step; 9] = [
        Step::Create,
        Step::Select(0),
        Step::Select(1),
        Step::Select(2),
        Step::SelectMissing,
        Step::Delete(0),
        Step::Delete(1),
        Step::Delete(2),
        Step::DeleteMissing,
    ];

    fn apply_step(store: &mut ConversationStore, step: Step) {
        let before = store.active_conversation_id();
        let id_at = |store: &ConversationStore, index: usize| {
            store.conversations().get(index).map(|conversation| conversation.id)
        };

        match step {
            Step::Create => {
                let created = store.create_conversation(NEW_CHAT_TITLE);
                assert_eq!(store.active_conversation_id(), Some(created));
                assert_eq!(store.state().front_id(), Some(created));
            }
            Step::Select(index) => {
                if let Some(conversation_id) = id_at(store, index) {
                    store.select_conversation(conversation_id).unwrap();
                    assert_eq!(store.active_conversation_id(), Some(conversation_id));
                }
            }
            Step::Delete(index) => {
                if let Some(conversation_id) = id_at(store, index) {
                    store.delete_conversation(conversation_id).unwrap();
                    assert!(store.conversation(conversation_id).is_none());
                    if before == Some(conversation_id) {
                        assert_eq!(store.active_conversation_id(), store.state().front_id());
                    } else {
                        assert_eq!(store.active_conversation_id(), before);
                    }
                }
            }
            Step::SelectMissing => {
                let result = store.select_conversation(ConversationId::new_v7());
                assert!(matches!(result, Err(StoreError::NotFound { .. })));
                assert_eq!(store.active_conversation_id(), before);
            }
            Step::DeleteMissing => {
                let result = store.delete_conversation(ConversationId::new_v7());
                assert!(matches!(result, Err(StoreError::NotFound { .. })));
                assert_eq!(store.active_conversation_id(), before);
            }
        }
    }

    #[test]
    fn selection_stays_valid_for_every_short_sequence() {
        const DEPTH: u32 = 4;

        // Every sequence of DEPTH steps, which also walks every shorter prefix.
        for sequence in 0..STEPS.len().pow(DEPTH) {
            let mut store = ConversationStore::default();
            let mut remaining = sequence;
            let mut trace = Vec::new();

            for _ in 0..DEPTH {
                let step = STEPS[remaining % STEPS.len()];
                remaining /= STEPS.len();
                trace.push(step);

                apply_step(&mut store, step);
                if let Some(active) = store.active_conversation_id() {
                    assert!(
                        store.conversation(active).is_some(),
                        "dangling selection after {trace:?}"
                    );
                }
                assert_eq!(
                    store.active_conversation_id().is_some(),
                    !store.conversations().is_empty(),
                    "selection lost after {trace:?}"
                );
            }
        }
    }

    #[test]
    fn create_inserts_at_front_and_activates() {
        let mut store = ConversationStore::default();
        let first = store.create_conversation(NEW_CHAT_TITLE);
        let second = store.create_conversation(NEW_CHAT_TITLE);

        let ids = store
            .conversations()
            .iter()
            .map(|conversation| conversation.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(store.active_conversation_id(), Some(second));
        assert_selection_valid(&store);
    }

    #[test]
    fn select_unknown_conversation_is_not_found() {
        let mut store = ConversationStore::default();
        let existing = store.create_conversation(NEW_CHAT_TITLE);

        let result = store.select_conversation(ConversationId::new_v7());

        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(store.active_conversation_id(), Some(existing));
    }

    #[test]
    fn deleting_active_selects_new_front() {
        let mut store = ConversationStore::default();
        let oldest = store.create_conversation("oldest");
        let middle = store.create_conversation("middle");
        let newest = store.create_conversation("newest");

        store.delete_conversation(newest).unwrap();
        assert_eq!(store.active_conversation_id(), Some(middle));
        assert_selection_valid(&store);

        store.select_conversation(oldest).unwrap();
        store.delete_conversation(middle).unwrap();
        assert_eq!(store.active_conversation_id(), Some(oldest));

        store.delete_conversation(oldest).unwrap();
        assert_eq!(store.active_conversation_id(), None);
        assert!(store.conversations().is_empty());
    }

    #[test]
    fn deleting_inactive_keeps_selection() {
        let mut store = ConversationStore::default();
        let older = store.create_conversation("older");
        let newer = store.create_conversation("newer");

        store.delete_conversation(older).unwrap();

        assert_eq!(store.active_conversation_id(), Some(newer));
        assert!(matches!(
            store.delete_conversation(older),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn upserting_fragments_keeps_one_trailing_message() {
        let mut store = ConversationStore::default();
        let conversation_id = store.create_conversation(NEW_CHAT_TITLE);
        store
            .append_message(conversation_id, Message::user("hi"))
            .unwrap();

        let mut reply = Message::assistant("Hel");
        let first = store
            .upsert_last_assistant_message(conversation_id, reply.clone())
            .unwrap();
        reply.text.push_str("lo");
        let second = store
            .upsert_last_assistant_message(conversation_id, reply.clone())
            .unwrap();

        assert_eq!(first, MessageUpdateKind::Appended);
        assert_eq!(second, MessageUpdateKind::Replaced);
        let messages = &store.conversation(conversation_id).unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].sender, Sender::Assistant);
        assert_eq!(messages[1].text, "Hello");
    }

    #[test]
    fn mutations_on_missing_conversation_are_not_found() {
        let mut store = ConversationStore::default();
        let missing = ConversationId::new_v7();

        assert!(store.append_message(missing, Message::user("x")).is_err());
        assert!(
            store
                .upsert_last_assistant_message(missing, Message::assistant("x"))
                .is_err()
        );
        assert!(store.rename_conversation(missing, "title").is_err());
    }

    #[test]
    fn every_mutation_is_persisted() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        let persistence = PersistenceAdapter::new(backend.clone());
        let mut store = ConversationStore::load(persistence.clone());

        let conversation_id = store.create_conversation(NEW_CHAT_TITLE);
        store
            .append_message(conversation_id, Message::user("hello"))
            .unwrap();
        store
            .rename_conversation(conversation_id, "Greetings")
            .unwrap();

        let reloaded = ConversationStore::load(persistence);
        assert_eq!(reloaded.state(), store.state());
        assert_eq!(
            reloaded.active_conversation().map(|c| c.title.as_str()),
            Some("Greetings")
        );
    }
}
