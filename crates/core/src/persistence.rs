use std::sync::Arc;

use parley_storage::KeyValueStore;
use snafu::ResultExt;

use crate::error::{
    DecodeActiveIdSnafu, DecodeConversationsSnafu, EncodeConversationsSnafu, PersistenceError,
    ReadKeySnafu, WriteKeySnafu,
};
use crate::ids::ConversationId;
use crate::message::{AppState, Conversation};

pub const CONVERSATIONS_KEY: &str = "conversations";
pub const ACTIVE_CONVERSATION_KEY: &str = "active_conversation_id";

/// Mirrors [`AppState`] into two keyed records of a [`KeyValueStore`].
#[derive(Clone)]
pub struct PersistenceAdapter {
    store: Arc<dyn KeyValueStore>,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Never fails: unreadable data is cleared and the empty state returned.
    pub fn load(&self) -> AppState {
        match self.try_load() {
            Ok(state) => {
                tracing::debug!(
                    conversation_count = state.conversations.len(),
                    active_conversation_id = ?state.active_conversation_id,
                    "loaded persisted conversations"
                );
                state
            }
            Err(error) => {
                tracing::warn!(error = %error, "persisted conversations are unreadable; starting empty");
                self.clear();
                AppState::empty()
            }
        }
    }

    pub fn save(&self, state: &AppState) {
        if let Err(error) = self.try_save(state) {
            tracing::warn!(
                error = %error,
                conversation_count = state.conversations.len(),
                "failed to persist conversations"
            );
        }
    }

    fn try_load(&self) -> Result<AppState, PersistenceError> {
        let raw_conversations = self.store.get(CONVERSATIONS_KEY).context(ReadKeySnafu {
            stage: "load-conversations",
            key: CONVERSATIONS_KEY,
        })?;
        let raw_active = self
            .store
            .get(ACTIVE_CONVERSATION_KEY)
            .context(ReadKeySnafu {
                stage: "load-active-conversation",
                key: ACTIVE_CONVERSATION_KEY,
            })?;

        let conversations = match raw_conversations {
            Some(raw) => serde_json::from_str::<Vec<Conversation>>(&raw).context(
                DecodeConversationsSnafu {
                    stage: "decode-conversations",
                },
            )?,
            None => Vec::new(),
        };

        let stored_active = match raw_active {
            Some(raw) => Some(ConversationId::parse(&raw).context(DecodeActiveIdSnafu {
                stage: "decode-active-conversation",
            })?),
            None => None,
        };

        let mut state = AppState {
            conversations,
            active_conversation_id: stored_active,
        };
        // An absent key means nothing was selected; only a dangling id is repaired.
        if let Some(id) = stored_active
            && !state.contains(id)
        {
            state.active_conversation_id = state.front_id();
        }

        Ok(state)
    }

    fn try_save(&self, state: &AppState) -> Result<(), PersistenceError> {
        let encoded = serde_json::to_string(&state.conversations).context(
            EncodeConversationsSnafu {
                stage: "encode-conversations",
            },
        )?;
        self.store
            .set(CONVERSATIONS_KEY, &encoded)
            .context(WriteKeySnafu {
                stage: "save-conversations",
                key: CONVERSATIONS_KEY,
            })?;

        match state.active_conversation_id {
            Some(id) => self
                .store
                .set(ACTIVE_CONVERSATION_KEY, &id.to_string())
                .context(WriteKeySnafu {
                    stage: "save-active-conversation",
                    key: ACTIVE_CONVERSATION_KEY,
                })?,
            None => self
                .store
                .remove(ACTIVE_CONVERSATION_KEY)
                .context(WriteKeySnafu {
                    stage: "clear-active-conversation",
                    key: ACTIVE_CONVERSATION_KEY,
                })?,
        }

        Ok(())
    }

    fn clear(&self) {
        for key in [CONVERSATIONS_KEY, ACTIVE_CONVERSATION_KEY] {
            if let Err(error) = self.store.remove(key) {
                tracing::warn!(key, error = %error, "failed to clear persisted key");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_storage::{MemoryKeyValueStore, StorageError, StorageResult};

    use super::*;
    use crate::message::Message;
    use crate::store::ConversationStore;

    /// Backend whose every call fails, like a locked or vanished database.
    struct UnavailableStore;

    impl UnavailableStore {
        fn unavailable<T>(stage: &'static str) -> StorageResult<T> {
            Err(StorageError::LockPoisoned { stage })
        }
    }

    impl KeyValueStore for UnavailableStore {
        fn get(&self, _key: &str) -> StorageResult<Option<String>> {
            Self::unavailable("unavailable-get")
        }

        fn set(&self, _key: &str, _value: &str) -> StorageResult<()> {
            Self::unavailable("unavailable-set")
        }

        fn remove(&self, _key: &str) -> StorageResult<()> {
            Self::unavailable("unavailable-remove")
        }
    }

    fn adapter() -> (Arc<MemoryKeyValueStore>, PersistenceAdapter) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let adapter = PersistenceAdapter::new(store.clone());
        (store, adapter)
    }

    fn sample_state() -> AppState {
        let mut first = Conversation::new("Coffee");
        first.messages.push(Message::user("How do I brew coffee?"));
        first.messages.push(Message::assistant("Start with fresh beans."));
        let second = Conversation::new("New Chat");

        AppState {
            active_conversation_id: Some(second.id),
            conversations: vec![first, second],
        }
    }

    #[test]
    fn missing_data_loads_empty_state() {
        let (_, adapter) = adapter();
        assert_eq!(adapter.load(), AppState::empty());
    }

    #[test]
    fn save_then_load_reproduces_state() {
        let (_, adapter) = adapter();
        let state = sample_state();

        adapter.save(&state);

        assert_eq!(adapter.load(), state);
    }

    #[test]
    fn saving_without_selection_removes_active_key() {
        let (store, adapter) = adapter();
        adapter.save(&sample_state());
        adapter.save(&AppState::empty());

        assert_eq!(store.get(ACTIVE_CONVERSATION_KEY).unwrap(), None);
        assert_eq!(store.get(CONVERSATIONS_KEY).unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn corrupt_conversations_load_empty_and_clear_keys() {
        let (store, adapter) = adapter();
        store.set(CONVERSATIONS_KEY, "{not json").unwrap();
        store
            .set(ACTIVE_CONVERSATION_KEY, &ConversationId::new_v7().to_string())
            .unwrap();

        assert_eq!(adapter.load(), AppState::empty());
        assert!(store.is_empty());
    }

    #[test]
    fn wrong_shape_loads_empty_state() {
        let (store, adapter) = adapter();
        store
            .set(CONVERSATIONS_KEY, r#"[{"title":"missing id"}]"#)
            .unwrap();

        assert_eq!(adapter.load(), AppState::empty());
        assert_eq!(store.get(CONVERSATIONS_KEY).unwrap(), None);
    }

    #[test]
    fn unparsable_active_id_loads_empty_state() {
        let (store, adapter) = adapter();
        adapter.save(&sample_state());
        store.set(ACTIVE_CONVERSATION_KEY, "definitely-not-a-uuid").unwrap();

        assert_eq!(adapter.load(), AppState::empty());
        assert!(store.is_empty());
    }

    #[test]
    fn dangling_active_id_selects_front_conversation() {
        let (store, adapter) = adapter();
        let state = sample_state();
        adapter.save(&state);
        store
            .set(ACTIVE_CONVERSATION_KEY, &ConversationId::new_v7().to_string())
            .unwrap();

        let loaded = adapter.load();

        assert_eq!(loaded.conversations, state.conversations);
        assert_eq!(loaded.active_conversation_id, state.front_id());
    }

    #[test]
    fn state_without_selection_round_trips() {
        let (_, adapter) = adapter();
        let state = AppState {
            active_conversation_id: None,
            ..sample_state()
        };

        adapter.save(&state);

        assert_eq!(adapter.load(), state);
    }

    #[test]
    fn read_errors_load_empty_state() {
        let adapter = PersistenceAdapter::new(Arc::new(UnavailableStore));
        assert_eq!(adapter.load(), AppState::empty());
    }

    #[test]
    fn store_mutations_survive_write_errors() {
        let mut store = ConversationStore::load(PersistenceAdapter::new(Arc::new(UnavailableStore)));

        let conversation_id = store.create_conversation("Offline");
        store
            .append_message(conversation_id, Message::user("still here"))
            .unwrap();
        store.rename_conversation(conversation_id, "Renamed").unwrap();

        assert_eq!(store.conversations().len(), 1);
        assert_eq!(store.active_conversation_id(), Some(conversation_id));
        assert_eq!(store.conversations()[0].title, "Renamed");
        assert_eq!(store.conversations()[0].messages.len(), 1);

        store.delete_conversation(conversation_id).unwrap();
        assert!(store.conversations().is_empty());
    }

    #[test]
    fn legacy_browser_payload_loads() {
        let (store, adapter) = adapter();
        store
            .set(
                CONVERSATIONS_KEY,
                r#"[{"id":"0190b6c2-6f6d-7a3e-9d6e-1b2c3d4e5f60","title":"Hi","messages":[
                    {"id":"0190b6c2-6f6d-7a3e-9d6e-1b2c3d4e5f61","sender":"user","text":"hi"},
                    {"id":"0190b6c2-6f6d-7a3e-9d6e-1b2c3d4e5f62","sender":"model","text":"hello"}
                ]}]"#,
            )
            .unwrap();

        let loaded = adapter.load();

        assert_eq!(loaded.conversations.len(), 1);
        assert_eq!(loaded.conversations[0].messages[1].text, "hello");
        assert_eq!(loaded.active_conversation_id, None);
    }
}
