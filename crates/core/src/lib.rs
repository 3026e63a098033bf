pub mod config;
pub mod error;
pub mod exchange;
pub mod ids;
pub mod message;
pub mod persistence;
pub mod store;

pub use config::{ChatSettings, SettingsStore, ThemePreference, default_database_path};
pub use error::{ExchangeError, SettingsError, StoreError, StoreResult};
pub use exchange::{
    ASSISTANT_ERROR_TEXT, ExchangeCoordinator, ExchangePhase, ExchangeStart, ExchangeTransition,
    ExchangeTransitionRejection, ExchangeTransitionResult,
};
pub use ids::{ConversationId, MessageId};
pub use message::{AppState, Conversation, Message, NEW_CHAT_TITLE, Sender, preview_title};
pub use persistence::{ACTIVE_CONVERSATION_KEY, CONVERSATIONS_KEY, PersistenceAdapter};
pub use store::{ConversationStore, MessageUpdate, MessageUpdateKind};
