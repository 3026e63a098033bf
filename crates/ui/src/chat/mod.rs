/// Event contracts for chat module wiring.
pub mod events;
pub mod message_input;
pub mod message_list;
pub mod scroll_manager;
pub mod sidebar;
pub mod view;

pub use events::{
    ConversationDeleted, ConversationSelected, NewChatRequested, Submit, ThemeToggled,
};
pub use message_input::MessageInput;
pub use message_list::MessageList;
pub use scroll_manager::ScrollManager;
pub use sidebar::{ChatSidebar, ConversationSummary};
pub use view::ChatView;
