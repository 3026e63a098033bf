use std::rc::Rc;

use gpui::*;
use gpui_component::{
    ActiveTheme, IconName, Sizable, VirtualListScrollHandle,
    button::{Button, ButtonVariants},
    h_flex,
    input::{Input, InputEvent, InputState},
    label::Label,
    list::ListItem,
    v_flex, v_virtual_list,
};
use parley_core::{Conversation, ConversationId, NEW_CHAT_TITLE, ThemePreference};

use crate::chat::events::{ConversationDeleted, ConversationSelected, NewChatRequested, ThemeToggled};

const CONVERSATION_ROW_HEIGHT: f32 = 40.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        let title = if conversation.title.trim().is_empty() {
            NEW_CHAT_TITLE.to_string()
        } else {
            conversation.title.clone()
        };
        Self {
            id: conversation.id,
            title,
        }
    }
}

pub struct ChatSidebar {
    search_input: Entity<InputState>,
    search_query: String,
    conversations: Vec<ConversationSummary>,
    active_conversation: Option<ConversationId>,
    visible: Vec<ConversationSummary>,
    item_sizes: Rc<Vec<Size<Pixels>>>,
    scroll_handle: VirtualListScrollHandle,
    theme: ThemePreference,
}

impl EventEmitter<ConversationSelected> for ChatSidebar {}
impl EventEmitter<ConversationDeleted> for ChatSidebar {}
impl EventEmitter<NewChatRequested> for ChatSidebar {}
impl EventEmitter<ThemeToggled> for ChatSidebar {}

impl ChatSidebar {
    pub fn new(window: &mut Window, cx: &mut Context<Self>) -> Self {
        let search_input =
            cx.new(|cx| InputState::new(window, cx).placeholder("Search conversations..."));

        cx.subscribe_in(
            &search_input,
            window,
            |this, _, _event: &InputEvent, _window, cx| {
                this.search_query = this.search_input.read(cx).value().to_string();
                this.rebuild_visible();
                cx.notify();
            },
        )
        .detach();

        Self {
            search_input,
            search_query: String::new(),
            conversations: Vec::new(),
            active_conversation: None,
            visible: Vec::new(),
            item_sizes: Rc::new(Vec::new()),
            scroll_handle: VirtualListScrollHandle::new(),
            theme: ThemePreference::default(),
        }
    }

    /// Replaces the listed conversations; order is kept as given (newest first).
    pub fn set_conversations(
        &mut self,
        conversations: Vec<ConversationSummary>,
        active_conversation: Option<ConversationId>,
        cx: &mut Context<Self>,
    ) {
        self.conversations = conversations;
        self.active_conversation = active_conversation;
        self.rebuild_visible();
        cx.notify();
    }

    pub fn set_theme(&mut self, theme: ThemePreference, cx: &mut Context<Self>) {
        self.theme = theme;
        cx.notify();
    }

    fn rebuild_visible(&mut self) {
        let query = self.search_query.trim().to_lowercase();
        self.visible = filter_conversations(&self.conversations, &query);
        self.item_sizes = Rc::new(
            self.visible
                .iter()
                .map(|_| size(px(0.), px(CONVERSATION_ROW_HEIGHT)))
                .collect(),
        );
    }

    fn render_toolbar(&mut self, cx: &mut Context<Self>) -> impl IntoElement {
        v_flex()
            .w_full()
            .min_w_0()
            .gap_2()
            .px_3()
            .pt(px(8.))
            .pb_2()
            .child(
                Button::new("new-chat")
                    .small()
                    .primary()
                    .w_full()
                    .icon(IconName::Plus)
                    .child(NEW_CHAT_TITLE)
                    .on_click(cx.listener(|_, _, _window, cx| {
                        cx.emit(NewChatRequested);
                    })),
            )
            .child(Input::new(&self.search_input).w_full().small())
    }

    fn render_empty_state(&mut self, cx: &mut Context<Self>) -> AnyElement {
        let theme = cx.theme();
        let message = if self.conversations.is_empty() {
            "No conversations yet"
        } else {
            "No conversations match your search"
        };

        v_flex()
            .flex_1()
            .items_center()
            .justify_center()
            .px_4()
            .child(
                Label::new(message)
                    .text_sm()
                    .text_color(theme.foreground.opacity(0.55)),
            )
            .into_any_element()
    }

    fn render_history_list(&mut self, cx: &mut Context<Self>) -> AnyElement {
        if self.visible.is_empty() {
            return self.render_empty_state(cx);
        }

        let active = self.active_conversation;
        let item_sizes = self.item_sizes.clone();
        let items = self.visible.clone();

        v_flex()
            .flex_1()
            .min_h_0()
            .child(
                v_virtual_list(
                    cx.entity().clone(),
                    "conversation-list",
                    item_sizes,
                    move |_this, visible_range, _window, cx| {
                        visible_range
                            .map(|index| {
                                let conversation = &items[index];
                                let conversation_id = conversation.id;

                                div()
                                    .w_full()
                                    .h(px(CONVERSATION_ROW_HEIGHT))
                                    .px_2()
                                    .child(
                                        ListItem::new(("conversation", index))
                                            .w_full()
                                            .h_full()
                                            .px_3()
                                            .py_2()
                                            .rounded_md()
                                            .selected(active == Some(conversation_id))
                                            .on_click(cx.listener(
                                                move |_this, _event: &ClickEvent, _window, cx| {
                                                    cx.emit(ConversationSelected { conversation_id });
                                                },
                                            ))
                                            .child(
                                                h_flex()
                                                    .w_full()
                                                    .items_center()
                                                    .gap_1()
                                                    .child(
                                                        div().flex_1().min_w_0().truncate().child(
                                                            Label::new(conversation.title.clone())
                                                                .text_sm(),
                                                        ),
                                                    )
                                                    .child(
                                                        Button::new(("delete-conversation", index))
                                                            .ghost()
                                                            .xsmall()
                                                            .icon(IconName::Delete)
                                                            .on_click(cx.listener(
                                                                move |_this, _, _window, cx| {
                                                                    cx.stop_propagation();
                                                                    cx.emit(ConversationDeleted {
                                                                        conversation_id,
                                                                    });
                                                                },
                                                            )),
                                                    ),
                                            ),
                                    )
                                    .into_any_element()
                            })
                            .collect()
                    },
                )
                .w_full()
                .flex_1()
                .track_scroll(&self.scroll_handle),
            )
            .into_any_element()
    }

    fn render_footer(&mut self, cx: &mut Context<Self>) -> impl IntoElement {
        let theme = cx.theme();
        let (toggle_icon, toggle_label) = if self.theme.is_dark() {
            (IconName::Sun, "Light mode")
        } else {
            (IconName::Moon, "Dark mode")
        };

        h_flex()
            .w_full()
            .min_w_0()
            .items_center()
            .px_3()
            .py_2()
            .border_t_1()
            .border_color(theme.border)
            .child(
                Button::new("theme-toggle")
                    .ghost()
                    .small()
                    .icon(toggle_icon)
                    .child(toggle_label)
                    .on_click(cx.listener(|_, _, _, cx| {
                        cx.emit(ThemeToggled);
                    })),
            )
    }
}

impl Render for ChatSidebar {
    fn render(&mut self, _window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        let theme = cx.theme();

        v_flex()
            .size_full()
            .min_w_0()
            .overflow_hidden()
            .bg(theme.background)
            .child(self.render_toolbar(cx))
            .child(self.render_history_list(cx))
            .child(self.render_footer(cx))
    }
}

fn filter_conversations(
    conversations: &[ConversationSummary],
    query: &str,
) -> Vec<ConversationSummary> {
    conversations
        .iter()
        .filter(|conversation| query.is_empty() || conversation.title.to_lowercase().contains(query))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(title: &str) -> ConversationSummary {
        ConversationSummary::from(&Conversation::new(title))
    }

    #[test]
    fn filter_keeps_order_and_matches_case_insensitively() {
        let conversations = vec![summary("Coffee brewing"), summary("Robots"), summary("Iced coffee")];

        let titles = filter_conversations(&conversations, "coffee")
            .into_iter()
            .map(|conversation| conversation.title)
            .collect::<Vec<_>>();

        assert_eq!(titles, vec!["Coffee brewing", "Iced coffee"]);
        assert_eq!(filter_conversations(&conversations, "").len(), 3);
    }

    #[test]
    fn blank_titles_show_placeholder() {
        assert_eq!(summary("  ").title, NEW_CHAT_TITLE);
    }
}
