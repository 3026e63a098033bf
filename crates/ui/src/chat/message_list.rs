use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use gpui::prelude::FluentBuilder as _;
use gpui::*;
use gpui_component::{
    ActiveTheme, Icon, IconName, Sizable,
    button::{Button, ButtonVariants},
    h_flex,
    label::Label,
    text::TextView,
    v_flex,
};
use parley_core::{Message, Sender};

use crate::chat::events::Submit;
use crate::chat::scroll_manager::ScrollManager;

const USER_BUBBLE_MAX_WIDTH: Pixels = px(540.);
const THREAD_MAX_WIDTH: Pixels = px(760.);
const MARKDOWN_SAFE_FALLBACK_THRESHOLD_BYTES: usize = 128 * 1024;

pub const SUGGESTIONS: [&str; 4] = [
    "Explain quantum computing in simple terms",
    "Suggest some creative gift ideas for a 10 year old",
    "Write a short story about a friendly robot",
    "How do I brew a good cup of coffee?",
];

/// What the thread shows for one stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBody {
    UserText,
    Markdown,
    PlainText,
    Empty,
    Failure,
}

pub fn message_body(message: &Message) -> MessageBody {
    match message.sender {
        Sender::User => MessageBody::UserText,
        Sender::Assistant if message.failed => MessageBody::Failure,
        Sender::Assistant if message.text.trim().is_empty() => MessageBody::Empty,
        Sender::Assistant if message.text.len() > MARKDOWN_SAFE_FALLBACK_THRESHOLD_BYTES => {
            MessageBody::PlainText
        }
        Sender::Assistant => MessageBody::Markdown,
    }
}

pub struct MessageList {
    messages: Vec<Message>,
    thinking: bool,
    scroll_manager: ScrollManager,
}

impl EventEmitter<Submit> for MessageList {}

impl MessageList {
    pub fn new(_cx: &mut Context<Self>) -> Self {
        Self {
            messages: Vec::new(),
            thinking: false,
            scroll_manager: ScrollManager::new(),
        }
    }

    pub fn set_messages(&mut self, messages: Vec<Message>, cx: &mut Context<Self>) {
        let grew = messages.len() > self.messages.len()
            || messages.last().map(|message| message.text.len())
                != self.messages.last().map(|message| message.text.len());

        self.messages = messages;
        if grew {
            self.scroll_manager.request_scroll_to_bottom_if_following();
        }
        cx.notify();
    }

    pub fn set_thinking(&mut self, thinking: bool, cx: &mut Context<Self>) {
        if self.thinking != thinking {
            self.thinking = thinking;
            if thinking {
                self.scroll_manager.request_scroll_to_bottom_if_following();
            }
            cx.notify();
        }
    }

    pub fn reset_scroll_tracking(&mut self, cx: &mut Context<Self>) {
        self.scroll_manager.reset();
        cx.notify();
    }

    fn render_suggestions(&self, cx: &mut Context<Self>) -> AnyElement {
        let theme = cx.theme();

        v_flex()
            .id("suggestions")
            .flex_1()
            .size_full()
            .items_center()
            .justify_center()
            .gap_4()
            .p_4()
            .child(
                Icon::new(IconName::Bot)
                    .size(px(48.))
                    .text_color(theme.muted_foreground),
            )
            .child(
                div()
                    .text_2xl()
                    .font_weight(FontWeight::BOLD)
                    .text_color(theme.foreground)
                    .child("Hello, I'm your AI assistant"),
            )
            .child(
                Label::new("How can I help you today?")
                    .text_color(theme.muted_foreground),
            )
            .child(
                v_flex()
                    .w_full()
                    .max_w(THREAD_MAX_WIDTH)
                    .gap_2()
                    .children(SUGGESTIONS.iter().enumerate().map(|(index, suggestion)| {
                        Button::new(("suggestion", index))
                            .outline()
                            .w_full()
                            .child(*suggestion)
                            .on_click(cx.listener(move |_, _, _, cx| {
                                cx.emit(Submit::new(SUGGESTIONS[index]));
                            }))
                    })),
            )
            .into_any_element()
    }

    fn render_message_row(&self, message: &Message, index: usize, cx: &Context<Self>) -> AnyElement {
        let theme = cx.theme();

        match message_body(message) {
            MessageBody::UserText => v_flex()
                .w_full()
                .items_end()
                .child(
                    div()
                        .max_w(USER_BUBBLE_MAX_WIDTH)
                        .px_3()
                        .py_2()
                        .rounded_lg()
                        .bg(theme.accent)
                        .text_color(theme.accent_foreground)
                        .child(Label::new(message.text.clone()).text_sm()),
                )
                .into_any_element(),
            body => v_flex()
                .w_full()
                .gap_2()
                .child(
                    Label::new("Assistant")
                        .text_xs()
                        .text_color(theme.foreground.opacity(0.5)),
                )
                .child(match body {
                    MessageBody::Failure => Label::new(message.text.clone())
                        .text_sm()
                        .text_color(theme.danger)
                        .into_any_element(),
                    MessageBody::Empty => Label::new("(empty response)")
                        .text_sm()
                        .text_color(theme.muted_foreground)
                        .into_any_element(),
                    MessageBody::PlainText => {
                        Label::new(message.text.clone()).text_sm().into_any_element()
                    }
                    _ => self.render_markdown(message, index),
                })
                .into_any_element(),
        }
    }

    fn render_markdown(&self, message: &Message, index: usize) -> AnyElement {
        let markdown_id = ElementId::Name(SharedString::from(format!(
            "assistant-markdown-{}-{index}",
            message.id
        )));

        TextView::markdown(markdown_id, message.text.clone())
            .code_block_actions(|code_block, _window, _cx| {
                let code = code_block.code().to_string();
                let mut hasher = DefaultHasher::new();
                hasher.write(code.as_bytes());
                let copy_button_id = format!("copy-code-{}", hasher.finish());

                h_flex().w_full().justify_end().child(
                    Button::new(copy_button_id)
                        .ghost()
                        .small()
                        .icon(IconName::Copy)
                        .child("Copy")
                        .on_click(move |_, _, cx| {
                            cx.write_to_clipboard(ClipboardItem::new_string(code.clone()));
                        }),
                )
            })
            .selectable(true)
            .into_any_element()
    }

    fn render_thinking(&self, cx: &Context<Self>) -> AnyElement {
        let theme = cx.theme();

        h_flex()
            .w_full()
            .gap_2()
            .items_center()
            .child(div().size(px(8.)).rounded_full().bg(theme.primary))
            .child(
                Label::new("Thinking...")
                    .text_sm()
                    .text_color(theme.foreground.opacity(0.65)),
            )
            .into_any_element()
    }
}

impl Render for MessageList {
    fn render(&mut self, _window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        if self.messages.is_empty() && !self.thinking {
            return self.render_suggestions(cx);
        }

        self.scroll_manager.update_follow_state();
        self.scroll_manager.apply_pending_scroll();

        let rows = self
            .messages
            .iter()
            .enumerate()
            .map(|(index, message)| self.render_message_row(message, index, cx))
            .collect::<Vec<_>>();

        div()
            .id("message-list")
            .size_full()
            .min_h_0()
            .overflow_y_scroll()
            .track_scroll(self.scroll_manager.handle())
            .child(
                v_flex()
                    .w_full()
                    .max_w(THREAD_MAX_WIDTH)
                    .mx_auto()
                    .px_4()
                    .py_3()
                    .gap_4()
                    .children(rows)
                    .when(self.thinking, |column| column.child(self.render_thinking(cx))),
            )
            .into_any_element()
    }
}

#[cfg(test)]
mod tests {
    use parley_core::ASSISTANT_ERROR_TEXT;

    use super::*;

    #[test]
    fn classifies_message_bodies() {
        assert_eq!(message_body(&Message::user("hi")), MessageBody::UserText);
        assert_eq!(message_body(&Message::assistant("")), MessageBody::Empty);
        let mut failed = Message::assistant(ASSISTANT_ERROR_TEXT);
        assert_eq!(message_body(&failed), MessageBody::Markdown);
        failed.failed = true;
        assert_eq!(message_body(&failed), MessageBody::Failure);
        assert_eq!(
            message_body(&Message::assistant("**bold**")),
            MessageBody::Markdown
        );
        assert_eq!(
            message_body(&Message::assistant(
                "x".repeat(MARKDOWN_SAFE_FALLBACK_THRESHOLD_BYTES + 1)
            )),
            MessageBody::PlainText
        );
    }
}
