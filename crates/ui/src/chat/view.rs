use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gpui::prelude::FluentBuilder as _;
use gpui::*;
use gpui_component::{ActiveTheme, label::Label, v_flex};
use gpui_tokio_bridge::Tokio;
use parley_core::{
    ChatSettings, ConversationId, ConversationStore, ExchangeCoordinator, ExchangeError,
    ExchangePhase, NEW_CHAT_TITLE, PersistenceAdapter, SettingsStore,
};
use parley_llm::{
    LlmProvider, ProviderError, ProviderEventStream, ProviderStreamHandle, ProviderWorker,
    StreamEventMapped, StreamEventPayload, StreamTarget, create_provider,
};
use parley_storage::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore};

use crate::chat::events::{
    ConversationDeleted, ConversationSelected, NewChatRequested, Submit, ThemeToggled,
};
use crate::chat::sidebar::ConversationSummary;
use crate::chat::{ChatSidebar, MessageInput, MessageList};
use crate::theme::apply_theme;

pub const STREAM_DEBOUNCE_MS: u64 = 50;

/// Owns the conversation store and drives exchanges for the sidebar, thread and input.
pub struct ChatView {
    sidebar: Entity<ChatSidebar>,
    message_list: Entity<MessageList>,
    message_input: Entity<MessageInput>,
    settings: Arc<SettingsStore>,
    store: ConversationStore,
    coordinator: ExchangeCoordinator,
    provider: Option<Arc<dyn LlmProvider>>,
    provider_error: Option<String>,
    model_id: String,
    active_target: Option<StreamTarget>,
    stream_worker_task: Option<Task<Result<(), gpui_tokio_bridge::JoinError>>>,
    stream_reader_task: Option<Task<()>>,
    stream_debounce_task: Option<Task<()>>,
    pending_stream_chunk: String,
}

impl ChatView {
    pub fn new(settings: Arc<SettingsStore>, window: &mut Window, cx: &mut Context<Self>) -> Self {
        let sidebar = cx.new(|cx| ChatSidebar::new(window, cx));
        let message_list = cx.new(MessageList::new);
        let message_input = cx.new(|cx| MessageInput::new(window, cx));

        let current = settings.settings();
        let persistence = PersistenceAdapter::new(open_key_value_store(&current.database_path));
        let store = ConversationStore::load(persistence);
        let (provider, provider_error) = build_provider(&current);

        cx.subscribe(&sidebar, |this, _, event: &ConversationSelected, cx| {
            this.select_conversation(event.conversation_id, cx);
        })
        .detach();

        cx.subscribe(&sidebar, |this, _, event: &ConversationDeleted, cx| {
            this.delete_conversation(event.conversation_id, cx);
        })
        .detach();

        cx.subscribe(&sidebar, |this, _, _event: &NewChatRequested, cx| {
            this.create_conversation(cx);
        })
        .detach();

        cx.subscribe(&sidebar, |this, _, _event: &ThemeToggled, cx| {
            this.toggle_theme(cx);
        })
        .detach();

        cx.subscribe(&message_input, |this, _, event: &Submit, cx| {
            this.handle_submit(event.content.clone(), cx);
        })
        .detach();

        // Suggestion prompts submit exactly like typed text.
        cx.subscribe(&message_list, |this, _, event: &Submit, cx| {
            this.handle_submit(event.content.clone(), cx);
        })
        .detach();

        sidebar.update(cx, |sidebar, cx| sidebar.set_theme(current.theme, cx));

        let mut this = Self {
            sidebar,
            message_list,
            message_input,
            settings: settings.clone(),
            store,
            coordinator: ExchangeCoordinator::new(),
            provider,
            provider_error,
            model_id: current.model.clone(),
            active_target: None,
            stream_worker_task: None,
            stream_reader_task: None,
            stream_debounce_task: None,
            pending_stream_chunk: String::new(),
        };
        this.sync_sidebar(cx);
        this.sync_thread(true, cx);
        this
    }

    pub fn sidebar(&self) -> &Entity<ChatSidebar> {
        &self.sidebar
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn active_title(&self) -> Option<String> {
        self.store
            .active_conversation()
            .map(|conversation| conversation.title.clone())
    }

    pub fn is_loading(&self) -> bool {
        self.coordinator.is_loading()
    }

    pub fn create_conversation(&mut self, cx: &mut Context<Self>) {
        self.store.create_conversation(NEW_CHAT_TITLE);
        self.sync_sidebar(cx);
        self.sync_thread(true, cx);
        cx.notify();
    }

    fn select_conversation(&mut self, conversation_id: ConversationId, cx: &mut Context<Self>) {
        if self.store.active_conversation_id() == Some(conversation_id) {
            return;
        }

        if let Err(error) = self.store.select_conversation(conversation_id) {
            tracing::debug!(error = %error, "ignoring selection of unknown conversation");
            return;
        }

        self.sync_sidebar(cx);
        self.sync_thread(true, cx);
        cx.notify();
    }

    fn delete_conversation(&mut self, conversation_id: ConversationId, cx: &mut Context<Self>) {
        let was_active = self.store.active_conversation_id() == Some(conversation_id);
        if let Err(error) = self.store.delete_conversation(conversation_id) {
            tracing::debug!(error = %error, "ignoring delete of unknown conversation");
            return;
        }

        self.sync_sidebar(cx);
        self.sync_thread(was_active, cx);
        cx.notify();
    }

    fn toggle_theme(&mut self, cx: &mut Context<Self>) {
        let next = self.settings.settings().theme.toggled();
        if let Err(error) = self.settings.set_theme(next) {
            tracing::warn!(error = %error, "failed to persist theme preference");
        }

        apply_theme(next, None, cx);
        cx.refresh_windows();
        self.sidebar
            .update(cx, |sidebar, cx| sidebar.set_theme(next, cx));
    }

    fn handle_submit(&mut self, content: String, cx: &mut Context<Self>) {
        let start = match self.coordinator.begin(&mut self.store, &content, &self.model_id) {
            Ok(start) => start,
            Err(ExchangeError::Busy { .. }) => {
                tracing::debug!("ignoring submit while an exchange is in flight");
                return;
            }
            Err(ExchangeError::EmptyPrompt { .. }) => return,
            Err(error) => {
                tracing::warn!(error = %error, "failed to start exchange");
                self.sync_thread(false, cx);
                return;
            }
        };

        self.active_target = Some(start.target);
        self.pending_stream_chunk.clear();
        self.stream_debounce_task = None;
        self.sync_sidebar(cx);
        self.sync_thread(start.created_conversation, cx);

        let handle = match self.provider.as_ref() {
            Some(provider) => provider.stream_reply(start.session, start.message),
            None => {
                let error = ProviderError::MissingApiKey {
                    stage: "chat-view-submit",
                    provider_id: self.settings.settings().provider_id.clone(),
                };
                ProviderStreamHandle::failed(start.target, &error)
            }
        };
        self.spawn_stream_worker(handle.worker, cx);
        self.spawn_stream_reader(handle.stream, cx);

        if let (Some(prompt), Some(provider)) = (start.title_prompt, self.provider.clone()) {
            self.spawn_title_task(start.conversation_id, prompt, provider, cx);
        }
    }

    fn spawn_stream_worker(&mut self, worker: ProviderWorker, cx: &mut Context<Self>) {
        self.stream_worker_task = Some(Tokio::spawn(cx, worker));
    }

    fn spawn_stream_reader(&mut self, mut stream: ProviderEventStream, cx: &mut Context<Self>) {
        let stream_target = stream.target();

        self.stream_reader_task = Some(cx.spawn(async move |this, cx| {
            while let Some(event) = stream.recv().await {
                let _ = this.update(cx, |this, cx| {
                    this.handle_stream_event(event, cx);
                });
            }

            let _ = this.update(cx, |this, cx| {
                this.handle_stream_reader_closed(stream_target, cx);
            });
        }));
    }

    fn spawn_title_task(
        &mut self,
        conversation_id: ConversationId,
        prompt: String,
        provider: Arc<dyn LlmProvider>,
        cx: &mut Context<Self>,
    ) {
        let request = Tokio::spawn(cx, async move { provider.summarize(&prompt).await });

        cx.spawn(async move |this, cx| {
            let title = match request.await {
                Ok(title) => title,
                Err(error) => {
                    tracing::warn!(error = %error, "title task did not finish");
                    return;
                }
            };

            let _ = this.update(cx, |this, cx| {
                if this
                    .coordinator
                    .apply_title(&mut this.store, conversation_id, &title)
                {
                    this.sync_sidebar(cx);
                    cx.notify();
                }
            });
        })
        .detach();
    }

    fn handle_stream_event(&mut self, event: StreamEventMapped, cx: &mut Context<Self>) {
        if self.active_target != Some(event.target) {
            return;
        }

        match event.payload {
            StreamEventPayload::Delta(chunk) => {
                self.pending_stream_chunk.push_str(&chunk);
                self.schedule_debounced_stream_flush(cx);
            }
            StreamEventPayload::Done | StreamEventPayload::Error(_) => {
                self.flush_pending_stream_chunk(cx);
                let phase = self.coordinator.apply_event(&mut self.store, event);
                self.finish_exchange(phase, cx);
            }
        }
    }

    fn handle_stream_reader_closed(&mut self, target: StreamTarget, cx: &mut Context<Self>) {
        self.stream_worker_task = None;
        self.stream_reader_task = None;

        if self.active_target == Some(target) {
            self.flush_pending_stream_chunk(cx);
            let phase = self.coordinator.handle_stream_closed(&mut self.store, target);
            self.finish_exchange(phase, cx);
        }
    }

    fn schedule_debounced_stream_flush(&mut self, cx: &mut Context<Self>) {
        if self.stream_debounce_task.is_some() {
            return;
        }

        self.stream_debounce_task = Some(cx.spawn(async move |this, cx| {
            cx.background_executor()
                .timer(Duration::from_millis(STREAM_DEBOUNCE_MS))
                .await;

            let _ = this.update(cx, |this, cx| {
                this.flush_pending_stream_chunk(cx);
                this.stream_debounce_task = None;
            });
        }));
    }

    /// Folds buffered fragments into the store as one delta, preserving order.
    fn flush_pending_stream_chunk(&mut self, cx: &mut Context<Self>) {
        if self.pending_stream_chunk.is_empty() {
            return;
        }

        let Some(target) = self.active_target else {
            self.pending_stream_chunk.clear();
            return;
        };

        let chunk = std::mem::take(&mut self.pending_stream_chunk);
        self.coordinator.apply_event(
            &mut self.store,
            StreamEventMapped {
                target,
                payload: StreamEventPayload::Delta(chunk),
            },
        );
        self.sync_thread(false, cx);
    }

    fn finish_exchange(&mut self, phase: ExchangePhase, cx: &mut Context<Self>) {
        tracing::debug!(phase = ?phase, "exchange settled");

        self.active_target = None;
        self.pending_stream_chunk.clear();
        self.stream_debounce_task = None;
        self.stream_worker_task = None;

        self.sync_thread(false, cx);
        cx.notify();
    }

    fn sync_sidebar(&mut self, cx: &mut Context<Self>) {
        let summaries = self
            .store
            .conversations()
            .iter()
            .map(ConversationSummary::from)
            .collect::<Vec<_>>();
        let active = self.store.active_conversation_id();

        self.sidebar.update(cx, |sidebar, cx| {
            sidebar.set_conversations(summaries, active, cx);
        });
    }

    fn sync_thread(&mut self, reset_scroll: bool, cx: &mut Context<Self>) {
        let messages = self
            .store
            .active_conversation()
            .map(|conversation| conversation.messages.clone())
            .unwrap_or_default();
        let thinking = matches!(self.coordinator.phase(), ExchangePhase::Sending(_))
            && self.coordinator.active_conversation_id().is_some()
            && self.coordinator.active_conversation_id() == self.store.active_conversation_id();
        let is_loading = self.coordinator.is_loading();

        self.message_list.update(cx, |list, cx| {
            if reset_scroll {
                list.reset_scroll_tracking(cx);
            }
            list.set_messages(messages, cx);
            list.set_thinking(thinking, cx);
        });
        self.message_input.update(cx, |input, cx| {
            input.set_loading(is_loading, cx);
        });
    }
}

impl Render for ChatView {
    fn render(&mut self, _window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        let theme = cx.theme();

        v_flex()
            .id("chat-view")
            .relative()
            .size_full()
            .min_h_0()
            .overflow_hidden()
            .bg(theme.background)
            .when_some(self.provider_error.clone(), |column, error| {
                column.child(
                    div()
                        .id("chat-view-provider-error")
                        .w_full()
                        .px_4()
                        .py_2()
                        .border_b_1()
                        .border_color(theme.border)
                        .child(Label::new(error).text_sm().text_color(theme.danger)),
                )
            })
            .child(
                div()
                    .id("chat-view-message-list")
                    .flex_1()
                    .min_h_0()
                    .child(self.message_list.clone()),
            )
            .child(
                div()
                    .id("chat-view-message-input")
                    .flex_shrink_0()
                    .w_full()
                    .border_t_1()
                    .border_color(theme.border)
                    .child(self.message_input.clone()),
            )
    }
}

fn open_key_value_store(database_path: &Path) -> Arc<dyn KeyValueStore> {
    match SqliteKeyValueStore::open(&database_path.to_string_lossy()) {
        Ok(store) => {
            tracing::info!(database_url = %store.database_url(), "opened conversation storage");
            Arc::new(store)
        }
        Err(error) => {
            tracing::error!(
                path = ?database_path,
                error = %error,
                "failed to open conversation storage; history will not survive restart"
            );
            Arc::new(MemoryKeyValueStore::new())
        }
    }
}

fn build_provider(settings: &ChatSettings) -> (Option<Arc<dyn LlmProvider>>, Option<String>) {
    let Some(config) = settings.to_provider_config() else {
        tracing::warn!("no API key configured; replies will fail until one is set");
        return (
            None,
            Some("No API key configured. Set GEMINI_API_KEY or api_key in settings.json.".into()),
        );
    };

    match create_provider(config, &settings.model) {
        Ok(provider) => {
            tracing::info!(provider_id = %provider.id(), model_id = %settings.model, "initialized provider");
            (Some(provider), None)
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to initialize provider");
            (None, Some(format!("Provider error: {error}")))
        }
    }
}
