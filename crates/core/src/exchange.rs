use std::pin::pin;

use futures::StreamExt;
use futures::stream;
use parley_llm::{
    ChatSession, LlmProvider, ProviderStreamHandle, StreamEventMapped, StreamEventPayload,
    StreamTarget,
};
use snafu::ResultExt;

use crate::error::{BusySnafu, EmptyPromptSnafu, ExchangeError, StoreError, StoreSnafu};
use crate::ids::ConversationId;
use crate::message::{Message, preview_title};
use crate::store::ConversationStore;

/// Text shown in place of a reply whenever the remote call fails.
pub const ASSISTANT_ERROR_TEXT: &str = "Error: Could not get a response from the model.";

/// Lifecycle of one send/reply round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePhase {
    #[default]
    Idle,
    Sending(StreamTarget),
    Streaming(StreamTarget),
    Completed(StreamTarget),
    Failed(StreamTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeTransition {
    Send(StreamTarget),
    Receive(StreamTarget),
    Complete(StreamTarget),
    Fail(StreamTarget),
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeTransitionRejection {
    AlreadyInFlight {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveExchange,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type ExchangeTransitionResult = Result<ExchangePhase, ExchangeTransitionRejection>;

impl ExchangePhase {
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Sending(target) | Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Completed(_) | Self::Failed(_) => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.active_target().is_some()
    }

    pub fn accepts_event(&self, target: StreamTarget) -> bool {
        self.active_target() == Some(target)
    }

    /// Applies one transition. Only `Send` may leave a settled phase, and every
    /// other transition must name the exchange currently in flight.
    pub fn apply(&self, transition: ExchangeTransition) -> ExchangeTransitionResult {
        match transition {
            ExchangeTransition::Send(target) => match self.active_target() {
                Some(active) => Err(ExchangeTransitionRejection::AlreadyInFlight {
                    active,
                    attempted: target,
                }),
                None => Ok(Self::Sending(target)),
            },
            ExchangeTransition::Receive(target) => {
                self.in_flight(target).map(|_| Self::Streaming(target))
            }
            ExchangeTransition::Complete(target) => {
                self.in_flight(target).map(|_| Self::Completed(target))
            }
            ExchangeTransition::Fail(target) => self.in_flight(target).map(|_| Self::Failed(target)),
            ExchangeTransition::Reset => Ok(Self::Idle),
        }
    }

    fn in_flight(&self, target: StreamTarget) -> Result<(), ExchangeTransitionRejection> {
        match self.active_target() {
            Some(active) if active == target => Ok(()),
            Some(active) => Err(ExchangeTransitionRejection::SessionMismatch {
                active,
                attempted: target,
            }),
            None => Err(ExchangeTransitionRejection::NoActiveExchange),
        }
    }
}

/// Everything the caller needs to put an accepted message on the wire.
#[derive(Debug, Clone)]
pub struct ExchangeStart {
    pub conversation_id: ConversationId,
    pub target: StreamTarget,
    pub session: ChatSession,
    pub message: String,
    /// Present on the conversation's first exchange.
    pub title_prompt: Option<String>,
    pub created_conversation: bool,
}

#[derive(Debug, Clone)]
struct ActiveReply {
    conversation_id: ConversationId,
    reply: Message,
    fragment_count: usize,
}

/// Folds provider stream events into a [`ConversationStore`].
#[derive(Debug, Default)]
pub struct ExchangeCoordinator {
    phase: ExchangePhase,
    next_session_id: u64,
    active: Option<ActiveReply>,
}

impl ExchangeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ExchangePhase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase.is_in_flight()
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.active.as_ref().map(|active| active.conversation_id)
    }

    pub fn begin(
        &mut self,
        store: &mut ConversationStore,
        text: &str,
        model_id: &str,
    ) -> Result<ExchangeStart, ExchangeError> {
        if text.trim().is_empty() {
            return EmptyPromptSnafu {
                stage: "begin-exchange",
            }
            .fail();
        }
        if self.phase.is_in_flight() {
            return BusySnafu {
                stage: "begin-exchange",
            }
            .fail();
        }

        let (conversation_id, created_conversation) = match store.active_conversation_id() {
            Some(conversation_id) => (conversation_id, false),
            None => (store.create_conversation(preview_title(text)), true),
        };

        let history = store
            .conversation(conversation_id)
            .map(|conversation| {
                conversation
                    .messages
                    .iter()
                    .map(Message::to_provider_message)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let first_exchange = history.is_empty();

        store
            .append_message(conversation_id, Message::user(text))
            .context(StoreSnafu {
                stage: "append-user-message",
            })?;

        self.next_session_id += 1;
        let target = StreamTarget::new(conversation_id.as_u128(), self.next_session_id);
        self.transition(ExchangeTransition::Send(target));
        self.active = Some(ActiveReply {
            conversation_id,
            reply: Message::assistant(String::new()),
            fragment_count: 0,
        });

        tracing::info!(
            conversation_id = %conversation_id,
            session_id = target.session_id,
            history_len = history.len(),
            created_conversation,
            "starting exchange"
        );

        Ok(ExchangeStart {
            conversation_id,
            target,
            session: ChatSession::seeded(target, model_id, history),
            message: text.to_string(),
            title_prompt: first_exchange.then(|| text.to_string()),
            created_conversation,
        })
    }

    pub fn apply_event(
        &mut self,
        store: &mut ConversationStore,
        event: StreamEventMapped,
    ) -> ExchangePhase {
        if !self.phase.accepts_event(event.target) {
            tracing::debug!(
                target = ?event.target,
                phase = ?self.phase,
                "ignoring stale stream event"
            );
            return self.phase;
        }

        let Some(mut active) = self.active.take() else {
            return self.phase;
        };

        match event.payload {
            StreamEventPayload::Delta(fragment) => {
                active.fragment_count += 1;
                active.reply.text.push_str(&fragment);
                Self::upsert_reply(store, &active);
                self.transition(ExchangeTransition::Receive(event.target));
                self.active = Some(active);
            }
            StreamEventPayload::Done => {
                if active.fragment_count == 0 {
                    Self::upsert_reply(store, &active);
                }
                tracing::info!(
                    conversation_id = %active.conversation_id,
                    fragment_count = active.fragment_count,
                    reply_len = active.reply.text.len(),
                    "exchange completed"
                );
                self.transition(ExchangeTransition::Complete(event.target));
            }
            StreamEventPayload::Error(detail) => {
                self.fail(store, active, event.target, &detail);
            }
        }

        self.phase
    }

    /// Settles an exchange whose stream ended without a terminal event.
    pub fn handle_stream_closed(
        &mut self,
        store: &mut ConversationStore,
        target: StreamTarget,
    ) -> ExchangePhase {
        if !self.phase.accepts_event(target) {
            return self.phase;
        }
        if let Some(active) = self.active.take() {
            self.fail(store, active, target, "stream closed before completion");
        }
        self.phase
    }

    /// Best-effort rename; returns whether the conversation still existed.
    pub fn apply_title(
        &self,
        store: &mut ConversationStore,
        conversation_id: ConversationId,
        title: &str,
    ) -> bool {
        match store.rename_conversation(conversation_id, title) {
            Ok(()) => {
                tracing::debug!(conversation_id = %conversation_id, title, "applied generated title");
                true
            }
            Err(error) => {
                tracing::debug!(error = %error, "skipping title for missing conversation");
                false
            }
        }
    }

    /// Sends `text` and drives the reply stream and the title request on the
    /// current task until both settle.
    pub async fn run_exchange(
        &mut self,
        store: &mut ConversationStore,
        provider: &dyn LlmProvider,
        text: &str,
        model_id: &str,
    ) -> Result<ExchangePhase, ExchangeError> {
        let ExchangeStart {
            conversation_id,
            target,
            session,
            message,
            title_prompt,
            ..
        } = self.begin(store, text, model_id)?;

        let ProviderStreamHandle {
            stream: events,
            worker,
        } = provider.stream_reply(session, message);

        let events = stream::unfold(events, |mut events| async move {
            events
                .recv()
                .await
                .map(|event| (ExchangeInput::Event(event), events))
        });
        let title = match title_prompt {
            Some(prompt) => stream::once(async move {
                ExchangeInput::Title(provider.summarize(&prompt).await)
            })
            .left_stream(),
            None => stream::empty().right_stream(),
        };

        let consume = async {
            let mut inputs = pin!(stream::select(events, title));
            while let Some(input) = inputs.next().await {
                match input {
                    ExchangeInput::Event(event) => {
                        self.apply_event(store, event);
                    }
                    ExchangeInput::Title(title) => {
                        self.apply_title(store, conversation_id, &title);
                    }
                }
            }
        };
        futures::join!(worker, consume);

        Ok(self.handle_stream_closed(store, target))
    }

    fn fail(
        &mut self,
        store: &mut ConversationStore,
        mut active: ActiveReply,
        target: StreamTarget,
        detail: &str,
    ) {
        tracing::warn!(
            conversation_id = %active.conversation_id,
            fragment_count = active.fragment_count,
            detail,
            "exchange failed"
        );
        active.reply.text = ASSISTANT_ERROR_TEXT.to_string();
        active.reply.failed = true;
        Self::upsert_reply(store, &active);
        self.transition(ExchangeTransition::Fail(target));
    }

    fn upsert_reply(store: &mut ConversationStore, active: &ActiveReply) {
        if let Err(error) =
            store.upsert_last_assistant_message(active.conversation_id, active.reply.clone())
        {
            match error {
                StoreError::NotFound { .. } => {
                    tracing::debug!(error = %error, "conversation removed mid-stream");
                }
                other => tracing::warn!(error = %other, "failed to store streamed reply"),
            }
        }
    }

    fn transition(&mut self, transition: ExchangeTransition) {
        match self.phase.apply(transition) {
            Ok(next) => self.phase = next,
            Err(rejection) => {
                tracing::warn!(
                    phase = ?self.phase,
                    transition = ?transition,
                    rejection = ?rejection,
                    "rejected exchange transition"
                );
            }
        }
    }
}

enum ExchangeInput {
    Event(StreamEventMapped),
    Title(String),
}
