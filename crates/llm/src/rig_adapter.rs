use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage, Prompt};
use rig::prelude::CompletionClient;
use rig::providers::gemini;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::model::{DEFAULT_GEMINI_MODEL, GEMINI_PROVIDER_ID};
use super::provider::{
    BoxFuture, CompletionsFailedSnafu, EmptyMessageSetSnafu, FALLBACK_TITLE, HttpClientSnafu,
    LlmProvider, MissingApiKeySnafu, PromptFailedSnafu, ProviderConfig, ProviderError,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role,
    StreamEventMapped, StreamEventPayload, StreamRequest, StreamTarget, make_event_stream,
    normalize_title, redact_api_key,
};

const TITLE_PREAMBLE: &str = "You name chat conversations. Reply with a title of at most six \
words that summarizes the user's message. Reply with the title only.";

pub struct RigProviderAdapter {
    config: ProviderConfig,
    default_model: String,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self {
            config,
            default_model: DEFAULT_GEMINI_MODEL.to_string(),
        })
    }

    pub fn with_default_model(mut self, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        if !model_id.trim().is_empty() {
            self.default_model = model_id.trim().to_string();
        }
        self
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    /// Splits the request into the prior turns and the prompt being answered.
    fn split_prompt(request: &StreamRequest) -> ProviderResult<(RigMessage, Vec<RigMessage>)> {
        let mut messages = request
            .messages
            .iter()
            .filter(|message| !message.content.is_empty())
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                target = ?request.target,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no non-empty messages remain"
            );
            return EmptyMessageSetSnafu {
                stage: "split-prompt",
                target: request.target,
            }
            .fail();
        };

        Ok((prompt, messages))
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        detail: String,
    ) {
        let _ = event_tx.send(StreamEventMapped {
            target,
            payload: StreamEventPayload::Error(detail),
        });
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        let payload = match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                StreamEventPayload::Delta(text.text)
            }
            // Reasoning, tool calls and the final usage record carry no thread text.
            _ => return None,
        };

        Some(StreamEventMapped { target, payload })
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let opened = async {
            let client = Self::build_client(&config)?;
            let model = client.completion_model(request.model_id.clone());
            let (prompt, history) = Self::split_prompt(&request)?;

            model
                .completion_request(prompt)
                .messages(history)
                .stream()
                .await
                .context(CompletionsFailedSnafu {
                    stage: "open-stream",
                })
        };

        let mut stream = match opened.await {
            Ok(stream) => stream,
            Err(error) => {
                let detail = redact_api_key(&error.to_string(), &config.api_key);
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %detail,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, detail);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;
        let mut fragment_count = 0_usize;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item) {
                                fragment_count += 1;
                                if event_tx.send(mapped).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            let detail = redact_api_key(&error.to_string(), &config.api_key);
                            tracing::warn!(
                                target = ?target,
                                fragment_count,
                                error = %detail,
                                "provider stream emitted an error chunk"
                            );
                            Self::emit_error_event(&event_tx, target, detail);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            tracing::debug!(target = ?target, fragment_count, "provider stream finished");
            let _ = event_tx.send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Done,
            });
        }
    }

    async fn request_title(&self, prompt: &str) -> ProviderResult<String> {
        let client = Self::build_client(&self.config)?;
        let agent = client
            .agent(self.default_model.as_str())
            .preamble(TITLE_PREAMBLE)
            .build();

        agent
            .prompt(prompt.to_string())
            .await
            .context(PromptFailedSnafu {
                stage: "summarize-prompt",
            })
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Gemini"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }

    fn summarize<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move {
            if prompt.trim().is_empty() {
                return FALLBACK_TITLE.to_string();
            }

            match self.request_title(prompt).await {
                Ok(raw) => normalize_title(&raw),
                Err(error) => {
                    tracing::warn!(
                        provider_id = %self.id(),
                        error = %redact_api_key(&error.to_string(), &self.config.api_key),
                        "title summarization failed; using fallback title"
                    );
                    FALLBACK_TITLE.to_string()
                }
            }
        })
    }
}

pub(crate) fn is_gemini_provider(provider_id: &str) -> bool {
    matches!(provider_id, GEMINI_PROVIDER_ID | "google" | "rig-gemini")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChatSession;

    fn request_with(messages: Vec<ProviderMessage>) -> StreamRequest {
        StreamRequest::new(StreamTarget::new(1, 1), DEFAULT_GEMINI_MODEL, messages)
    }

    #[test]
    fn new_rejects_blank_api_key() {
        let result = RigProviderAdapter::new(ProviderConfig::new("gemini", "   ", ""));
        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }

    #[test]
    fn split_prompt_uses_last_message_as_prompt() {
        let request = request_with(vec![
            ProviderMessage::new(Role::User, "first"),
            ProviderMessage::new(Role::Assistant, ""),
            ProviderMessage::new(Role::User, "second"),
        ]);

        let (prompt, history) = RigProviderAdapter::split_prompt(&request).unwrap();

        assert!(matches!(prompt, RigMessage::User { .. }));
        // Empty assistant turns are dropped before they reach the wire.
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0], RigMessage::User { .. }));
    }

    #[test]
    fn split_prompt_rejects_requests_without_content() {
        let request = request_with(vec![ProviderMessage::new(Role::User, "")]);
        let result = RigProviderAdapter::split_prompt(&request);
        assert!(matches!(result, Err(ProviderError::EmptyMessageSet { .. })));
    }

    #[test]
    fn stream_chat_rejects_empty_request() {
        let adapter =
            RigProviderAdapter::new(ProviderConfig::new("gemini", "test-key", "")).unwrap();
        let result = adapter.stream_chat(request_with(Vec::new()));
        assert!(matches!(result, Err(ProviderError::EmptyMessageSet { .. })));
    }

    #[test]
    fn recognizes_gemini_aliases() {
        assert!(is_gemini_provider("gemini"));
        assert!(is_gemini_provider("google"));
        assert!(!is_gemini_provider("openai"));
    }

    #[tokio::test]
    async fn transport_errors_never_carry_the_api_key() {
        let api_key = "parley-secret-key";
        // Nothing listens on the discard port, so the request fails in transport.
        let adapter = RigProviderAdapter::new(ProviderConfig::new(
            "gemini",
            api_key,
            "http://127.0.0.1:9",
        ))
        .unwrap();
        let session = ChatSession::seeded(StreamTarget::new(3, 1), DEFAULT_GEMINI_MODEL, Vec::new());

        let ProviderStreamHandle { mut stream, worker } =
            adapter.stream_reply(session, "hello".to_string());
        worker.await;

        let mut details = Vec::new();
        while let Some(event) = stream.recv().await {
            if let StreamEventPayload::Error(detail) = event.payload {
                details.push(detail);
            }
        }

        assert_eq!(details.len(), 1);
        assert!(!details[0].contains(api_key), "leaked key in {:?}", details[0]);
    }
}
