use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::session::ChatSession;

/// Fallback title used whenever summarization cannot produce one.
pub const FALLBACK_TITLE: &str = "New Conversation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Remote role vocabulary. The wire adapter maps `Assistant` onto whatever the
/// provider calls its own turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Routing key attached to every stream event so consumers can drop stale ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_key: u128,
    pub session_id: u64,
}

impl StreamTarget {
    pub const fn new(conversation_key: u128, session_id: u64) -> Self {
        Self {
            conversation_key,
            session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            messages,
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("prompt failed on `{stage}`, {source}"))]
    PromptFailed {
        stage: &'static str,
        source: rig::completion::PromptError,
    },
}

pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// A lazily started reply: nothing touches the network until `worker` is polled.
pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderStreamHandle {
    /// Builds a handle whose stream yields one `Error` event and then closes.
    pub fn failed(target: StreamTarget, error: &ProviderError) -> Self {
        let (event_tx, stream, _cancel_rx) = make_event_stream(target);
        let message = error.to_string();
        let worker: ProviderWorker = Box::pin(async move {
            let _ = event_tx.send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Error(message),
            });
        });

        Self { stream, worker }
    }
}

impl ProviderEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;

    /// Opens a reply stream for a fully built request.
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;

    /// Produces a short conversation title, or [`FALLBACK_TITLE`] on any failure.
    fn summarize<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, String>;

    /// Sends `message` on top of the session's seeded history.
    ///
    /// Never fails up front: request errors are delivered as a single
    /// `Error` event on the returned stream.
    fn stream_reply(&self, session: ChatSession, message: String) -> ProviderStreamHandle {
        let target = session.target();
        let request = session.into_request(message);
        match self.stream_chat(request) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(
                    target = ?target,
                    provider_id = %self.id(),
                    error = %error,
                    "provider rejected stream request"
                );
                ProviderStreamHandle::failed(target, &error)
            }
        }
    }
}

/// Channel plumbing shared by every provider: the sender feeds the returned
/// stream, and the receiver fires once the stream is cancelled or dropped.
pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}

const REDACTED: &str = "[redacted]";

/// Scrubs the API key out of error text before it is logged or surfaced.
///
/// Gemini authenticates with a `key` query parameter, so transport errors
/// that echo the request URL carry the key verbatim.
pub fn redact_api_key(text: &str, api_key: &str) -> String {
    let mut redacted = if api_key.is_empty() {
        text.to_string()
    } else {
        text.replace(api_key, REDACTED)
    };

    for marker in ["?key=", "&key="] {
        let mut search_from = 0;
        while let Some(found) = redacted[search_from..].find(marker) {
            let value_start = search_from + found + marker.len();
            let value_end = redacted[value_start..]
                .find(|character: char| {
                    matches!(character, '&' | '#' | ')' | '"' | '\'') || character.is_whitespace()
                })
                .map_or(redacted.len(), |offset| value_start + offset);
            redacted.replace_range(value_start..value_end, REDACTED);
            search_from = value_start + REDACTED.len();
        }
    }

    redacted
}

/// Cleans a raw model answer into a single-line title.
pub fn normalize_title(raw: &str) -> String {
    let first_line = raw.lines().find(|line| !line.trim().is_empty()).unwrap_or("");
    let cleaned = first_line
        .trim()
        .trim_matches(|character| matches!(character, '"' | '\'' | '*' | '#' | '`'))
        .trim()
        .trim_end_matches('.')
        .trim();

    if cleaned.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_handle_emits_single_error_then_closes() {
        let target = StreamTarget::new(7, 1);
        let error = ProviderError::MissingApiKey {
            stage: "test",
            provider_id: "gemini".to_string(),
        };
        let ProviderStreamHandle {
            mut stream,
            worker,
        } = ProviderStreamHandle::failed(target, &error);

        worker.await;

        let event = stream.recv().await.unwrap();
        assert_eq!(event.target, target);
        assert!(matches!(event.payload, StreamEventPayload::Error(ref message) if message.contains("gemini")));
        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn redact_api_key_scrubs_key_and_query_parameter() {
        let detail = "error sending request (http://127.0.0.1:9/v1beta/models/m:streamGenerateContent?alt=sse&key=sk-123)";

        let redacted = redact_api_key(detail, "sk-123");
        assert!(!redacted.contains("sk-123"));
        assert!(redacted.ends_with("&key=[redacted])"));

        // A key that was rotated since the client was built still never leaks.
        let redacted = redact_api_key("https://host/path?key=old-key&alt=sse", "new-key");
        assert_eq!(redacted, "https://host/path?key=[redacted]&alt=sse");

        assert_eq!(redact_api_key("connection refused", ""), "connection refused");
    }

    #[test]
    fn normalize_title_strips_quotes_and_falls_back() {
        assert_eq!(normalize_title("\"Quantum basics.\"\n"), "Quantum basics");
        assert_eq!(normalize_title("\n\n  ## Coffee brewing  \nextra"), "Coffee brewing");
        assert_eq!(normalize_title("   "), FALLBACK_TITLE);
    }
}
