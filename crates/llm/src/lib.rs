use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;
mod session;

pub use model::{
    DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL, GEMINI_PROVIDER_ID,
    resolve_provider_id,
};
pub use provider::{
    BoxFuture, FALLBACK_TITLE, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role,
    StreamEventMapped, StreamEventPayload, StreamRequest, StreamTarget, make_event_stream,
    normalize_title, redact_api_key,
};
pub use rig_adapter::RigProviderAdapter;
pub use session::ChatSession;

pub fn create_provider(
    mut config: ProviderConfig,
    default_model: &str,
) -> ProviderResult<Arc<dyn LlmProvider>> {
    config.provider_id = resolve_provider_id(&config.provider_id).to_string();

    if rig_adapter::is_gemini_provider(&config.provider_id) {
        config.provider_id = GEMINI_PROVIDER_ID.to_string();
        let adapter = RigProviderAdapter::new(config)?.with_default_model(default_model);
        return Ok(Arc::new(adapter));
    }

    Err(ProviderError::UnsupportedProvider {
        stage: "create-provider",
        provider_id: config.provider_id,
    })
}
