use std::sync::Arc;

mod provider;
mod rig_adapter;
mod scripted;

pub use provider::{
    BoxFuture, CompletionProvider, CompletionRequest, ProviderConfig, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker,
    Role, StreamEvent, StreamEventPayload, StreamSessionId,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptStep, ScriptedProvider};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn CompletionProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        SCRIPTED_PROVIDER_ID => Ok(Arc::new(ScriptedProvider::new())),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
