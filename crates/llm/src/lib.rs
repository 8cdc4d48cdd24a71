use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;

pub use model::{
    DEFAULT_MAX_TOKENS, DEFAULT_MODEL_ID, DEFAULT_TEMPERATURE, DEFAULT_TOP_P, SamplingParams,
};
pub use provider::{
    LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped,
    StreamEventPayload, StreamRequest, StreamTarget, make_event_stream,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};

/// Provider ids that speak the OpenAI chat protocol and share the rig adapter.
const OPENAI_COMPATIBLE_IDS: &[&str] = &["openai", "rig-openai", "huggingface", "hf"];

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    if OPENAI_COMPATIBLE_IDS.contains(&config.provider_id.as_str()) {
        return Ok(Arc::new(RigProviderAdapter::new(config)?));
    }

    Err(ProviderError::UnsupportedProvider {
        stage: "create-provider",
        provider_id: config.provider_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_provider_id_falls_back_to_openai() {
        let provider = create_provider(ProviderConfig::new("", "key", "")).unwrap();
        assert_eq!(provider.id(), RIG_OPENAI_PROVIDER_ID);
    }

    #[test]
    fn huggingface_router_reuses_the_openai_adapter() {
        let provider = create_provider(ProviderConfig::new(
            "huggingface",
            "key",
            "https://router.huggingface.co/v1",
        ))
        .unwrap();
        assert_eq!(provider.id(), "huggingface");
        assert_eq!(provider.default_model(), DEFAULT_MODEL_ID);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let result = create_provider(ProviderConfig::new("bedrock", "key", ""));
        assert!(matches!(
            result,
            Err(ProviderError::UnsupportedProvider { provider_id, .. }) if provider_id == "bedrock"
        ));
    }
}
