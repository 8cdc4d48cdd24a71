use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen2.5-Coder-32B-Instruct";

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u64 = 2048;
pub const DEFAULT_TOP_P: f64 = 0.9;

/// Sampling knobs forwarded with every generation request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: Some(DEFAULT_TEMPERATURE),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            top_p: Some(DEFAULT_TOP_P),
        }
    }
}

impl SamplingParams {
    /// Leaves every knob to the provider's own defaults.
    pub const fn unset() -> Self {
        Self {
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    /// Extra request fields rig has no dedicated builder method for.
    pub fn additional_params(&self) -> Option<serde_json::Value> {
        self.top_p.map(|top_p| serde_json::json!({ "top_p": top_p }))
    }
}
