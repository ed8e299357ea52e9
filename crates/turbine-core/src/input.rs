use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::lora::LoraId;

/// Token id in the model vocabulary.
pub type TokenId = u32;

/// Opaque pre-computed multimodal embedding, produced outside the core.
///
/// Shared without copying; the last holder dropping it releases the buffer.
pub type Embedding = Arc<[f32]>;

/// Wire shape the prompt was built from. The core does not interpret it;
/// it travels with the request for executors that condition on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestFormat {
    #[default]
    Raw,
    ChatApi,
}

/// Per-request sampling knobs, forwarded verbatim to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
        }
    }
}

/// Generation options recognized by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// Upper bound on generated tokens; clipped to `max_seq_len - prompt_len`
    /// at admission.
    pub max_new_tokens: usize,
    /// Token ids that terminate generation (EOS and friends).
    pub stop_token_ids: HashSet<TokenId>,
    pub sampling: SamplingParams,
    /// Name of the LoRA adapter to apply, if any.
    pub adapter_name: Option<String>,
    pub request_format: RequestFormat,
    pub return_logprobs: bool,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 64,
            stop_token_ids: HashSet::new(),
            sampling: SamplingParams::default(),
            adapter_name: None,
            request_format: RequestFormat::Raw,
            return_logprobs: false,
        }
    }
}

/// An immutable generation request.
///
/// `lora_id` starts out `None` and is filled by the engine once the adapter
/// named in [`GenerateConfig::adapter_name`] has been read-acquired.
#[derive(Debug, Clone)]
pub struct GenerateInput {
    /// Prompt token ids. Must be non-empty.
    pub token_ids: Vec<TokenId>,
    /// Optional token-type ids, parallel to `token_ids`.
    pub token_type_ids: Option<Vec<TokenId>>,
    /// Optional pre-computed multimodal embedding.
    pub embedding: Option<Embedding>,
    pub config: GenerateConfig,
    /// Assigned post-admission; opaque to callers.
    pub lora_id: Option<LoraId>,
}

impl GenerateInput {
    /// A plain text-token request with default options.
    pub fn from_tokens(token_ids: Vec<TokenId>) -> Self {
        Self {
            token_ids,
            token_type_ids: None,
            embedding: None,
            config: GenerateConfig::default(),
            lora_id: None,
        }
    }

    pub fn with_config(mut self, config: GenerateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn prompt_len(&self) -> usize {
        self.token_ids.len()
    }
}
