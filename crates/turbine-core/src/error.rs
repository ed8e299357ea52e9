use thiserror::Error;

use crate::stream::RequestId;

/// Errors surfaced by the decoder engine and its resource managers.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The request carried no prompt tokens.
    #[error("prompt must not be empty")]
    EmptyPrompt,

    /// The prompt leaves no room for generation under `max_seq_len`.
    #[error(
        "prompt of {prompt_len} tokens leaves no room to generate \
         (max_seq_len {max_seq_len})"
    )]
    LongPrompt {
        prompt_len: usize,
        max_seq_len: usize,
    },

    /// The KV-cache pool cannot satisfy an allocation even after eviction.
    #[error("out of kv-cache memory for request {request_id}")]
    OutOfMemory { request_id: RequestId },

    /// The named LoRA adapter is not registered.
    #[error("lora adapter not found: {name}")]
    AdapterNotFound { name: String },

    /// The model executor failed while processing a batch.
    #[error("executor failed: {message}")]
    Executor { message: String },

    /// The request was cancelled by the caller.
    #[error("request {request_id} cancelled: {reason}")]
    Cancelled { request_id: RequestId, reason: String },

    /// The engine worker has been stopped.
    #[error("decoder engine stopped")]
    EngineStopped,
}

/// Errors returned by [`Executor`] / [`Collectives`] collaborators.
///
/// The engine folds these into [`EngineError::Executor`] before they reach
/// member streams.
///
/// [`Executor`]: crate::executor::Executor
/// [`Collectives`]: crate::executor::Collectives
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    /// A model kernel failed. Messages carrying an accelerator marker
    /// (e.g. "CUDA") trigger the engine's fast-fail path.
    #[error("kernel failure: {message}")]
    Kernel { message: String },

    /// A tensor-parallel collective failed.
    #[error("collective failure: {message}")]
    Collective { message: String },
}

impl ExecutorError {
    pub fn message(&self) -> &str {
        match self {
            Self::Kernel { message } | Self::Collective { message } => message,
        }
    }
}
