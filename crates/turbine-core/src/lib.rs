//! Asynchronous decoder engine for continuous-batching LLM serving.
//!
//! The engine accepts an open-ended stream of generation requests,
//! interleaves their token-by-token decoding on a shared accelerator, and
//! returns incremental snapshots to each caller. Three subsystems carry the
//! weight:
//!
//! - a scheduler that rebuilds the decode mini-batch every step from a pool
//!   of in-flight requests under a bounded KV-cache block budget,
//! - per-request generation streams bridging the single worker thread to
//!   many concurrent async consumers, with cooperative cancellation and
//!   guaranteed resource release,
//! - reference-counted resource accounting for KV blocks and LoRA adapters.
//!
//! Model kernels, tokenization, and transport live outside the crate; the
//! engine consumes them through the [`Executor`] and [`Collectives`]
//! capabilities.

pub mod batch;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod input;
pub mod lora;
pub mod metrics;
pub mod scheduler;
pub mod stream;

#[cfg(test)]
mod tests;

pub use batch::BatchQuery;
pub use cache::{BlockId, CacheManager};
pub use config::{EngineConfig, ParallelInfo};
pub use engine::{DecoderEngine, GenerateHandle};
pub use error::{EngineError, ExecutorError};
pub use executor::{Collectives, Executor, LocalCollectives};
pub use input::{
    Embedding, GenerateConfig, GenerateInput, RequestFormat, SamplingParams, TokenId,
};
pub use lora::{LoraHolder, LoraId, LoraRegistry};
pub use scheduler::Scheduler;
pub use stream::{GenerateOutput, GenerateStream, RequestId, StreamStatus};
