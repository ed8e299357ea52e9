use std::sync::Arc;

use crate::batch::BatchQuery;
use crate::error::ExecutorError;
use crate::input::Embedding;
use crate::lora::LoraRegistry;

/// Tensor-parallel collective operations.
///
/// Every rank enters [`Self::sync_batch`] once per worker iteration,
/// including for empty descriptors, so collectives stay lockstep even while
/// the coordinator idles. Implementations must tolerate empty batches.
pub trait Collectives: Send + Sync {
    /// Replicate tensors from the coordinator to all ranks in place.
    fn broadcast_tp(&self, tensors: &mut [Embedding]) -> Result<(), ExecutorError>;

    /// Replicate the batch descriptor so every rank agrees on batch shape.
    /// On the coordinator this publishes `batch`; on other ranks it
    /// overwrites `batch` with the coordinator's descriptor.
    fn sync_batch(&self, batch: &mut BatchQuery) -> Result<(), ExecutorError>;
}

/// Single-rank collectives: every operation is a no-op.
#[derive(Debug, Default)]
pub struct LocalCollectives;

impl Collectives for LocalCollectives {
    fn broadcast_tp(&self, _tensors: &mut [Embedding]) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn sync_batch(&self, _batch: &mut BatchQuery) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// The model-executor capability consumed by the worker loop.
///
/// `process` computes one decoding step for a fully prepared [`BatchQuery`]
/// — prefill for members packed with their whole sequence, next-token for
/// the rest — and fills `next_tokens[i]` (and `logprobs[i]` when requested)
/// for every member `i` in packing order. It is synchronous from the
/// worker's perspective; accelerator streams are an internal concern.
pub trait Executor: Send + Sync {
    fn process(&self, batch: &mut BatchQuery) -> Result<(), ExecutorError>;

    /// The LoRA table living with the model weights.
    fn lora_registry(&self) -> Arc<LoraRegistry>;

    /// Collective-communication capability for this rank.
    fn collectives(&self) -> Arc<dyn Collectives>;
}
