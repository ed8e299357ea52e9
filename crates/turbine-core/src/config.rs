use serde::{Deserialize, Serialize};

/// Tensor-parallel topology descriptor, injected at engine construction.
///
/// Rank 0 is the coordinator: it owns scheduling decisions while the other
/// ranks mirror its batch descriptor through [`Collectives::sync_batch`].
///
/// [`Collectives::sync_batch`]: crate::executor::Collectives::sync_batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelInfo {
    /// Number of tensor-parallel ranks (≥ 1).
    pub tp_size: usize,
    /// This process's rank in `[0, tp_size)`.
    pub tp_rank: usize,
}

impl ParallelInfo {
    /// Single-process topology.
    pub fn single() -> Self {
        Self {
            tp_size: 1,
            tp_rank: 0,
        }
    }

    /// Whether this rank makes scheduling decisions.
    pub fn is_coordinator(&self) -> bool {
        self.tp_rank == 0
    }
}

impl Default for ParallelInfo {
    fn default() -> Self {
        Self::single()
    }
}

/// Engine-level limits and KV-cache geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on prompt length + generated tokens per request.
    pub max_seq_len: usize,
    /// Maximum number of streams decoded together in one step.
    pub max_batch_size: usize,
    /// Budget of prompt tokens admitted for prefill within one step.
    pub max_prefill_tokens: usize,
    /// Tokens covered by a single KV-cache block.
    pub block_size: usize,
    /// Total number of KV-cache blocks in the pool.
    pub num_cache_blocks: usize,
    /// Tensor-parallel topology.
    pub parallel: ParallelInfo,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_seq_len: 2048,
            max_batch_size: 8,
            max_prefill_tokens: 2048,
            block_size: 16,
            num_cache_blocks: 512,
            parallel: ParallelInfo::single(),
        }
    }
}
