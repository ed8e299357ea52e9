use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::batch::BatchQuery;
use crate::cache::CacheManager;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::stream::{GenerateStream, RequestId, StreamStatus};

/// Continuous-batching scheduler.
///
/// Owns the FIFO wait queue of enqueued streams and the running set of
/// streams holding KV blocks. Every worker iteration calls [`Self::schedule`]
/// to reap terminal streams, promote admissions, grow running streams across
/// block boundaries, and pack the step's [`BatchQuery`].
///
/// A stream is never in both collections at once; admission order equals
/// enqueue order modulo preemption, and preempted streams re-enter at the
/// queue head so the oldest request always wins the next free block.
pub struct Scheduler {
    cache: CacheManager,
    wait_queue: VecDeque<Arc<GenerateStream>>,
    /// Admission order; the most recently admitted stream sits at the back.
    running: Vec<Arc<GenerateStream>>,
    max_batch_size: usize,
    max_prefill_tokens: usize,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            cache: CacheManager::new(config.num_cache_blocks, config.block_size),
            wait_queue: VecDeque::new(),
            running: Vec::new(),
            max_batch_size: config.max_batch_size,
            max_prefill_tokens: config.max_prefill_tokens,
        }
    }

    /// Place a stream at the tail of the wait queue.
    pub fn enqueue(&mut self, stream: Arc<GenerateStream>) {
        debug!(
            request_id = stream.request_id(),
            prompt_len = stream.prompt_len(),
            "stream enqueued"
        );
        self.wait_queue.push_back(stream);
    }

    /// True iff any stream is waiting or running.
    pub fn have_streams(&self) -> bool {
        !self.wait_queue.is_empty() || !self.running.is_empty()
    }

    pub fn running_batch_size(&self) -> usize {
        self.running.len()
    }

    pub fn wait_stream_size(&self) -> usize {
        self.wait_queue.len()
    }

    pub fn block_used_ratio(&self) -> f64 {
        self.cache.block_used_ratio()
    }

    /// Build the next step's batch.
    pub fn schedule(&mut self) -> BatchQuery {
        self.reap_terminal();
        self.promote();
        self.grow_running();
        self.assemble()
    }

    /// Drop terminal streams from both collections and return their blocks
    /// to the pool. Cancelled streams park here until the step boundary, so
    /// a consumer-side cancel never races the executor.
    fn reap_terminal(&mut self) {
        let cache = &mut self.cache;
        self.wait_queue.retain(|stream| {
            if stream.is_terminal() {
                cache.free(stream.take_blocks());
                debug!(request_id = stream.request_id(), "waiting stream reaped");
                false
            } else {
                true
            }
        });
        self.running.retain(|stream| {
            if stream.is_terminal() {
                cache.free(stream.take_blocks());
                debug!(
                    request_id = stream.request_id(),
                    status = %stream.status(),
                    "running stream reaped"
                );
                false
            } else {
                true
            }
        });
    }

    /// Admit waiting streams in FIFO order while the batch-size, prefill-token,
    /// and cache gates all hold. Stops at the first stream that does not fit
    /// so admission order is preserved.
    fn promote(&mut self) {
        let mut prefill_tokens: usize = 0;
        while let Some(front) = self.wait_queue.front() {
            if self.running.len() >= self.max_batch_size {
                break;
            }
            if prefill_tokens >= self.max_prefill_tokens {
                break;
            }
            // Re-admitted streams prefill prompt + preserved tokens.
            let seq_len = front.seq_len();
            let needed = self.cache.blocks_for_tokens(seq_len);
            let Some(blocks) = self.cache.allocate(needed) else {
                break;
            };
            let stream = self
                .wait_queue
                .pop_front()
                .expect("front element checked above");
            stream.set_blocks(blocks);
            if !stream.mark_running() {
                // Cancelled between the reap and this admission pass.
                self.cache.free(stream.take_blocks());
                continue;
            }
            info!(
                request_id = stream.request_id(),
                seq_len,
                blocks = needed,
                "stream admitted"
            );
            prefill_tokens += seq_len;
            self.running.push(stream);
        }
    }

    /// Give each running stream the blocks its next token needs, evicting the
    /// most recently admitted streams when the pool runs dry.
    fn grow_running(&mut self) {
        let snapshot: Vec<Arc<GenerateStream>> = self.running.clone();
        for stream in snapshot {
            // May have been preempted by an earlier growth in this pass.
            if stream.status() != StreamStatus::Running {
                continue;
            }
            // This step writes KV entries up to position seq_len - 1: a
            // prefill covers the whole packed sequence, a decode appends the
            // previously sampled token. The token sampled THIS step lands in
            // the cache only on the next one.
            let needed = self.cache.blocks_for_tokens(stream.seq_len());
            loop {
                let held = stream.block_count();
                if held >= needed {
                    break;
                }
                if let Some(blocks) = self.cache.allocate(needed - held) {
                    for block in blocks {
                        stream.push_block(block);
                    }
                    break;
                }
                if !self.evict_latest_running(stream.request_id()) {
                    // Nothing left to evict; this stream cannot continue.
                    warn!(
                        request_id = stream.request_id(),
                        "kv pool exhausted with no eviction candidate"
                    );
                    self.cache.free(stream.take_blocks());
                    let err = EngineError::OutOfMemory {
                        request_id: stream.request_id(),
                    };
                    stream.set_error(&err.to_string());
                    break;
                }
            }
        }
    }

    /// Preempt the most recently admitted running stream other than `exclude`:
    /// free its blocks and move it, produced tokens intact, back to the head
    /// of the wait queue. Returns false when no candidate remains.
    fn evict_latest_running(&mut self, exclude: RequestId) -> bool {
        let Some(pos) = self
            .running
            .iter()
            .rposition(|s| s.request_id() != exclude && !s.is_terminal())
        else {
            return false;
        };
        let victim = self.running.remove(pos);
        self.cache.free(victim.take_blocks());
        victim.mark_preempted();
        info!(
            request_id = victim.request_id(),
            produced = victim.produced_len(),
            "stream preempted to wait queue"
        );
        self.wait_queue.push_front(victim);
        true
    }

    /// Pack the step's batch: prefill members (first step after admission)
    /// first, then decode members.
    fn assemble(&mut self) -> BatchQuery {
        let mut batch = BatchQuery::default();
        for stream in &self.running {
            if stream.status() != StreamStatus::Running {
                continue;
            }
            if stream.needs_prefill() {
                batch.push_prefill(stream);
            } else {
                batch.push_decode(stream);
            }
        }
        batch.seal();
        batch
    }

    /// Apply executor output to the batch's member streams. Cancelled members
    /// have their results discarded; everyone else appends exactly one token
    /// and has its generation bumped.
    pub fn update_batch_query(&mut self, batch: &BatchQuery) {
        for (i, stream) in batch.members().enumerate() {
            if stream.is_cancelled() {
                continue;
            }
            let Some(token) = batch.next_tokens.get(i).copied().flatten() else {
                warn!(
                    request_id = stream.request_id(),
                    member = i,
                    "executor left batch member without a token"
                );
                stream.set_error("executor returned no token for batch member");
                continue;
            };
            let logprob = batch.logprobs.get(i).copied().flatten();
            stream.append_step(token, logprob);
        }
    }

    /// Terminally error every current member, waiting or running. Used when
    /// the executor fails a whole step.
    pub fn update_all_errors(&mut self, message: &str) {
        for stream in self.wait_queue.iter().chain(self.running.iter()) {
            stream.set_error(message);
        }
    }
}
