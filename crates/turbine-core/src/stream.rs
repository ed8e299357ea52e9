use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use strum::Display;
use tokio::sync::Notify;
use tracing::debug;

use crate::cache::BlockId;
use crate::input::{GenerateInput, TokenId};
use crate::lora::LoraId;

/// Monotonic id assigned to each accepted request.
pub type RequestId = u64;

/// Lifecycle state of a generation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    /// Waiting in the scheduler's admission queue.
    Queued,
    /// Admitted; holds cache blocks and participates in decode steps.
    Running,
    /// Terminated by a stop token.
    FinishedEos,
    /// Terminated by the new-token cap.
    FinishedLength,
    /// Terminated by the caller.
    Cancelled,
    /// Terminated by an engine or executor failure.
    Errored,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// One observed snapshot of a stream, returned to the request side.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    pub request_id: RequestId,
    /// Prompt tokens followed by everything produced so far.
    pub token_ids: Vec<TokenId>,
    /// Tokens new since the consumer's previous snapshot.
    pub delta: Vec<TokenId>,
    pub status: StreamStatus,
    /// Set iff status is `Cancelled` or `Errored`.
    pub stop_reason: Option<String>,
    /// Per-produced-token logprobs, when the request asked for them.
    pub logprobs: Option<Vec<f32>>,
}

impl GenerateOutput {
    pub fn finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Consistent (generation, state) pair read under the stream's lock.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub generation: u64,
    pub status: StreamStatus,
    pub produced: Vec<TokenId>,
    pub stop_reason: Option<String>,
    pub logprobs: Option<Vec<f32>>,
}

struct StreamInner {
    produced: Vec<TokenId>,
    logprobs: Vec<f32>,
    status: StreamStatus,
    stop_reason: Option<String>,
    /// KV blocks currently owned by this stream, in allocation order.
    blocks: Vec<BlockId>,
    /// True between admission and the first processed step; the next batch
    /// must run this stream through prefill (prompt + preserved tokens).
    needs_prefill: bool,
    /// Scoped release actions, run LIFO exactly once.
    destructors: Vec<Box<dyn FnOnce() + Send>>,
    released: bool,
}

/// Per-request mutable state shared between the scheduler, the worker loop,
/// and the request-facing consumer.
///
/// The token buffer is append-only; its length is additionally published
/// through an atomic so readers can size snapshots without the lock. The
/// worker is the only writer of `produced`; the request side mutates only
/// the status word (`cancel`) and the destructor list.
pub struct GenerateStream {
    request_id: RequestId,
    input: GenerateInput,
    /// `max_new_tokens` after clipping to `max_seq_len - prompt_len`.
    max_new_tokens: usize,
    /// Bumped once per decode step that advances this stream.
    generation: AtomicU64,
    produced_len: AtomicUsize,
    /// Wakes `observe` callers on step advance or terminal transition.
    notify: Notify,
    inner: Mutex<StreamInner>,
}

impl std::fmt::Debug for GenerateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateStream")
            .field("request_id", &self.request_id)
            .field("prompt_len", &self.prompt_len())
            .field("produced_len", &self.produced_len())
            .finish()
    }
}

impl GenerateStream {
    pub fn new(request_id: RequestId, input: GenerateInput, max_new_tokens: usize) -> Self {
        Self {
            request_id,
            input,
            max_new_tokens,
            generation: AtomicU64::new(0),
            produced_len: AtomicUsize::new(0),
            notify: Notify::new(),
            inner: Mutex::new(StreamInner {
                produced: Vec::new(),
                logprobs: Vec::new(),
                status: StreamStatus::Queued,
                stop_reason: None,
                blocks: Vec::new(),
                needs_prefill: false,
                destructors: Vec::new(),
                released: false,
            }),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, StreamInner> {
        self.inner.lock().expect("stream lock poisoned")
    }

    // ── Identity and dimensions ──────────────────────────────────────────────

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn input(&self) -> &GenerateInput {
        &self.input
    }

    pub fn lora_id(&self) -> Option<LoraId> {
        self.input.lora_id
    }

    pub fn prompt_len(&self) -> usize {
        self.input.token_ids.len()
    }

    pub fn produced_len(&self) -> usize {
        self.produced_len.load(Ordering::Acquire)
    }

    /// Prompt length plus produced tokens.
    pub fn seq_len(&self) -> usize {
        self.prompt_len() + self.produced_len()
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // ── Status word ──────────────────────────────────────────────────────────

    pub fn status(&self) -> StreamStatus {
        self.lock_inner().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == StreamStatus::Cancelled
    }

    /// QUEUED → RUNNING on admission; the next step prefills this stream.
    /// Returns false if the stream turned terminal since it was queued
    /// (e.g. cancelled while the scheduler was mid-pass).
    pub(crate) fn mark_running(&self) -> bool {
        let mut inner = self.lock_inner();
        if inner.status != StreamStatus::Queued {
            return false;
        }
        inner.status = StreamStatus::Running;
        inner.needs_prefill = true;
        true
    }

    /// RUNNING → QUEUED on eviction. Produced tokens are preserved; the
    /// stream re-prefills its full sequence when re-admitted.
    pub(crate) fn mark_preempted(&self) {
        let mut inner = self.lock_inner();
        if inner.status == StreamStatus::Running {
            inner.status = StreamStatus::Queued;
            inner.needs_prefill = false;
        }
    }

    /// Request cancellation. Safe from any thread; idempotent; a no-op once
    /// the stream is already terminal.
    pub fn cancel(&self, reason: &str) {
        let mut inner = self.lock_inner();
        if inner.status.is_terminal() {
            return;
        }
        inner.status = StreamStatus::Cancelled;
        inner.stop_reason = Some(reason.to_owned());
        drop(inner);
        debug!(request_id = self.request_id, reason, "stream cancelled");
        self.notify.notify_waiters();
    }

    /// Terminal failure. Idempotent against already-terminal streams.
    pub(crate) fn set_error(&self, message: &str) {
        let mut inner = self.lock_inner();
        if inner.status.is_terminal() {
            return;
        }
        inner.status = StreamStatus::Errored;
        inner.stop_reason = Some(message.to_owned());
        drop(inner);
        self.notify.notify_waiters();
    }

    // ── Worker-side token appends ────────────────────────────────────────────

    /// Record one sampled token, called by the worker under the scheduler's
    /// step lock. Appends, resolves terminal transitions (stop token, length
    /// cap), then bumps the stream's generation and wakes waiters. Ignored
    /// if the stream turned terminal in the meantime (e.g. cancelled
    /// mid-step: the result is discarded).
    pub(crate) fn append_step(&self, token: TokenId, logprob: Option<f32>) {
        let mut inner = self.lock_inner();
        if inner.status.is_terminal() {
            return;
        }
        inner.produced.push(token);
        if let Some(lp) = logprob {
            inner.logprobs.push(lp);
        }
        self.produced_len.store(inner.produced.len(), Ordering::Release);
        inner.needs_prefill = false;

        if self.input.config.stop_token_ids.contains(&token) {
            inner.status = StreamStatus::FinishedEos;
        } else if inner.produced.len() >= self.max_new_tokens {
            inner.status = StreamStatus::FinishedLength;
        }
        // The append is visible before the generation moves.
        self.generation.fetch_add(1, Ordering::AcqRel);
        drop(inner);
        self.notify.notify_waiters();
    }

    // ── Batch assembly helpers ───────────────────────────────────────────────

    pub(crate) fn needs_prefill(&self) -> bool {
        self.lock_inner().needs_prefill
    }

    /// Full token sequence to prefill: prompt plus any tokens preserved
    /// across preemption.
    pub(crate) fn prefill_tokens(&self) -> Vec<TokenId> {
        let inner = self.lock_inner();
        let mut tokens = self.input.token_ids.clone();
        tokens.extend_from_slice(&inner.produced);
        tokens
    }

    /// Input token for a decode step: the most recent produced token.
    pub(crate) fn last_token(&self) -> TokenId {
        let inner = self.lock_inner();
        inner
            .produced
            .last()
            .or_else(|| self.input.token_ids.last())
            .copied()
            .unwrap_or_default()
    }

    // ── Cache-block accounting ───────────────────────────────────────────────

    pub(crate) fn set_blocks(&self, blocks: Vec<BlockId>) {
        self.lock_inner().blocks = blocks;
    }

    pub(crate) fn push_block(&self, block: BlockId) {
        self.lock_inner().blocks.push(block);
    }

    pub(crate) fn take_blocks(&self) -> Vec<BlockId> {
        std::mem::take(&mut self.lock_inner().blocks)
    }

    pub(crate) fn block_count(&self) -> usize {
        self.lock_inner().blocks.len()
    }

    pub(crate) fn block_table(&self) -> Vec<BlockId> {
        self.lock_inner().blocks.clone()
    }

    // ── Request-side observation ─────────────────────────────────────────────

    pub(crate) fn snapshot(&self) -> Snapshot {
        let inner = self.lock_inner();
        Snapshot {
            generation: self.generation.load(Ordering::Acquire),
            status: inner.status,
            produced: inner.produced.clone(),
            stop_reason: inner.stop_reason.clone(),
            logprobs: self
                .input
                .config
                .return_logprobs
                .then(|| inner.logprobs.clone()),
        }
    }

    /// Wait until the stream advanced past `last_seen` or reached a terminal
    /// status, then return the latest snapshot.
    pub(crate) async fn observe(&self, last_seen: u64) -> Snapshot {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            // Register interest before checking state, or a wake landing
            // between the check and the await would be lost.
            notified.as_mut().enable();
            let snap = self.snapshot();
            if snap.generation != last_seen || snap.status.is_terminal() {
                return snap;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    // ── Scoped resource release ──────────────────────────────────────────────

    pub(crate) fn push_destructor(&self, dtor: Box<dyn FnOnce() + Send>) {
        self.lock_inner().destructors.push(dtor);
    }

    /// Run the destructor list, newest first. Idempotent; every terminal
    /// path funnels through here exactly once.
    pub fn release_resource(&self) {
        let dtors = {
            let mut inner = self.lock_inner();
            if inner.released {
                return;
            }
            inner.released = true;
            std::mem::take(&mut inner.destructors)
        };
        // Run outside the lock; a destructor must not observe a held stream.
        for dtor in dtors.into_iter().rev() {
            dtor();
        }
    }

    pub(crate) fn build_output(&self, snap: &Snapshot, seen: usize) -> GenerateOutput {
        let mut token_ids = self.input.token_ids.clone();
        token_ids.extend_from_slice(&snap.produced);
        GenerateOutput {
            request_id: self.request_id,
            delta: snap.produced.get(seen..).unwrap_or_default().to_vec(),
            token_ids,
            status: snap.status,
            stop_reason: snap.stop_reason.clone(),
            logprobs: snap.logprobs.clone(),
        }
    }
}
