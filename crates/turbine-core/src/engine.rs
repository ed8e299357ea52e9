use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_stream::Stream;
use tracing::{debug, error, info};

use crate::batch::BatchQuery;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::input::{Embedding, GenerateInput};
use crate::lora::LoraHolder;
use crate::metrics::{self, MetricsSink, StepTimer, TracingMetrics};
use crate::scheduler::Scheduler;
use crate::stream::{GenerateOutput, GenerateStream, RequestId};

/// Per-rank sleep after an iteration whose synced batch was still empty.
const IDLE_SLEEP: Duration = Duration::from_millis(1);
/// Grace period before a fatal exit, letting consumers observe their
/// terminal snapshots and metrics flush.
const FATAL_DRAIN: Duration = Duration::from_millis(100);
/// Failure messages carrying this marker indicate accelerator-context
/// corruption, which cannot be recovered mid-run.
const ACCELERATOR_MARKER: &str = "CUDA";

struct EngineShared {
    scheduler: Mutex<Scheduler>,
    executor: Arc<dyn Executor>,
    config: EngineConfig,
    metrics: Arc<dyn MetricsSink>,
    stop: AtomicBool,
    /// Engine-wide decode generation, bumped once per completed iteration.
    step_generation: AtomicU64,
    step_notify: Notify,
    next_request_id: AtomicU64,
}

impl EngineShared {
    fn lock_scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().expect("scheduler lock poisoned")
    }

    fn bump_step(&self) {
        self.step_generation.fetch_add(1, Ordering::AcqRel);
        self.step_notify.notify_waiters();
    }
}

/// The asynchronous decoder engine.
///
/// Owns a dedicated OS worker thread that drives the continuous-batching
/// loop: pick a batch, run the executor, write tokens back into member
/// streams, wake waiters. Request-facing callers interact only through
/// [`Self::decode`] / [`Self::generate`] and the returned handle; the two
/// sides meet at the scheduler's step lock and the streams' status words.
pub struct DecoderEngine {
    shared: Arc<EngineShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DecoderEngine {
    pub fn new(executor: Arc<dyn Executor>, scheduler: Scheduler, config: EngineConfig) -> Self {
        Self::with_metrics(executor, scheduler, config, Arc::new(TracingMetrics))
    }

    /// Start the engine with a custom metrics sink.
    ///
    /// Spawns the decode worker immediately; the engine is serving as soon
    /// as this returns.
    pub fn with_metrics(
        executor: Arc<dyn Executor>,
        scheduler: Scheduler,
        config: EngineConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let parallel = config.parallel;
        let shared = Arc::new(EngineShared {
            scheduler: Mutex::new(scheduler),
            executor,
            config,
            metrics,
            stop: AtomicBool::new(false),
            step_generation: AtomicU64::new(0),
            step_notify: Notify::new(),
            next_request_id: AtomicU64::new(0),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("turbine-decode".to_owned())
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn decode worker thread")
        };
        info!(
            tp_rank = parallel.tp_rank,
            tp_size = parallel.tp_size,
            "decoder engine started"
        );
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Submit a request and return a handle yielding incremental snapshots.
    ///
    /// Validation is synchronous: an empty prompt, a prompt filling
    /// `max_seq_len`, a zero token budget after clipping, and an unknown
    /// adapter name all fail here, before any stream exists.
    pub fn decode(&self, mut input: GenerateInput) -> Result<GenerateHandle, EngineError> {
        let prompt_len = input.prompt_len();
        if prompt_len == 0 {
            return Err(EngineError::EmptyPrompt);
        }
        let max_seq_len = self.shared.config.max_seq_len;
        if prompt_len >= max_seq_len {
            return Err(EngineError::LongPrompt {
                prompt_len,
                max_seq_len,
            });
        }
        let max_new_tokens = input.config.max_new_tokens.min(max_seq_len - prompt_len);
        if max_new_tokens == 0 {
            return Err(EngineError::LongPrompt {
                prompt_len,
                max_seq_len,
            });
        }
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(EngineError::EngineStopped);
        }

        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);

        // Pin the adapter before the stream exists so an unknown name fails
        // synchronously; the release rides the stream's destructor list.
        let mut holder = None;
        if let Some(name) = input.config.adapter_name.clone() {
            let acquired = LoraHolder::acquire(self.shared.executor.lora_registry(), &name)?;
            input.lora_id = Some(acquired.lora_id());
            holder = Some(acquired);
        }

        let stream = Arc::new(GenerateStream::new(request_id, input, max_new_tokens));
        if let Some(holder) = holder {
            stream.push_destructor(Box::new(move || holder.release()));
        }

        debug!(request_id, prompt_len, max_new_tokens, "request accepted");
        self.shared.lock_scheduler().enqueue(Arc::clone(&stream));
        Ok(GenerateHandle {
            stream,
            last_seen: 0,
            emitted: 0,
            done: false,
        })
    }

    /// Unary convenience: drive the request to completion and return the
    /// final snapshot.
    pub async fn generate(&self, input: GenerateInput) -> Result<GenerateOutput, EngineError> {
        let mut handle = self.decode(input)?;
        let mut last = None;
        while let Some(output) = handle.next().await {
            last = Some(output);
        }
        last.ok_or(EngineError::EngineStopped)
    }

    /// Ask the worker to exit and join it. Idempotent.
    pub fn stop(&self) {
        info!("decoder engine begin stop");
        self.shared.stop.store(true, Ordering::Release);
        let handle = self
            .worker
            .lock()
            .expect("worker handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        info!("decoder engine stop done");
    }

    // ── Observability ────────────────────────────────────────────────────────

    pub fn running_batch_size(&self) -> usize {
        self.shared.lock_scheduler().running_batch_size()
    }

    pub fn wait_stream_size(&self) -> usize {
        self.shared.lock_scheduler().wait_stream_size()
    }

    pub fn kv_cache_used_ratio(&self) -> f64 {
        self.shared.lock_scheduler().block_used_ratio()
    }

    /// Engine-wide decode generation; advances once per completed step.
    pub fn step_generation(&self) -> u64 {
        self.shared.step_generation.load(Ordering::Acquire)
    }

    /// Wait until the engine-wide generation moves past `last_seen` and
    /// return the new value. Every completed step wakes all waiters.
    pub async fn next_step(&self, last_seen: u64) -> u64 {
        let mut notified = std::pin::pin!(self.shared.step_notify.notified());
        loop {
            notified.as_mut().enable();
            let current = self.shared.step_generation.load(Ordering::Acquire);
            if current != last_seen {
                return current;
            }
            notified.as_mut().await;
            notified.set(self.shared.step_notify.notified());
        }
    }
}

impl Drop for DecoderEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Request-side handle to one in-flight generation.
///
/// Each `next().await` waits for the stream to advance (or terminate) and
/// returns the latest snapshot; intermediate tokens missed between polls are
/// still present in `token_ids`, so consumers never lose data. Dropping the
/// handle cancels the request and releases its resources; the scheduler
/// reclaims the KV blocks at the next step boundary.
pub struct GenerateHandle {
    stream: Arc<GenerateStream>,
    last_seen: u64,
    /// Produced tokens already reported, for delta computation.
    emitted: usize,
    done: bool,
}

impl GenerateHandle {
    pub fn request_id(&self) -> RequestId {
        self.stream.request_id()
    }

    /// Cooperative cancellation; safe from any task.
    pub fn cancel(&self, reason: &str) {
        self.stream.cancel(reason);
    }

    /// Next snapshot, or `None` once the terminal snapshot has been yielded.
    pub async fn next(&mut self) -> Option<GenerateOutput> {
        if self.done {
            return None;
        }
        let snap = self.stream.observe(self.last_seen).await;
        self.last_seen = snap.generation;
        let output = self.stream.build_output(&snap, self.emitted);
        self.emitted = snap.produced.len();
        if output.finished() {
            self.done = true;
            self.stream.release_resource();
        }
        Some(output)
    }

    /// Adapt the handle into a [`futures::Stream`] of snapshots.
    pub fn into_stream(self) -> impl Stream<Item = GenerateOutput> {
        futures::stream::unfold(self, |mut handle| async move {
            handle.next().await.map(|output| (output, handle))
        })
    }
}

impl Drop for GenerateHandle {
    fn drop(&mut self) {
        if !self.done {
            self.stream.cancel("generate handle dropped");
        }
        self.stream.release_resource();
    }
}

// ── Worker loop ──────────────────────────────────────────────────────────────

fn worker_loop(shared: Arc<EngineShared>) {
    let parallel = shared.config.parallel;
    let coordinator = parallel.is_coordinator();
    info!(tp_rank = parallel.tp_rank, "decode worker running");
    loop {
        if shared.stop.load(Ordering::Acquire) {
            info!("stop flag set, decode worker exiting");
            return;
        }

        let timer = StepTimer::start();
        // Non-coordinator ranks never touch the wait queue; they present an
        // empty descriptor for the sync to overwrite.
        let mut batch = if coordinator {
            shared.lock_scheduler().schedule()
        } else {
            BatchQuery::default()
        };

        match run_step(&shared, &mut batch, coordinator) {
            Ok(true) => {
                report_step(&shared, &timer);
                shared.bump_step();
            }
            Ok(false) => {
                // Still empty after the sync; idle until the next poll.
                std::thread::sleep(IDLE_SLEEP);
            }
            Err(err) => {
                let message = err.to_string();
                if !batch.is_empty() {
                    shared.lock_scheduler().update_all_errors(&message);
                }
                error!(error = %message, "decode step failed");
                shared.metrics.counter(metrics::COUNTER_ERROR_EXIT, 1);
                if is_fatal(&shared.config, &message) {
                    shared.metrics.flush();
                    // Collectives hang and accelerator contexts stay corrupt
                    // after such failures; drain briefly, then fail fast.
                    std::thread::sleep(FATAL_DRAIN);
                    std::process::exit(1);
                }
                shared.bump_step();
            }
        }
    }
}

fn run_step(
    shared: &Arc<EngineShared>,
    batch: &mut BatchQuery,
    coordinator: bool,
) -> Result<bool, EngineError> {
    let collectives = shared.executor.collectives();
    // The sync runs before any idle decision, so rank call-counts stay
    // lockstep even when the coordinator has nothing to schedule.
    collectives.sync_batch(batch).map_err(executor_failure)?;
    if batch.is_empty() {
        return Ok(false);
    }

    if shared.config.parallel.tp_size > 1 {
        broadcast_embeddings(batch, &*collectives)?;
    }

    shared.executor.process(batch).map_err(executor_failure)?;
    if coordinator {
        shared.lock_scheduler().update_batch_query(batch);
    }
    Ok(true)
}

/// Replicate the batch's multimodal embeddings across ranks in place.
fn broadcast_embeddings(
    batch: &mut BatchQuery,
    collectives: &dyn crate::executor::Collectives,
) -> Result<(), EngineError> {
    let mut tensors: Vec<Embedding> = batch.embeddings.iter().flatten().cloned().collect();
    if tensors.is_empty() {
        return Ok(());
    }
    collectives
        .broadcast_tp(&mut tensors)
        .map_err(executor_failure)?;
    let mut replicated = tensors.into_iter();
    for slot in batch.embeddings.iter_mut() {
        if slot.is_some() {
            *slot = replicated.next();
        }
    }
    Ok(())
}

fn report_step(shared: &Arc<EngineShared>, timer: &StepTimer) {
    let (running, waiting, used_ratio) = {
        let scheduler = shared.lock_scheduler();
        (
            scheduler.running_batch_size(),
            scheduler.wait_stream_size(),
            scheduler.block_used_ratio(),
        )
    };
    let sink = &shared.metrics;
    sink.gauge(metrics::GAUGE_ASYNC_BATCH_SIZE, running as f64);
    sink.gauge(metrics::GAUGE_ASYNC_WAIT_QUERY_SIZE, waiting as f64);
    sink.gauge(metrics::GAUGE_ASYNC_ITERATE_LATENCY_MS, timer.elapsed_ms());
    sink.gauge(metrics::GAUGE_KV_CACHE_MEM_USED_RATIO, used_ratio);
}

fn executor_failure(err: crate::error::ExecutorError) -> EngineError {
    EngineError::Executor {
        message: err.message().to_owned(),
    }
}

/// Executor failures corrupt shared state when collectives are involved or
/// the accelerator context itself raised; those cannot be retried in-process.
fn is_fatal(config: &EngineConfig, message: &str) -> bool {
    config.parallel.tp_size > 1 || message.contains(ACCELERATOR_MARKER)
}
