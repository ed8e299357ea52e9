#[cfg(test)]
mod tests {
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use tracing_test::traced_test;

    use crate::batch::BatchQuery;
    use crate::config::EngineConfig;
    use crate::engine::{DecoderEngine, GenerateHandle};
    use crate::error::{EngineError, ExecutorError};
    use crate::executor::{Collectives, Executor, LocalCollectives};
    use crate::input::{Embedding, GenerateConfig, GenerateInput, TokenId};
    use crate::lora::LoraRegistry;
    use crate::metrics::{self, RecordingMetrics};
    use crate::scheduler::Scheduler;
    use crate::stream::{GenerateOutput, StreamStatus};

    const STEP_WAIT: Duration = Duration::from_secs(5);

    // ── Test doubles ──────────────────────────────────────────────────────────

    /// Parks the worker inside the per-iteration collective sync so tests can
    /// release decode iterations one at a time.
    ///
    /// Because every iteration enters the sync (even with an empty batch),
    /// the worker parks here on its startup iteration before any request
    /// exists. Tests wait for that arrival, enqueue their requests, burn the
    /// stale empty iteration with one allowance, and from then on each
    /// allowance releases exactly one deterministic step.
    #[derive(Default)]
    struct GateState {
        allowed: usize,
        arrivals: u64,
    }

    struct StepGate {
        state: Mutex<GateState>,
        cv: Condvar,
    }

    impl StepGate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(GateState::default()),
                cv: Condvar::new(),
            })
        }

        fn allow(&self, n: usize) {
            self.state.lock().unwrap().allowed += n;
            self.cv.notify_all();
        }

        /// Let the worker run freely; required before engine teardown.
        fn open_wide(&self) {
            self.state.lock().unwrap().allowed = usize::MAX;
            self.cv.notify_all();
        }

        /// Number of times the worker has entered the sync so far.
        fn arrivals(&self) -> u64 {
            self.state.lock().unwrap().arrivals
        }

        fn pass(&self) {
            let mut state = self.state.lock().unwrap();
            state.arrivals += 1;
            while state.allowed == 0 {
                state = self.cv.wait(state).unwrap();
            }
            if state.allowed != usize::MAX {
                state.allowed -= 1;
            }
        }
    }

    struct GatedCollectives {
        gate: Arc<StepGate>,
    }

    impl Collectives for GatedCollectives {
        fn broadcast_tp(&self, _tensors: &mut [Embedding]) -> Result<(), ExecutorError> {
            Ok(())
        }

        fn sync_batch(&self, _batch: &mut BatchQuery) -> Result<(), ExecutorError> {
            self.gate.pass();
            Ok(())
        }
    }

    struct FailPlan {
        steps_before_failure: usize,
        message: String,
    }

    /// Deterministic executor double: request `r`'s next token is
    /// `scripts[r][produced_len]`, so replays after preemption stay identical.
    struct ScriptedExecutor {
        registry: Arc<LoraRegistry>,
        collectives: Arc<dyn Collectives>,
        scripts: Vec<Vec<TokenId>>,
        /// One-shot failure injected after the configured number of good steps.
        failure: Mutex<Option<FailPlan>>,
    }

    impl ScriptedExecutor {
        fn new(scripts: Vec<Vec<TokenId>>) -> Self {
            Self {
                registry: Arc::new(LoraRegistry::new()),
                collectives: Arc::new(LocalCollectives),
                scripts,
                failure: Mutex::new(None),
            }
        }

        fn with_gate(mut self, gate: Arc<StepGate>) -> Self {
            self.collectives = Arc::new(GatedCollectives { gate });
            self
        }

        fn failing_after(self, good_steps: usize, message: &str) -> Self {
            *self.failure.lock().unwrap() = Some(FailPlan {
                steps_before_failure: good_steps,
                message: message.to_owned(),
            });
            self
        }
    }

    impl Executor for ScriptedExecutor {
        fn process(&self, batch: &mut BatchQuery) -> Result<(), ExecutorError> {
            {
                let mut failure = self.failure.lock().unwrap();
                if let Some(plan) = failure.as_mut() {
                    if plan.steps_before_failure == 0 {
                        let message = plan.message.clone();
                        *failure = None;
                        return Err(ExecutorError::Kernel { message });
                    }
                    plan.steps_before_failure -= 1;
                }
            }
            let members: Vec<_> = batch.members().cloned().collect();
            for (i, stream) in members.iter().enumerate() {
                let script = self.scripts.get(stream.request_id() as usize);
                let token = script
                    .and_then(|s| s.get(stream.produced_len()))
                    .copied()
                    .unwrap_or(0);
                batch.next_tokens[i] = Some(token);
                if stream.input().config.return_logprobs {
                    batch.logprobs[i] = Some(-0.25);
                }
            }
            Ok(())
        }

        fn lora_registry(&self) -> Arc<LoraRegistry> {
            Arc::clone(&self.registry)
        }

        fn collectives(&self) -> Arc<dyn Collectives> {
            Arc::clone(&self.collectives)
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn engine_config(num_blocks: usize, block_size: usize, max_batch: usize) -> EngineConfig {
        EngineConfig {
            max_seq_len: 64,
            max_batch_size: max_batch,
            max_prefill_tokens: 256,
            block_size,
            num_cache_blocks: num_blocks,
            ..EngineConfig::default()
        }
    }

    fn build_engine(
        executor: ScriptedExecutor,
        config: EngineConfig,
    ) -> (DecoderEngine, Arc<RecordingMetrics>) {
        let metrics = Arc::new(RecordingMetrics::new());
        let scheduler = Scheduler::new(&config);
        let engine = DecoderEngine::with_metrics(
            Arc::new(executor),
            scheduler,
            config,
            Arc::clone(&metrics) as Arc<dyn metrics::MetricsSink>,
        );
        (engine, metrics)
    }

    fn request(prompt: Vec<TokenId>, max_new: usize, stop: &[TokenId]) -> GenerateInput {
        let mut config = GenerateConfig::default();
        config.max_new_tokens = max_new;
        config.stop_token_ids = stop.iter().copied().collect();
        GenerateInput::from_tokens(prompt).with_config(config)
    }

    async fn next_within(handle: &mut GenerateHandle) -> Option<GenerateOutput> {
        tokio::time::timeout(STEP_WAIT, handle.next())
            .await
            .expect("timed out waiting for snapshot")
    }

    /// Drain a handle to completion, returning every observed snapshot.
    async fn drain(mut handle: GenerateHandle) -> Vec<GenerateOutput> {
        let mut outputs = Vec::new();
        while let Some(output) = next_within(&mut handle).await {
            outputs.push(output);
        }
        outputs
    }

    /// Wait until the worker is parked in the gated sync of its startup
    /// iteration, whose batch is necessarily empty because nothing has been
    /// enqueued yet. Call before submitting requests so the first released
    /// real step contains all of them.
    async fn parked_at_gate(gate: &StepGate) {
        tokio::time::timeout(STEP_WAIT, async {
            while gate.arrivals() == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("worker never reached the sync gate");
    }

    // ── Admission-time validation ─────────────────────────────────────────────

    #[tokio::test]
    async fn admission_errors_are_synchronous() {
        let (engine, _metrics) = build_engine(
            ScriptedExecutor::new(vec![]),
            EngineConfig {
                max_seq_len: 8,
                ..engine_config(8, 4, 4)
            },
        );

        assert!(matches!(
            engine.decode(GenerateInput::from_tokens(vec![])),
            Err(EngineError::EmptyPrompt)
        ));

        // Prompt exactly filling max_seq_len leaves no room to generate.
        let full = request((0..8).collect(), 4, &[]);
        assert!(matches!(
            engine.decode(full),
            Err(EngineError::LongPrompt { .. })
        ));

        let zero_budget = request(vec![1, 2], 0, &[]);
        assert!(matches!(
            engine.decode(zero_budget),
            Err(EngineError::LongPrompt { .. })
        ));

        let mut with_adapter = request(vec![1, 2], 4, &[]);
        with_adapter.config.adapter_name = Some("missing".to_owned());
        assert!(matches!(
            engine.decode(with_adapter),
            Err(EngineError::AdapterNotFound { .. })
        ));

        engine.stop();
    }

    // ── End-to-end decoding ───────────────────────────────────────────────────

    #[tokio::test]
    #[traced_test]
    async fn single_request_streams_then_finishes_on_stop_token() {
        let gate = StepGate::new();
        let executor =
            ScriptedExecutor::new(vec![vec![40, 2]]).with_gate(Arc::clone(&gate));
        let (engine, _metrics) = build_engine(executor, engine_config(8, 16, 8));
        parked_at_gate(&gate).await;

        let mut handle = engine
            .decode(request(vec![10, 20, 30], 2, &[2]))
            .expect("decode should accept");

        // One allowance for the parked empty startup iteration, one for the
        // prefill step.
        gate.allow(2);
        let first = next_within(&mut handle).await.expect("first snapshot");
        assert_eq!(first.token_ids, vec![10, 20, 30, 40]);
        assert_eq!(first.delta, vec![40]);
        assert_eq!(first.status, StreamStatus::Running);

        gate.allow(1);
        let last = next_within(&mut handle).await.expect("terminal snapshot");
        assert_eq!(last.token_ids, vec![10, 20, 30, 40, 2]);
        assert_eq!(last.delta, vec![2]);
        assert_eq!(last.status, StreamStatus::FinishedEos);
        assert!(last.finished());

        assert!(next_within(&mut handle).await.is_none());

        gate.open_wide();
        engine.stop();
    }

    #[tokio::test]
    async fn max_new_tokens_one_finishes_in_a_single_step() {
        let (engine, _metrics) =
            build_engine(ScriptedExecutor::new(vec![vec![40]]), engine_config(8, 16, 8));

        let mut input = request(vec![10, 20, 30], 1, &[]);
        input.config.return_logprobs = true;
        let output = tokio::time::timeout(STEP_WAIT, engine.generate(input))
            .await
            .expect("generation should not hang")
            .expect("generation should succeed");

        assert_eq!(output.token_ids, vec![10, 20, 30, 40]);
        assert_eq!(output.status, StreamStatus::FinishedLength);
        assert_eq!(output.logprobs, Some(vec![-0.25]));
        engine.stop();
    }

    #[tokio::test]
    async fn concurrent_requests_progress_and_finish_at_length_cap() {
        // Pool of 2 blocks, one per stream: both decode together.
        let executor = ScriptedExecutor::new(vec![vec![50, 51, 52], vec![60, 61, 62]]);
        let (engine, _metrics) = build_engine(executor, engine_config(2, 8, 2));

        let h1 = engine
            .decode(request(vec![1, 2, 3, 4], 3, &[]))
            .expect("first request");
        let h2 = engine
            .decode(request(vec![5, 6, 7, 8], 3, &[]))
            .expect("second request");

        let (outs1, outs2) = tokio::join!(drain(h1), drain(h2));

        for (outputs, prompt, script) in [
            (&outs1, vec![1, 2, 3, 4], vec![50, 51, 52]),
            (&outs2, vec![5, 6, 7, 8], vec![60, 61, 62]),
        ] {
            let last = outputs.last().expect("at least one snapshot");
            let mut expected = prompt.clone();
            expected.extend(&script);
            assert_eq!(last.token_ids, expected);
            assert_eq!(last.status, StreamStatus::FinishedLength);

            // Snapshot sequence is prefix-monotone and only the last one is
            // terminal.
            for pair in outputs.windows(2) {
                assert!(pair[1].token_ids.starts_with(&pair[0].token_ids));
                assert!(!pair[0].finished());
            }
        }

        // Terminal streams are reaped and their blocks returned.
        tokio::time::timeout(STEP_WAIT, async {
            while engine.running_batch_size() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("running set should drain");
        assert_eq!(engine.kv_cache_used_ratio(), 0.0);
        engine.stop();
    }

    #[tokio::test]
    async fn third_request_waits_for_capacity_then_completes() {
        let gate = StepGate::new();
        let executor = ScriptedExecutor::new(vec![
            vec![50, 51],
            vec![60, 61],
            vec![70, 71],
        ])
        .with_gate(Arc::clone(&gate));
        // Pool fits exactly two streams.
        let (engine, metrics) = build_engine(executor, engine_config(2, 8, 8));
        parked_at_gate(&gate).await;

        let h1 = engine.decode(request(vec![1, 2, 3, 4], 2, &[])).unwrap();
        let h2 = engine.decode(request(vec![1, 2, 3, 4], 2, &[])).unwrap();
        let h3 = engine.decode(request(vec![1, 2, 3, 4], 2, &[])).unwrap();

        gate.allow(20);
        let (outs1, outs2, outs3) = tokio::join!(drain(h1), drain(h2), drain(h3));

        assert_eq!(outs1.last().unwrap().token_ids, vec![1, 2, 3, 4, 50, 51]);
        assert_eq!(outs2.last().unwrap().token_ids, vec![1, 2, 3, 4, 60, 61]);
        assert_eq!(outs3.last().unwrap().token_ids, vec![1, 2, 3, 4, 70, 71]);
        assert_eq!(outs3.last().unwrap().status, StreamStatus::FinishedLength);

        // The third stream sat in the wait queue while the first two decoded.
        assert!(
            metrics
                .gauge_values(metrics::GAUGE_ASYNC_WAIT_QUERY_SIZE)
                .iter()
                .any(|v| *v >= 1.0),
            "wait-queue gauge never saw the queued stream"
        );

        gate.open_wide();
        engine.stop();
    }

    #[tokio::test]
    async fn cancel_terminates_stream_and_frees_blocks() {
        let gate = StepGate::new();
        let executor = ScriptedExecutor::new(vec![
            vec![50, 51, 52, 53],
            vec![60, 61, 62, 63],
        ])
        .with_gate(Arc::clone(&gate));
        let (engine, _metrics) = build_engine(executor, engine_config(2, 8, 2));
        parked_at_gate(&gate).await;

        let mut h1 = engine.decode(request(vec![1, 2, 3, 4], 4, &[])).unwrap();
        let mut h2 = engine.decode(request(vec![1, 2, 3, 4], 4, &[])).unwrap();

        // Empty startup iteration, then the prefill step for both streams.
        gate.allow(2);
        let first = next_within(&mut h1).await.expect("first token");
        assert_eq!(first.status, StreamStatus::Running);

        h1.cancel("user cancelled");
        let terminal = next_within(&mut h1).await.expect("cancel snapshot");
        assert_eq!(terminal.status, StreamStatus::Cancelled);
        assert_eq!(terminal.stop_reason.as_deref(), Some("user cancelled"));
        // Results of any in-flight step for the cancelled stream are dropped.
        assert_eq!(terminal.token_ids.len(), 5);
        assert!(next_within(&mut h1).await.is_none());

        // Within one more step boundary the cancelled stream is reaped and
        // only the survivor's block remains in use.
        gate.allow(2);
        next_within(&mut h2).await.expect("survivor advances");
        next_within(&mut h2).await.expect("survivor advances again");
        tokio::time::timeout(STEP_WAIT, async {
            while engine.running_batch_size() > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cancelled stream should be reaped");
        assert!((engine.kv_cache_used_ratio() - 0.5).abs() < f64::EPSILON);

        gate.open_wide();
        engine.stop();
    }

    #[tokio::test]
    async fn executor_failure_errors_whole_batch_without_abort() {
        let gate = StepGate::new();
        let executor = ScriptedExecutor::new(vec![
            vec![50, 51],
            vec![60, 61],
            vec![70, 71],
            vec![90],
        ])
        .with_gate(Arc::clone(&gate))
        .failing_after(1, "simulated logits corruption");
        let (engine, metrics) = build_engine(executor, engine_config(8, 16, 8));
        parked_at_gate(&gate).await;

        let mut handles = vec![
            engine.decode(request(vec![1, 2], 4, &[])).unwrap(),
            engine.decode(request(vec![3, 4], 4, &[])).unwrap(),
            engine.decode(request(vec![5, 6], 4, &[])).unwrap(),
        ];

        // Empty startup iteration, then the good step: all three prefill
        // together and see a RUNNING snapshot.
        gate.allow(2);
        for handle in handles.iter_mut() {
            let out = next_within(handle).await.expect("first step output");
            assert_eq!(out.status, StreamStatus::Running);
        }

        // The next step fails; every member turns terminal with one message.
        gate.allow(1);
        let mut reasons = Vec::new();
        for handle in handles.iter_mut() {
            let out = next_within(handle).await.expect("terminal output");
            assert_eq!(out.status, StreamStatus::Errored);
            reasons.push(out.stop_reason.expect("errored stream carries reason"));
        }
        assert!(reasons[0].contains("simulated logits corruption"));
        assert!(reasons.iter().all(|r| r == &reasons[0]));

        tokio::time::timeout(STEP_WAIT, async {
            while metrics.counter_value(metrics::COUNTER_ERROR_EXIT) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("error_exit counter should increment");

        // Single rank, no accelerator marker: the engine keeps serving.
        let late = engine.decode(request(vec![9], 1, &[])).unwrap();
        gate.allow(4);
        let outs = drain(late).await;
        assert_eq!(outs.last().unwrap().token_ids, vec![9, 90]);
        assert_eq!(outs.last().unwrap().status, StreamStatus::FinishedLength);

        gate.open_wide();
        engine.stop();
    }

    #[tokio::test]
    async fn dropping_handle_cancels_and_releases() {
        let gate = StepGate::new();
        let executor = ScriptedExecutor::new(vec![vec![50, 51, 52, 53]])
            .with_gate(Arc::clone(&gate));
        let (engine, _metrics) = build_engine(executor, engine_config(4, 8, 4));
        parked_at_gate(&gate).await;

        let mut handle = engine.decode(request(vec![1, 2, 3], 4, &[])).unwrap();
        // Empty startup iteration, then the prefill step.
        gate.allow(2);
        next_within(&mut handle).await.expect("first token");
        drop(handle);

        // The next step boundary reaps the abandoned stream.
        gate.allow(2);
        tokio::time::timeout(STEP_WAIT, async {
            while engine.running_batch_size() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dropped stream should be reaped");
        assert_eq!(engine.kv_cache_used_ratio(), 0.0);

        gate.open_wide();
        engine.stop();
    }

    // ── LoRA lifecycle across requests ────────────────────────────────────────

    #[tokio::test]
    async fn adapter_reload_waits_for_streaming_readers() {
        let executor = ScriptedExecutor::new(vec![vec![50], vec![60]]);
        let registry = executor.lora_registry();
        registry.load("style-a", Arc::from(vec![0.1f32; 4])).await;

        let (engine, _metrics) = build_engine(executor, engine_config(8, 16, 8));

        let mut r1 = request(vec![1, 2], 1, &[]);
        r1.config.adapter_name = Some("style-a".to_owned());
        let mut r2 = request(vec![3, 4], 1, &[]);
        r2.config.adapter_name = Some("style-a".to_owned());

        let h1 = engine.decode(r1).expect("first adapter request");
        let h2 = engine.decode(r2).expect("second adapter request");
        assert_eq!(registry.reader_count("style-a"), 2);

        let loader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.load("style-a", Arc::from(vec![0.2f32; 4])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            !loader.is_finished(),
            "reload finished while streams still pinned the adapter"
        );

        // Draining both handles observes the terminal snapshots and runs the
        // release destructors.
        let (outs1, outs2) = tokio::join!(drain(h1), drain(h2));
        assert!(outs1.last().unwrap().finished());
        assert!(outs2.last().unwrap().finished());

        tokio::time::timeout(STEP_WAIT, loader)
            .await
            .expect("reload should finish once readers released")
            .expect("loader task");
        assert_eq!(registry.reader_count("style-a"), 0);
        engine.stop();
    }
}
