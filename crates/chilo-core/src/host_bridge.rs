//! The Host Bridge: the four entry points the host fuzzer calls per
//! seed/per mutate, and the `CurrentCallState` they share.
//!
//! `schedule`/`mutate` never propagate errors to the host; only
//! [`HostBridge::init`] can fail hard. Module-level shared state is an
//! explicit field on this struct rather than a `static mut`. The FFI shim
//! crate is the only place a process-wide singleton lives.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{Config, EnergyConfig};
use crate::coverage::{CoverageSource, GlobalBitmap};
use crate::crash_library::CrashLibrary;
use crate::csv_log::{CsvLogger, MainCsvRow};
use crate::error::InitError;
use crate::llm::{LlmChat, LlmClient};
use crate::mutator::{Mutator, MutatorPool};
use crate::pipeline::{self, ParseJob, PipelineContext, Queues, StructuralJob};
use crate::seed::SeedRegistry;

/// Selection mode chosen at `schedule` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Wait,
    FirstRun,
    PoolSample,
    Structural,
}

/// Scalars shared between the energy-decision call and the post-execution
/// callback.
struct CallState {
    strategy: Strategy,
    sampled_mutator: Option<Arc<Mutator>>,
    sampled_factors: Option<(f64, f64, f64)>,
    current_batch_new_edges: u64,
    left_fuzz_count: u64,
    fuzz_count_in_batch: u64,
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            strategy: Strategy::Wait,
            sampled_mutator: None,
            sampled_factors: None,
            current_batch_new_edges: 0,
            left_fuzz_count: 0,
            fuzz_count_in_batch: 0,
        }
    }
}

/// Real dependencies an FFI shim constructs once per process and hands to
/// [`HostBridge::init`]; a test harness substitutes fakes here instead, so
/// the pipeline never talks to a live LLM endpoint or shared-memory segment
/// under test.
pub struct HostBridgeDeps {
    pub llm_parser: Arc<dyn LlmChat>,
    pub llm_generator: Arc<dyn LlmChat>,
    pub llm_fixer: Arc<dyn LlmChat>,
    pub llm_structural: Arc<dyn LlmChat>,
    pub coverage: Box<dyn CoverageSource>,
}

impl HostBridgeDeps {
    /// Construct the real, network/shared-memory-backed dependencies from
    /// configuration and the host-provided coverage handle.
    pub fn from_config(config: &Config, coverage_handle: &str) -> Result<Self, InitError> {
        let coverage = crate::coverage::attach(coverage_handle, config.paths.map_size)?;
        Ok(Self {
            llm_parser: Arc::new(LlmClient::new(config.llm.llm_parser.clone())),
            llm_generator: Arc::new(LlmClient::new(config.llm.llm_mutator_generator.clone())),
            llm_fixer: Arc::new(LlmClient::new(config.llm.llm_fixer.clone())),
            llm_structural: Arc::new(LlmClient::new(config.llm.llm_structural_mutator.clone())),
            coverage,
        })
    }
}

pub struct HostBridge {
    config: Arc<Config>,
    seeds: Arc<SeedRegistry>,
    pool: Arc<MutatorPool>,
    queues: Queues,
    csv: Arc<CsvLogger>,
    bitmap: Mutex<GlobalBitmap>,
    coverage: Box<dyn CoverageSource>,
    call_state: Mutex<CallState>,
    rng: Mutex<StdRng>,
    start_time: Instant,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl HostBridge {
    /// One-time setup: load workers, registry, pool, queues, CSV sinks, and
    /// the crash library; start the four worker pools. Idempotent-safe in
    /// the sense that each call produces an independent, fully-initialized
    /// instance. The FFI shim is responsible for calling this exactly once
    /// per process.
    pub fn init(config: Config, deps: HostBridgeDeps, random_seed: u64) -> Result<Self, InitError> {
        let config = Arc::new(config);
        let seeds = Arc::new(SeedRegistry::new());
        let pool = Arc::new(MutatorPool::new());
        let queues = Queues::new(config.others.queue_capacity);
        let csv = Arc::new(CsvLogger::new(&config.paths.csv_dir).map_err(|source| {
            InitError::Csv {
                path: config.paths.csv_dir.clone(),
                source,
            }
        })?);
        let crash_library = Arc::new(
            CrashLibrary::new(
                config.paths.afl_crashes_dir.clone(),
                config.paths.cve_cases_dir.clone(),
            )
            .map_err(InitError::CrashLibrary)?,
        );
        let bitmap = Mutex::new(GlobalBitmap::new(config.paths.map_size, config.paths.bitmap_dir.clone()));

        let ctx = PipelineContext {
            config: Arc::clone(&config),
            seeds: Arc::clone(&seeds),
            pool: Arc::clone(&pool),
            csv: Arc::clone(&csv),
            crash_library,
            llm_parser: deps.llm_parser,
            llm_generator: deps.llm_generator,
            llm_fixer: deps.llm_fixer,
            llm_structural: deps.llm_structural,
            start_time: Instant::now(),
            structural_seq: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        };
        let workers = pipeline::spawn_workers(ctx.clone(), &queues);

        Ok(Self {
            config,
            seeds,
            pool,
            queues,
            csv,
            bitmap,
            coverage: deps.coverage,
            call_state: Mutex::new(CallState::default()),
            rng: Mutex::new(StdRng::seed_from_u64(random_seed)),
            start_time: ctx.start_time,
            _workers: workers,
        })
    }

    /// `schedule(payload) -> energy`.
    pub fn schedule(&self, payload: &[u8]) -> u64 {
        let (_, seed) = self.seeds.insert(payload.to_vec());
        let selected = seed.bump_selected();

        let k = self.config.others.times_to_structural_mutator;
        if k > 0 && selected % k == 0 && self.config.others.structural_threads > 0 {
            let _ = self.queues.structural_tx.try_send(StructuralJob {
                seed_id: seed.seed_id,
                energy_budget: self.config.energy.min_energy,
            });
        }

        let _ = self.queues.parse_tx.try_send(ParseJob {
            seed_id: seed.seed_id,
            energy_budget: self.config.energy.min_energy,
        });

        self.decide_strategy_and_energy()
    }

    fn decide_strategy_and_energy(&self) -> u64 {
        let mut state = self.call_state.lock();

        if self.queues.structural_ready_rx.len() > 0 {
            *state = CallState {
                strategy: Strategy::Structural,
                left_fuzz_count: 1,
                ..CallState::default()
            };
            return 1;
        }

        if !self.queues.ready.is_empty() {
            let run_len = self.queues.ready.leading_run_len();
            *state = CallState {
                strategy: Strategy::FirstRun,
                left_fuzz_count: run_len,
                ..CallState::default()
            };
            return run_len;
        }

        if !self.pool.is_empty() {
            let selection = {
                let mut rng = self.rng.lock();
                self.pool.thompson_select(&mut rng)
            };
            if let Some((mutator, result)) = selection {
                let energy = clip_energy(result.score, &self.config.energy);
                *state = CallState {
                    strategy: Strategy::PoolSample,
                    sampled_mutator: Some(mutator),
                    sampled_factors: Some((result.a_i, result.b_i, result.c_i)),
                    left_fuzz_count: energy,
                    ..CallState::default()
                };
                return energy;
            }
        }

        *state = CallState::default();
        0
    }

    /// `mutate(payload, max_len) -> bytes`. `payload` (the host's current
    /// seed) and the advertised `add_payload` splice input are unused by the
    /// selection logic itself, only `max_len` bounds the output (this
    /// system advertises no-splice).
    pub fn mutate(&self, max_len: usize) -> Vec<u8> {
        let start = self.relative_time();
        let strategy = self.call_state.lock().strategy;

        let (text, seed_id, mutator_id, is_from_structural, is_error_occur) = match strategy {
            Strategy::Wait => (String::new(), None, None, false, false),
            Strategy::Structural => self.produce_structural(),
            Strategy::FirstRun | Strategy::PoolSample => self.produce_from_ready_or_pool(),
        };

        if let Some(seed_id) = seed_id {
            if let Some(seed) = self.seeds.get(seed_id) {
                seed.bump_mutated();
            }
        }

        let ori_size = text.len();
        let mut bytes = text.into_bytes();
        let is_cut = bytes.len() > max_len;
        if is_cut {
            bytes.truncate(max_len);
        }

        let fuzz_count = {
            let mut state = self.call_state.lock();
            state.left_fuzz_count = state.left_fuzz_count.saturating_sub(1);
            state.fuzz_count_in_batch += 1;
            state.fuzz_count_in_batch
        };
        let now_seed_id = seed_id.unwrap_or(0);

        let _ = self.csv.write_main(MainCsvRow {
            real_time: self.real_time(),
            relative_time: start,
            fuzz_count_seed_number: fuzz_count,
            fuzz_seed_number: self.seeds.len() as u64,
            is_by_random: strategy == Strategy::PoolSample,
            fuzz_use_time: self.relative_time() - start,
            now_seed_id,
            real_fuzz_seed_id: now_seed_id,
            real_mutator_id: mutator_id,
            left_wait_exec_queue_count: self.queues.ready.len() as usize,
            ori_mutate_out_size: ori_size,
            real_mutate_out_size: bytes.len(),
            is_cut,
            is_error_occur,
            is_from_structural_mutator: is_from_structural,
        });

        bytes
    }

    fn produce_structural(&self) -> (String, Option<u32>, Option<u32>, bool, bool) {
        match self.queues.structural_ready_rx.try_recv() {
            Ok(item) => (item.payload_text, Some(item.seed_id), None, true, false),
            Err(_) => (String::new(), None, None, true, false),
        }
    }

    /// Non-structural strategies share the "try ready-queue, else sample the
    /// pool" path. For `PoolSample` the mutator chosen at `schedule` time is
    /// reused across the whole batch so that the end-of-batch credit lands
    /// on it; once it is marked failed every subsequent call in the batch
    /// falls back to a uniform random pick, without ever re-crediting the
    /// replacement.
    fn produce_from_ready_or_pool(&self) -> (String, Option<u32>, Option<u32>, bool, bool) {
        if let Some(mutator) = self.queues.ready.pop_one() {
            return self.invoke_or_fallback(mutator, false);
        }

        let active = {
            let state = self.call_state.lock();
            match state.strategy {
                Strategy::PoolSample => state.sampled_mutator.clone(),
                _ => None,
            }
        };

        match active {
            Some(mutator) if !mutator.is_error() => self.invoke_or_fallback(mutator, false),
            _ => self.fallback_random(false),
        }
    }

    fn invoke_or_fallback(&self, mutator: Arc<Mutator>, had_error: bool) -> (String, Option<u32>, Option<u32>, bool, bool) {
        let result = {
            let mut rng = self.rng.lock();
            mutator.generate(&mut rng)
        };
        match result {
            Ok(text) => (text, Some(mutator.seed_id), Some(mutator.mutator_id), false, had_error),
            Err(_) => {
                mutator.mark_error();
                self.fallback_random(true)
            }
        }
    }

    /// Uniform random pick over the pool, skipping mutators already marked
    /// failed, bounded so an all-failed pool degrades to an empty payload
    /// rather than looping forever.
    fn fallback_random(&self, had_error: bool) -> (String, Option<u32>, Option<u32>, bool, bool) {
        let attempts = self.pool.len().saturating_mul(2).max(1);
        for _ in 0..attempts {
            let picked = {
                let mut rng = self.rng.lock();
                self.pool.random_pick(&mut rng)
            };
            let Some(mutator) = picked else {
                return (String::new(), None, None, false, had_error);
            };
            if mutator.is_error() {
                continue;
            }
            let result = {
                let mut rng = self.rng.lock();
                mutator.generate(&mut rng)
            };
            match result {
                Ok(text) => return (text, Some(mutator.seed_id), Some(mutator.mutator_id), false, had_error),
                Err(_) => mutator.mark_error(),
            }
        }
        (String::new(), None, None, false, true)
    }

    /// `post_execute()`: accumulate the bitmap snapshot and, once the
    /// batch's `left_fuzz_count` has reached zero (decremented inside
    /// `mutate`), close the batch by crediting the sampled mutator.
    pub fn post_execute(&self) {
        let new_edges = {
            let mut bitmap = self.bitmap.lock();
            match bitmap.accumulate(self.coverage.snapshot()) {
                Ok(n) => {
                    let _ = bitmap.maybe_persist();
                    n
                }
                Err(err) => {
                    tracing::warn!(error = %err, "coverage bitmap accumulate failed");
                    0
                }
            }
        };

        let mut state = self.call_state.lock();
        if state.strategy == Strategy::PoolSample {
            state.current_batch_new_edges += new_edges;
        }

        if state.left_fuzz_count == 0 && state.strategy == Strategy::PoolSample {
            if let Some(mutator) = state.sampled_mutator.take() {
                mutator.bandit.lock().apply_feedback(state.current_batch_new_edges);
            }
        }
    }

    /// `deinit()`: best-effort cleanup. Flushes the bitmap
    /// one last time; worker threads are detached daemons and are not
    /// joined (process exit reclaims them, matching the original).
    pub fn deinit(&self) {
        let mut bitmap = self.bitmap.lock();
        if let Err(err) = bitmap.force_persist() {
            tracing::warn!(error = %err, "failed to flush coverage bitmap on deinit");
        }
    }

    /// `splice_optout()`: presence alone signals the host that splicing is
    /// disabled; there is nothing to compute.
    pub fn splice_optout(&self) {}

    fn relative_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    fn real_time(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// Test/inspection helpers (used by the CLI's registry-dump debugging
    /// aid and the scenario tests).
    pub fn seed_registry(&self) -> &SeedRegistry {
        &self.seeds
    }

    pub fn mutator_pool(&self) -> &MutatorPool {
        &self.pool
    }

    pub fn current_strategy(&self) -> Strategy {
        self.call_state.lock().strategy
    }

    pub fn sampled_factors(&self) -> Option<(f64, f64, f64)> {
        self.call_state.lock().sampled_factors
    }

    /// Register a payload in the seed registry without driving it through
    /// the pipeline, mirroring what `schedule`'s insert-or-lookup step does
    /// on its own. Exposed so tests can drive the bandit/queue logic
    /// directly rather than waiting on a live LLM endpoint to finish
    /// annotating and generating a mutator.
    pub fn register_seed(&self, bytes: Vec<u8>) -> u32 {
        self.seeds.insert(bytes).1.seed_id
    }

    /// Test seam: publish a fully-formed Mutator straight into the pool and
    /// push `energy` contiguous references into the ready queue, bypassing
    /// the asynchronous parse/generate/fix pipeline entirely. This is how
    /// tests get a deterministic Mutator population without a live LLM
    /// endpoint, going one step further than injecting a fake `LlmClient`
    /// by also skipping the pipeline's own concurrency, to avoid
    /// timing-dependent tests.
    pub fn test_publish_mutator(
        &self,
        seed_id: u32,
        mask_count: u32,
        similarity: f64,
        plan: crate::mutator::MutationPlan,
        energy: u64,
    ) -> Arc<Mutator> {
        let seed = self
            .seeds
            .get(seed_id)
            .expect("seed must already be registered");
        let mutator_id = seed.next_mutator_id();
        let artifact_path = self
            .config
            .paths
            .mutator_module_dir
            .join(format!("{seed_id}_{mutator_id}"));
        let mutator = Mutator::new(seed_id, mutator_id, 0, artifact_path, mask_count, similarity, plan);
        let published = self.pool.publish(mutator);
        self.queues.ready.push_run(Arc::clone(&published), energy);
        published
    }
}

/// `clip(score * R, min, max)`.
fn clip_energy(score: f64, cfg: &EnergyConfig) -> u64 {
    let scaled = (score * cfg.exchange_rate).max(0.0).round() as u64;
    scaled.clamp(cfg.min_energy, cfg.max_energy)
}
