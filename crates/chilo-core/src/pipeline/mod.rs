//! The four-stage worker farm: `parse -> generate -> fix -> ready`, plus the
//! side channel `structural -> structural-ready`. Workers communicate only
//! through bounded `crossbeam_channel` queues, a multi-producer/
//! multi-consumer generalization of a single-consumer `std::sync::mpsc`.

mod fixer;
mod generator;
mod parser;
mod structural;

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::config::Config;
use crate::crash_library::CrashLibrary;
use crate::csv_log::CsvLogger;
use crate::llm::LlmChat;
use crate::mutator::{Mutator, MutatorPool};
use crate::seed::SeedRegistry;

#[derive(Debug, Clone)]
pub struct ParseJob {
    pub seed_id: u32,
    pub energy_budget: u64,
}

#[derive(Debug, Clone)]
pub struct GenerateJob {
    pub seed_id: u32,
    pub energy_budget: u64,
    pub parsed_text: String,
    pub mask_count: u32,
}

#[derive(Debug, Clone)]
pub struct FixJob {
    pub seed_id: u32,
    pub energy_budget: u64,
    pub mask_count: u32,
    pub plan_text: String,
}

#[derive(Debug, Clone)]
pub struct StructuralJob {
    pub seed_id: u32,
    pub energy_budget: u64,
}

#[derive(Debug, Clone)]
pub struct StructuralReadyItem {
    pub seed_id: u32,
    pub payload_text: String,
}

/// Shared, read-mostly context every stage needs. Cheap to clone (everything
/// inside is an `Arc`).
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub seeds: Arc<SeedRegistry>,
    pub pool: Arc<MutatorPool>,
    pub csv: Arc<CsvLogger>,
    pub crash_library: Arc<CrashLibrary>,
    pub llm_parser: Arc<dyn LlmChat>,
    pub llm_generator: Arc<dyn LlmChat>,
    pub llm_fixer: Arc<dyn LlmChat>,
    pub llm_structural: Arc<dyn LlmChat>,
    pub start_time: Instant,
    pub structural_seq: Arc<AtomicU64>,
}

impl PipelineContext {
    pub fn relative_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn real_time(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

struct RunEntry {
    mutator: Arc<Mutator>,
    remaining: u64,
}

/// FIFO of Mutator references where a Mutator appears contiguously N times.
/// Modeled as a queue of runs rather than N individual clones so `schedule`
/// can read the length of the leading run, the energy owed to whichever
/// Mutator instance sits at the head, without popping it.
#[derive(Default)]
pub struct ReadyQueue {
    inner: Mutex<VecDeque<RunEntry>>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_run(&self, mutator: Arc<Mutator>, count: u64) {
        if count == 0 {
            return;
        }
        self.inner.lock().push_back(RunEntry {
            mutator,
            remaining: count,
        });
    }

    pub fn pop_one(&self) -> Option<Arc<Mutator>> {
        let mut inner = self.inner.lock();
        let front = inner.front_mut()?;
        let mutator = Arc::clone(&front.mutator);
        front.remaining -= 1;
        if front.remaining == 0 {
            inner.pop_front();
        }
        Some(mutator)
    }

    pub fn leading_run_len(&self) -> u64 {
        self.inner.lock().front().map(|e| e.remaining).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total outstanding Mutator invocations across every run, used for the
    /// `left_wait_exec_queue_count` CSV column.
    pub fn len(&self) -> u64 {
        self.inner.lock().iter().map(|e| e.remaining).sum()
    }
}

pub struct Queues {
    pub parse_tx: Sender<ParseJob>,
    parse_rx: Receiver<ParseJob>,
    generate_tx: Sender<GenerateJob>,
    generate_rx: Receiver<GenerateJob>,
    fix_tx: Sender<FixJob>,
    fix_rx: Receiver<FixJob>,
    pub ready: Arc<ReadyQueue>,
    pub structural_tx: Sender<StructuralJob>,
    structural_rx: Receiver<StructuralJob>,
    pub structural_ready_tx: Sender<StructuralReadyItem>,
    pub structural_ready_rx: Receiver<StructuralReadyItem>,
}

impl Queues {
    pub fn new(capacity: usize) -> Self {
        let (parse_tx, parse_rx) = crossbeam_channel::bounded(capacity);
        let (generate_tx, generate_rx) = crossbeam_channel::bounded(capacity);
        let (fix_tx, fix_rx) = crossbeam_channel::bounded(capacity);
        let (structural_tx, structural_rx) = crossbeam_channel::bounded(capacity);
        let (structural_ready_tx, structural_ready_rx) = crossbeam_channel::bounded(capacity);
        Self {
            parse_tx,
            parse_rx,
            generate_tx,
            generate_rx,
            fix_tx,
            fix_rx,
            ready: Arc::new(ReadyQueue::new()),
            structural_tx,
            structural_rx,
            structural_ready_tx,
            structural_ready_rx,
        }
    }
}

/// Spawns every configured worker thread. Stages are cancellable by closing
/// their input queue (dropping every `Sender`); they drain gracefully and
/// the spawned threads exit on their own.
pub fn spawn_workers(ctx: PipelineContext, queues: &Queues) -> Vec<std::thread::JoinHandle<()>> {
    let mut handles = Vec::new();

    for _ in 0..ctx.config.others.parser_threads {
        let ctx = ctx.clone();
        let parse_rx = queues.parse_rx.clone();
        let generate_tx = queues.generate_tx.clone();
        let stack_capacity = ctx.config.others.parser_stack_size;
        handles.push(
            std::thread::Builder::new()
                .name("chilo-parser".into())
                .spawn(move || parser::run(ctx, parse_rx, generate_tx, stack_capacity))
                .expect("spawn parser thread"),
        );
    }

    for _ in 0..ctx.config.others.generator_threads {
        let ctx = ctx.clone();
        let generate_rx = queues.generate_rx.clone();
        let fix_tx = queues.fix_tx.clone();
        handles.push(
            std::thread::Builder::new()
                .name("chilo-generator".into())
                .spawn(move || generator::run(ctx, generate_rx, fix_tx))
                .expect("spawn generator thread"),
        );
    }

    for _ in 0..ctx.config.others.fixer_threads {
        let ctx = ctx.clone();
        let fix_rx = queues.fix_rx.clone();
        let ready = Arc::clone(&queues.ready);
        handles.push(
            std::thread::Builder::new()
                .name("chilo-fixer".into())
                .spawn(move || fixer::run(ctx, fix_rx, ready))
                .expect("spawn fixer thread"),
        );
    }

    for _ in 0..ctx.config.others.structural_threads {
        let ctx = ctx.clone();
        let structural_rx = queues.structural_rx.clone();
        let structural_ready_tx = queues.structural_ready_tx.clone();
        handles.push(
            std::thread::Builder::new()
                .name("chilo-structural".into())
                .spawn(move || structural::run(ctx, structural_rx, structural_ready_tx))
                .expect("spawn structural thread"),
        );
    }

    handles
}
