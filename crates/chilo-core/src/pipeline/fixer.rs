//! Fixer stage: the two-phase repair loop, validating and resampling a
//! `MutationPlan` instead of syntax-checking dynamically loaded source.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{FixJob, PipelineContext, ReadyQueue};
use crate::csv_log::MutatorFixerCsvRow;
use crate::llm::LlmRequest;
use crate::mutator::{MutationPlan, Mutator};

pub fn run(ctx: PipelineContext, fix_rx: Receiver<FixJob>, ready: Arc<ReadyQueue>) {
    while let Ok(job) = fix_rx.recv() {
        process_one(&ctx, &ready, job);
    }
}

fn process_one(ctx: &PipelineContext, ready: &Arc<ReadyQueue>, job: FixJob) {
    let _span = tracing::info_span!("fixer", seed_id = job.seed_id).entered();
    let start = ctx.relative_time();
    let try_time = ctx.config.others.fix_mutator_try_time as usize;
    let mut rng = StdRng::from_entropy();

    let mut all_llm_count = 0u64;
    let mut syntax_error_count = 0u64;
    let mut syntax_format_error_time = 0u64;
    let mut syntax_llm_count = 0u64;
    let syntax_started = std::time::Instant::now();

    // Syntax phase: parse the plan, repairing via LLM on malformed JSON or a
    // slot count mismatch against the seed's mask_count.
    let mut plan_text = job.plan_text.clone();
    let mut plan: Option<MutationPlan> = None;
    for _ in 0..=ctx.config.others.syntax_error_max_retry {
        match MutationPlan::from_json(&plan_text) {
            Ok(candidate) if candidate.matches_mask_count(job.mask_count) => {
                plan = Some(candidate);
                break;
            }
            _ => {
                syntax_error_count += 1;
                let (fixed, retried_llm) = request_syntax_fix(ctx, &plan_text, job.mask_count);
                syntax_llm_count += retried_llm;
                all_llm_count += retried_llm;
                match fixed {
                    Some(text) => plan_text = text,
                    None => syntax_format_error_time += 1,
                }
            }
        }
    }
    let syntax_use_time = syntax_started.elapsed().as_secs_f64();

    let Some(mut plan) = plan else {
        tracing::warn!(seed_id = job.seed_id, "fixer exhausted syntax retries, dropping module");
        let _ = ctx.csv.write_mutator_fixer(MutatorFixerCsvRow {
            real_time: ctx.real_time(),
            relative_time: start,
            seed_id: job.seed_id,
            mutator_id: 0,
            need_mutate_count: job.energy_budget,
            all_use_time: ctx.relative_time() - start,
            all_llm_count,
            syntax_use_time,
            syntax_error_count,
            syntax_format_error_time,
            syntax_llm_use_time: syntax_use_time,
            syntax_llm_count,
            syntax_up_token: 0,
            syntax_down_token: 0,
            semantic_use_time: 0.0,
            semantic_mask_error_count: 0,
            semantic_random_error_count: 0,
            semantic_error_count: 0,
            semantic_error_llm_use_time: 0.0,
            semantic_error_llm_count: 0,
            semantic_llm_format_error: 0,
            semantic_up_token: 0,
            semantic_down_token: 0,
            left_fix_queue_count: 0,
            at_last_is_all_correct: false,
        });
        return;
    };

    // Semantic phase: T samples must contain no leftover mask tokens and be
    // at least 25% unique; otherwise ask the LLM to repair semantics.
    let semantic_started = std::time::Instant::now();
    let mut semantic_mask_error_count = 0u64;
    let mut semantic_random_error_count = 0u64;
    let mut semantic_error_count = 0u64;
    let mut semantic_error_llm_count = 0u64;
    let mut at_last_is_all_correct = true;
    let mut similarity;

    loop {
        let samples: Vec<String> = (0..try_time).map(|_| plan.evaluate(&mut rng)).collect();
        let has_mask = samples.iter().any(|s| plan.sample_contains_mask(s));
        let unique: std::collections::HashSet<&String> = samples.iter().collect();
        let unique_ratio = unique.len() as f64 / try_time.max(1) as f64;
        similarity = 1.0 - unique_ratio;
        let insufficient_diversity = unique_ratio < 0.25;

        if !has_mask && !insufficient_diversity {
            break;
        }
        semantic_error_count += 1;
        if has_mask {
            semantic_mask_error_count += 1;
        }
        if insufficient_diversity {
            semantic_random_error_count += 1;
        }
        if semantic_error_count > ctx.config.others.semantic_fix_max_time as u64 {
            // Accept anyway: syntax is clean even though semantics remain
            // imperfect.
            at_last_is_all_correct = false;
            break;
        }
        let (fixed, retried_llm) = request_semantic_fix(ctx, &plan);
        semantic_error_llm_count += retried_llm;
        all_llm_count += retried_llm;
        if let Some(fixed_plan) = fixed {
            plan = fixed_plan;
        }
    }
    let semantic_use_time = semantic_started.elapsed().as_secs_f64();

    let seed = ctx.seeds.get(job.seed_id);
    let Some(seed) = seed else { return };
    let mutator_id = seed.next_mutator_id();
    let artifact_path = ctx
        .config
        .paths
        .mutator_module_dir
        .join(format!("{}_{}", job.seed_id, mutator_id));
    let _ = std::fs::write(&artifact_path, serde_json::to_string(&plan).unwrap_or_default());

    let mutator = Mutator::new(
        job.seed_id,
        mutator_id,
        0, // overwritten by MutatorPool::publish
        artifact_path,
        job.mask_count,
        similarity,
        plan,
    );
    let published = ctx.pool.publish(mutator);
    ready.push_run(published, job.energy_budget);

    let _ = ctx.csv.write_mutator_fixer(MutatorFixerCsvRow {
        real_time: ctx.real_time(),
        relative_time: start,
        seed_id: job.seed_id,
        mutator_id,
        need_mutate_count: job.energy_budget,
        all_use_time: ctx.relative_time() - start,
        all_llm_count,
        syntax_use_time,
        syntax_error_count,
        syntax_format_error_time,
        syntax_llm_use_time: syntax_use_time,
        syntax_llm_count,
        syntax_up_token: 0,
        syntax_down_token: 0,
        semantic_use_time,
        semantic_mask_error_count,
        semantic_random_error_count,
        semantic_error_count,
        semantic_error_llm_use_time: semantic_use_time,
        semantic_error_llm_count,
        semantic_llm_format_error: 0,
        semantic_up_token: 0,
        semantic_down_token: 0,
        left_fix_queue_count: 0,
        at_last_is_all_correct,
    });
}

fn request_syntax_fix(ctx: &PipelineContext, broken_plan: &str, mask_count: u32) -> (Option<String>, u64) {
    let response = ctx.llm_fixer.chat(&LlmRequest {
        prompt: format!(
            "This mutation plan JSON is malformed or has the wrong slot count (expected {mask_count}):\n{broken_plan}\nReturn a corrected plan."
        ),
        system: None,
    });
    let blocks = crate::llm::extract_fenced_blocks(&response.text, "json");
    (blocks.into_iter().next(), 1)
}

fn request_semantic_fix(ctx: &PipelineContext, plan: &MutationPlan) -> (Option<MutationPlan>, u64) {
    let plan_json = serde_json::to_string(plan).unwrap_or_default();
    let response = ctx.llm_fixer.chat(&LlmRequest {
        prompt: format!(
            "This mutation plan leaves masks unresolved or samples too similarly:\n{plan_json}\nReturn a plan with richer candidate sets."
        ),
        system: None,
    });
    let blocks = crate::llm::extract_fenced_blocks(&response.text, "json");
    let fixed = blocks
        .into_iter()
        .next()
        .and_then(|text| MutationPlan::from_json(&text).ok());
    (fixed, 1)
}
