//! Generator stage: asks the LLM for a mutation plan, the data analogue of
//! a dynamically-loaded generator module.

use crossbeam_channel::{Receiver, Sender};

use super::{FixJob, GenerateJob, PipelineContext};
use crate::csv_log::MutatorGeneratorCsvRow;
use crate::llm::LlmRequest;

pub fn run(ctx: PipelineContext, generate_rx: Receiver<GenerateJob>, fix_tx: Sender<FixJob>) {
    while let Ok(job) = generate_rx.recv() {
        process_one(&ctx, &fix_tx, job);
    }
}

fn process_one(ctx: &PipelineContext, fix_tx: &Sender<FixJob>, job: GenerateJob) {
    let _span = tracing::info_span!("generator", seed_id = job.seed_id).entered();
    let start = ctx.relative_time();
    let max_retry = ctx.config.others.llm_format_retry;
    let mut llm_count = 0u64;
    let mut llm_error_count = 0u64;
    let llm_started = std::time::Instant::now();

    let mut plan_text = None;
    for _ in 0..=max_retry {
        llm_count += 1;
        let response = ctx.llm_generator.chat(&LlmRequest {
            prompt: format!(
                "Produce a JSON mutation plan with {} mask slots for:\n{}",
                job.mask_count, job.parsed_text
            ),
            system: None,
        });
        let blocks = crate::llm::extract_fenced_blocks(&response.text, "json");
        if let Some(json) = blocks.into_iter().next() {
            plan_text = Some(json);
            break;
        }
        llm_error_count += 1;
    }

    let _ = ctx.csv.write_mutator_generator(MutatorGeneratorCsvRow {
        real_time: ctx.real_time(),
        relative_time: start,
        seed_id: job.seed_id,
        use_all_time: ctx.relative_time() - start,
        llm_use_time: llm_started.elapsed().as_secs_f64(),
        llm_up_token: 0,
        llm_down_token: 0,
        llm_count,
        llm_error_count,
        left_mutator_generate_queue_count: 0,
    });

    let Some(plan_text) = plan_text else {
        // Format errors exhausted: drop the seed, contributing no mutator.
        tracing::warn!(seed_id = job.seed_id, "generator exhausted LLM format retries, dropping");
        return;
    };

    let _ = fix_tx.send(FixJob {
        seed_id: job.seed_id,
        energy_budget: job.energy_budget,
        mask_count: job.mask_count,
        plan_text,
    });
}
