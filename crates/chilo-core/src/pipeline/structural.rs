//! Structural mutator stage: full-seed LLM rewrite, optionally seeded with
//! crash examples, re-registered as a new seed before emission.

use crossbeam_channel::{Receiver, Sender};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{PipelineContext, StructuralJob, StructuralReadyItem};
use crate::crash_library::CrashLibrary;
use crate::csv_log::StructuralMutatorCsvRow;
use crate::llm::LlmRequest;

const CRASH_EXAMPLES_PER_PROMPT: usize = 3;

pub fn run(
    ctx: PipelineContext,
    structural_rx: Receiver<StructuralJob>,
    structural_ready_tx: Sender<StructuralReadyItem>,
) {
    while let Ok(job) = structural_rx.recv() {
        process_one(&ctx, &structural_ready_tx, job);
    }
}

fn process_one(ctx: &PipelineContext, structural_ready_tx: &Sender<StructuralReadyItem>, job: StructuralJob) {
    let _span = tracing::info_span!("structural", seed_id = job.seed_id).entered();
    let start = ctx.relative_time();
    let Some(seed) = ctx.seeds.get(job.seed_id) else {
        return;
    };

    let mut rng = StdRng::from_entropy();
    let examples = ctx
        .crash_library
        .get_random_cases(CRASH_EXAMPLES_PER_PROMPT, &mut rng);
    let examples_text = CrashLibrary::format_cases_for_prompt(&examples);

    let max_retry = ctx.config.others.llm_format_retry;
    let mut llm_count = 0u64;
    let mut llm_format_error_count = 0u64;
    let llm_started = std::time::Instant::now();
    let mut rewritten = None;

    for _ in 0..=max_retry {
        llm_count += 1;
        let response = ctx.llm_structural.chat(&LlmRequest {
            prompt: format!(
                "Rewrite this {} payload with structurally-enriched boundary cases.\nSeed:\n{}\nInspiration:\n{}",
                ctx.config.target.dbms, seed.text, examples_text
            ),
            system: None,
        });
        let blocks = crate::llm::extract_fenced_blocks(&response.text, "sql");
        if let Some(text) = blocks.into_iter().next() {
            rewritten = Some(text);
            break;
        }
        llm_format_error_count += 1;
    }

    // On format-retry exhaustion, pass the original payload through
    // unchanged rather than dropping the job.
    let payload_text = rewritten.unwrap_or_else(|| seed.text.clone());

    // The new payload is registered as a seed before it is emitted to
    // structural-ready, so anything reading the registry downstream always
    // finds a valid entry for it.
    let (_, new_seed) = ctx.seeds.insert(payload_text.clone().into_bytes());

    let seq = ctx
        .structural_seq
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let artifact_path = ctx
        .config
        .paths
        .structural_output_dir
        .join(format!("{seq}_{}_{}.txt", job.seed_id, new_seed.seed_id));
    let _ = std::fs::write(&artifact_path, &payload_text);

    let _ = ctx.csv.write_structural_mutator(StructuralMutatorCsvRow {
        real_time: ctx.real_time(),
        relative_time: start,
        seed_id: job.seed_id,
        new_seed_id: new_seed.seed_id,
        all_use_time: ctx.relative_time() - start,
        llm_up_token: 0,
        llm_down_token: 0,
        llm_count,
        llm_format_error_count,
        llm_use_time: llm_started.elapsed().as_secs_f64(),
        left_structural_mutate_queue_count: 0,
    });

    let _ = structural_ready_tx.send(StructuralReadyItem {
        seed_id: new_seed.seed_id,
        payload_text,
    });
}
