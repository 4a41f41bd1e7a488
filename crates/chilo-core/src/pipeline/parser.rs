//! Parser stage: stack-with-reflow scheduling over incoming parse jobs.
//!
//! Modeled as a pair of `VecDeque`s plus an alternator flag rather than a
//! bespoke data structure, per the design note: a bounded LIFO `stack`
//! (prefers the newest seed) that evicts its oldest entry into an unbounded
//! FIFO `reflow` queue instead of dropping it.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{GenerateJob, ParseJob, PipelineContext};
use crate::csv_log::ParserCsvRow;
use crate::llm::LlmRequest;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn run(
    ctx: PipelineContext,
    parse_rx: Receiver<ParseJob>,
    generate_tx: Sender<GenerateJob>,
    stack_capacity: usize,
) {
    let mut stack: VecDeque<ParseJob> = VecDeque::new();
    let mut reflow: VecDeque<ParseJob> = VecDeque::new();
    let mut use_stack_next = true;

    loop {
        match parse_rx.recv_timeout(POLL_INTERVAL) {
            Ok(job) => push(&mut stack, &mut reflow, stack_capacity, job),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // Drain whatever is left, then exit.
                while let Some(job) = pop(&mut stack, &mut reflow, &mut use_stack_next) {
                    process_one(&ctx, &generate_tx, job);
                }
                return;
            }
        }

        // Backpressure: if the downstream generate-queue has no room, do
        // nothing this tick, in particular issue no LLM call.
        if generate_tx.len() >= generate_tx.capacity().unwrap_or(usize::MAX) {
            continue;
        }

        if let Some(job) = pop(&mut stack, &mut reflow, &mut use_stack_next) {
            process_one(&ctx, &generate_tx, job);
        }
    }
}

fn push(stack: &mut VecDeque<ParseJob>, reflow: &mut VecDeque<ParseJob>, capacity: usize, job: ParseJob) {
    if stack.len() >= capacity.max(1) {
        if let Some(evicted) = stack.pop_front() {
            reflow.push_back(evicted);
        }
    }
    stack.push_back(job);
}

/// Alternates LIFO stack (recency) and FIFO reflow (fairness) sources,
/// falling back to whichever is non-empty.
fn pop(stack: &mut VecDeque<ParseJob>, reflow: &mut VecDeque<ParseJob>, use_stack_next: &mut bool) -> Option<ParseJob> {
    let prefer_stack = *use_stack_next;
    *use_stack_next = !*use_stack_next;

    if prefer_stack {
        stack.pop_back().or_else(|| reflow.pop_front())
    } else {
        reflow.pop_front().or_else(|| stack.pop_back())
    }
}

fn process_one(ctx: &PipelineContext, generate_tx: &Sender<GenerateJob>, job: ParseJob) {
    let _span = tracing::info_span!("parser", seed_id = job.seed_id).entered();
    let start = ctx.relative_time();
    let Some(seed) = ctx.seeds.get(job.seed_id) else {
        return;
    };

    let (parsed_text, mask_count, was_already_parsed, llm_use_time, llm_count, format_error_count) = {
        let cache = seed.parse_cache.lock().clone();
        if cache.is_parsed {
            (cache.parsed_text.unwrap_or_default(), cache.mask_count, true, 0.0, 0, 0)
        } else {
            drop(cache);
            annotate_via_llm(ctx, &seed.text)
        }
    };

    if !was_already_parsed {
        let mut cache = seed.parse_cache.lock();
        cache.parsed_text = Some(parsed_text.clone());
        cache.is_parsed = true;
        cache.mask_count = mask_count;
        drop(cache);
        let path = ctx
            .config
            .paths
            .annotated_seed_dir
            .join(job.seed_id.to_string());
        let _ = std::fs::write(path, &parsed_text);
    }

    let _ = ctx.csv.write_parser(ParserCsvRow {
        real_time: ctx.real_time(),
        relative_time: start,
        seed_id: job.seed_id,
        need_mutate_count: job.energy_budget,
        is_parsed: was_already_parsed,
        llm_use_time,
        up_token: 0,
        down_token: 0,
        llm_count,
        llm_format_error_count: format_error_count,
        all_use_time: ctx.relative_time() - start,
        select_count: seed.selected_count.load(std::sync::atomic::Ordering::SeqCst),
        left_parser_queue_count: 0,
    });

    let _ = generate_tx.send(GenerateJob {
        seed_id: job.seed_id,
        energy_budget: job.energy_budget,
        parsed_text,
        mask_count,
    });
}

/// Annotates mutable positions by asking the LLM, retrying on extraction
/// failure up to `llm_format_retry`. `mask_count` is the number of `[`
/// placeholder openers in the returned text.
fn annotate_via_llm(ctx: &PipelineContext, text: &str) -> (String, u32, bool, f64, u64, u64) {
    let max_retry = ctx.config.others.llm_format_retry;
    let mut format_errors = 0u64;
    let mut calls = 0u64;
    let started = std::time::Instant::now();

    for _ in 0..=max_retry {
        calls += 1;
        let response = ctx.llm_parser.chat(&LlmRequest {
            prompt: format!(
                "Annotate mutable positions in this {} payload with bracketed masks:\n{}",
                ctx.config.target.dbms, text
            ),
            system: None,
        });
        let blocks = crate::llm::extract_fenced_blocks(&response.text, "sql");
        if let Some(annotated) = blocks.into_iter().next() {
            let mask_count = annotated.matches('[').count() as u32;
            return (annotated, mask_count, false, started.elapsed().as_secs_f64(), calls, format_errors);
        }
        format_errors += 1;
    }
    // Exhausted: forward the original text unannotated rather than blocking
    // the pipeline forever.
    (text.to_string(), 0, false, started.elapsed().as_secs_f64(), calls, format_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_evicts_oldest_into_reflow_when_full() {
        let mut stack = VecDeque::new();
        let mut reflow = VecDeque::new();
        for i in 0..3 {
            push(&mut stack, &mut reflow, 2, ParseJob { seed_id: i, energy_budget: 1 });
        }
        assert_eq!(stack.len(), 2);
        assert_eq!(reflow.len(), 1);
        assert_eq!(reflow.front().unwrap().seed_id, 0);
    }

    #[test]
    fn pop_alternates_sources() {
        let mut stack = VecDeque::new();
        let mut reflow = VecDeque::new();
        stack.push_back(ParseJob { seed_id: 1, energy_budget: 1 });
        reflow.push_back(ParseJob { seed_id: 2, energy_budget: 1 });
        let mut use_stack_next = true;
        let first = pop(&mut stack, &mut reflow, &mut use_stack_next).unwrap();
        let second = pop(&mut stack, &mut reflow, &mut use_stack_next).unwrap();
        assert_eq!(first.seed_id, 1);
        assert_eq!(second.seed_id, 2);
    }

    #[test]
    fn pop_falls_back_when_preferred_source_is_empty() {
        let mut stack = VecDeque::new();
        let mut reflow = VecDeque::new();
        reflow.push_back(ParseJob { seed_id: 9, energy_budget: 1 });
        let mut use_stack_next = true;
        let job = pop(&mut stack, &mut reflow, &mut use_stack_next).unwrap();
        assert_eq!(job.seed_id, 9);
    }
}
