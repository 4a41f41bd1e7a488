//! CSV event sinks, one dedicated mutex per sink, append-only, one row per
//! call. Column orders are transliterated from the original
//! `chilo_factory.py` writer calls.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

pub struct MainCsvRow {
    pub real_time: f64,
    pub relative_time: f64,
    pub fuzz_count_seed_number: u64,
    pub fuzz_seed_number: u64,
    pub is_by_random: bool,
    pub fuzz_use_time: f64,
    pub now_seed_id: u32,
    pub real_fuzz_seed_id: u32,
    pub real_mutator_id: Option<u32>,
    pub left_wait_exec_queue_count: usize,
    pub ori_mutate_out_size: usize,
    pub real_mutate_out_size: usize,
    pub is_cut: bool,
    pub is_error_occur: bool,
    pub is_from_structural_mutator: bool,
}

pub struct ParserCsvRow {
    pub real_time: f64,
    pub relative_time: f64,
    pub seed_id: u32,
    pub need_mutate_count: u64,
    pub is_parsed: bool,
    pub llm_use_time: f64,
    pub up_token: u64,
    pub down_token: u64,
    pub llm_count: u64,
    pub llm_format_error_count: u64,
    pub all_use_time: f64,
    pub select_count: u64,
    pub left_parser_queue_count: usize,
}

pub struct MutatorGeneratorCsvRow {
    pub real_time: f64,
    pub relative_time: f64,
    pub seed_id: u32,
    pub use_all_time: f64,
    pub llm_use_time: f64,
    pub llm_up_token: u64,
    pub llm_down_token: u64,
    pub llm_count: u64,
    pub llm_error_count: u64,
    pub left_mutator_generate_queue_count: usize,
}

pub struct MutatorFixerCsvRow {
    pub real_time: f64,
    pub relative_time: f64,
    pub seed_id: u32,
    pub mutator_id: u32,
    pub need_mutate_count: u64,
    pub all_use_time: f64,
    pub all_llm_count: u64,
    pub syntax_use_time: f64,
    pub syntax_error_count: u64,
    pub syntax_format_error_time: u64,
    pub syntax_llm_use_time: f64,
    pub syntax_llm_count: u64,
    pub syntax_up_token: u64,
    pub syntax_down_token: u64,
    pub semantic_use_time: f64,
    pub semantic_mask_error_count: u64,
    pub semantic_random_error_count: u64,
    pub semantic_error_count: u64,
    pub semantic_error_llm_use_time: f64,
    pub semantic_error_llm_count: u64,
    pub semantic_llm_format_error: u64,
    pub semantic_up_token: u64,
    pub semantic_down_token: u64,
    pub left_fix_queue_count: usize,
    pub at_last_is_all_correct: bool,
}

pub struct StructuralMutatorCsvRow {
    pub real_time: f64,
    pub relative_time: f64,
    pub seed_id: u32,
    pub new_seed_id: u32,
    pub all_use_time: f64,
    pub llm_up_token: u64,
    pub llm_down_token: u64,
    pub llm_count: u64,
    pub llm_format_error_count: u64,
    pub llm_use_time: f64,
    pub left_structural_mutate_queue_count: usize,
}

struct Sink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Sink {
    fn new(path: PathBuf, header: &[&str]) -> std::io::Result<Self> {
        let needs_header = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if needs_header {
            write_row(&mut file, header)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    fn append(&self, row: &[String]) -> std::io::Result<()> {
        let _guard = self.lock.lock();
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let refs: Vec<&str> = row.iter().map(String::as_str).collect();
        write_row(&mut file, &refs)
    }
}

fn write_row(file: &mut File, fields: &[&str]) -> std::io::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(fields)?;
    writer.flush()
}

pub struct CsvLogger {
    main: Sink,
    parser: Sink,
    mutator_generator: Sink,
    mutator_fixer: Sink,
    structural_mutator: Sink,
}

impl CsvLogger {
    pub fn new(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            main: Sink::new(
                dir.join("main.csv"),
                &[
                    "real_time",
                    "relative_time",
                    "fuzz_count_seed_number",
                    "fuzz_seed_number",
                    "is_by_random",
                    "fuzz_use_time",
                    "now_seed_id",
                    "real_fuzz_seed_id",
                    "real_mutator_id",
                    "left_wait_exec_queue_count",
                    "ori_mutate_out_size",
                    "real_mutate_out_size",
                    "is_cut",
                    "is_error_occur",
                    "is_from_structural_mutator",
                ],
            )?,
            parser: Sink::new(
                dir.join("parser.csv"),
                &[
                    "real_time",
                    "relative_time",
                    "seed_id",
                    "need_mutate_count",
                    "is_parsed",
                    "LLM_use_time",
                    "up_token",
                    "down_token",
                    "LLM_count",
                    "LLM_format_error_count",
                    "all_use_time",
                    "select_count",
                    "left_parser_queue_count",
                ],
            )?,
            mutator_generator: Sink::new(
                dir.join("mutator_generator.csv"),
                &[
                    "real_time",
                    "relative_time",
                    "seed_id",
                    "use_all_time",
                    "llm_use_time",
                    "llm_up_token",
                    "llm_down_token",
                    "llm_count",
                    "llm_error_count",
                    "left_mutator_generate_queue_count",
                ],
            )?,
            mutator_fixer: Sink::new(
                dir.join("mutator_fixer.csv"),
                &[
                    "real_time",
                    "relative_time",
                    "seed_id",
                    "mutator_id",
                    "need_mutate_count",
                    "all_use_time",
                    "all_llm_count",
                    "syntax_use_time",
                    "syntax_error_count",
                    "syntax_format_error_time",
                    "syntax_llm_use_time",
                    "syntax_llm_count",
                    "syntax_up_token",
                    "syntax_down_token",
                    "sematic_use_time",
                    "semantic_mask_error_count",
                    "semantic_random_error_count",
                    "semantic_error_count",
                    "semantic_error_llm_use_time",
                    "semantic_error_llm_count",
                    "semantic_llm_format_error",
                    "semantic_up_token",
                    "semantic_down_token",
                    "left_fix_queue_count",
                    "at_last_is_all_correct",
                ],
            )?,
            structural_mutator: Sink::new(
                dir.join("structural_mutator.csv"),
                &[
                    "real_time",
                    "relative_time",
                    "seed_id",
                    "new_seed_id",
                    "all_use_time",
                    "llm_up_token",
                    "llm_down_token",
                    "llm_count",
                    "llm_format_error_count",
                    "llm_use_time",
                    "left_structural_mutate_queue_count",
                ],
            )?,
        })
    }

    pub fn write_main(&self, row: MainCsvRow) -> std::io::Result<()> {
        self.main.append(&[
            row.real_time.to_string(),
            row.relative_time.to_string(),
            row.fuzz_count_seed_number.to_string(),
            row.fuzz_seed_number.to_string(),
            row.is_by_random.to_string(),
            row.fuzz_use_time.to_string(),
            row.now_seed_id.to_string(),
            row.real_fuzz_seed_id.to_string(),
            row.real_mutator_id.map(|v| v.to_string()).unwrap_or_default(),
            row.left_wait_exec_queue_count.to_string(),
            row.ori_mutate_out_size.to_string(),
            row.real_mutate_out_size.to_string(),
            row.is_cut.to_string(),
            row.is_error_occur.to_string(),
            row.is_from_structural_mutator.to_string(),
        ])
    }

    pub fn write_parser(&self, row: ParserCsvRow) -> std::io::Result<()> {
        self.parser.append(&[
            row.real_time.to_string(),
            row.relative_time.to_string(),
            row.seed_id.to_string(),
            row.need_mutate_count.to_string(),
            row.is_parsed.to_string(),
            row.llm_use_time.to_string(),
            row.up_token.to_string(),
            row.down_token.to_string(),
            row.llm_count.to_string(),
            row.llm_format_error_count.to_string(),
            row.all_use_time.to_string(),
            row.select_count.to_string(),
            row.left_parser_queue_count.to_string(),
        ])
    }

    pub fn write_mutator_generator(&self, row: MutatorGeneratorCsvRow) -> std::io::Result<()> {
        self.mutator_generator.append(&[
            row.real_time.to_string(),
            row.relative_time.to_string(),
            row.seed_id.to_string(),
            row.use_all_time.to_string(),
            row.llm_use_time.to_string(),
            row.llm_up_token.to_string(),
            row.llm_down_token.to_string(),
            row.llm_count.to_string(),
            row.llm_error_count.to_string(),
            row.left_mutator_generate_queue_count.to_string(),
        ])
    }

    pub fn write_mutator_fixer(&self, row: MutatorFixerCsvRow) -> std::io::Result<()> {
        self.mutator_fixer.append(&[
            row.real_time.to_string(),
            row.relative_time.to_string(),
            row.seed_id.to_string(),
            row.mutator_id.to_string(),
            row.need_mutate_count.to_string(),
            row.all_use_time.to_string(),
            row.all_llm_count.to_string(),
            row.syntax_use_time.to_string(),
            row.syntax_error_count.to_string(),
            row.syntax_format_error_time.to_string(),
            row.syntax_llm_use_time.to_string(),
            row.syntax_llm_count.to_string(),
            row.syntax_up_token.to_string(),
            row.syntax_down_token.to_string(),
            row.semantic_use_time.to_string(),
            row.semantic_mask_error_count.to_string(),
            row.semantic_random_error_count.to_string(),
            row.semantic_error_count.to_string(),
            row.semantic_error_llm_use_time.to_string(),
            row.semantic_error_llm_count.to_string(),
            row.semantic_llm_format_error.to_string(),
            row.semantic_up_token.to_string(),
            row.semantic_down_token.to_string(),
            row.left_fix_queue_count.to_string(),
            row.at_last_is_all_correct.to_string(),
        ])
    }

    pub fn write_structural_mutator(&self, row: StructuralMutatorCsvRow) -> std::io::Result<()> {
        self.structural_mutator.append(&[
            row.real_time.to_string(),
            row.relative_time.to_string(),
            row.seed_id.to_string(),
            row.new_seed_id.to_string(),
            row.all_use_time.to_string(),
            row.llm_up_token.to_string(),
            row.llm_down_token.to_string(),
            row.llm_count.to_string(),
            row.llm_format_error_count.to_string(),
            row.llm_use_time.to_string(),
            row.left_structural_mutate_queue_count.to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_once_and_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CsvLogger::new(dir.path()).unwrap();
        logger
            .write_main(MainCsvRow {
                real_time: 1.0,
                relative_time: 0.0,
                fuzz_count_seed_number: 1,
                fuzz_seed_number: 1,
                is_by_random: false,
                fuzz_use_time: 0.01,
                now_seed_id: 0,
                real_fuzz_seed_id: 0,
                real_mutator_id: Some(0),
                left_wait_exec_queue_count: 0,
                ori_mutate_out_size: 10,
                real_mutate_out_size: 10,
                is_cut: false,
                is_error_occur: false,
                is_from_structural_mutator: false,
            })
            .unwrap();
        let contents = std::fs::read_to_string(dir.path().join("main.csv")).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().next().unwrap().starts_with("real_time,"));
    }

    #[test]
    fn reopening_logger_does_not_duplicate_header() {
        let dir = tempfile::tempdir().unwrap();
        {
            CsvLogger::new(dir.path()).unwrap();
        }
        CsvLogger::new(dir.path()).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("parser.csv")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
