//! Configuration data model, loaded with `serde` + `serde_yaml`.
//!
//! The loader is deliberately thin: parse, make sure directories exist (or
//! can be created), and hand back a typed tree. Prompt construction and file
//! format nuance beyond that are out of scope.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    pub others: OthersConfig,
    pub energy: EnergyConfig,
    pub llm: LlmEndpoints,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub dbms: String,
    pub dbms_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OthersConfig {
    /// `T`: number of samples drawn from a candidate module during repair.
    pub fix_mutator_try_time: u32,
    pub semantic_fix_max_time: u32,
    pub syntax_error_max_retry: u32,
    pub llm_format_retry: u32,
    /// `K`: selection-count period that forks a structural job.
    pub times_to_structural_mutator: u64,
    #[serde(default = "default_thread_count")]
    pub parser_threads: usize,
    #[serde(default = "default_thread_count")]
    pub generator_threads: usize,
    #[serde(default = "default_thread_count")]
    pub fixer_threads: usize,
    #[serde(default = "default_thread_count")]
    pub structural_threads: usize,
    #[serde(default = "default_stack_size")]
    pub parser_stack_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_thread_count() -> usize {
    1
}

fn default_stack_size() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnergyConfig {
    /// `R`: exchange rate multiplying the selection score.
    pub exchange_rate: f64,
    pub min_energy: u64,
    pub max_energy: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmEndpoints {
    pub llm_parser: LlmEndpoint,
    pub llm_mutator_generator: LlmEndpoint,
    pub llm_structural_mutator: LlmEndpoint,
    pub llm_fixer: LlmEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmEndpoint {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    pub annotated_seed_dir: PathBuf,
    pub mutator_module_dir: PathBuf,
    pub structural_output_dir: PathBuf,
    pub csv_dir: PathBuf,
    pub bitmap_dir: PathBuf,
    pub afl_crashes_dir: PathBuf,
    pub cve_cases_dir: PathBuf,
    pub map_size: usize,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.ensure_dirs()?;
        Ok(config)
    }

    fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            &self.paths.annotated_seed_dir,
            &self.paths.mutator_module_dir,
            &self.paths.structural_output_dir,
            &self.paths.csv_dir,
            &self.paths.bitmap_dir,
            &self.paths.afl_crashes_dir,
            &self.paths.cve_cases_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Read {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
target:
  dbms: postgres
  dbms_version: "16"
others:
  fix_mutator_try_time: 8
  semantic_fix_max_time: 3
  syntax_error_max_retry: 3
  llm_format_retry: 3
  times_to_structural_mutator: 5
energy:
  exchange_rate: 1.0
  min_energy: 1
  max_energy: 32
llm:
  llm_parser: {base_url: "http://x", model: "m", api_key: "k"}
  llm_mutator_generator: {base_url: "http://x", model: "m", api_key: "k"}
  llm_structural_mutator: {base_url: "http://x", model: "m", api_key: "k"}
  llm_fixer: {base_url: "http://x", model: "m", api_key: "k"}
paths:
  annotated_seed_dir: /tmp/chilo/seeds
  mutator_module_dir: /tmp/chilo/mutators
  structural_output_dir: /tmp/chilo/structural
  csv_dir: /tmp/chilo/csv
  bitmap_dir: /tmp/chilo/bitmap
  afl_crashes_dir: /tmp/chilo/crashes
  cve_cases_dir: /tmp/chilo/cve
  map_size: 65536
"#
    }

    #[test]
    fn parses_and_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = sample_yaml().replace("/tmp/chilo", &dir.path().join("state").display().to_string());
        std::fs::write(&path, yaml).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.target.dbms, "postgres");
        assert_eq!(config.others.parser_threads, 1);
        assert!(config.paths.csv_dir.exists());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Path::new("/nonexistent/chilo.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
