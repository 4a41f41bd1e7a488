//! Error taxonomy for the mutation pipeline.
//!
//! Worker stages never surface these upward to the host; they are caught,
//! logged, and the work unit is dropped or retried. Only configuration
//! loading and shared-memory attachment are allowed to fail hard (they are
//! both only ever called from `init`).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("output directory {0:?} already exists and is not empty")]
    DirtyOutputDir(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport error talking to the LLM endpoint")]
    Transport(#[source] reqwest::Error),
    #[error("LLM response did not contain a `{tag}` fenced code block")]
    NoCodeBlock { tag: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BitmapError {
    #[error("failed to attach coverage shared memory ({handle})")]
    AttachFailed { handle: String, errno: i32 },
    #[error("coverage snapshot size {actual} does not match configured map size {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("syntax repair exhausted after {retries} retries")]
    SyntaxExhausted { retries: u32 },
    #[error("mutation plan is malformed: {0}")]
    MalformedPlan(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("LLM kept returning malformed output after {retries} retries")]
    FormatExhausted { retries: u32 },
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Repair(#[from] RepairError),
}

/// A published Mutator's `generate()` is pure evaluation of its plan, but a
/// plan accepted despite exhausted semantic-repair retries can still
/// produce a sample with an unresolved mask token at draw time. The caller
/// marks the mutator failed and falls back to a random pool pick.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("evaluated sample still contains an unresolved mask token")]
    UnresolvedMask,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
    #[error("failed to initialize CSV logger at {path:?}")]
    Csv {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to initialize crash library")]
    CrashLibrary(#[source] std::io::Error),
}
