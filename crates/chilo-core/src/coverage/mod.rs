//! Coverage bitmap: shared-memory reader plus the three-array accumulator.

mod shmem;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub use shmem::{PosixShmem, SysVShmem};

use crate::error::BitmapError;

/// Abstracts the two shared-memory attachment modes so the accumulator is
/// backend-agnostic.
pub trait CoverageSource: Send {
    fn snapshot(&self) -> &[u8];
}

/// Build the right backend from the handle string the host places in the
/// environment: either a POSIX shm path or a numeric SysV id.
pub fn attach(handle: &str, map_size: usize) -> Result<Box<dyn CoverageSource>, BitmapError> {
    if let Some(name) = handle.strip_prefix('/') {
        let name_with_slash = format!("/{name}");
        Ok(Box::new(PosixShmem::attach(&name_with_slash, map_size)?))
    } else {
        let id: i32 = handle.parse().map_err(|_| BitmapError::AttachFailed {
            handle: handle.to_string(),
            errno: 0,
        })?;
        Ok(Box::new(SysVShmem::attach(id, map_size)?))
    }
}

/// A bitmap snapshot loaded back from the three persisted files, for
/// offline inspection (`chilo-cli`'s replay aid) rather than live
/// accumulation.
#[derive(Debug, Clone)]
pub struct PersistedBitmap {
    pub sum: Vec<u64>,
    pub cumulative: Vec<u32>,
    pub bool_map: Vec<u8>,
}

impl PersistedBitmap {
    /// Reads `sum.txt`/`cumulative.txt`/`bool.txt` from `dir` (the inverse
    /// of [`GlobalBitmap::force_persist`]).
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        Ok(Self {
            sum: parse_csv_line(&std::fs::read_to_string(dir.join("sum.txt"))?),
            cumulative: parse_csv_line(&std::fs::read_to_string(dir.join("cumulative.txt"))?),
            bool_map: parse_csv_line(&std::fs::read_to_string(dir.join("bool.txt"))?),
        })
    }

    pub fn hit_count(&self) -> u64 {
        self.bool_map.iter().map(|&b| b as u64).sum()
    }

    /// Checks that `sum[i] >= cumulative[i] >= bool[i] ∈ {0,1}` for every
    /// slot. Returns the index of the first violation, if any.
    pub fn check_invariants(&self) -> Result<(), usize> {
        let len = self.sum.len().min(self.cumulative.len()).min(self.bool_map.len());
        for i in 0..len {
            let ok = self.sum[i] >= self.cumulative[i] as u64
                && self.cumulative[i] as u32 >= self.bool_map[i] as u32
                && (self.bool_map[i] == 0 || self.bool_map[i] == 1);
            if !ok {
                return Err(i);
            }
        }
        Ok(())
    }
}

fn parse_csv_line<T: std::str::FromStr>(line: &str) -> Vec<T> {
    line.trim()
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

pub struct GlobalBitmap {
    sum: Vec<u64>,
    cumulative: Vec<u32>,
    bool_map: Vec<u8>,
    hit_count: u64,
    dir: PathBuf,
    last_saved: Option<Instant>,
    min_save_interval: Duration,
}

impl GlobalBitmap {
    pub fn new(map_size: usize, dir: PathBuf) -> Self {
        Self {
            sum: vec![0; map_size],
            cumulative: vec![0; map_size],
            bool_map: vec![0; map_size],
            hit_count: 0,
            dir,
            last_saved: None,
            min_save_interval: Duration::from_secs(5),
        }
    }

    pub fn map_size(&self) -> usize {
        self.sum.len()
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn sum(&self) -> &[u64] {
        &self.sum
    }

    pub fn cumulative(&self) -> &[u32] {
        &self.cumulative
    }

    pub fn bool_map(&self) -> &[u8] {
        &self.bool_map
    }

    /// Accumulate one snapshot, returning the number of newly-hit edges.
    pub fn accumulate(&mut self, snapshot: &[u8]) -> Result<u64, BitmapError> {
        if snapshot.len() != self.sum.len() {
            return Err(BitmapError::SizeMismatch {
                expected: self.sum.len(),
                actual: snapshot.len(),
            });
        }
        let mut new_edges = 0u64;
        for i in 0..snapshot.len() {
            let hit = snapshot[i];
            if hit == 0 {
                continue;
            }
            self.sum[i] += hit as u64;
            self.cumulative[i] += 1;
            if self.bool_map[i] == 0 {
                self.bool_map[i] = 1;
                self.hit_count += 1;
                new_edges += 1;
            }
        }
        Ok(new_edges)
    }

    /// Persist the three arrays if at least 5 seconds elapsed since the last
    /// save; no-op otherwise. Returns whether a write happened.
    pub fn maybe_persist(&mut self) -> std::io::Result<bool> {
        if let Some(last) = self.last_saved {
            if last.elapsed() < self.min_save_interval {
                return Ok(false);
            }
        }
        self.persist()?;
        self.last_saved = Some(Instant::now());
        Ok(true)
    }

    /// Force a write regardless of the minimum interval, used by `deinit`
    /// for the last-gasp flush before the process exits.
    pub fn force_persist(&mut self) -> std::io::Result<()> {
        self.persist()?;
        self.last_saved = Some(Instant::now());
        Ok(())
    }

    fn persist(&self) -> std::io::Result<()> {
        write_atomic(
            &self.dir.join("sum.txt"),
            &join_csv(self.sum.iter()),
        )?;
        write_atomic(
            &self.dir.join("cumulative.txt"),
            &join_csv(self.cumulative.iter()),
        )?;
        write_atomic(&self.dir.join("bool.txt"), &join_csv(self.bool_map.iter()))?;
        Ok(())
    }
}

fn join_csv<T: std::fmt::Display>(values: impl Iterator<Item = T>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::fs::write(tmp.path(), contents)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
