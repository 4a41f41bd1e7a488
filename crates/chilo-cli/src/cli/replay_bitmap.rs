use std::path::PathBuf;

use anyhow::Context;
use chilo_core::coverage::PersistedBitmap;

/// Loads a bitmap snapshot persisted by `post_execute` and reports its hit
/// count and whether it satisfies `sum[i] >= cumulative[i] >= bool[i] ∈
/// {0,1}` for every slot.
#[derive(Debug, clap::Parser)]
pub struct ReplayBitmap {
    /// Directory containing `sum.txt`, `cumulative.txt`, and `bool.txt`.
    bitmap_dir: PathBuf,
}

impl ReplayBitmap {
    pub fn run(self) -> anyhow::Result<()> {
        let bitmap = PersistedBitmap::load(&self.bitmap_dir)
            .with_context(|| format!("reading bitmap files from {}", self.bitmap_dir.display()))?;

        println!("map_size: {}", bitmap.sum.len());
        println!("hit_count: {}", bitmap.hit_count());

        match bitmap.check_invariants() {
            Ok(()) => println!("invariants: ok"),
            Err(index) => {
                println!(
                    "invariants: VIOLATED at slot {index} (sum={}, cumulative={}, bool={})",
                    bitmap.sum[index], bitmap.cumulative[index], bitmap.bool_map[index]
                );
            }
        }
        Ok(())
    }
}
