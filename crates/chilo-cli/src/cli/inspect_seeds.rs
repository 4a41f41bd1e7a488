use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;

/// Summarizes the on-disk artifacts the pipeline has produced so far: one
/// annotated-seed file per parsed seed and `{seed_id}_{mutator_id}` mutator
/// modules. The seed registry itself is in-memory only, so this
/// reconstructs a view of it from what the fixer and parser stages have
/// written to disk rather than reading live state.
#[derive(Debug, clap::Parser)]
pub struct InspectSeeds {
    /// Directory of annotated-seed text files, one per seed_id.
    #[clap(long)]
    annotated_seed_dir: PathBuf,

    /// Directory of published mutator modules, named `{seed_id}_{mutator_id}`.
    #[clap(long)]
    mutator_module_dir: PathBuf,
}

impl InspectSeeds {
    pub fn run(self) -> anyhow::Result<()> {
        let parsed_seed_ids = list_file_stems(&self.annotated_seed_dir)
            .context("reading annotated-seed directory")?;
        let mutator_counts = count_mutators_per_seed(&self.mutator_module_dir)
            .context("reading mutator-module directory")?;

        let mut seed_ids: Vec<u32> = parsed_seed_ids
            .iter()
            .copied()
            .chain(mutator_counts.keys().copied())
            .collect();
        seed_ids.sort_unstable();
        seed_ids.dedup();

        if seed_ids.is_empty() {
            println!("no seed artifacts found");
            return Ok(());
        }

        println!("{:>10}  {:>8}  {:>10}", "seed_id", "parsed", "mutators");
        for seed_id in seed_ids {
            let parsed = parsed_seed_ids.contains(&seed_id);
            let mutators = mutator_counts.get(&seed_id).copied().unwrap_or(0);
            println!("{seed_id:>10}  {:>8}  {mutators:>10}", parsed);
        }
        Ok(())
    }
}

fn list_file_stems(dir: &std::path::Path) -> std::io::Result<Vec<u32>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(id) = name.parse() {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

fn count_mutators_per_seed(dir: &std::path::Path) -> std::io::Result<BTreeMap<u32, u32>> {
    let mut counts = BTreeMap::new();
    if !dir.exists() {
        return Ok(counts);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Some((seed_id, _mutator_id)) = name.split_once('_') {
            if let Ok(seed_id) = seed_id.parse::<u32>() {
                *counts.entry(seed_id).or_insert(0) += 1;
            }
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_mutators_grouped_by_seed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0_0"), "{}").unwrap();
        std::fs::write(dir.path().join("0_1"), "{}").unwrap();
        std::fs::write(dir.path().join("1_0"), "{}").unwrap();

        let counts = count_mutators_per_seed(dir.path()).unwrap();
        assert_eq!(counts.get(&0), Some(&2));
        assert_eq!(counts.get(&1), Some(&1));
    }

    #[test]
    fn missing_directory_yields_empty_results() {
        let missing = std::path::Path::new("/nonexistent/chilo/seeds");
        assert!(list_file_stems(missing).unwrap().is_empty());
        assert!(count_mutators_per_seed(missing).unwrap().is_empty());
    }
}
