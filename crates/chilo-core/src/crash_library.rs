//! Dynamic and static crash-inspiration examples for the structural
//! mutator; default CVE cases supplemented from `crash_library.py`.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;

const DEFAULT_CVE_CASES: &[&str] = &[
    "SELECT * FROM t WHERE id = 2147483648;",
    "SELECT * FROM t WHERE id = -2147483649;",
    "SELECT repeat('A', 100000);",
    "SELECT * FROM t LIMIT -1;",
    "SELECT 1/0;",
    "SELECT CAST('9223372036854775808' AS BIGINT);",
    "INSERT INTO t VALUES (NULL, NULL, NULL);",
    "SELECT * FROM t WHERE name LIKE '%' || char(0) || '%';",
    "SELECT * FROM t ORDER BY 999999999;",
    "WITH RECURSIVE r(n) AS (SELECT 1 UNION ALL SELECT n+1 FROM r) SELECT * FROM r;",
    "SELECT * FROM t WHERE col = 0.1 + 0.2;",
    "DROP TABLE IF EXISTS t; CREATE TABLE t (a INT);",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSource {
    Dynamic,
    Static,
}

pub struct CrashLibrary {
    afl_crashes_dir: PathBuf,
    cve_cases_dir: PathBuf,
}

impl CrashLibrary {
    pub fn new(afl_crashes_dir: PathBuf, cve_cases_dir: PathBuf) -> std::io::Result<Self> {
        let library = Self {
            afl_crashes_dir,
            cve_cases_dir,
        };
        library.ensure_cve_dir()?;
        Ok(library)
    }

    fn ensure_cve_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.cve_cases_dir)?;
        let is_empty = std::fs::read_dir(&self.cve_cases_dir)?.next().is_none();
        if is_empty {
            self.create_default_cve_cases()?;
        }
        Ok(())
    }

    fn create_default_cve_cases(&self) -> std::io::Result<()> {
        for (i, case) in DEFAULT_CVE_CASES.iter().enumerate() {
            let path = self.cve_cases_dir.join(format!("default_{i:02}.sql"));
            std::fs::write(path, case)?;
        }
        Ok(())
    }

    fn get_afl_crashes(&self) -> Vec<String> {
        read_text_files(&self.afl_crashes_dir)
    }

    fn get_cve_cases(&self) -> Vec<String> {
        read_text_files(&self.cve_cases_dir)
    }

    pub fn get_all_cases(&self) -> Vec<(String, CaseSource)> {
        let mut all: Vec<(String, CaseSource)> = self
            .get_afl_crashes()
            .into_iter()
            .map(|c| (c, CaseSource::Dynamic))
            .collect();
        all.extend(
            self.get_cve_cases()
                .into_iter()
                .map(|c| (c, CaseSource::Static)),
        );
        all
    }

    /// `random_examples(n)`: biased to half-from-dynamic, rest from static,
    /// backfilling from whichever source has more when one is short.
    pub fn get_random_cases(&self, n: usize, rng: &mut impl Rng) -> Vec<(String, CaseSource)> {
        let mut dynamic = self.get_afl_crashes();
        let mut statics = self.get_cve_cases();
        dynamic.shuffle(rng);
        statics.shuffle(rng);

        let want_dynamic = n / 2;
        let mut taken_dynamic = dynamic.len().min(want_dynamic);
        let mut taken_static = statics.len().min(n - taken_dynamic);

        let shortfall = n.saturating_sub(taken_dynamic + taken_static);
        if shortfall > 0 {
            let extra_dynamic = (dynamic.len() - taken_dynamic).min(shortfall);
            taken_dynamic += extra_dynamic;
            let remaining = shortfall - extra_dynamic;
            taken_static += statics.len().saturating_sub(taken_static).min(remaining);
        }

        let mut out: Vec<(String, CaseSource)> = dynamic
            .into_iter()
            .take(taken_dynamic)
            .map(|c| (c, CaseSource::Dynamic))
            .collect();
        out.extend(
            statics
                .into_iter()
                .take(taken_static)
                .map(|c| (c, CaseSource::Static)),
        );
        out
    }

    pub fn format_cases_for_prompt(cases: &[(String, CaseSource)]) -> String {
        cases
            .iter()
            .enumerate()
            .map(|(i, (text, source))| {
                let label = match source {
                    CaseSource::Dynamic => "observed-crash",
                    CaseSource::Static => "known-pattern",
                };
                format!("-- example {i} ({label})\n{text}")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn case_count(&self) -> (usize, usize) {
        (self.get_afl_crashes().len(), self.get_cve_cases().len())
    }
}

fn read_text_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| std::fs::read_to_string(entry.path()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn creates_default_cases_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let cve_dir = dir.path().join("cve");
        let crashes_dir = dir.path().join("crashes");
        let library = CrashLibrary::new(crashes_dir, cve_dir.clone()).unwrap();
        let (_, static_count) = library.case_count();
        assert_eq!(static_count, DEFAULT_CVE_CASES.len());
    }

    #[test]
    fn does_not_recreate_cases_when_dir_already_populated() {
        let dir = tempfile::tempdir().unwrap();
        let cve_dir = dir.path().join("cve");
        std::fs::create_dir_all(&cve_dir).unwrap();
        std::fs::write(cve_dir.join("custom.sql"), "SELECT 1;").unwrap();
        let library = CrashLibrary::new(dir.path().join("crashes"), cve_dir).unwrap();
        let (_, static_count) = library.case_count();
        assert_eq!(static_count, 1);
    }

    #[test]
    fn random_cases_backfill_when_dynamic_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let library =
            CrashLibrary::new(dir.path().join("crashes"), dir.path().join("cve")).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let cases = library.get_random_cases(5, &mut rng);
        assert_eq!(cases.len(), 5);
        assert!(cases.iter().all(|(_, s)| *s == CaseSource::Static));
    }

    #[test]
    fn rescans_directories_each_call() {
        let dir = tempfile::tempdir().unwrap();
        let crashes_dir = dir.path().join("crashes");
        let library =
            CrashLibrary::new(crashes_dir.clone(), dir.path().join("cve")).unwrap();
        assert_eq!(library.get_afl_crashes().len(), 0);
        std::fs::create_dir_all(&crashes_dir).unwrap();
        std::fs::write(crashes_dir.join("crash1.sql"), "SELECT crash();").unwrap();
        assert_eq!(library.get_afl_crashes().len(), 1);
    }
}
