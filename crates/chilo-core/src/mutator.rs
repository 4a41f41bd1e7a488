//! Mutators, the mutator pool, Thompson-sampling selection, and the
//! `MutationPlan` expression tree, replacing the original's dynamically
//! loaded generator module.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

/// One per-mask candidate set plus a perturbation strategy, the data
/// analogue of the original's LLM-generated closure over mask candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationSlot {
    pub mask_token: String,
    pub candidates: Vec<String>,
    #[serde(default)]
    pub strategy: PerturbationStrategy,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PerturbationStrategy {
    #[default]
    UniformPick,
    BoundaryBias,
}

/// A parsed-and-validated mutation plan: the body text with mask tokens,
/// plus the slots describing how each mask is filled in at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationPlan {
    pub template: String,
    pub slots: Vec<MutationSlot>,
}

impl MutationPlan {
    pub fn from_json(text: &str) -> Result<Self, crate::error::RepairError> {
        serde_json::from_str(text)
            .map_err(|e| crate::error::RepairError::MalformedPlan(e.to_string()))
    }

    /// Evaluate the plan with a fresh random draw. Pure and side-effect-free:
    /// no temp files, no dynamic loading, no subprocess.
    pub fn evaluate(&self, rng: &mut impl Rng) -> String {
        let mut out = self.template.clone();
        for slot in &self.slots {
            if slot.candidates.is_empty() {
                continue;
            }
            let pick = match slot.strategy {
                PerturbationStrategy::UniformPick => {
                    &slot.candidates[rng.gen_range(0..slot.candidates.len())]
                }
                PerturbationStrategy::BoundaryBias => {
                    // Boundary values (first/last in the candidate list) get
                    // double weight relative to the interior.
                    let n = slot.candidates.len();
                    let weighted_len = n + 2;
                    let idx = rng.gen_range(0..weighted_len);
                    if idx == 0 {
                        &slot.candidates[0]
                    } else if idx == weighted_len - 1 {
                        &slot.candidates[n - 1]
                    } else {
                        &slot.candidates[idx - 1]
                    }
                }
            };
            out = out.replacen(&slot.mask_token, pick, 1);
        }
        out
    }

    /// Slot count must match the seed's `mask_count`; mismatch is a syntax
    /// failure fed back to the LLM fix-syntax prompt.
    pub fn matches_mask_count(&self, mask_count: u32) -> bool {
        self.slots.len() as u32 == mask_count
    }

    fn mask_tokens(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.mask_token.as_str())
    }

    /// True if `sample` still contains an un-substituted mask token, a
    /// semantic-phase failure.
    pub fn sample_contains_mask(&self, sample: &str) -> bool {
        self.mask_tokens().any(|tok| sample.contains(tok))
    }
}

#[derive(Debug, Default)]
pub struct BanditState {
    pub alpha: f64,
    pub beta: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_new_edges: u64,
}

impl BanditState {
    fn new() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            success_count: 0,
            failure_count: 0,
            total_new_edges: 0,
        }
    }

    /// `α + β = success_count + failure_count + 2`.
    pub fn apply_feedback(&mut self, new_edges: u64) {
        if new_edges > 0 {
            self.success_count += 1;
            self.alpha += 1.0;
        } else {
            self.failure_count += 1;
            self.beta += 1.0;
        }
        self.total_new_edges += new_edges;
    }
}

#[derive(Debug)]
pub struct Mutator {
    pub seed_id: u32,
    pub mutator_id: u32,
    pub mutator_index: u32,
    pub artifact_path: PathBuf,
    pub mask_count: u32,
    pub similarity: f64,
    pub plan: MutationPlan,
    pub is_error: AtomicBool,
    pub bandit: Mutex<BanditState>,
}

impl Mutator {
    pub fn new(
        seed_id: u32,
        mutator_id: u32,
        mutator_index: u32,
        artifact_path: PathBuf,
        mask_count: u32,
        similarity: f64,
        plan: MutationPlan,
    ) -> Self {
        Self {
            seed_id,
            mutator_id,
            mutator_index,
            artifact_path,
            mask_count,
            similarity,
            plan,
            is_error: AtomicBool::new(false),
            bandit: Mutex::new(BanditState::new()),
        }
    }

    /// Produce one payload: pure evaluation of the published plan. A plan
    /// that was accepted with semantic checks still failing (repair-cap
    /// exhaustion) can still draw a sample with an unresolved mask token;
    /// that is this mutator's invocation-time failure mode, distinct from a
    /// malformed plan, which is rejected before publication and can never
    /// reach `generate`.
    pub fn generate(&self, rng: &mut impl Rng) -> Result<String, crate::error::GenerateError> {
        let sample = self.plan.evaluate(rng);
        if self.plan.sample_contains_mask(&sample) {
            return Err(crate::error::GenerateError::UnresolvedMask);
        }
        Ok(sample)
    }

    pub fn mark_error(&self) {
        self.is_error.store(true, Ordering::SeqCst);
    }

    pub fn is_error(&self) -> bool {
        self.is_error.load(Ordering::SeqCst)
    }
}

pub struct SelectionResult {
    pub mutator_index: usize,
    pub score: f64,
    pub a_i: f64,
    pub b_i: f64,
    pub c_i: f64,
}

/// Append-only ordered collection of Mutators.
#[derive(Default)]
pub struct MutatorPool {
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    mutators: Vec<std::sync::Arc<Mutator>>,
    next_mutator_index: u32,
    total_select_count: u64,
}

impl MutatorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append under the pool lock, assigning the next dense `mutator_index`.
    /// `mutator_index` in the returned Mutator overrides whatever caller
    /// passed in; the index assignment is a critical section.
    pub fn publish(&self, mut mutator: Mutator) -> std::sync::Arc<Mutator> {
        let mut inner = self.inner.lock();
        mutator.mutator_index = inner.next_mutator_index;
        inner.next_mutator_index += 1;
        let mutator = std::sync::Arc::new(mutator);
        inner.mutators.push(std::sync::Arc::clone(&mutator));
        mutator
    }

    pub fn len(&self) -> usize {
        self.inner.lock().mutators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<std::sync::Arc<Mutator>> {
        self.inner.lock().mutators.get(index).cloned()
    }

    pub fn random_pick(&self, rng: &mut impl Rng) -> Option<std::sync::Arc<Mutator>> {
        let inner = self.inner.lock();
        if inner.mutators.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..inner.mutators.len());
        Some(std::sync::Arc::clone(&inner.mutators[idx]))
    }

    /// Thompson-sampling selection over the pool.
    pub fn thompson_select(&self, rng: &mut impl Rng) -> Option<(std::sync::Arc<Mutator>, SelectionResult)> {
        let mut inner = self.inner.lock();
        if inner.mutators.is_empty() {
            return None;
        }
        let t = inner.total_select_count as f64;
        inner.total_select_count += 1;
        let n = inner.mutators.len() as f64;
        let mask_avg: f64 =
            inner.mutators.iter().map(|m| m.mask_count as f64).sum::<f64>() / n;

        let mut best: Option<(usize, SelectionResult)> = None;
        for (idx, mutator) in inner.mutators.iter().enumerate() {
            let bandit = mutator.bandit.lock();
            let beta_dist = Beta::new(bandit.alpha, bandit.beta)
                .expect("alpha and beta are always >= 1.0");
            let a_i = beta_dist.sample(rng);
            let su = bandit.success_count as f64;
            let fa = bandit.failure_count as f64;
            let ne = bandit.total_new_edges as f64;
            drop(bandit);

            let b_i = (t / n + 1.0).ln() * ((ne + 1.0) / (su + fa + 1.0) + 1.0).ln();
            let c_i = {
                let eps = f64::EPSILON;
                let denom = mask_avg.max(eps);
                ((mutator.mask_count as f64 * (1.0 - mutator.similarity)) / denom + 1.0).ln()
            };
            let s_i = a_i * (1.0 + b_i) * (1.0 + c_i);

            let better = match &best {
                None => true,
                Some((_, cur)) => s_i > cur.score,
            };
            if better {
                best = Some((
                    idx,
                    SelectionResult {
                        mutator_index: idx,
                        score: s_i,
                        a_i,
                        b_i,
                        c_i,
                    },
                ));
            }
        }
        let (idx, result) = best.expect("non-empty pool checked above");
        Some((std::sync::Arc::clone(&inner.mutators[idx]), result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn plan(slots: usize) -> MutationPlan {
        MutationPlan {
            template: (0..slots)
                .map(|i| format!("[M{i}]"))
                .collect::<Vec<_>>()
                .join(" "),
            slots: (0..slots)
                .map(|i| MutationSlot {
                    mask_token: format!("[M{i}]"),
                    candidates: vec!["1".to_string(), "2".to_string()],
                    strategy: PerturbationStrategy::UniformPick,
                })
                .collect(),
        }
    }

    #[test]
    fn alpha_plus_beta_invariant_holds_after_feedback() {
        let mut bandit = BanditState::new();
        assert_eq!(bandit.alpha + bandit.beta, (bandit.success_count + bandit.failure_count + 2) as f64);
        bandit.apply_feedback(3);
        assert_eq!(bandit.alpha + bandit.beta, (bandit.success_count + bandit.failure_count + 2) as f64);
        bandit.apply_feedback(0);
        assert_eq!(bandit.alpha + bandit.beta, (bandit.success_count + bandit.failure_count + 2) as f64);
    }

    #[test]
    fn evaluate_substitutes_every_slot() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let p = plan(2);
        let out = p.evaluate(&mut rng);
        assert!(!p.sample_contains_mask(&out));
    }

    #[test]
    fn pool_append_assigns_contiguous_indices() {
        let pool = MutatorPool::new();
        for i in 0..3u32 {
            let m = Mutator::new(0, i, 999, PathBuf::from("x"), 1, 0.0, plan(1));
            let published = pool.publish(m);
            assert_eq!(published.mutator_index, i);
        }
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn thompson_select_picks_from_pool_and_is_deterministic_with_seed() {
        let pool = MutatorPool::new();
        pool.publish(Mutator::new(0, 0, 0, PathBuf::from("a"), 2, 0.1, plan(2)));
        pool.publish(Mutator::new(0, 1, 1, PathBuf::from("b"), 4, 0.5, plan(4)));
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let (mutator, result) = pool.thompson_select(&mut rng).unwrap();
        assert!(mutator.mutator_index == 0 || mutator.mutator_index == 1);
        assert!(result.score.is_finite());
    }

    #[test]
    fn generate_fails_when_a_slot_has_no_candidates() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let broken_plan = MutationPlan {
            template: "[M0]".to_string(),
            slots: vec![MutationSlot {
                mask_token: "[M0]".to_string(),
                candidates: vec![],
                strategy: PerturbationStrategy::UniformPick,
            }],
        };
        let mutator = Mutator::new(0, 0, 0, PathBuf::from("x"), 1, 0.0, broken_plan);
        assert!(mutator.generate(&mut rng).is_err());
    }

    #[test]
    fn empty_pool_returns_none() {
        let pool = MutatorPool::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(pool.thompson_select(&mut rng).is_none());
        assert!(pool.random_pick(&mut rng).is_none());
    }
}
