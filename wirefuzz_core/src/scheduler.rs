use crate::schema::Transition;
use rand::Rng;
use rand_core::RngCore;
use serde::Deserialize;
use std::collections::HashMap;

/// Transition selection policy named in configuration.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Round-robin over the outgoing transitions of each state.
    Exhaustive,
    /// Random choice proportional to each transition's `weight`.
    Weighted,
    /// Least-fired transition first, ties broken at random.
    #[default]
    Guided,
}

/// A `TransitionScheduler` picks which outgoing transition a session fires next.
///
/// Schedulers are owned by a single session, so they may keep per-session
/// bookkeeping without synchronization.
pub trait TransitionScheduler: Send {
    fn name(&self) -> &'static str;

    /// Returns an index into `candidates`, or `None` when nothing can fire.
    ///
    /// # Arguments
    /// * `state`: The session's current state.
    /// * `candidates`: Transitions whose `from` equals `state`, in declared order.
    /// * `rng`: Session-owned random number generator.
    fn select(
        &mut self,
        state: &str,
        candidates: &[&Transition],
        rng: &mut dyn RngCore,
    ) -> Option<usize>;

    /// Reports whether firing `transition` advanced the session to its `to` state.
    fn report_outcome(&mut self, _transition: &Transition, _advanced: bool) {}
}

pub fn scheduler_for(policy: SelectionPolicy) -> Box<dyn TransitionScheduler> {
    match policy {
        SelectionPolicy::Exhaustive => Box::new(ExhaustiveScheduler::new()),
        SelectionPolicy::Weighted => Box::new(WeightedScheduler::new()),
        SelectionPolicy::Guided => Box::new(GuidedScheduler::new()),
    }
}

#[derive(Debug, Default)]
pub struct ExhaustiveScheduler {
    cursors: HashMap<String, usize>,
}

impl ExhaustiveScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransitionScheduler for ExhaustiveScheduler {
    fn name(&self) -> &'static str {
        "exhaustive"
    }

    fn select(
        &mut self,
        state: &str,
        candidates: &[&Transition],
        _rng: &mut dyn RngCore,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let cursor = self.cursors.entry(state.to_string()).or_insert(0);
        let pick = *cursor % candidates.len();
        *cursor = cursor.wrapping_add(1);
        Some(pick)
    }
}

#[derive(Debug, Default)]
pub struct WeightedScheduler;

impl WeightedScheduler {
    pub fn new() -> Self {
        WeightedScheduler
    }
}

impl TransitionScheduler for WeightedScheduler {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(
        &mut self,
        _state: &str,
        candidates: &[&Transition],
        rng: &mut dyn RngCore,
    ) -> Option<usize> {
        let total: u64 = candidates.iter().map(|t| u64::from(t.weight.max(1))).sum();
        if total == 0 {
            return None;
        }
        let mut roll = rng.random_range(0..total);
        for (idx, transition) in candidates.iter().enumerate() {
            let weight = u64::from(transition.weight.max(1));
            if roll < weight {
                return Some(idx);
            }
            roll -= weight;
        }
        None
    }
}

/// Prefers transitions that have fired least often, so every branch of the
/// state graph gets exercised early.
#[derive(Debug, Default)]
pub struct GuidedScheduler {
    fired: HashMap<String, u64>,
}

impl GuidedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(transition: &Transition) -> String {
        format!("{}|{}|{}", transition.from, transition.to, transition.trigger)
    }
}

impl TransitionScheduler for GuidedScheduler {
    fn name(&self) -> &'static str {
        "guided"
    }

    fn select(
        &mut self,
        _state: &str,
        candidates: &[&Transition],
        rng: &mut dyn RngCore,
    ) -> Option<usize> {
        let counts: Vec<u64> = candidates
            .iter()
            .map(|t| self.fired.get(&Self::key(t)).copied().unwrap_or(0))
            .collect();
        let least = *counts.iter().min()?;
        let ties: Vec<usize> = counts
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == least)
            .map(|(idx, _)| idx)
            .collect();
        let pick = ties[rng.random_range(0..ties.len())];
        *self.fired.entry(Self::key(candidates[pick])).or_insert(0) += 1;
        Some(pick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;

    fn branching() -> Vec<Transition> {
        ["A", "B", "C"]
            .iter()
            .enumerate()
            .map(|(i, to)| Transition {
                from: "S".to_string(),
                to: to.to_string(),
                trigger: format!("go_{to}"),
                message_type: None,
                expected_response: None,
                weight: (i as u32) + 1,
            })
            .collect()
    }

    fn visited(scheduler: &mut dyn TransitionScheduler, iterations: usize) -> HashSet<String> {
        let transitions = branching();
        let candidates: Vec<&Transition> = transitions.iter().collect();
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let mut targets = HashSet::new();
        for _ in 0..iterations {
            let pick = scheduler
                .select("S", &candidates, &mut rng)
                .expect("a branching state always has a candidate");
            targets.insert(candidates[pick].to.clone());
        }
        targets
    }

    #[test]
    fn every_policy_reaches_all_branches() {
        for policy in [SelectionPolicy::Exhaustive, SelectionPolicy::Weighted, SelectionPolicy::Guided] {
            let mut scheduler = scheduler_for(policy);
            let targets = visited(scheduler.as_mut(), 60);
            assert_eq!(targets.len(), 3, "{policy:?} left branches unvisited: {targets:?}");
        }
    }

    #[test]
    fn exhaustive_cycles_in_declared_order() {
        let transitions = branching();
        let candidates: Vec<&Transition> = transitions.iter().collect();
        let mut scheduler = ExhaustiveScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        let picks: Vec<usize> = (0..6)
            .map(|_| scheduler.select("S", &candidates, &mut rng).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn guided_visits_each_branch_once_before_repeating() {
        let mut scheduler = GuidedScheduler::new();
        assert_eq!(visited(&mut scheduler, 3).len(), 3);
    }

    #[test]
    fn weighted_favours_heavier_transitions() {
        let transitions = branching();
        let candidates: Vec<&Transition> = transitions.iter().collect();
        let mut scheduler = WeightedScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        let mut counts = [0usize; 3];
        for _ in 0..3000 {
            counts[scheduler.select("S", &candidates, &mut rng).unwrap()] += 1;
        }
        assert!(
            counts[2] > counts[0],
            "weight 3 should fire more often than weight 1: {counts:?}"
        );
    }

    #[test]
    fn no_candidates_means_no_selection() {
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        for policy in [SelectionPolicy::Exhaustive, SelectionPolicy::Weighted, SelectionPolicy::Guided] {
            assert_eq!(scheduler_for(policy).select("S", &[], &mut rng), None);
        }
    }
}
