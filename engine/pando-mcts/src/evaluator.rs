//! Evaluator trait for batched position evaluation.
//!
//! The evaluator turns a batch of history windows into policy priors and
//! per-player value estimates. In a deployed searcher this wraps a neural
//! network; the searcher only depends on the blocking batch-forward call
//! below. For tests, `UniformEvaluator` returns flat priors and neutral
//! values.

use pando_core::HistoryEntry;
use thiserror::Error;

/// Errors that can occur during evaluation.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("Evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Model error: {0}")]
    ModelError(String),
}

/// Result of evaluating one history window.
#[derive(Debug, Clone, Default)]
pub struct EvalOutput {
    /// Policy over the flat action space. Values need not be normalised;
    /// the coordinator renormalises over the valid actions of the leaf.
    pub policy: Vec<f32>,

    /// Value estimate per player, indexed by player id.
    pub values: Vec<f32>,
}

/// Trait for batched position evaluators.
///
/// `S` is the engine's index-encoded state type. The call blocks until the
/// whole batch is evaluated; the coordinator guarantees exclusive access
/// for the duration of one call.
pub trait Evaluator<S>: Send + Sync {
    /// Evaluate a batch of history windows.
    ///
    /// `out` is cleared and filled with one `EvalOutput` per input window,
    /// in order. Implementations must not return fewer outputs than
    /// inputs; doing so is treated as an evaluator failure.
    fn forward_batch(
        &self,
        histories: &[Vec<HistoryEntry<S>>],
        out: &mut Vec<EvalOutput>,
    ) -> Result<(), EvaluatorError>;
}

/// Evaluator returning a flat policy and neutral values.
///
/// Useful for testing the search machinery without a model: priors end up
/// uniform over valid actions and all value signal comes from terminals.
#[derive(Debug, Clone)]
pub struct UniformEvaluator {
    action_space: usize,
    num_players: usize,
}

impl UniformEvaluator {
    pub fn new(action_space: usize, num_players: usize) -> Self {
        Self {
            action_space,
            num_players,
        }
    }
}

impl<S> Evaluator<S> for UniformEvaluator {
    fn forward_batch(
        &self,
        histories: &[Vec<HistoryEntry<S>>],
        out: &mut Vec<EvalOutput>,
    ) -> Result<(), EvaluatorError> {
        out.clear();
        let prior = 1.0 / self.action_space as f32;
        for _ in histories {
            out.push(EvalOutput {
                policy: vec![prior; self.action_space],
                values: vec![0.0; self.num_players],
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_evaluator_shapes() {
        let eval = UniformEvaluator::new(9, 2);
        let histories: Vec<Vec<HistoryEntry<u32>>> =
            vec![vec![HistoryEntry::pad(); 4], vec![HistoryEntry::pad(); 4]];
        let mut out = Vec::new();

        eval.forward_batch(&histories, &mut out).unwrap();

        assert_eq!(out.len(), 2);
        for result in &out {
            assert_eq!(result.policy.len(), 9);
            assert_eq!(result.values.len(), 2);
            let sum: f32 = result.policy.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(result.values.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_uniform_evaluator_empty_batch() {
        let eval = UniformEvaluator::new(4, 2);
        let histories: Vec<Vec<HistoryEntry<u32>>> = Vec::new();
        let mut out = vec![EvalOutput::default()];

        eval.forward_batch(&histories, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
