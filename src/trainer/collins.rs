//! Collins' voted perceptron.

use argmin_math::ArgminAdd;

use crate::errors::Result;
use crate::feature::FeatureGenerator;
use crate::params::Params;
use crate::span::SpanView;
use crate::topology::Graph;
use crate::trainer::Evaluator;
use crate::transition::TransitionCache;
use crate::viterbi::{path_score, Path, Viterbi};

const DEFAULT_BEAM: usize = 3;
const DEFAULT_BETA: f64 = 0.05;

/// Adds `scale` times the features of span `(start, end, y)` following a
/// span in state `prev` to `grad`.
fn update<V, G>(features: &G, view: &V, span: (usize, usize, usize), prev: Option<usize>, scale: f64, grad: &mut [f64])
where
    V: SpanView,
    G: FeatureGenerator<V::Seq>,
{
    let (start, end, y) = span;
    view.scan(features, start, end, &mut |f| {
        if f.y == y && (f.y_prev.is_none() || f.y_prev == prev) {
            grad[f.index] += f.value * scale;
        }
    });
}

#[inline(always)]
fn state_before(path: &[(usize, usize, usize)], i: usize) -> Option<usize> {
    i.checked_sub(1).map(|p| path[p].2)
}

/// Perceptron updates for one sequence. Returns the number of points at
/// which the gold path and the competing paths diverge.
fn correct<V, G>(features: &G, view: &V, gold: &Path, wrong: &[Path], grad: &mut [f64]) -> usize
where
    V: SpanView,
    G: FeatureGenerator<V::Seq>,
{
    let share = -1.0 / wrong.len() as f64;
    // cursor into each competing path: number of its spans not yet passed
    let mut cursors: Vec<usize> = wrong.iter().map(Vec::len).collect();
    let mut errors = 0;
    for i in (0..gold.len()).rev() {
        let span = gold[i];
        let frontier = span.0;
        let differs = wrong
            .iter()
            .zip(&cursors)
            .any(|(path, &c)| c == 0 || path[c - 1] != span);
        if differs {
            errors += 1;
            update(features, view, span, state_before(gold, i), 1.0, grad);
            for (path, &c) in wrong.iter().zip(&cursors) {
                let mut k = c;
                while k > 0 && path[k - 1].1 >= frontier {
                    update(features, view, path[k - 1], state_before(path, k - 1), share, grad);
                    k -= 1;
                }
            }
        }
        for (path, c) in wrong.iter().zip(cursors.iter_mut()) {
            while *c > 0 && path[*c - 1].1 >= frontier {
                *c -= 1;
            }
        }
    }
    errors
}

/// Trains with the voted perceptron.
///
/// Each sequence is decoded with a beam; every top path that scores within
/// `beta` of the gold path but differs from it pulls the weights towards
/// the gold spans at each divergence. The running weights are summed after
/// every sequence. Stops early after an epoch without errors.
pub(super) fn train<V, G>(
    graph: &Graph,
    features: &G,
    views: &[V],
    params: &Params,
    mut evaluator: Option<&mut dyn Evaluator>,
) -> Result<Vec<f64>>
where
    V: SpanView,
    G: FeatureGenerator<V::Seq>,
{
    let beam = params.beam_size.unwrap_or(DEFAULT_BEAM);
    let beta: f64 = params.misc_or("beta", DEFAULT_BETA)?;
    let voted = params.misc_bool_or("voted", true)?;
    let use_updated = params.misc_bool_or("UpdatedViterbi", false)?;

    let num_features = features.num_features();
    let mut summed = vec![0.0; num_features];
    let mut current = vec![0.0; num_features];
    for t in 0..params.max_iters {
        let mut errors = 0;
        for view in views {
            if view.len() == 0 {
                continue;
            }
            let Some(gold) = view.gold_path() else {
                log::warn!("gold segmentation not found among the candidate segments; sequence skipped");
                continue;
            };
            let weights = if use_updated { &summed } else { &current };
            let cache = TransitionCache::build(graph, features, weights, view, params.reuse_m);
            let table = Viterbi::new(graph, &cache, beam).run(&[]);
            let gold_score = path_score(graph, &cache, &gold);
            let mut wrong = vec![];
            for k in 0..table.num_solutions() {
                let Some((score, path)) = table.path(k) else {
                    break;
                };
                if score < gold_score * (1.0 - beta) {
                    break;
                }
                if path != gold {
                    wrong.push(path);
                }
            }
            if !wrong.is_empty() {
                errors += correct(features, view, &gold, &wrong, &mut current);
            }
            if voted {
                summed = summed.add(&current);
            }
        }
        log::info!("iteration {t}: {errors} errors");
        let weights = if voted { &summed } else { &current };
        if let Some(evaluator) = evaluator.as_deref_mut() {
            if !evaluator.evaluate(t, weights) {
                break;
            }
        }
        if errors == 0 {
            break;
        }
    }
    Ok(if voted { summed } else { current })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sequence::LabelSequence;
    use crate::span::UnitSpans;
    use crate::test_utils::ToyFeatures;

    #[test]
    fn test_single_divergence() {
        let features = ToyFeatures::new(2, 2);
        let seq = LabelSequence::new(vec![0u8, 1], &[0, 1]);
        let view = UnitSpans::new(&seq);
        let gold = vec![(0, 0, 0), (1, 1, 1)];
        let wrong = vec![vec![(0, 0, 0), (1, 1, 0)]];
        let mut grad = vec![0.0; 8];
        assert_eq!(1, correct(&features, &view, &gold, &wrong, &mut grad));
        assert_eq!(1.0, grad[features.emission(1, 1)]);
        assert_eq!(-1.0, grad[features.emission(1, 0)]);
        assert_eq!(1.0, grad[features.transition(0, 1)]);
        assert_eq!(-1.0, grad[features.transition(0, 0)]);
        assert_eq!(0.0, grad[features.emission(0, 0)]);
    }

    #[test]
    fn test_learns_separable_data() {
        let graph = Graph::complete(2);
        let features = ToyFeatures::new(2, 2);
        let seqs = vec![
            LabelSequence::new(vec![0u8, 1, 1, 0], &[0, 1, 1, 0]),
            LabelSequence::new(vec![1u8, 0, 0], &[1, 0, 0]),
        ];
        let views: Vec<_> = seqs.iter().map(UnitSpans::new).collect();
        let params = Params::parse("trainer collins maxIters 20").unwrap();
        let weights = train(&graph, &features, &views, &params, None).unwrap();
        for view in &views {
            let cache = TransitionCache::build(&graph, &features, &weights, view, false);
            let (_, path) = Viterbi::new(&graph, &cache, 1).best().unwrap();
            assert_eq!(view.gold_path().unwrap(), path);
        }
    }
}
