//! Exponentiated gradient training for large-margin structured
//! classification.

use argmin_math::{ArgminAdd, ArgminDot, ArgminMul};

use crate::errors::Result;
use crate::feature::FeatureGenerator;
use crate::params::Params;
use crate::span::SpanView;
use crate::topology::Graph;
use crate::trainer::{hamming, Evaluator, Objective, Strategy};
use crate::transition::TransitionCache;
use crate::viterbi::{path_score, Viterbi};

const DEFAULT_C: f64 = 1000.0;

/// Fit of `weights` on the training views.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Margins {
    /// Summed score of the best loss-augmented path over the gold path,
    /// where the former is higher.
    slack: f64,

    /// Positions mislabeled by the best unaugmented path.
    errors: usize,
}

fn margins<V, G>(graph: &Graph, features: &G, views: &[V], weights: &[f64], reuse_m: bool) -> Margins
where
    V: SpanView,
    G: FeatureGenerator<V::Seq>,
{
    let mut margins = Margins::default();
    for view in views {
        if view.len() == 0 {
            continue;
        }
        let Some(gold) = view.gold_path() else {
            continue;
        };
        let mut cache = TransitionCache::build(graph, features, weights, view, reuse_m);
        if let Some((_, path)) = Viterbi::new(graph, &cache, 1).best() {
            margins.errors += path
                .iter()
                .map(|&(start, end, y)| hamming(view, start, end, y) as usize)
                .sum::<usize>();
        }
        cache.add_loss(&|start, end, y| hamming(view, start, end, y));
        let gold_score = path_score(graph, &cache, &gold);
        if let Some((best, _)) = Viterbi::new(graph, &cache, 1).best() {
            if gold_score < best {
                margins.slack += best - gold_score;
            }
        }
    }
    margins
}

/// Runs `maxIters + 1` exponentiated gradient steps.
///
/// The dual variables `z` accumulate the scaled likelihood gradients; the
/// gradient at step `t` is taken with emission scores raised by `t` times
/// the Hamming loss. The primal weights of the steps oscillate, so the step
/// with the fewest training errors is kept, ties going to the lower primal
/// objective.
pub(super) fn train<V, G>(
    objective: Objective<'_, V, G>,
    graph: &Graph,
    features: &G,
    views: &[V],
    params: &Params,
    mut evaluator: Option<&mut dyn Evaluator>,
) -> Result<Vec<f64>>
where
    V: SpanView + Sync,
    G: FeatureGenerator<V::Seq> + Sync,
{
    let c: f64 = params.misc_or("C", DEFAULT_C)?;
    let mut objective = objective;
    let mut z = vec![params.init_value; features.num_features()];
    let mut best: Option<(usize, f64, u64, Vec<f64>)> = None;
    for t in 0..=params.max_iters {
        objective = objective.with_strategy(Strategy::LossAugmented(t as f64));
        let (_, grad) = objective.accumulate(&z)?;
        let weights = grad.mul(&c);
        z = z.add(&weights);

        let norm_sq: f64 = weights.dot(&weights);
        let fit = margins(graph, features, views, &weights, params.reuse_m);
        let xi = c * fit.slack;
        let primal = 0.5 * norm_sq + xi;
        log::info!(
            "iteration {t}: primal objective {primal} norm^2 {norm_sq} slack {xi} errors {}",
            fit.errors
        );
        let improved = best
            .as_ref()
            .map_or(true, |&(errors, p, _, _)| (fit.errors, primal) < (errors, p));
        let stop = evaluator
            .as_deref_mut()
            .is_some_and(|evaluator| !evaluator.evaluate(t, &weights));
        if improved {
            best = Some((fit.errors, primal, t, weights));
        }
        if stop {
            break;
        }
    }
    let (errors, primal, t, weights) = best.unwrap_or_else(|| (0, 0.0, 0, z));
    log::info!("keeping iteration {t}: {errors} training errors, primal objective {primal}");
    Ok(weights)
}
