use crate::feature::{Feature, FeatureGenerator};
use crate::forward_backward::ForwardBackward;
use crate::math::{self, LOG0};
use crate::scratch::Scratch;
use crate::span::SpanView;
use crate::transition;

struct Piece {
    end: usize,
    scores: Vec<f64>,
    features: Vec<Feature>,
}

/// Piecewise likelihood of one sequence.
///
/// Each gold span is normalized locally: against every span starting at
/// the same position in every state, given the gold state before it.
/// `grad` is only touched if the whole sequence contributes.
pub(super) fn local_likelihood<V, G>(
    fb: &ForwardBackward<'_, G>,
    view: &V,
    scratch: &mut Scratch,
    grad: &mut [f64],
) -> Option<f64>
where
    V: SpanView,
    G: FeatureGenerator<V::Seq>,
{
    if view.len() == 0 {
        return Some(0.0);
    }
    let Some(path) = view.gold_path() else {
        log::warn!("gold segmentation not found among the candidate segments; sequence skipped");
        return None;
    };
    let n = fb.graph.num_states();
    scratch.prepare(view.len(), n);
    let ends = view.ends_by_start();
    let w = view.weight();

    let mut objective = 0.0;
    let mut updates: Vec<(usize, f64)> = vec![];
    let mut pieces: Vec<Piece> = vec![];
    let mut prev: Option<usize> = None;
    for &(start, end, gold) in &path {
        pieces.clear();
        for &e in &ends[start] {
            let mut features = vec![];
            transition::compute(
                fb.graph,
                fb.features,
                fb.weights,
                view,
                start,
                e,
                prev.map(|_| &mut scratch.m),
                &mut scratch.r,
                Some(&mut features),
            );
            let scores: Vec<f64> = (0..n)
                .map(|y| match prev {
                    Some(p) => scratch.m.get(p, y) + scratch.r[y],
                    None if fb.graph.is_start_state(y) => scratch.r[y],
                    None => LOG0,
                })
                .collect();
            pieces.push(Piece {
                end: e,
                scores,
                features,
            });
        }
        let local: Vec<f64> = pieces.iter().flat_map(|p| p.scores.iter().copied()).collect();
        let log_z = math::logsumexp_all(&local);
        let gold_score = pieces.iter().find(|p| p.end == end)?.scores[gold];
        if !log_z.is_finite() || !gold_score.is_finite() {
            log::warn!("local partition function at {start} is {log_z}; sequence skipped");
            return None;
        }
        for piece in &pieces {
            for f in &piece.features {
                if f.y_prev.is_some() && f.y_prev != prev {
                    continue;
                }
                let p = math::exp(piece.scores[f.y] - log_z);
                updates.push((f.index, -p * f.value));
                if piece.end == end && f.y == gold {
                    updates.push((f.index, f.value));
                }
            }
        }
        objective += gold_score - log_z;
        prev = Some(gold);
    }
    for (f, v) in updates {
        grad[f] += v * w;
    }
    Some(objective * w)
}
