use crate::feature::FeatureGenerator;
use crate::forward_backward::ForwardBackward;
use crate::math;
use crate::span::SpanView;
use crate::trainer::Worker;

/// Soft log margin of one sequence: `log sum_y H(y) exp(w.F(y)) - w.F(y*)`
/// negated, where `H(y)` counts the gold spans `y` gets wrong.
///
/// With `N` gold spans and `C(y)` of them reproduced, the loss-weighted
/// partition function is `N Z - Z_C`, and `Z_C` comes from the
/// loss-tracking recursions.
pub(super) fn soft_log_margin<V, G>(
    fb: &ForwardBackward<'_, G>,
    view: &V,
    worker: &mut Worker,
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
    let Worker {
        scratch,
        exp,
        exp_loss,
    } = worker;
    exp.clear();
    exp_loss.clear();
    fb.backward(view, scratch, None, true);
    let log_z = fb.forward(view, scratch, None, true, &mut |span| {
        let gold = view.gold_state(span.start, span.end);
        for feature in span.features {
            if let Some(v) = span.expectation(feature) {
                exp.add(feature.index, v);
            }
            if let Some(v) = span.loss_expectation(feature, gold) {
                exp_loss.add(feature.index, v);
            }
        }
    });
    let last = view.len() - 1;
    let finals: Vec<f64> = scratch.alpha_loss[last]
        .iter()
        .zip(&scratch.betas[last])
        .map(|(a, b)| a + b)
        .collect();
    let log_z_correct = math::logsumexp_all(&finals);
    let n = path.len() as f64;
    let log_z_loss = match math::log_minus_exp(n.ln() + log_z, log_z_correct) {
        Some(v) if v.is_finite() => v,
        _ => {
            log::warn!(
                "loss-weighted partition function vanished (log Z = {log_z}, log Z_C = {log_z_correct}); sequence skipped"
            );
            return None;
        }
    };
    let w = view.weight();
    let score = fb.observed(view, grad, w)?;
    for &f in &exp.touched {
        grad[f] -= n * math::exp(exp.exp_f[f] - log_z_loss) * w;
    }
    for &f in &exp_loss.touched {
        grad[f] += math::exp(exp_loss.exp_f[f] - log_z_loss) * w;
    }
    Some((score - log_z_loss) * w)
}
