//! Parameter estimation.
//!
//! Every gradient-based strategy shares one outer loop: an L-BFGS minimizer
//! over the negated objective, fed by worker threads that each take whole
//! sequences from a queue. Strategies only differ in what they compute for
//! a single sequence.

mod collins;
mod eg;
mod margin;
mod piecewise;

use std::borrow::Cow;
use std::sync::{Mutex, PoisonError};
use std::thread;

use argmin::core::observers::ObserverMode;
use argmin::core::{
    CostFunction, Error, Executor, Gradient, Problem, Solver, State, TerminationReason,
    TerminationStatus, KV,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use argmin_observer_slog::SlogLogger;

use crate::errors::{CrfError, Result};
use crate::feature::FeatureGenerator;
use crate::forward_backward::ForwardBackward;
use crate::math;
use crate::params::{Params, Prior, TrainerKind};
use crate::scratch::{Expectations, Scratch};
use crate::span::SpanView;
use crate::topology::Graph;

const LAPLACE_EPS: f64 = 1e-3;

/// Callback invoked once per training iteration.
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub trait Evaluator {
    /// Receives the iteration number and the current weights. Returning
    /// `false` stops training; the weights seen so far are kept.
    fn evaluate(&mut self, iteration: u64, weights: &[f64]) -> bool;
}

impl<F> Evaluator for F
where
    F: FnMut(u64, &[f64]) -> bool,
{
    fn evaluate(&mut self, iteration: u64, weights: &[f64]) -> bool {
        self(iteration, weights)
    }
}

/// Number of positions of `start..=end` whose gold state is not `y`.
#[inline(always)]
pub(crate) fn hamming<V: SpanView>(view: &V, start: usize, end: usize, y: usize) -> f64 {
    (start..=end).filter(|&pos| view.state_at(pos) != Some(y)).count() as f64
}

/// Buffers owned by one worker thread.
pub(crate) struct Worker {
    scratch: Scratch,
    exp: Expectations,
    exp_loss: Expectations,
}

impl Worker {
    fn new(num_features: usize) -> Self {
        Self {
            scratch: Scratch::new(),
            exp: Expectations::new(num_features),
            exp_loss: Expectations::new(num_features),
        }
    }
}

/// Per-sequence computation of a gradient-based trainer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Strategy {
    LogLikelihood,

    /// Likelihood with `scale` times the Hamming loss added to every
    /// emission score.
    LossAugmented(f64),

    SoftLogMargin,

    Piecewise,

    /// Likelihood of the known labels, marginalizing the unknown ones.
    Partial,
}

impl Strategy {
    /// Adds the gradient of one sequence's objective into `grad` and
    /// returns the objective, or `None` if the sequence was skipped.
    fn pass<V, G>(
        self,
        fb: &ForwardBackward<'_, G>,
        view: &V,
        worker: &mut Worker,
        grad: &mut [f64],
    ) -> Option<f64>
    where
        V: SpanView + Sync,
        G: FeatureGenerator<V::Seq>,
    {
        match self {
            Self::LogLikelihood => {
                fb.log_likelihood(view, &mut worker.scratch, &mut worker.exp, grad, None)
            }
            Self::LossAugmented(scale) => {
                let loss = |start: usize, end: usize, y: usize| scale * hamming(view, start, end, y);
                fb.log_likelihood(view, &mut worker.scratch, &mut worker.exp, grad, Some(&loss))
            }
            Self::SoftLogMargin => margin::soft_log_margin(fb, view, worker, grad),
            Self::Piecewise => piecewise::local_likelihood(fb, view, &mut worker.scratch, grad),
            Self::Partial => fb.partial_log_likelihood(
                view,
                &mut worker.scratch,
                &mut worker.exp,
                &mut worker.exp_loss,
                grad,
            ),
        }
    }
}

#[inline(always)]
fn to_weights(param: &[f64], log_weights: bool) -> Cow<'_, [f64]> {
    if log_weights {
        Cow::Owned(param.iter().map(|&p| math::exp(p)).collect())
    } else {
        Cow::Borrowed(param)
    }
}

fn to_param(weights: Vec<f64>, log_weights: bool) -> Vec<f64> {
    if log_weights {
        weights.into_iter().map(math::log).collect()
    } else {
        weights
    }
}

/// Adds the prior's gradient into `grad` and returns its (non-positive)
/// contribution to the objective.
fn apply_prior(prior: Prior, s: f64, weights: &[f64], grad: &mut [f64]) -> f64 {
    let mut penalty = 0.0;
    for (g, &w) in grad.iter_mut().zip(weights) {
        match prior {
            Prior::Gaussian => {
                penalty += w * w * s * 0.5;
                *g -= w * s;
            }
            Prior::Exp => {
                penalty += w * s;
                *g -= s;
            }
            Prior::LaplaceApprox => {
                let a = (w * w + LAPLACE_EPS).sqrt();
                penalty += a * s;
                *g -= w * s / a;
            }
        }
    }
    -penalty
}

/// Penalized objective summed over a training set.
pub(crate) struct Objective<'a, V, G> {
    graph: &'a Graph,
    features: &'a G,
    views: &'a [V],
    strategy: Strategy,
    prior: Option<(Prior, f64)>,
    reuse_m: bool,
    n_threads: usize,
}

impl<'a, V, G> Objective<'a, V, G>
where
    V: SpanView + Sync,
    G: FeatureGenerator<V::Seq> + Sync,
{
    pub fn new(graph: &'a Graph, features: &'a G, views: &'a [V], strategy: Strategy, params: &Params) -> Self {
        Self {
            graph,
            features,
            views,
            strategy,
            prior: Some((params.prior, params.inv_sigma_square)),
            reuse_m: params.reuse_m,
            n_threads: params.n_threads,
        }
    }

    pub fn without_prior(mut self) -> Self {
        self.prior = None;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Optimizes log-weights when the prior requires positive weights.
    fn log_weights(&self) -> bool {
        matches!(self.prior, Some((Prior::Exp, _)))
    }

    /// Unpenalized objective and its gradient with respect to the weights.
    pub fn accumulate(&self, weights: &[f64]) -> Result<(f64, Vec<f64>)> {
        let (s, r) = crossbeam_channel::unbounded();
        for view in self.views {
            s.send(view)
                .map_err(|_| CrfError::Optimizer("work queue closed".to_string()))?;
        }
        let fb = ForwardBackward::new(self.graph, self.features, weights, self.reuse_m);
        let total = Mutex::new((0.0, vec![0.0; weights.len()]));
        thread::scope(|scope| {
            for _ in 0..self.n_threads {
                scope.spawn(|| {
                    let mut worker = Worker::new(weights.len());
                    let mut local_grad = vec![0.0; weights.len()];
                    let mut local_objective = 0.0;
                    let mut skipped = 0;
                    while let Ok(view) = r.try_recv() {
                        match self.strategy.pass(&fb, view, &mut worker, &mut local_grad) {
                            Some(v) => local_objective += v,
                            None => skipped += 1,
                        }
                    }
                    if skipped > 0 {
                        log::debug!("{skipped} sequences skipped by this worker");
                    }
                    let mut total = total.lock().unwrap_or_else(PoisonError::into_inner);
                    total.0 += local_objective;
                    for (y, x) in total.1.iter_mut().zip(local_grad) {
                        *y += x;
                    }
                });
            }
        });
        Ok(total.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    /// Penalized objective and gradient with respect to `param`.
    fn evaluate(&self, param: &[f64]) -> Result<Evaluation> {
        let log_weights = self.log_weights();
        let weights = to_weights(param, log_weights);
        let (mut objective, mut grad) = self.accumulate(&weights)?;
        if let Some((prior, s)) = self.prior {
            objective += apply_prior(prior, s, &weights, &mut grad);
        }
        if log_weights {
            for (g, w) in grad.iter_mut().zip(weights.iter()) {
                *g *= w;
            }
        }
        let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        log::info!("objective = {objective}, |grad| = {norm}");
        Ok(Evaluation {
            param: param.to_vec(),
            objective,
            grad,
        })
    }

    /// Maximizes the objective starting from `weights`. Returns the best
    /// weights seen, also when the optimizer stops on an error.
    pub fn optimize(
        &self,
        weights: Vec<f64>,
        params: &Params,
        evaluator: Option<&mut dyn Evaluator>,
    ) -> Result<Vec<f64>> {
        let log_weights = self.log_weights();
        let best = Mutex::new(None);
        let loss = SequencesLoss {
            objective: self,
            last: Mutex::new(None),
            best: &best,
        };
        let linesearch = MoreThuenteLineSearch::new()
            .with_c(1e-4, 0.9)
            .map_err(|e| CrfError::Optimizer(e.to_string()))?;
        let solver = EvaluatorStop {
            inner: LBFGS::new(linesearch, params.m_for_hessian),
            eps: params.eps_for_convergence,
            log_weights,
            last_cost: None,
            evaluator,
        };
        let mut executor = Executor::new(loss, solver).configure(|state| {
            state
                .param(to_param(weights, log_weights))
                .max_iters(params.max_iters)
        });
        if params.debug_lvl > 0 {
            executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
        }
        match executor.run() {
            Ok(res) => log::info!(
                "optimizer stopped after {} iterations: {:?}",
                res.state.get_iter(),
                res.state.get_termination_reason()
            ),
            Err(e) => log::warn!("optimizer failed: {e}; keeping the best weights seen"),
        }
        let best: Option<Evaluation> = best.into_inner().unwrap_or_else(PoisonError::into_inner);
        best.map(|b| to_weights(&b.param, log_weights).into_owned())
            .ok_or_else(|| CrfError::Optimizer("objective was never evaluated".to_string()))
    }
}

struct Evaluation {
    param: Vec<f64>,
    objective: f64,
    grad: Vec<f64>,
}

/// Negated objective as seen by the minimizer. The last evaluation is
/// memoized since cost and gradient are requested at the same point.
struct SequencesLoss<'o, 'a, V, G> {
    objective: &'o Objective<'a, V, G>,
    last: Mutex<Option<(Vec<f64>, f64, Vec<f64>)>>,
    best: &'o Mutex<Option<Evaluation>>,
}

impl<V, G> SequencesLoss<'_, '_, V, G>
where
    V: SpanView + Sync,
    G: FeatureGenerator<V::Seq> + Sync,
{
    fn evaluate(&self, param: &[f64]) -> Result<(f64, Vec<f64>)> {
        {
            let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((p, objective, grad)) = last.as_ref() {
                if p.as_slice() == param {
                    return Ok((*objective, grad.clone()));
                }
            }
        }
        let evaluation = self.objective.evaluate(param)?;
        let result = (evaluation.objective, evaluation.grad.clone());
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((param.to_vec(), result.0, result.1.clone()));
        let mut best = self.best.lock().unwrap_or_else(PoisonError::into_inner);
        let improved = best
            .as_ref()
            .map_or(true, |b| evaluation.objective > b.objective);
        if improved && evaluation.objective.is_finite() {
            *best = Some(evaluation);
        }
        Ok(result)
    }
}

impl<V, G> CostFunction for SequencesLoss<'_, '_, V, G>
where
    V: SpanView + Sync,
    G: FeatureGenerator<V::Seq> + Sync,
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        Ok(-self.evaluate(param)?.0)
    }
}

impl<V, G> Gradient for SequencesLoss<'_, '_, V, G>
where
    V: SpanView + Sync,
    G: FeatureGenerator<V::Seq> + Sync,
{
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, Error> {
        Ok(self.evaluate(param)?.1.into_iter().map(|g| -g).collect())
    }
}

/// Wraps a solver with the relative-change convergence test and the
/// caller's evaluator.
struct EvaluatorStop<'e, S> {
    inner: S,
    eps: f64,
    log_weights: bool,
    last_cost: Option<f64>,
    evaluator: Option<&'e mut dyn Evaluator>,
}

impl<O, S, I> Solver<O, I> for EvaluatorStop<'_, S>
where
    S: Solver<O, I>,
    I: State<Param = Vec<f64>, Float = f64>,
{
    const NAME: &'static str = S::NAME;

    fn init(&mut self, problem: &mut Problem<O>, state: I) -> Result<(I, Option<KV>), Error> {
        self.inner.init(problem, state)
    }

    fn next_iter(&mut self, problem: &mut Problem<O>, state: I) -> Result<(I, Option<KV>), Error> {
        self.inner.next_iter(problem, state)
    }

    fn terminate(&mut self, state: &I) -> TerminationStatus {
        let status = self.inner.terminate(state);
        if matches!(status, TerminationStatus::Terminated(_)) {
            return status;
        }
        let cost = state.get_cost();
        if let Some(last) = self.last_cost.replace(cost) {
            if (last - cost).abs() < self.eps * cost.abs() {
                log::info!("relative objective change below {}", self.eps);
                return TerminationStatus::Terminated(TerminationReason::SolverConverged);
            }
        }
        if let (Some(evaluator), Some(param)) = (self.evaluator.as_deref_mut(), state.get_param()) {
            let weights = to_weights(param, self.log_weights);
            if !evaluator.evaluate(state.get_iter(), &weights) {
                return TerminationStatus::Terminated(TerminationReason::SolverExit(
                    "stopped by evaluator".to_string(),
                ));
            }
        }
        TerminationStatus::NotTerminated
    }
}

/// Trains weights for `views` with the strategy selected in `params`.
pub(crate) fn train<V, G>(
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
    // Under the exp prior initValue is the starting log-weight.
    let start = match params.prior {
        Prior::Exp => math::exp(params.init_value),
        _ => params.init_value,
    };
    let init = vec![start; features.num_features()];
    let objective = |strategy| Objective::new(graph, features, views, strategy, params);
    log::info!(
        "training {:?} on {} sequences with {} features",
        params.trainer,
        views.len(),
        init.len()
    );
    match params.trainer {
        TrainerKind::LogLikelihood => {
            objective(Strategy::LogLikelihood).optimize(init, params, evaluator)
        }
        TrainerKind::SoftMargin => {
            objective(Strategy::LossAugmented(1.0)).optimize(init, params, evaluator)
        }
        TrainerKind::Piecewise => objective(Strategy::Piecewise).optimize(init, params, evaluator),
        TrainerKind::Partial => objective(Strategy::Partial).optimize(init, params, evaluator),
        TrainerKind::SoftLogMargin => {
            let likelihood = objective(Strategy::LogLikelihood);
            let warm = likelihood.optimize(
                init,
                params,
                evaluator.as_deref_mut().map(|e| e as &mut dyn Evaluator),
            )?;
            log::info!("switching to the soft log margin objective");
            likelihood
                .with_strategy(Strategy::SoftLogMargin)
                .optimize(warm, params, evaluator)
        }
        TrainerKind::Collins => collins::train(graph, features, views, params, evaluator),
        TrainerKind::ExponentiatedGradient => eg::train(
            objective(Strategy::LogLikelihood).without_prior(),
            graph,
            features,
            views,
            params,
            evaluator,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::feature::FeatureSpace;
    use crate::sequence::LabelSequence;
    use crate::span::UnitSpans;
    use crate::test_utils::{toy_weights, ToyFeatures};

    fn dataset() -> Vec<LabelSequence<u8>> {
        vec![
            LabelSequence::new(vec![0, 1, 0, 1], &[0, 1, 0, 1]),
            LabelSequence::new(vec![1, 1, 0], &[1, 1, 0]),
            LabelSequence::new(vec![0, 0, 1, 1, 0], &[0, 0, 1, 1, 0]),
        ]
    }

    #[test]
    fn test_prior_gradients() {
        let weights = [0.5, -2.0];
        for prior in [Prior::Gaussian, Prior::Exp, Prior::LaplaceApprox] {
            let mut grad = [0.0; 2];
            let value = apply_prior(prior, 0.1, &weights, &mut grad);
            for i in 0..2 {
                let mut shifted = weights;
                shifted[i] += 1e-6;
                let mut unused = [0.0; 2];
                let numeric = (apply_prior(prior, 0.1, &shifted, &mut unused) - value) / 1e-6;
                assert!((numeric - grad[i]).abs() < 1e-4, "{prior:?}");
            }
        }
    }

    #[test]
    fn test_threads_agree() {
        let graph = Graph::complete(2);
        let features = ToyFeatures::new(2, 2);
        let seqs = dataset();
        let views: Vec<_> = seqs.iter().map(UnitSpans::new).collect();
        let weights = toy_weights(features.num_features(), 6);
        let one = Params::new();
        let four = Params::new().n_threads(4).unwrap();
        let (a, ga) = Objective::new(&graph, &features, &views, Strategy::LogLikelihood, &one)
            .accumulate(&weights)
            .unwrap();
        let (b, gb) = Objective::new(&graph, &features, &views, Strategy::LogLikelihood, &four)
            .accumulate(&weights)
            .unwrap();
        assert!((a - b).abs() < 1e-9);
        for (x, y) in ga.iter().zip(&gb) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_log_likelihood_improves() {
        let graph = Graph::complete(2);
        let features = ToyFeatures::new(2, 2);
        let seqs = dataset();
        let views: Vec<_> = seqs.iter().map(UnitSpans::new).collect();
        let params = Params::new().max_iters(30).unwrap();
        let objective = Objective::new(&graph, &features, &views, Strategy::LogLikelihood, &params);
        let before = objective.evaluate(&vec![0.0; features.num_features()]).unwrap().objective;
        let weights = objective.optimize(vec![0.0; features.num_features()], &params, None).unwrap();
        let after = objective.evaluate(&weights).unwrap().objective;
        assert!(after > before);
    }

    #[test]
    fn test_evaluator_stops() {
        let graph = Graph::complete(2);
        let features = ToyFeatures::new(2, 2);
        let seqs = dataset();
        let views: Vec<_> = seqs.iter().map(UnitSpans::new).collect();
        let params = Params::new().max_iters(100).unwrap();
        let mut calls = 0;
        let mut evaluator = |_: u64, _: &[f64]| {
            calls += 1;
            calls < 2
        };
        train(&graph, &features, &views, &params, Some(&mut evaluator)).unwrap();
        assert!((1..=2).contains(&calls));
    }

    #[test]
    fn test_exp_prior_keeps_weights_positive() {
        let graph = Graph::complete(2);
        let features = ToyFeatures::new(2, 2);
        let seqs = dataset();
        let views: Vec<_> = seqs.iter().map(UnitSpans::new).collect();
        let params = Params::new()
            .max_iters(10)
            .unwrap()
            .prior(Prior::Exp, 0.1)
            .unwrap();
        let weights = train(&graph, &features, &views, &params, None).unwrap();
        assert!(weights.iter().all(|&w| w > 0.0));
    }
}
