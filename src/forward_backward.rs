//! Sum-product passes over the spans of a sequence.

use crate::feature::{Feature, FeatureGenerator};
use crate::math::{self, log_mult, logsumexp, Matrix, LOG0};
use crate::scratch::{Expectations, Scratch};
use crate::span::SpanView;
use crate::topology::Graph;
use crate::transition;

/// Score added to the emission of state `y` on span `start..=end`.
pub(crate) type Loss<'l> = Option<&'l (dyn Fn(usize, usize, usize) -> f64 + Sync)>;

/// Everything the forward pass knows about one span when it is visited.
pub(crate) struct SpanState<'s> {
    pub start: usize,
    pub end: usize,
    /// Transition potentials into this span; `None` when it starts the
    /// sequence.
    pub m: Option<&'s Matrix>,
    pub r: &'s [f64],
    /// Forward mass of the paths whose last span is this one.
    pub contrib: &'s [f64],
    pub alpha_prev: Option<&'s [f64]>,
    pub beta: &'s [f64],
    pub features: &'s [Feature],
    /// Loss-weighted counterparts, present when the loss recursions run.
    pub contrib_loss: Option<&'s [f64]>,
    pub alpha_loss_prev: Option<&'s [f64]>,
    pub beta_loss: Option<&'s [f64]>,
}

impl SpanState<'_> {
    /// Log mass of all paths through this span taking state `y`.
    #[inline(always)]
    pub fn node(&self, y: usize) -> f64 {
        self.contrib[y] + self.beta[y]
    }

    /// Log mass of all paths through this span taking state `y` after
    /// `y_prev`.
    #[inline(always)]
    pub fn edge(&self, y_prev: usize, y: usize) -> f64 {
        match (self.m, self.alpha_prev) {
            (Some(m), Some(alpha)) => alpha[y_prev] + m.get(y_prev, y) + self.r[y] + self.beta[y],
            _ => LOG0,
        }
    }

    /// Log expected count of `feature` on this span, or `None` if its value
    /// cannot enter the log domain.
    pub fn expectation(&self, feature: &Feature) -> Option<f64> {
        let lv = log_value(feature)?;
        Some(match feature.y_prev {
            None => self.node(feature.y) + lv,
            Some(y_prev) => self.edge(y_prev, feature.y) + lv,
        })
    }

    /// Log expected count of `feature` weighted by the number of gold
    /// spans each path reproduces. `gold` is the gold state of this span.
    /// Requires the loss recursions.
    pub fn loss_expectation(&self, feature: &Feature, gold: Option<usize>) -> Option<f64> {
        if feature.value <= 0.0 {
            return None;
        }
        let lv = feature.value.ln();
        let (contrib_loss, beta_loss) = (self.contrib_loss?, self.beta_loss?);
        let y = feature.y;
        let mass = match feature.y_prev {
            None => logsumexp(contrib_loss[y] + self.beta[y], self.contrib[y] + beta_loss[y]),
            Some(y_prev) => {
                let (m, alpha, alpha_loss) = (self.m?, self.alpha_prev?, self.alpha_loss_prev?);
                let through = m.get(y_prev, y) + self.r[y];
                let mut mass = logsumexp(
                    alpha_loss[y_prev] + through + self.beta[y],
                    alpha[y_prev] + through + beta_loss[y],
                );
                if gold == Some(y) {
                    mass = logsumexp(mass, alpha[y_prev] + through + self.beta[y]);
                }
                mass
            }
        };
        Some(mass + lv)
    }
}

#[inline(always)]
fn log_value(feature: &Feature) -> Option<f64> {
    if feature.value > 0.0 {
        Some(feature.value.ln())
    } else {
        if feature.value < 0.0 {
            log::warn!(
                "negative value {} of feature {} skipped in expectations",
                feature.value,
                feature.index
            );
        }
        None
    }
}

/// Forward-backward over a fixed weight vector.
pub(crate) struct ForwardBackward<'a, G> {
    pub graph: &'a Graph,
    pub features: &'a G,
    pub weights: &'a [f64],
    pub reuse_m: bool,
}

impl<'a, G> ForwardBackward<'a, G> {
    pub fn new(graph: &'a Graph, features: &'a G, weights: &'a [f64], reuse_m: bool) -> Self {
        Self {
            graph,
            features,
            weights,
            reuse_m,
        }
    }

    /// Fills `scratch.m` (unless it is reused) and `scratch.r` for a span.
    fn potentials<V>(
        &self,
        view: &V,
        start: usize,
        end: usize,
        scratch: &mut Scratch,
        loss: Loss,
        record: bool,
    ) where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        scratch.features.clear();
        let want_m = start > 0 && !(self.reuse_m && scratch.m_init_done);
        let populated = transition::compute(
            self.graph,
            self.features,
            self.weights,
            view,
            start,
            end,
            want_m.then_some(&mut scratch.m),
            &mut scratch.r,
            record.then_some(&mut scratch.features),
        );
        if populated {
            scratch.m_init_done = true;
        }
        if let Some(loss) = loss {
            for (y, r) in scratch.r.iter_mut().enumerate() {
                *r += loss(start, end, y);
            }
        }
    }

    /// Computes the backward table and returns the log partition function
    /// accumulated from the spans starting the sequence.
    ///
    /// With `track_loss`, `scratch.beta_loss` receives the mass of the
    /// suffixes weighted by the number of gold spans they contain.
    pub fn backward<V>(&self, view: &V, scratch: &mut Scratch, loss: Loss, track_loss: bool) -> f64
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        let n = self.graph.num_states();
        let len = view.len();
        scratch.prepare(len, n);
        if track_loss {
            scratch.prepare_loss(len, n);
        }
        if len == 0 {
            return 0.0;
        }
        for y in 0..n {
            scratch.betas[len - 1][y] = if self.graph.is_end_state(y) { 0.0 } else { LOG0 };
        }
        let edges = self.graph.edge_filter();
        let mut finals = vec![];
        for end in (0..len).rev() {
            for k in 0..view.num_ending_at(end) {
                let start = view.start(end, k);
                self.potentials(view, start, end, scratch, loss, false);
                if start == 0 {
                    finals.extend(
                        (0..n)
                            .filter(|&y| self.graph.is_start_state(y))
                            .map(|y| scratch.r[y] + scratch.betas[end][y]),
                    );
                    continue;
                }
                for y in 0..n {
                    scratch.tmp[y] = scratch.r[y] + scratch.betas[end][y];
                }
                log_mult(&scratch.m, &scratch.tmp, &mut scratch.betas[start - 1], true, false, edges);
                if track_loss {
                    for y in 0..n {
                        scratch.tmp[y] = scratch.r[y] + scratch.beta_loss[end][y];
                    }
                    if let Some(g) = view.gold_state(start, end) {
                        scratch.tmp[g] = logsumexp(scratch.tmp[g], scratch.r[g] + scratch.betas[end][g]);
                    }
                    log_mult(
                        &scratch.m,
                        &scratch.tmp,
                        &mut scratch.beta_loss[start - 1],
                        true,
                        false,
                        edges,
                    );
                }
            }
        }
        math::logsumexp_all(&finals)
    }

    /// Computes the forward table, visiting every span once its forward
    /// contribution is known, and returns the log partition function.
    ///
    /// [`ForwardBackward::backward`] must have run on the same view first.
    pub fn forward<V>(
        &self,
        view: &V,
        scratch: &mut Scratch,
        loss: Loss,
        track_loss: bool,
        visit: &mut dyn FnMut(&SpanState),
    ) -> f64
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        let n = self.graph.num_states();
        let len = view.len();
        if len == 0 {
            return 0.0;
        }
        let edges = self.graph.edge_filter();
        for end in 0..len {
            for k in 0..view.num_ending_at(end) {
                let start = view.start(end, k);
                self.potentials(view, start, end, scratch, loss, true);
                if start == 0 {
                    for y in 0..n {
                        scratch.contrib[y] = if self.graph.is_start_state(y) {
                            scratch.r[y]
                        } else {
                            LOG0
                        };
                    }
                } else {
                    log_mult(
                        &scratch.m,
                        &scratch.alphas[start - 1],
                        &mut scratch.contrib,
                        false,
                        true,
                        edges,
                    );
                    for (c, r) in scratch.contrib.iter_mut().zip(&scratch.r) {
                        *c += r;
                    }
                }
                if track_loss {
                    if start == 0 {
                        scratch.contrib_loss.fill(LOG0);
                    } else {
                        log_mult(
                            &scratch.m,
                            &scratch.alpha_loss[start - 1],
                            &mut scratch.contrib_loss,
                            false,
                            true,
                            edges,
                        );
                        for (c, r) in scratch.contrib_loss.iter_mut().zip(&scratch.r) {
                            *c += r;
                        }
                    }
                    if let Some(g) = view.gold_state(start, end) {
                        scratch.contrib_loss[g] = logsumexp(scratch.contrib_loss[g], scratch.contrib[g]);
                    }
                }
                visit(&SpanState {
                    start,
                    end,
                    m: (start > 0).then_some(&scratch.m),
                    r: &scratch.r,
                    contrib: &scratch.contrib,
                    alpha_prev: (start > 0).then(|| scratch.alphas[start - 1].as_slice()),
                    beta: &scratch.betas[end],
                    features: &scratch.features,
                    contrib_loss: track_loss.then_some(scratch.contrib_loss.as_slice()),
                    alpha_loss_prev: (track_loss && start > 0)
                        .then(|| scratch.alpha_loss[start - 1].as_slice()),
                    beta_loss: track_loss.then(|| scratch.beta_loss[end].as_slice()),
                });
                for y in 0..n {
                    scratch.alphas[end][y] = logsumexp(scratch.alphas[end][y], scratch.contrib[y]);
                }
                if track_loss {
                    for y in 0..n {
                        scratch.alpha_loss[end][y] =
                            logsumexp(scratch.alpha_loss[end][y], scratch.contrib_loss[y]);
                    }
                }
            }
        }
        let finals: Vec<f64> = (0..n)
            .map(|y| scratch.alphas[len - 1][y] + scratch.betas[len - 1][y])
            .collect();
        math::logsumexp_all(&finals)
    }

    /// Runs both passes, collecting log expected feature counts into `exp`.
    /// Returns the log partition function.
    pub fn expectations<V>(
        &self,
        view: &V,
        scratch: &mut Scratch,
        exp: &mut Expectations,
        loss: Loss,
    ) -> f64
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        exp.clear();
        self.backward(view, scratch, loss, false);
        self.forward(view, scratch, loss, false, &mut |span| {
            for feature in span.features {
                if let Some(v) = span.expectation(feature) {
                    exp.add(feature.index, v);
                }
            }
        })
    }

    /// Adds the features of the gold path, scaled by `scale`, into `grad`
    /// and returns the gold path score. `None` if the gold path is missing
    /// from the spans of the view.
    pub fn observed<V>(&self, view: &V, grad: &mut [f64], scale: f64) -> Option<f64>
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        let path = view.gold_path()?;
        Some(self.observed_path(view, &path, grad, scale))
    }

    fn observed_path<V>(&self, view: &V, path: &[(usize, usize, usize)], grad: &mut [f64], scale: f64) -> f64
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        let mut score = 0.0;
        transition::path_features(self.features, view, path, &mut |f| {
            grad[f.index] += f.value * scale;
            score += self.weights[f.index] * f.value;
        });
        score
    }

    /// Adds the gradient of the weighted log-likelihood of one sequence
    /// into `grad` and returns that log-likelihood.
    ///
    /// Returns `None` and leaves `grad` untouched when the sequence cannot
    /// contribute: its gold path is not among the spans, or its partition
    /// function is not finite.
    pub fn log_likelihood<V>(
        &self,
        view: &V,
        scratch: &mut Scratch,
        exp: &mut Expectations,
        grad: &mut [f64],
        loss: Loss,
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
        let log_z = self.expectations(view, scratch, exp, loss);
        if !log_z.is_finite() {
            log::warn!("partition function is {log_z}; sequence skipped");
            return None;
        }
        let w = view.weight();
        let score = self.observed_path(view, &path, grad, w);
        for &f in &exp.touched {
            grad[f] -= math::exp(exp.exp_f[f] - log_z) * w;
        }
        log::trace!("score = {score}, log_z = {log_z}");
        Some((score - log_z) * w)
    }

    /// Like [`ForwardBackward::log_likelihood`] for a sequence whose labels
    /// may be unknown at some positions. The numerator sums over every path
    /// whose states carry the known labels; `exp_known` receives its
    /// expectations.
    pub fn partial_log_likelihood<V>(
        &self,
        view: &V,
        scratch: &mut Scratch,
        exp: &mut Expectations,
        exp_known: &mut Expectations,
        grad: &mut [f64],
    ) -> Option<f64>
    where
        V: SpanView + Sync,
        G: FeatureGenerator<V::Seq>,
    {
        if view.len() == 0 {
            return Some(0.0);
        }
        let graph = self.graph;
        let consistent = |start: usize, end: usize, y: usize| {
            let label = graph.label(y);
            if (start..=end).all(|pos| view.state_at(pos).map_or(true, |l| l == label)) {
                0.0
            } else {
                LOG0
            }
        };
        let log_z_known = self.expectations(view, scratch, exp_known, Some(&consistent));
        let log_z = self.expectations(view, scratch, exp, None);
        if !log_z_known.is_finite() || !log_z.is_finite() {
            log::warn!("partition functions are {log_z_known} and {log_z}; sequence skipped");
            return None;
        }
        let w = view.weight();
        for &f in &exp_known.touched {
            grad[f] += math::exp(exp_known.exp_f[f] - log_z_known) * w;
        }
        for &f in &exp.touched {
            grad[f] -= math::exp(exp.exp_f[f] - log_z) * w;
        }
        log::trace!("log_z_known = {log_z_known}, log_z = {log_z}");
        Some((log_z_known - log_z) * w)
    }
}
