//! Decoding and posterior queries shared by the plain and segment models.

use crate::astar::{AStar, SearchLimits};
use crate::constraints::Constraints;
use crate::errors::Result;
use crate::feature::FeatureGenerator;
use crate::forward_backward::ForwardBackward;
use crate::math;
use crate::params::{InferenceKind, Params};
use crate::scratch::{Expectations, Scratch};
use crate::span::SpanView;
use crate::topology::Graph;
use crate::transition::{self, TransitionCache};
use crate::viterbi::{Path, Viterbi};

const DEFAULT_MAX_CACHED_CELLS: usize = 1 << 22;

/// Decoder settings read once from [`Params`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct DecodeOptions {
    pub inference: InferenceKind,
    pub beam: usize,
    pub limits: SearchLimits,
    /// Transition caches larger than this are compacted.
    pub max_cached_cells: usize,
    pub reuse_m: bool,
}

impl DecodeOptions {
    pub fn from_params(params: &Params) -> Result<Self> {
        let defaults = SearchLimits::default();
        let backward_beam: usize = params.misc_or("backwardViterbiBeamSize", 1)?;
        if backward_beam > 1 {
            log::debug!("backwardViterbiBeamSize {backward_beam} ignored; bounds keep the best suffix only");
        }
        let limits = SearchLimits {
            max_expansions: params.misc_or("maxExpansions", defaults.max_expansions)?,
            queue_size_limit: params.misc_or("queueSizeLimit", defaults.queue_size_limit)?,
            bound_update: params.misc_bool_or("boundUpdate", defaults.bound_update)?,
            forward_beam: params
                .misc_or("forwardViterbiBeamSize", defaults.forward_beam)?
                .max(1),
        };
        Ok(Self {
            inference: params.inference,
            beam: params.decode_beam(),
            limits,
            max_cached_cells: params.misc_or("maxCachedCells", DEFAULT_MAX_CACHED_CELLS)?,
            reuse_m: params.reuse_m,
        })
    }
}

/// Posterior probability of one span taking one state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SpanPosterior {
    pub start: usize,
    pub end: usize,
    pub state: usize,
    pub probability: f64,
}

/// Node and edge posteriors of a sequence.
pub(crate) struct Posteriors {
    pub spans: Vec<SpanPosterior>,
    /// `(start, prev_state, state, probability)` for transitions into the
    /// span starting at `start`.
    pub edges: Vec<(usize, usize, usize, f64)>,
}

/// Queries against one weight vector.
pub(crate) struct Inference<'a, G> {
    graph: &'a Graph,
    features: &'a G,
    weights: &'a [f64],
    options: &'a DecodeOptions,
}

impl<'a, G> Inference<'a, G> {
    pub fn new(graph: &'a Graph, features: &'a G, weights: &'a [f64], options: &'a DecodeOptions) -> Self {
        Self {
            graph,
            features,
            weights,
            options,
        }
    }

    fn cache<V>(&self, view: &V) -> TransitionCache
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        let mut cache = TransitionCache::build(self.graph, self.features, self.weights, view, self.options.reuse_m);
        let cells = cache.num_cells();
        if cells > self.options.max_cached_cells {
            log::debug!("compacting a transition cache of {cells} cells");
            cache.compact();
        }
        cache
    }

    /// Best path under the configured decoder. Non-empty `constraints`
    /// always go through A*.
    pub fn best<V>(&self, view: &V, constraints: Option<&Constraints>) -> Option<(f64, Path)>
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        if view.len() == 0 {
            return Some((0.0, vec![]));
        }
        let cache = self.cache(view);
        let constraints = constraints.filter(|c| !c.is_empty());
        if self.options.inference == InferenceKind::AStar || constraints.is_some() {
            AStar::new(self.graph, &cache, self.options.limits)
                .constrained(constraints, V::SEGMENTED)
                .search()
        } else {
            Viterbi::new(self.graph, &cache, self.options.beam).best()
        }
    }

    /// Up to `k` best paths, best first.
    pub fn top_k<V>(&self, view: &V, k: usize) -> Vec<(f64, Path)>
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        if view.len() == 0 {
            return vec![(0.0, vec![])];
        }
        let cache = self.cache(view);
        let table = Viterbi::new(self.graph, &cache, self.options.beam.max(k)).run(&[]);
        (0..k.min(table.num_solutions()))
            .filter_map(|i| table.path(i))
            .collect()
    }

    fn forward_backward(&self) -> ForwardBackward<'a, G> {
        ForwardBackward::new(self.graph, self.features, self.weights, self.options.reuse_m)
    }

    pub fn log_z<V>(&self, view: &V) -> f64
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        self.forward_backward().backward(view, &mut Scratch::new(), None, false)
    }

    pub fn path_score<V>(&self, view: &V, path: &[(usize, usize, usize)]) -> f64
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        transition::path_score(self.features, self.weights, view, path)
    }

    /// Probability of `score` under the sequence's partition function.
    pub fn probability<V>(&self, view: &V, score: f64) -> f64
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        math::exp(score - self.log_z(view))
    }

    /// Posteriors of every span and transition. Entries below `LOG0` are
    /// omitted.
    pub fn posteriors<V>(&self, view: &V) -> Posteriors
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        let fb = self.forward_backward();
        let mut scratch = Scratch::new();
        let log_z = fb.backward(view, &mut scratch, None, false);
        let n = self.graph.num_states();
        let mut spans = vec![];
        let mut edges = vec![];
        fb.forward(view, &mut scratch, None, false, &mut |span| {
            for state in 0..n {
                let node = span.node(state);
                if node.is_finite() {
                    spans.push(SpanPosterior {
                        start: span.start,
                        end: span.end,
                        state,
                        probability: math::exp(node - log_z),
                    });
                }
            }
            if span.m.is_some() {
                for &(yp, y) in self.graph.edges() {
                    let edge = span.edge(yp, y);
                    if edge.is_finite() {
                        edges.push((span.start, yp, y, math::exp(edge - log_z)));
                    }
                }
            }
        });
        Posteriors { spans, edges }
    }

    /// Adds the expected feature counts of `view` into `out`.
    pub fn add_expectations<V>(&self, view: &V, scratch: &mut Scratch, exp: &mut Expectations, out: &mut [f64])
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        if view.len() == 0 {
            return;
        }
        let log_z = self.forward_backward().expectations(view, scratch, exp, None);
        if !log_z.is_finite() {
            log::warn!("partition function is {log_z}; sequence skipped");
            return;
        }
        for &f in &exp.touched {
            out[f] += math::exp(exp.exp_f[f] - log_z);
        }
    }
}
