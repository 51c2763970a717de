//! Transition and emission potentials of a span.

use crate::feature::{Feature, FeatureGenerator};
use crate::math::{Matrix, LOG0};
use crate::span::SpanView;
use crate::topology::Graph;

/// Fills `r[y]` and, if given, `m[y_prev][y]` with the summed weighted
/// features of `start..=end`.
///
/// `m` starts from `LOG0` with the graph's edges opened when the graph is
/// restricted, and from zero otherwise. Features are appended to `record`
/// when given. Returns `true` if `m` was populated.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute<V, G>(
    graph: &Graph,
    features: &G,
    weights: &[f64],
    view: &V,
    start: usize,
    end: usize,
    m: Option<&mut Matrix>,
    r: &mut [f64],
    mut record: Option<&mut Vec<Feature>>,
) -> bool
where
    V: SpanView,
    G: FeatureGenerator<V::Seq>,
{
    r.fill(0.0);
    let mut m = m;
    if let Some(m) = m.as_deref_mut() {
        init_matrix(graph, m);
    }
    view.scan(features, start, end, &mut |feature| {
        let w = weights[feature.index] * feature.value;
        match feature.y_prev {
            None => r[feature.y] += w,
            Some(y_prev) => {
                if let Some(m) = m.as_deref_mut() {
                    m.add(y_prev, feature.y, w);
                }
            }
        }
        if let Some(record) = record.as_deref_mut() {
            record.push(feature);
        }
    });
    m.is_some()
}

fn init_matrix(graph: &Graph, m: &mut Matrix) {
    let n = graph.num_states();
    match graph.edge_filter() {
        Some(edges) => {
            m.reset(n, LOG0);
            for &(p, c) in edges {
                m.set(p, c, 0.0);
            }
        }
        None => m.reset(n, 0.0),
    }
}

/// Calls `f` for the features along `path`, given as `(start, end, state)`
/// spans: the state features of each span's state, and the transition
/// features from the previous span's state.
pub(crate) fn path_features<V, G>(
    features: &G,
    view: &V,
    path: &[(usize, usize, usize)],
    f: &mut dyn FnMut(Feature),
) where
    V: SpanView,
    G: FeatureGenerator<V::Seq>,
{
    let mut prev = None;
    for &(start, end, y) in path {
        view.scan(features, start, end, &mut |feature| {
            if feature.y == y && (feature.y_prev.is_none() || feature.y_prev == prev) {
                f(feature);
            }
        });
        prev = Some(y);
    }
}

/// Sum of the weighted features along `path`.
pub(crate) fn path_score<V, G>(
    features: &G,
    weights: &[f64],
    view: &V,
    path: &[(usize, usize, usize)],
) -> f64
where
    V: SpanView,
    G: FeatureGenerator<V::Seq>,
{
    let mut score = 0.0;
    path_features(features, view, path, &mut |f| {
        score += weights[f.index] * f.value;
    });
    score
}

/// Transition matrix kept by a [`TransitionCache`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StoredMatrix {
    Dense(Matrix),

    /// Entries above `LOG0`, sorted by `(prev, curr)`.
    Sparse(Vec<(usize, usize, f64)>),
}

impl StoredMatrix {
    #[inline(always)]
    pub fn get(&self, prev: usize, curr: usize) -> f64 {
        match self {
            Self::Dense(m) => m.get(prev, curr),
            Self::Sparse(entries) => entries
                .binary_search_by(|&(p, c, _)| (p, c).cmp(&(prev, curr)))
                .map_or(LOG0, |i| entries[i].2),
        }
    }

    fn cells(&self) -> usize {
        match self {
            Self::Dense(m) => m.size() * m.size(),
            Self::Sparse(entries) => entries.len(),
        }
    }
}

/// Potentials of one span.
#[derive(Clone, Debug)]
pub(crate) struct CachedSpan {
    pub start: usize,
    pub end: usize,
    /// Index into the cache's matrices; `None` for spans starting the
    /// sequence.
    pub m: Option<usize>,
    pub r: Vec<f64>,
}

/// Potentials of every span of a sequence, grouped by end position.
#[derive(Clone, Debug, Default)]
pub(crate) struct TransitionCache {
    spans: Vec<Vec<CachedSpan>>,
    matrices: Vec<StoredMatrix>,
}

impl TransitionCache {
    /// With `reuse_m`, the matrix of the first span not starting the
    /// sequence is shared by every later span.
    pub fn build<V, G>(graph: &Graph, features: &G, weights: &[f64], view: &V, reuse_m: bool) -> Self
    where
        V: SpanView,
        G: FeatureGenerator<V::Seq>,
    {
        let n = graph.num_states();
        let mut spans = Vec::with_capacity(view.len());
        let mut matrices = vec![];
        let mut m = Matrix::new(n, 0.0);
        for end in 0..view.len() {
            let mut here = Vec::with_capacity(view.num_ending_at(end));
            for k in 0..view.num_ending_at(end) {
                let start = view.start(end, k);
                let mut r = vec![0.0; n];
                let index = if start == 0 {
                    compute(graph, features, weights, view, start, end, None, &mut r, None);
                    None
                } else if reuse_m && !matrices.is_empty() {
                    compute(graph, features, weights, view, start, end, None, &mut r, None);
                    Some(0)
                } else {
                    compute(graph, features, weights, view, start, end, Some(&mut m), &mut r, None);
                    matrices.push(StoredMatrix::Dense(m.clone()));
                    Some(matrices.len() - 1)
                };
                here.push(CachedSpan {
                    start,
                    end,
                    m: index,
                    r,
                });
            }
            spans.push(here);
        }
        Self { spans, matrices }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    #[inline(always)]
    pub fn ending_at(&self, end: usize) -> &[CachedSpan] {
        &self.spans[end]
    }

    /// The span `start..=end`, if it is a candidate.
    pub fn span(&self, start: usize, end: usize) -> Option<&CachedSpan> {
        self.spans.get(end)?.iter().find(|s| s.start == start)
    }

    /// Transition potential into `span` from state `prev`.
    #[inline(always)]
    pub fn transition(&self, span: &CachedSpan, prev: usize, curr: usize) -> f64 {
        span.m.map_or(0.0, |i| self.matrices[i].get(prev, curr))
    }

    /// Adds `loss(start, end, y)` to the state potentials of every span.
    pub fn add_loss(&mut self, loss: &dyn Fn(usize, usize, usize) -> f64) {
        for span in self.spans.iter_mut().flatten() {
            for (y, r) in span.r.iter_mut().enumerate() {
                *r += loss(span.start, span.end, y);
            }
        }
    }

    /// Stored potentials, counting each sparse entry as one cell.
    pub fn num_cells(&self) -> usize {
        self.matrices.iter().map(StoredMatrix::cells).sum::<usize>()
            + self.spans.iter().flatten().map(|s| s.r.len()).sum::<usize>()
    }

    /// Converts dense matrices with fewer than half of their entries open
    /// into sorted sparse lists.
    pub fn compact(&mut self) {
        for stored in &mut self.matrices {
            if let StoredMatrix::Dense(m) = stored {
                let entries: Vec<_> = m.finite_entries().collect();
                if entries.len() * 2 < m.size() * m.size() {
                    *stored = StoredMatrix::Sparse(entries);
                }
            }
        }
    }
}
