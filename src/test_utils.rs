use crate::feature::{Feature, FeatureGenerator, FeatureSpace};
use crate::math::LOG0;
use crate::sequence::{LabelSequence, SegmentedSequence};
use crate::topology::Graph;
use crate::transition::TransitionCache;

macro_rules! logsumexp {
    ( $($x:expr,)* ) => {
        {
            let mut y = f64::NEG_INFINITY;
            $(
                y = $crate::math::logsumexp(y, $x);
            )*
            y
        }
    };
    ( $($x:expr),* ) => {
        logsumexp!($( $x, )*)
    };
}

/// Indicator features over small integer observations.
///
/// Index `obs * num_states + y` fires once per position of a span, and
/// index `num_obs * num_states + y_prev * num_states + y` fires on every
/// span not starting the sequence.
pub struct ToyFeatures {
    num_states: usize,
    num_obs: usize,
}

impl ToyFeatures {
    pub fn new(num_states: usize, num_obs: usize) -> Self {
        Self {
            num_states,
            num_obs,
        }
    }

    pub fn emission(&self, obs: u8, y: usize) -> usize {
        usize::from(obs) * self.num_states + y
    }

    pub fn transition(&self, y_prev: usize, y: usize) -> usize {
        self.num_obs * self.num_states + y_prev * self.num_states + y
    }

    fn scan_obs(&self, obs: &[u8], start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        for y in 0..self.num_states {
            for &o in &obs[start..=end] {
                f(Feature::state(self.emission(o, y), y, 1.0));
            }
        }
        if start > 0 {
            for y_prev in 0..self.num_states {
                for y in 0..self.num_states {
                    f(Feature::transition(self.transition(y_prev, y), y_prev, y, 1.0));
                }
            }
        }
    }
}

impl FeatureSpace for ToyFeatures {
    fn num_features(&self) -> usize {
        self.num_obs * self.num_states + self.num_states * self.num_states
    }
}

impl FeatureGenerator<LabelSequence<u8>> for ToyFeatures {
    fn scan(&self, seq: &LabelSequence<u8>, start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        self.scan_obs(seq.observations(), start, end, f);
    }
}

impl FeatureGenerator<SegmentedSequence<u8>> for ToyFeatures {
    fn scan(&self, seq: &SegmentedSequence<u8>, start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        self.scan_obs(seq.observations(), start, end, f);
    }
}

/// Deterministic pseudo-random weights in `[-1, 1)`.
pub fn toy_weights(n: usize, seed: u64) -> Vec<f64> {
    let mut x = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..n)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 11) as f64 / (1u64 << 52) as f64 - 1.0
        })
        .collect()
}

/// Every complete path over the cached spans, with its score.
pub fn all_paths(graph: &Graph, cache: &TransitionCache) -> Vec<(f64, Vec<(usize, usize, usize)>)> {
    let mut out = vec![];
    extend_paths(graph, cache, 0, 0.0, &mut vec![], &mut out);
    out
}

fn extend_paths(
    graph: &Graph,
    cache: &TransitionCache,
    pos: usize,
    score: f64,
    path: &mut Vec<(usize, usize, usize)>,
    out: &mut Vec<(f64, Vec<(usize, usize, usize)>)>,
) {
    if pos == cache.len() {
        if let Some(&(_, _, y)) = path.last() {
            if graph.is_end_state(y) {
                out.push((score, path.clone()));
            }
        }
        return;
    }
    for end in pos..cache.len() {
        let Some(span) = cache.span(pos, end) else {
            continue;
        };
        for y in 0..graph.num_states() {
            let step = match path.last() {
                None if graph.is_start_state(y) => span.r[y],
                None => LOG0,
                Some(&(_, _, prev)) => cache.transition(span, prev, y) + span.r[y],
            };
            if step == LOG0 {
                continue;
            }
            path.push((pos, end, y));
            extend_paths(graph, cache, end + 1, score + step, path, out);
            path.pop();
        }
    }
}

/// The highest scoring complete path.
pub fn best_path(graph: &Graph, cache: &TransitionCache) -> (f64, Vec<(usize, usize, usize)>) {
    all_paths(graph, cache)
        .into_iter()
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .unwrap()
}

pub(crate) use logsumexp;
