//! Max-product decoding over cached span potentials.

use crate::constraints::Constraints;
use crate::math::LOG0;
use crate::topology::Graph;
use crate::transition::TransitionCache;

/// A labeled path as `(start, end, state)` spans.
pub(crate) type Path = Vec<(usize, usize, usize)>;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Link {
    /// The span starts the sequence.
    Start,

    /// The span closes a fixed prefix.
    Prefix,

    /// The span follows the `rank`-th solution of `state` at `end`.
    Prev {
        end: usize,
        state: usize,
        rank: usize,
    },
}

#[derive(Clone, Copy, Debug)]
struct Soln {
    score: f64,
    start: usize,
    link: Link,
}

/// Inserts `soln` into a descending beam of at most `cap` entries. Returns
/// `false` if it scored too low to enter.
#[inline(always)]
fn insert(beam: &mut Vec<Soln>, cap: usize, soln: Soln) -> bool {
    if beam.len() >= cap && beam.last().is_some_and(|worst| soln.score <= worst.score) {
        return false;
    }
    let pos = beam.partition_point(|s| s.score >= soln.score);
    beam.insert(pos, soln);
    beam.truncate(cap);
    true
}

/// Solutions of one decoding run.
pub(crate) struct Table {
    /// `entries[end][state]`: best partial paths whose last span ends at
    /// `end` in `state`, highest score first.
    entries: Vec<Vec<Vec<Soln>>>,
    /// `(score, state, rank)` of the best complete paths.
    finals: Vec<(f64, usize, usize)>,
    prefix: Path,
}

impl Table {
    /// Number of complete paths found.
    pub fn num_solutions(&self) -> usize {
        self.finals.len()
    }

    /// The `k`-th best complete path.
    pub fn path(&self, k: usize) -> Option<(f64, Path)> {
        let &(score, state, rank) = self.finals.get(k)?;
        let end = self.entries.len().checked_sub(1)?;
        Some((score, self.walk(end, state, rank)))
    }

    fn walk(&self, mut end: usize, mut state: usize, mut rank: usize) -> Path {
        let mut spans = vec![];
        loop {
            let soln = self.entries[end][state][rank];
            match soln.link {
                Link::Prefix => break,
                Link::Start => {
                    spans.push((soln.start, end, state));
                    break;
                }
                Link::Prev {
                    end: e,
                    state: s,
                    rank: r,
                } => {
                    spans.push((soln.start, end, state));
                    end = e;
                    state = s;
                    rank = r;
                }
            }
        }
        let mut path = self.prefix.clone();
        path.extend(spans.into_iter().rev());
        path
    }
}

fn chain_labels(
    graph: &Graph,
    entries: &[Vec<Vec<Soln>>],
    prefix: &[(usize, usize, usize)],
    mut end: usize,
    mut state: usize,
    mut rank: usize,
    out: &mut Vec<usize>,
) {
    out.clear();
    loop {
        let soln = entries[end][state][rank];
        match soln.link {
            Link::Prefix => {
                out.extend(prefix.iter().map(|&(_, _, y)| graph.label(y)));
                return;
            }
            Link::Start => {
                out.push(graph.label(state));
                return;
            }
            Link::Prev {
                end: e,
                state: s,
                rank: r,
            } => {
                out.push(graph.label(state));
                end = e;
                state = s;
                rank = r;
            }
        }
    }
}

/// Score of `path` under the cached potentials, or `LOG0` if the path
/// leaves the graph or uses a span that is not a candidate.
pub(crate) fn path_score(graph: &Graph, cache: &TransitionCache, path: &[(usize, usize, usize)]) -> f64 {
    let mut score = 0.0;
    let mut prev: Option<usize> = None;
    for &(start, end, y) in path {
        let Some(span) = cache.span(start, end) else {
            return LOG0;
        };
        score += span.r[y];
        match prev {
            Some(p) => score += cache.transition(span, p, y),
            None if !graph.is_start_state(y) => return LOG0,
            None => (),
        }
        prev = Some(y);
    }
    match prev {
        Some(y) if !graph.is_end_state(y) => LOG0,
        _ => score,
    }
}

/// Beam Viterbi, optionally respecting label exclusions.
pub(crate) struct Viterbi<'a> {
    graph: &'a Graph,
    cache: &'a TransitionCache,
    beam: usize,
    constraints: Option<&'a Constraints>,
    segmented: bool,
}

impl<'a> Viterbi<'a> {
    pub fn new(graph: &'a Graph, cache: &'a TransitionCache, beam: usize) -> Self {
        Self {
            graph,
            cache,
            beam: beam.max(1),
            constraints: None,
            segmented: false,
        }
    }

    /// Only extends partial paths that `constraints` admit. With
    /// `segmented`, consecutive spans never continue one another.
    pub fn constrained(mut self, constraints: Option<&'a Constraints>, segmented: bool) -> Self {
        self.constraints = constraints.filter(|c| !c.is_empty());
        self.segmented = segmented;
        self
    }

    /// Fills the table. Spans of `prefix` are fixed and the search resumes
    /// right after its last span.
    pub fn run(&self, prefix: &[(usize, usize, usize)]) -> Table {
        let len = self.cache.len();
        let n = self.graph.num_states();
        let mut entries = vec![vec![Vec::<Soln>::new(); n]; len];
        let first = prefix.last().map_or(0, |&(_, end, _)| end + 1);
        if let Some(&(start, end, y)) = prefix.last() {
            let score = path_score_open(self.graph, self.cache, prefix);
            if score != LOG0 {
                entries[end][y].push(Soln {
                    score,
                    start,
                    link: Link::Prefix,
                });
            }
        }
        let mut labels = vec![];
        for end in first..len {
            let (before, after) = entries.split_at_mut(end);
            let current = &mut after[0];
            for span in self.cache.ending_at(end) {
                if span.start < first {
                    continue;
                }
                if span.start == 0 {
                    for y in 0..n {
                        if self.graph.is_start_state(y) {
                            let soln = Soln {
                                score: span.r[y],
                                start: 0,
                                link: Link::Start,
                            };
                            insert(&mut current[y], self.beam, soln);
                        }
                    }
                    continue;
                }
                let pe = span.start - 1;
                for &(yp, y) in self.graph.edges() {
                    let t = self.cache.transition(span, yp, y) + span.r[y];
                    if t == LOG0 {
                        continue;
                    }
                    for (rank, prev) in before[pe][yp].iter().enumerate() {
                        if let Some(constraints) = self.constraints {
                            chain_labels(self.graph, before, prefix, pe, yp, rank, &mut labels);
                            let prev_label = (!self.segmented).then(|| self.graph.label(yp));
                            if !constraints.admits(labels.iter().copied(), self.graph.label(y), prev_label) {
                                continue;
                            }
                        }
                        let soln = Soln {
                            score: prev.score + t,
                            start: span.start,
                            link: Link::Prev {
                                end: pe,
                                state: yp,
                                rank,
                            },
                        };
                        if !insert(&mut current[y], self.beam, soln) && self.constraints.is_none() {
                            break;
                        }
                    }
                }
            }
        }
        let mut finals: Vec<(f64, usize, usize)> = vec![];
        if let Some(last) = entries.last() {
            for (y, beam) in last.iter().enumerate() {
                if !self.graph.is_end_state(y) {
                    continue;
                }
                for (rank, soln) in beam.iter().enumerate() {
                    if soln.score == LOG0 {
                        continue;
                    }
                    let pos = finals.partition_point(|f| f.0 >= soln.score);
                    if pos < self.beam {
                        finals.insert(pos, (soln.score, y, rank));
                        finals.truncate(self.beam);
                    }
                }
            }
        }
        Table {
            entries,
            finals,
            prefix: prefix.to_vec(),
        }
    }

    /// Best path, if any complete path exists.
    pub fn best(&self) -> Option<(f64, Path)> {
        self.run(&[]).path(0)
    }
}

/// Score of a path prefix, without the end state check.
fn path_score_open(graph: &Graph, cache: &TransitionCache, prefix: &[(usize, usize, usize)]) -> f64 {
    let mut score = 0.0;
    let mut prev: Option<usize> = None;
    for &(start, end, y) in prefix {
        let Some(span) = cache.span(start, end) else {
            return LOG0;
        };
        score += span.r[y];
        match prev {
            Some(p) => score += cache.transition(span, p, y),
            None if !graph.is_start_state(y) => return LOG0,
            None => (),
        }
        prev = Some(y);
    }
    score
}

/// Exact completion scores for heuristic search.
pub(crate) struct Bounds {
    /// `h[end][state]`: best score of the spans after a span ending at
    /// `end` in `state`, constraints ignored.
    pub h: Vec<Vec<f64>>,
    /// Best score of a complete path.
    pub best: f64,
}

impl Bounds {
    /// Backward max-product pass.
    pub fn backward(graph: &Graph, cache: &TransitionCache) -> Self {
        let len = cache.len();
        let n = graph.num_states();
        let mut h = vec![vec![LOG0; n]; len];
        let mut best = LOG0;
        if len == 0 {
            return Self { h, best: 0.0 };
        }
        for y in 0..n {
            if graph.is_end_state(y) {
                h[len - 1][y] = 0.0;
            }
        }
        for end in (0..len).rev() {
            for span in cache.ending_at(end) {
                if span.start == 0 {
                    for y in 0..n {
                        if graph.is_start_state(y) {
                            best = best.max(span.r[y] + h[end][y]);
                        }
                    }
                    continue;
                }
                let pe = span.start - 1;
                for &(yp, y) in graph.edges() {
                    let v = cache.transition(span, yp, y) + span.r[y] + h[end][y];
                    if v > h[pe][yp] {
                        h[pe][yp] = v;
                    }
                }
            }
        }
        Self { h, best }
    }
}
