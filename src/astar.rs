//! Best-first decoding under label exclusions.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::constraints::Constraints;
use crate::math::LOG0;
use crate::topology::Graph;
use crate::transition::TransitionCache;
use crate::viterbi::{Bounds, Path, Viterbi};

/// Slack on score comparisons against the lower bound.
const PRUNE_DELTA: f64 = 0.001;

/// Expansions between two bound updates.
const BOUND_UPDATE_INTERVAL: usize = 50;

/// Knobs of [`AStar`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct SearchLimits {
    pub max_expansions: usize,
    pub queue_size_limit: usize,
    pub bound_update: bool,
    pub forward_beam: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_expansions: 100_000,
            queue_size_limit: 100_000,
            bound_update: false,
            forward_beam: 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Node {
    end: usize,
    start: usize,
    state: usize,
    g: f64,
    h: f64,
    pred: Option<usize>,
}

#[derive(Clone, Copy, Debug)]
struct Frontier {
    f: f64,
    node: usize,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f
            .total_cmp(&other.f)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// A* over `(end, state)` nodes with the backward max-product scores as
/// an exact heuristic for the unconstrained problem.
///
/// A feasible path found by constrained beam Viterbi serves as the lower
/// bound; nodes that cannot beat it are dropped. When the budget runs out
/// the search hands over to constrained Viterbi from the best open node.
pub(crate) struct AStar<'a> {
    graph: &'a Graph,
    cache: &'a TransitionCache,
    constraints: Option<&'a Constraints>,
    segmented: bool,
    limits: SearchLimits,
}

impl<'a> AStar<'a> {
    pub fn new(graph: &'a Graph, cache: &'a TransitionCache, limits: SearchLimits) -> Self {
        Self {
            graph,
            cache,
            constraints: None,
            segmented: false,
            limits,
        }
    }

    pub fn constrained(mut self, constraints: Option<&'a Constraints>, segmented: bool) -> Self {
        self.constraints = constraints.filter(|c| !c.is_empty());
        self.segmented = segmented;
        self
    }

    fn viterbi(&self) -> Viterbi<'a> {
        Viterbi::new(self.graph, self.cache, self.limits.forward_beam).constrained(self.constraints, self.segmented)
    }

    /// Best path satisfying the constraints. Falls back to unconstrained
    /// Viterbi with a warning if no feasible path was found.
    pub fn search(&self) -> Option<(f64, Path)> {
        if self.cache.len() == 0 {
            return Some((0.0, vec![]));
        }
        if let Some(found) = self.search_feasible() {
            return Some(found);
        }
        log::warn!("no path satisfies the constraints; decoding without them");
        Viterbi::new(self.graph, self.cache, 1).best()
    }

    fn search_feasible(&self) -> Option<(f64, Path)> {
        if self.constraints.is_none() {
            // the heuristic is exact, so the search would only retrace it
            return Viterbi::new(self.graph, self.cache, 1).best();
        }
        self.best_first(self.viterbi().best())
    }

    /// Heap search over span-end nodes. `seed` is a known path whose score
    /// serves as the initial lower bound.
    fn best_first(&self, seed: Option<(f64, Path)>) -> Option<(f64, Path)> {
        let len = self.cache.len();
        let bounds = Bounds::backward(self.graph, self.cache);
        let mut best = seed;
        let mut lb = best.as_ref().map_or(LOG0, |b| b.0);
        if bounds.best <= lb + PRUNE_DELTA {
            return best;
        }

        let mut starts_at: Vec<Vec<usize>> = vec![vec![]; len];
        for end in 0..len {
            for span in self.cache.ending_at(end) {
                starts_at[span.start].push(end);
            }
        }

        let mut arena: Vec<Node> = vec![];
        let mut heap = BinaryHeap::new();
        for &end in &starts_at[0] {
            let Some(span) = self.cache.span(0, end) else {
                continue;
            };
            for y in 0..self.graph.num_states() {
                if !self.graph.is_start_state(y) {
                    continue;
                }
                let node = Node {
                    end,
                    start: 0,
                    state: y,
                    g: span.r[y],
                    h: bounds.h[end][y],
                    pred: None,
                };
                if node.g + node.h + PRUNE_DELTA < lb {
                    continue;
                }
                arena.push(node);
                heap.push(Frontier {
                    f: node.g + node.h,
                    node: arena.len() - 1,
                });
            }
        }

        let mut labels = vec![];
        let mut expansions = 0;
        while let Some(Frontier { f, node: id }) = heap.pop() {
            if f + PRUNE_DELTA < lb {
                break;
            }
            let node = arena[id];
            if node.end == len - 1 {
                if self.graph.is_end_state(node.state) {
                    log::debug!("A* reached the goal after {expansions} expansions");
                    return Some((node.g, self.backtrack(&arena, id)));
                }
                continue;
            }
            expansions += 1;
            if expansions > self.limits.max_expansions || heap.len() > self.limits.queue_size_limit {
                log::warn!(
                    "A* budget exhausted after {expansions} expansions with {} open nodes; falling back to Viterbi",
                    heap.len()
                );
                let prefix = self.backtrack(&arena, id);
                let resumed = self.viterbi().run(&prefix).path(0);
                return better(resumed, best);
            }
            if self.limits.bound_update && expansions % BOUND_UPDATE_INTERVAL == 0 {
                let prefix = self.backtrack(&arena, id);
                if let Some(found) = self.viterbi().run(&prefix).path(0) {
                    if found.0 > lb {
                        log::debug!("lower bound raised from {lb} to {}", found.0);
                        lb = found.0;
                        best = Some(found);
                    }
                }
            }

            self.collect_labels(&arena, id, &mut labels);
            let start = node.end + 1;
            for &end in &starts_at[start] {
                let Some(span) = self.cache.span(start, end) else {
                    continue;
                };
                for &(yp, y) in self.graph.edges() {
                    if yp != node.state {
                        continue;
                    }
                    let step = self.cache.transition(span, yp, y) + span.r[y];
                    if step == LOG0 {
                        continue;
                    }
                    if let Some(constraints) = self.constraints {
                        let prev = (!self.segmented).then(|| self.graph.label(yp));
                        if !constraints.admits(labels.iter().copied(), self.graph.label(y), prev) {
                            continue;
                        }
                    }
                    let child = Node {
                        end,
                        start,
                        state: y,
                        g: node.g + step,
                        h: bounds.h[end][y],
                        pred: Some(id),
                    };
                    if child.g + child.h + PRUNE_DELTA < lb {
                        continue;
                    }
                    arena.push(child);
                    heap.push(Frontier {
                        f: child.g + child.h,
                        node: arena.len() - 1,
                    });
                }
            }
        }
        log::debug!("A* closed without beating the lower bound after {expansions} expansions");
        best
    }

    fn collect_labels(&self, arena: &[Node], mut id: usize, out: &mut Vec<usize>) {
        out.clear();
        loop {
            out.push(self.graph.label(arena[id].state));
            match arena[id].pred {
                Some(p) => id = p,
                None => return,
            }
        }
    }

    fn backtrack(&self, arena: &[Node], mut id: usize) -> Path {
        let mut path = vec![];
        loop {
            let node = &arena[id];
            path.push((node.start, node.end, node.state));
            match node.pred {
                Some(p) => id = p,
                None => break,
            }
        }
        path.reverse();
        path
    }
}

fn better(a: Option<(f64, Path)>, b: Option<(f64, Path)>) -> Option<(f64, Path)> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.0 > a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::feature::FeatureSpace;
    use crate::viterbi::path_score;
    use crate::sequence::{LabelSequence, SegmentedSequence};
    use crate::span::{CandidateSpans, UnitSpans};
    use crate::test_utils::{all_paths, best_path, toy_weights, ToyFeatures};

    fn plain_cache(graph: &Graph, seed: u64, obs: Vec<u8>) -> TransitionCache {
        let features = ToyFeatures::new(graph.num_states(), 3);
        let weights = toy_weights(features.num_features(), seed);
        let seq = LabelSequence::unlabeled(obs);
        TransitionCache::build(graph, &features, &weights, &UnitSpans::new(&seq), false)
    }

    fn best_feasible(graph: &Graph, cache: &TransitionCache, c: &Constraints, segmented: bool) -> Option<f64> {
        all_paths(graph, cache)
            .into_iter()
            .filter(|(_, p)| {
                let labels: Vec<usize> = p.iter().map(|&(_, _, y)| graph.label(y)).collect();
                c.satisfied_by(&labels, segmented)
            })
            .map(|p| p.0)
            .max_by(f64::total_cmp)
    }

    #[test]
    fn test_unconstrained_matches_viterbi() {
        for seed in 1..6 {
            let graph = Graph::complete(3);
            let cache = plain_cache(&graph, seed, vec![0, 1, 2, 1, 0]);
            let (score, path) = AStar::new(&graph, &cache, SearchLimits::default()).search().unwrap();
            let (expected, expected_path) = Viterbi::new(&graph, &cache, 1).best().unwrap();
            assert_eq!(expected_path, path);
            assert!((expected - score).abs() < 1e-12);
        }
    }

    #[test]
    fn test_best_first_without_seed() {
        for (seed, spec) in [(1, "naive"), (2, "naiveNoLoop"), (3, "naive,BI*")] {
            let graph = Graph::new(3, spec).unwrap();
            let cache = plain_cache(&graph, seed, vec![0, 1, 2, 1, 0, 2]);
            let (score, path) = AStar::new(&graph, &cache, SearchLimits::default())
                .best_first(None)
                .unwrap();
            let (expected, expected_path) = best_path(&graph, &cache);
            assert!((expected - score).abs() < 1e-9, "{spec}");
            assert_eq!(expected_path, path, "{spec}");
            assert!((path_score(&graph, &cache, &path) - score).abs() < 1e-9);
        }

        let graph = Graph::complete(2);
        let features = ToyFeatures::new(2, 2);
        let weights = toy_weights(features.num_features(), 5);
        let seq = SegmentedSequence::unlabeled(vec![1u8, 0, 0, 1, 1], 3);
        let cache = TransitionCache::build(&graph, &features, &weights, &CandidateSpans::new(&seq), false);
        let (score, path) = AStar::new(&graph, &cache, SearchLimits::default())
            .best_first(None)
            .unwrap();
        let (expected, expected_path) = best_path(&graph, &cache);
        assert!((expected - score).abs() < 1e-9);
        assert_eq!(expected_path, path);
    }

    #[test]
    fn test_constrained_is_optimal() {
        let constraints = Constraints::new().disallow(0, 2).disallow(1, 1);
        for seed in 1..8 {
            let graph = Graph::complete(3);
            let cache = plain_cache(&graph, seed, vec![2, 0, 1, 2, 0]);
            let (score, path) = AStar::new(&graph, &cache, SearchLimits::default())
                .constrained(Some(&constraints), false)
                .search()
                .unwrap();
            let labels: Vec<usize> = path.iter().map(|&(_, _, y)| y).collect();
            assert!(constraints.satisfied_by(&labels, false), "seed {seed}");
            let expected = best_feasible(&graph, &cache, &constraints, false).unwrap();
            assert!((expected - score).abs() < 1e-9, "seed {seed}");

            let (free, _) = best_path(&graph, &cache);
            assert!(score <= free + 1e-9);
        }
    }

    #[test]
    fn test_budget_fallback_is_feasible() {
        let constraints = Constraints::new().disallow(0, 0);
        let graph = Graph::complete(2);
        let cache = plain_cache(&graph, 3, vec![0, 0, 1, 0, 0, 1]);
        let limits = SearchLimits {
            max_expansions: 2,
            ..SearchLimits::default()
        };
        let (score, path) = AStar::new(&graph, &cache, limits)
            .constrained(Some(&constraints), false)
            .search()
            .unwrap();
        let labels: Vec<usize> = path.iter().map(|&(_, _, y)| y).collect();
        assert!(constraints.satisfied_by(&labels, false));
        assert_eq!(6, path.len());
        assert!((path_score(&graph, &cache, &path) - score).abs() < 1e-9);
    }

    #[test]
    fn test_bound_update_keeps_optimum() {
        let constraints = Constraints::new().disallow(0, 1);
        let graph = Graph::complete(3);
        let cache = plain_cache(&graph, 11, vec![0, 1, 2, 0, 1, 2, 0]);
        let limits = SearchLimits {
            bound_update: true,
            ..SearchLimits::default()
        };
        let (score, _) = AStar::new(&graph, &cache, limits)
            .constrained(Some(&constraints), false)
            .search()
            .unwrap();
        let expected = best_feasible(&graph, &cache, &constraints, false).unwrap();
        assert!((expected - score).abs() < 1e-9);
    }

    #[test]
    fn test_segments() {
        let graph = Graph::complete(3);
        let features = ToyFeatures::new(3, 2);
        let weights = toy_weights(features.num_features(), 29);
        let seq = SegmentedSequence::unlabeled(vec![0u8, 1, 1, 0], 2);
        let cache = TransitionCache::build(&graph, &features, &weights, &CandidateSpans::new(&seq), false);
        let constraints = Constraints::new().disallow(1, 1);
        let (score, path) = AStar::new(&graph, &cache, SearchLimits::default())
            .constrained(Some(&constraints), true)
            .search()
            .unwrap();
        let labels: Vec<usize> = path.iter().map(|&(_, _, y)| y).collect();
        assert!(constraints.satisfied_by(&labels, true));
        let expected = best_feasible(&graph, &cache, &constraints, true).unwrap();
        assert!((expected - score).abs() < 1e-9);
    }
}
