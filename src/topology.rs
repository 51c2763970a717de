//! Label graphs.
//!
//! A [`Graph`] maps the logical labels assigned by the user to the internal
//! states the dynamic programs run over, and restricts which state may
//! follow which.

use bincode::{Decode, Encode};

use crate::errors::{CrfError, Result};
use crate::sequence::DataSequence;

/// State graph of a single label, with label-local state ids.
#[derive(Clone, Debug, Decode, Encode, PartialEq, Eq)]
struct LabelGraph {
    num_states: usize,
    edges: Vec<(usize, usize)>,
    starts: Vec<usize>,
    ends: Vec<usize>,
}

impl LabelGraph {
    fn single() -> Self {
        Self {
            num_states: 1,
            edges: vec![(0, 0)],
            starts: vec![0],
            ends: vec![0],
        }
    }

    /// One state without a loop; repeats are left to the outer graph.
    fn bare() -> Self {
        Self {
            edges: vec![],
            ..Self::single()
        }
    }

    fn parse(spec: &str) -> Result<Self> {
        let unknown = || CrfError::UnknownTopology(spec.to_string());
        let mut graph = match spec {
            "naive" => Self::single(),
            "boundary" | "BCEU" => Self {
                num_states: 4,
                edges: vec![(1, 2), (1, 3), (2, 2), (2, 3)],
                starts: vec![0, 1],
                ends: vec![0, 3],
            },
            "BCE" => Self {
                num_states: 3,
                edges: vec![(0, 1), (0, 2), (1, 1), (1, 2)],
                starts: vec![0],
                ends: vec![0, 2],
            },
            "BI" => Self {
                num_states: 2,
                edges: vec![(0, 1), (1, 1)],
                starts: vec![0],
                ends: vec![0, 1],
            },
            _ => {
                let (len, kind) = spec.split_once('-').ok_or_else(unknown)?;
                let len: usize = len.parse().map_err(|_| unknown())?;
                if len == 0 {
                    return Err(unknown());
                }
                match kind {
                    "chain" | "long" => Self::chain(len),
                    "parallel" => Self::parallel(len),
                    _ => return Err(unknown()),
                }
            }
        };
        graph.edges.sort_unstable();
        graph.edges.dedup();
        Ok(graph)
    }

    /// States `0..len` in a row; the second to last loops and every state
    /// may jump to the last one.
    fn chain(len: usize) -> Self {
        if len == 1 {
            return Self::single();
        }
        let mut edges = Vec::with_capacity(2 * (len - 1));
        for i in 0..len - 1 {
            edges.push((i, i + 1));
            edges.push((i, len - 1));
        }
        if let Some(last) = edges.last_mut() {
            *last = (len - 2, len - 2);
        }
        Self {
            num_states: len,
            edges,
            starts: vec![0],
            ends: vec![0, len - 1],
        }
    }

    /// Branches of lengths `1..=len` side by side.
    fn parallel(len: usize) -> Self {
        let num_states = len * (len + 1) / 2;
        let mut edges = vec![];
        let mut starts = vec![];
        let mut ends = vec![];
        let mut node = 0;
        for i in 0..len {
            node += i;
            for j in 0..i {
                edges.push((node + j, node + j + 1));
            }
            starts.push(node);
            ends.push(node + i);
        }
        if num_states >= 2 {
            edges.push((num_states - 2, num_states - 2));
        }
        Self {
            num_states,
            edges,
            starts,
            ends,
        }
    }

    /// First state path of length `len` in start state and edge order.
    fn path(&self, len: usize) -> Option<Vec<usize>> {
        if len == 0 {
            return None;
        }
        // reach[k][s]: an end state is reachable from s in exactly k steps.
        let mut reach = vec![vec![false; self.num_states]; len];
        for &s in &self.ends {
            reach[0][s] = true;
        }
        for k in 1..len {
            for &(from, to) in &self.edges {
                if reach[k - 1][to] {
                    reach[k][from] = true;
                }
            }
        }
        let mut state = *self.starts.iter().find(|&&s| reach[len - 1][s])?;
        let mut path = Vec::with_capacity(len);
        path.push(state);
        for k in (0..len - 1).rev() {
            state = self
                .edges
                .iter()
                .find(|&&(from, to)| from == state && reach[k][to])?
                .1;
            path.push(state);
        }
        Some(path)
    }
}

/// Internal state graph over all labels.
#[derive(Clone, Debug, Decode, Encode, PartialEq, Eq)]
pub struct Graph {
    num_labels: usize,
    state_labels: Vec<usize>,
    label_offsets: Vec<usize>,
    inner: Vec<LabelGraph>,
    edges: Vec<(usize, usize)>,
    start_states: Vec<usize>,
    end_states: Vec<usize>,
    is_start: Vec<bool>,
    is_end: Vec<bool>,
    complete: bool,
}

impl Graph {
    /// Builds a graph from a topology name.
    ///
    /// Base graphs are `naive` (also `semi-markov`), `noEdge` and
    /// `naiveNoLoop`. Anything else is read as a nested specification
    /// `outer,inner1,inner2,...` where `outer` is a base graph over labels
    /// and each inner graph gives the states of one label. An inner spec
    /// ending in `*` is repeated for all remaining labels.
    ///
    /// # Errors
    ///
    /// [`CrfError::UnknownTopology`] is returned if the specification is not
    /// recognized.
    pub fn new(num_labels: usize, spec: &str) -> Result<Self> {
        if num_labels == 0 {
            return Err(CrfError::invalid_argument("num_labels must not be 0"));
        }
        if let Some(edges) = Self::base_edges(num_labels, spec) {
            let complete = edges.len() == num_labels * num_labels;
            let all: Vec<usize> = (0..num_labels).collect();
            let inner = if complete {
                LabelGraph::single()
            } else {
                LabelGraph::bare()
            };
            return Ok(Self::assemble(
                num_labels,
                vec![inner; num_labels],
                &edges,
                &all,
                &all,
                complete,
            ));
        }
        Self::nested(num_labels, spec)
    }

    /// Complete graph with one state per label.
    pub fn complete(num_labels: usize) -> Self {
        let all: Vec<usize> = (0..num_labels).collect();
        let edges = Self::base_edges(num_labels, "naive").unwrap_or_default();
        Self::assemble(
            num_labels,
            vec![LabelGraph::single(); num_labels],
            &edges,
            &all,
            &all,
            true,
        )
    }

    fn base_edges(num_labels: usize, spec: &str) -> Option<Vec<(usize, usize)>> {
        let pairs = (0..num_labels).flat_map(|i| (0..num_labels).map(move |j| (i, j)));
        if spec.eq_ignore_ascii_case("naive") || spec.eq_ignore_ascii_case("semi-markov") {
            Some(pairs.collect())
        } else if spec.eq_ignore_ascii_case("noEdge") {
            Some(vec![])
        } else if spec.eq_ignore_ascii_case("naiveNoLoop") {
            Some(pairs.filter(|(i, j)| i != j).collect())
        } else {
            None
        }
    }

    fn nested(num_labels: usize, spec: &str) -> Result<Self> {
        let unknown = || CrfError::UnknownTopology(spec.to_string());
        let mut tokens = spec.split(',');
        let outer = tokens
            .next()
            .and_then(|outer| Self::base_edges(num_labels, outer))
            .ok_or_else(unknown)?;
        let mut inner = Vec::with_capacity(num_labels);
        let mut common = None;
        for _ in 0..num_labels {
            let graph = match &common {
                Some(graph) => LabelGraph::clone(graph),
                None => {
                    let token = tokens.next().ok_or_else(unknown)?;
                    match token.strip_suffix('*') {
                        Some(token) => {
                            let graph = LabelGraph::parse(token)?;
                            common = Some(graph.clone());
                            graph
                        }
                        None => LabelGraph::parse(token)?,
                    }
                }
            };
            inner.push(graph);
        }
        if tokens.next().is_some() {
            return Err(unknown());
        }
        let all: Vec<usize> = (0..num_labels).collect();
        Ok(Self::assemble(num_labels, inner, &outer, &all, &all, false))
    }

    fn assemble(
        num_labels: usize,
        inner: Vec<LabelGraph>,
        outer_edges: &[(usize, usize)],
        outer_starts: &[usize],
        outer_ends: &[usize],
        complete: bool,
    ) -> Self {
        let mut label_offsets = Vec::with_capacity(num_labels + 1);
        let mut state_labels = vec![];
        for (label, g) in inner.iter().enumerate() {
            label_offsets.push(state_labels.len());
            state_labels.extend(core::iter::repeat(label).take(g.num_states));
        }
        label_offsets.push(state_labels.len());
        let num_states = state_labels.len();

        let mut edges = vec![];
        if complete {
            edges.extend_from_slice(outer_edges);
        } else {
            for (label, g) in inner.iter().enumerate() {
                let off = label_offsets[label];
                edges.extend(g.edges.iter().map(|&(a, b)| (a + off, b + off)));
            }
            for &(a, b) in outer_edges {
                for &e in &inner[a].ends {
                    for &s in &inner[b].starts {
                        edges.push((e + label_offsets[a], s + label_offsets[b]));
                    }
                }
            }
        }
        edges.sort_unstable();
        edges.dedup();

        let start_states: Vec<usize> = outer_starts
            .iter()
            .flat_map(|&l| inner[l].starts.iter().map(move |&s| (l, s)))
            .map(|(l, s)| s + label_offsets[l])
            .collect();
        let end_states: Vec<usize> = outer_ends
            .iter()
            .flat_map(|&l| inner[l].ends.iter().map(move |&s| (l, s)))
            .map(|(l, s)| s + label_offsets[l])
            .collect();
        let mut is_start = vec![false; num_states];
        let mut is_end = vec![false; num_states];
        start_states.iter().for_each(|&s| is_start[s] = true);
        end_states.iter().for_each(|&s| is_end[s] = true);

        Self {
            num_labels,
            state_labels,
            label_offsets,
            inner,
            edges,
            start_states,
            end_states,
            is_start,
            is_end,
            complete,
        }
    }

    /// Number of logical labels.
    #[inline(always)]
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Number of internal states.
    #[inline(always)]
    pub fn num_states(&self) -> usize {
        self.state_labels.len()
    }

    /// Number of allowed transitions.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Allowed transitions `(prev, curr)`, sorted.
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    /// Returns `true` if every state may follow every other state.
    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Edge list for the log-domain products, or `None` for a complete
    /// graph where every pair is visited anyway.
    #[inline(always)]
    pub fn edge_filter(&self) -> Option<&[(usize, usize)]> {
        (!self.complete).then_some(&self.edges)
    }

    /// Logical label of a state.
    #[inline(always)]
    pub fn label(&self, state: usize) -> usize {
        self.state_labels[state]
    }

    /// States allowed at the first position.
    pub fn start_states(&self) -> &[usize] {
        &self.start_states
    }

    /// States allowed at the last position.
    pub fn end_states(&self) -> &[usize] {
        &self.end_states
    }

    /// Returns `true` if `state` may begin a sequence.
    #[inline(always)]
    pub fn is_start_state(&self, state: usize) -> bool {
        self.is_start[state]
    }

    /// Returns `true` if `state` may end a sequence.
    #[inline(always)]
    pub fn is_end_state(&self, state: usize) -> bool {
        self.is_end[state]
    }

    /// Number of states of a label.
    pub fn num_label_states(&self, label: usize) -> usize {
        self.inner[label].num_states
    }

    /// First start state of a label.
    pub fn first_start_state(&self, label: usize) -> usize {
        self.label_offsets[label] + self.inner[label].starts.first().copied().unwrap_or(0)
    }

    /// Last end state of a label.
    pub fn last_end_state(&self, label: usize) -> usize {
        self.label_offsets[label] + self.inner[label].ends.last().copied().unwrap_or(0)
    }

    /// State path that a run of `len` positions with `label` takes.
    ///
    /// # Errors
    ///
    /// [`CrfError::NoPathInGraph`] is returned if no such path exists.
    pub fn states_for_length(&self, label: usize, len: usize) -> Result<Vec<usize>> {
        let off = self.label_offsets[label];
        let path = self.inner[label]
            .path(len)
            .ok_or(CrfError::NoPathInGraph { label, len })?;
        Ok(path.into_iter().map(|s| s + off).collect())
    }

    /// Rewrites the labels of a plain sequence into states. Each run of
    /// equal labels is mapped as one stretch of its label's graph.
    ///
    /// # Errors
    ///
    /// [`CrfError::NoPathInGraph`] is returned if a run has no state path.
    pub fn map_labels_to_states<S: DataSequence + ?Sized>(&self, seq: &mut S) -> Result<()> {
        if self.complete {
            return Ok(());
        }
        let mut start = 0;
        while start < seq.len() {
            let label = seq.y(start);
            let mut end = start + 1;
            while end < seq.len() && seq.y(end) == label {
                end += 1;
            }
            if let Some(label) = label {
                for (i, state) in self.states_for_length(label, end - start)?.into_iter().enumerate() {
                    seq.set_y(start + i, state);
                }
            }
            start = end;
        }
        Ok(())
    }

    /// Rewrites the states of a sequence into logical labels.
    pub fn map_states_to_labels<S: DataSequence + ?Sized>(&self, seq: &mut S) {
        if self.complete {
            return;
        }
        for i in 0..seq.len() {
            if let Some(state) = seq.y(i) {
                seq.set_y(i, self.label(state));
            }
        }
    }
}
