//! Span views over input sequences.
//!
//! Every dynamic program in the crate walks spans `start..=end` grouped by
//! their end position. A plain chain is the special case where each
//! position is the only span ending there.

use crate::feature::{Feature, FeatureGenerator};
use crate::sequence::{CandidateSegments, DataSequence, SegmentSequence};

pub(crate) trait SpanView {
    type Seq: ?Sized;

    /// Spans carry a single state each and may be longer than one position.
    const SEGMENTED: bool;

    fn seq(&self) -> &Self::Seq;

    fn len(&self) -> usize;

    fn num_ending_at(&self, end: usize) -> usize;

    fn start(&self, end: usize, k: usize) -> usize;

    /// Gold state of `start..=end` if that span is part of the gold path.
    fn gold_state(&self, start: usize, end: usize) -> Option<usize>;

    /// Gold state covering `pos`.
    fn state_at(&self, pos: usize) -> Option<usize>;

    fn weight(&self) -> f64;

    /// Stable id used to key feature caches.
    fn id(&self) -> Option<usize>;

    fn scan<G: FeatureGenerator<Self::Seq>>(
        &self,
        features: &G,
        start: usize,
        end: usize,
        f: &mut dyn FnMut(Feature),
    ) {
        match self.id() {
            Some(id) => features.scan_by_id(id, self.seq(), start, end, f),
            None => features.scan(self.seq(), start, end, f),
        }
    }

    /// Gold path as `(start, end, state)`, or `None` if a position is
    /// unlabeled or a gold span is not among the candidates.
    fn gold_path(&self) -> Option<Vec<(usize, usize, usize)>> {
        let mut path = vec![];
        let mut ends_at = vec![None; self.len()];
        for end in 0..self.len() {
            for k in 0..self.num_ending_at(end) {
                let start = self.start(end, k);
                if let Some(state) = self.gold_state(start, end) {
                    ends_at[start] = Some((end, state));
                }
            }
        }
        let mut start = 0;
        while start < self.len() {
            let (end, state) = ends_at[start]?;
            path.push((start, end, state));
            start = end + 1;
        }
        Some(path)
    }

    /// Candidate ends of the spans starting at each position, ascending.
    fn ends_by_start(&self) -> Vec<Vec<usize>> {
        let mut ends = vec![vec![]; self.len()];
        for end in 0..self.len() {
            for k in 0..self.num_ending_at(end) {
                ends[self.start(end, k)].push(end);
            }
        }
        ends
    }
}

/// One span per position.
pub(crate) struct UnitSpans<'a, S: ?Sized> {
    seq: &'a S,
    id: Option<usize>,
}

impl<'a, S: DataSequence + ?Sized> UnitSpans<'a, S> {
    pub fn new(seq: &'a S) -> Self {
        Self { seq, id: None }
    }

    pub fn with_id(seq: &'a S, id: usize) -> Self {
        Self { seq, id: Some(id) }
    }
}

impl<S: DataSequence + ?Sized> SpanView for UnitSpans<'_, S> {
    type Seq = S;

    const SEGMENTED: bool = false;

    #[inline(always)]
    fn seq(&self) -> &S {
        self.seq
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.seq.len()
    }

    #[inline(always)]
    fn num_ending_at(&self, _end: usize) -> usize {
        1
    }

    #[inline(always)]
    fn start(&self, end: usize, _k: usize) -> usize {
        end
    }

    fn gold_state(&self, start: usize, end: usize) -> Option<usize> {
        if start == end {
            self.seq.y(start)
        } else {
            None
        }
    }

    fn state_at(&self, pos: usize) -> Option<usize> {
        self.seq.y(pos)
    }

    fn weight(&self) -> f64 {
        self.seq.weight()
    }

    fn id(&self) -> Option<usize> {
        self.id
    }
}

/// Spans enumerated by the sequence itself.
pub(crate) struct CandidateSpans<'a, S: ?Sized> {
    seq: &'a S,
    id: Option<usize>,
}

impl<'a, S: CandidateSegments + ?Sized> CandidateSpans<'a, S> {
    pub fn new(seq: &'a S) -> Self {
        Self { seq, id: None }
    }

    pub fn with_id(seq: &'a S, id: usize) -> Self {
        Self { seq, id: Some(id) }
    }
}

fn gold_segment<S: SegmentSequence + ?Sized>(seq: &S, start: usize, end: usize) -> Option<usize> {
    if seq.segment_end(start) == Some(end) {
        seq.y(start)
    } else {
        None
    }
}

impl<S: CandidateSegments + ?Sized> SpanView for CandidateSpans<'_, S> {
    type Seq = S;

    const SEGMENTED: bool = true;

    #[inline(always)]
    fn seq(&self) -> &S {
        self.seq
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.seq.len()
    }

    #[inline(always)]
    fn num_ending_at(&self, end: usize) -> usize {
        self.seq.num_candidates_ending_at(end)
    }

    #[inline(always)]
    fn start(&self, end: usize, k: usize) -> usize {
        self.seq.candidate_start(end, k)
    }

    fn gold_state(&self, start: usize, end: usize) -> Option<usize> {
        gold_segment(self.seq, start, end)
    }

    fn state_at(&self, pos: usize) -> Option<usize> {
        self.seq.y(pos)
    }

    fn weight(&self) -> f64 {
        self.seq.weight()
    }

    fn id(&self) -> Option<usize> {
        self.id
    }
}

/// Every span of at most `max_len` positions.
pub(crate) struct BoundedSpans<'a, S: ?Sized> {
    seq: &'a S,
    max_len: usize,
    id: Option<usize>,
}

impl<'a, S: SegmentSequence + ?Sized> BoundedSpans<'a, S> {
    pub fn new(seq: &'a S, max_len: usize) -> Self {
        Self {
            seq,
            max_len: max_len.max(1),
            id: None,
        }
    }

    pub fn with_id(seq: &'a S, max_len: usize, id: usize) -> Self {
        Self {
            seq,
            max_len: max_len.max(1),
            id: Some(id),
        }
    }
}

impl<S: SegmentSequence + ?Sized> SpanView for BoundedSpans<'_, S> {
    type Seq = S;

    const SEGMENTED: bool = true;

    #[inline(always)]
    fn seq(&self) -> &S {
        self.seq
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.seq.len()
    }

    #[inline(always)]
    fn num_ending_at(&self, end: usize) -> usize {
        self.max_len.min(end + 1)
    }

    #[inline(always)]
    fn start(&self, end: usize, k: usize) -> usize {
        end - k
    }

    fn gold_state(&self, start: usize, end: usize) -> Option<usize> {
        gold_segment(self.seq, start, end)
    }

    fn state_at(&self, pos: usize) -> Option<usize> {
        self.seq.y(pos)
    }

    fn weight(&self) -> f64 {
        self.seq.weight()
    }

    fn id(&self) -> Option<usize> {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sequence::{LabelSequence, SegmentedSequence};

    #[test]
    fn test_unit_spans() {
        let seq = LabelSequence::new(vec![(); 3], &[1, 0, 1]);
        let view = UnitSpans::new(&seq);
        assert_eq!(1, view.num_ending_at(2));
        assert_eq!(Some(0), view.gold_state(1, 1));
        assert_eq!(None, view.gold_state(0, 1));
        assert_eq!(Some(vec![(0, 0, 1), (1, 1, 0), (2, 2, 1)]), view.gold_path());
        assert_eq!(vec![vec![0], vec![1], vec![2]], view.ends_by_start());
    }

    #[test]
    fn test_candidate_spans() {
        let seq = SegmentedSequence::new(vec![(); 4], &[(0, 1, 0), (2, 3, 1)], 2);
        let view = CandidateSpans::with_id(&seq, 3);
        assert_eq!(Some(3), view.id());
        assert_eq!(2, view.num_ending_at(3));
        assert_eq!(Some(0), view.gold_state(0, 1));
        assert_eq!(None, view.gold_state(1, 1));
        assert_eq!(Some(vec![(0, 1, 0), (2, 3, 1)]), view.gold_path());
        assert_eq!(vec![vec![0, 1], vec![1, 2], vec![2, 3], vec![3]], view.ends_by_start());
    }

    #[test]
    fn test_gold_outside_candidates() {
        let seq = SegmentedSequence::new(vec![(); 3], &[(0, 2, 0)], 3)
            .with_candidates(vec![vec![0], vec![1, 0], vec![2, 1]]);
        assert_eq!(None, CandidateSpans::new(&seq).gold_path());
        assert!(BoundedSpans::new(&seq, 3).gold_path().is_some());
        assert!(BoundedSpans::new(&seq, 2).gold_path().is_none());
    }
}
