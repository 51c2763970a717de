//! Input sequences.

/// A sequence of positions, each carrying an optional label.
///
/// Labels are internal state ids; `None` means the label is unknown and is
/// to be inferred.
pub trait DataSequence {
    /// Number of positions.
    fn len(&self) -> usize;

    /// Returns `true` if the sequence has no positions.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Label at position `i`.
    fn y(&self, i: usize) -> Option<usize>;

    /// Overwrites the label at position `i`.
    fn set_y(&mut self, i: usize, label: usize);

    /// Weight of this sequence in the training objective.
    fn weight(&self) -> f64 {
        1.0
    }
}

/// A sequence partitioned into labeled segments.
pub trait SegmentSequence: DataSequence {
    /// Last position of the segment starting at `start`, or `None` if no
    /// segment starts there.
    fn segment_end(&self, start: usize) -> Option<usize>;

    /// Labels the positions `start..=end` as one segment.
    fn set_segment(&mut self, start: usize, end: usize, label: usize);
}

/// A segmented sequence that enumerates the segments competing to end at
/// each position.
pub trait CandidateSegments: SegmentSequence {
    /// Number of candidate segments ending at `end`.
    fn num_candidates_ending_at(&self, end: usize) -> usize;

    /// Start of the `k`-th candidate segment ending at `end`.
    fn candidate_start(&self, end: usize, k: usize) -> usize;
}

/// A sequence of observations with one label per position.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelSequence<T> {
    observations: Vec<T>,
    labels: Vec<Option<usize>>,
    weight: f64,
}

impl<T> LabelSequence<T> {
    /// Creates a labeled sequence.
    ///
    /// # Panics
    ///
    /// Panics if the lengths differ.
    pub fn new(observations: Vec<T>, labels: &[usize]) -> Self {
        assert_eq!(observations.len(), labels.len());
        Self {
            observations,
            labels: labels.iter().copied().map(Some).collect(),
            weight: 1.0,
        }
    }

    /// Creates a sequence whose labels are all unknown.
    pub fn unlabeled(observations: Vec<T>) -> Self {
        let labels = vec![None; observations.len()];
        Self {
            observations,
            labels,
            weight: 1.0,
        }
    }

    /// Creates a sequence where `None` marks a position whose label is
    /// unknown.
    ///
    /// # Panics
    ///
    /// Panics if the lengths differ.
    pub fn partial(observations: Vec<T>, labels: &[Option<usize>]) -> Self {
        assert_eq!(observations.len(), labels.len());
        Self {
            observations,
            labels: labels.to_vec(),
            weight: 1.0,
        }
    }

    /// Sets the instance weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Observation at each position.
    pub fn observations(&self) -> &[T] {
        &self.observations
    }

    /// Label at each position.
    pub fn labels(&self) -> &[Option<usize>] {
        &self.labels
    }

    /// Clears every label.
    pub fn clear_labels(&mut self) {
        self.labels.fill(None);
    }
}

impl<T> DataSequence for LabelSequence<T> {
    fn len(&self) -> usize {
        self.observations.len()
    }

    fn y(&self, i: usize) -> Option<usize> {
        self.labels[i]
    }

    fn set_y(&mut self, i: usize, label: usize) {
        self.labels[i] = Some(label);
    }

    fn weight(&self) -> f64 {
        self.weight
    }
}

/// Candidate segments of a [`SegmentedSequence`].
#[derive(Clone, Debug, PartialEq)]
enum Candidates {
    /// Every segment of at most this length.
    Bounded(usize),

    /// Explicit starts per end position.
    Explicit(Vec<Vec<usize>>),
}

/// A sequence of observations partitioned into labeled segments.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentedSequence<T> {
    observations: Vec<T>,
    labels: Vec<Option<usize>>,
    ends: Vec<Option<usize>>,
    candidates: Candidates,
    weight: f64,
}

impl<T> SegmentedSequence<T> {
    /// Creates a segmented sequence from `(start, end, label)` triples.
    ///
    /// Candidates are all segments up to `max_len` positions long.
    ///
    /// # Panics
    ///
    /// Panics if the segments do not tile the sequence.
    pub fn new(observations: Vec<T>, segments: &[(usize, usize, usize)], max_len: usize) -> Self {
        let mut seq = Self::unlabeled(observations, max_len);
        let mut next = 0;
        for &(start, end, label) in segments {
            assert_eq!(next, start, "segments must tile the sequence");
            assert!(start <= end);
            seq.set_segment(start, end, label);
            next = end + 1;
        }
        assert_eq!(next, seq.observations.len(), "segments must tile the sequence");
        seq
    }

    /// Creates an unsegmented sequence whose candidates are all segments up
    /// to `max_len` positions long.
    pub fn unlabeled(observations: Vec<T>, max_len: usize) -> Self {
        let n = observations.len();
        Self {
            observations,
            labels: vec![None; n],
            ends: vec![None; n],
            candidates: Candidates::Bounded(max_len.max(1)),
            weight: 1.0,
        }
    }

    /// Replaces the candidates with explicit start lists, one per end
    /// position. Starts are expected in decreasing order.
    ///
    /// # Panics
    ///
    /// Panics if the list length differs from the sequence length or a
    /// start lies after its end.
    pub fn with_candidates(mut self, starts: Vec<Vec<usize>>) -> Self {
        assert_eq!(starts.len(), self.observations.len());
        for (end, s) in starts.iter().enumerate() {
            assert!(s.iter().all(|&start| start <= end));
        }
        self.candidates = Candidates::Explicit(starts);
        self
    }

    /// Sets the instance weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Observation at each position.
    pub fn observations(&self) -> &[T] {
        &self.observations
    }

    /// Returns the labeled segments as `(start, end, label)` triples.
    pub fn segments(&self) -> Vec<(usize, usize, usize)> {
        let mut segments = vec![];
        let mut start = 0;
        while start < self.observations.len() {
            let Some(end) = self.ends[start] else {
                start += 1;
                continue;
            };
            if let Some(label) = self.labels[start] {
                segments.push((start, end, label));
            }
            start = end + 1;
        }
        segments
    }
}

impl<T> DataSequence for SegmentedSequence<T> {
    fn len(&self) -> usize {
        self.observations.len()
    }

    fn y(&self, i: usize) -> Option<usize> {
        self.labels[i]
    }

    fn set_y(&mut self, i: usize, label: usize) {
        self.labels[i] = Some(label);
    }

    fn weight(&self) -> f64 {
        self.weight
    }
}

impl<T> SegmentSequence for SegmentedSequence<T> {
    fn segment_end(&self, start: usize) -> Option<usize> {
        self.ends[start]
    }

    fn set_segment(&mut self, start: usize, end: usize, label: usize) {
        for i in start..=end {
            self.labels[i] = Some(label);
            self.ends[i] = None;
        }
        self.ends[start] = Some(end);
    }
}

impl<T> CandidateSegments for SegmentedSequence<T> {
    fn num_candidates_ending_at(&self, end: usize) -> usize {
        match &self.candidates {
            Candidates::Bounded(max_len) => (*max_len).min(end + 1),
            Candidates::Explicit(starts) => starts[end].len(),
        }
    }

    fn candidate_start(&self, end: usize, k: usize) -> usize {
        match &self.candidates {
            Candidates::Bounded(_) => end - k,
            Candidates::Explicit(starts) => starts[end][k],
        }
    }
}
