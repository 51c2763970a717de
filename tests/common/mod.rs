#![allow(dead_code)]

use segcrf::{Feature, FeatureGenerator, FeatureSpace, LabelSequence, SegmentedSequence};

/// Indicator features over small integer observations: one per
/// `(observation, label)` pair and one per label bigram.
pub struct Indicators {
    pub num_labels: usize,
    pub num_obs: usize,
}

impl Indicators {
    pub fn new(num_labels: usize, num_obs: usize) -> Self {
        Self { num_labels, num_obs }
    }

    fn scan_obs(&self, obs: &[u8], start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        let n = self.num_labels;
        for y in 0..n {
            for &o in &obs[start..=end] {
                f(Feature::state(usize::from(o) * n + y, y, 1.0));
            }
            if start > 0 {
                for y_prev in 0..n {
                    f(Feature::transition(self.num_obs * n + y_prev * n + y, y_prev, y, 1.0));
                }
            }
        }
    }
}

impl FeatureSpace for Indicators {
    fn num_features(&self) -> usize {
        self.num_obs * self.num_labels + self.num_labels * self.num_labels
    }
}

impl FeatureGenerator<LabelSequence<u8>> for Indicators {
    fn scan(&self, seq: &LabelSequence<u8>, start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        self.scan_obs(seq.observations(), start, end, f);
    }
}

impl FeatureGenerator<SegmentedSequence<u8>> for Indicators {
    fn scan(&self, seq: &SegmentedSequence<u8>, start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        self.scan_obs(seq.observations(), start, end, f);
    }
}

/// Sequences whose observation at each position is its label.
pub fn separable() -> Vec<LabelSequence<u8>> {
    [
        vec![0u8, 1, 1, 0, 2],
        vec![2u8, 2, 0, 1],
        vec![1u8, 0, 2, 2, 1, 0],
        vec![0u8, 0, 1],
    ]
    .into_iter()
    .map(|obs| {
        let labels: Vec<usize> = obs.iter().map(|&o| usize::from(o)).collect();
        LabelSequence::new(obs, &labels)
    })
    .collect()
}

pub fn labels<T>(seq: &LabelSequence<T>) -> Vec<usize> {
    seq.labels().iter().map(|l| l.unwrap()).collect()
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
