//! # segcrf
//!
//! Linear-chain and semi-Markov Conditional Random Fields, with beam
//! Viterbi and A* decoding under pairwise label exclusions.
//!
//! Features are supplied by the caller through [`FeatureGenerator`]; the
//! crate only sees `(index, state, previous state, value)` tuples per span.
#![cfg_attr(
    feature = "train",
    doc = "
## Examples

```rust
use segcrf::{Crf, Feature, FeatureGenerator, FeatureSpace, LabelSequence, Params};

// One indicator per (observation, label) pair and one per label bigram.
struct Indicators;

impl FeatureSpace for Indicators {
    fn num_features(&self) -> usize {
        2 * 2 + 2 * 2
    }
}

impl FeatureGenerator<LabelSequence<u8>> for Indicators {
    fn scan(&self, seq: &LabelSequence<u8>, start: usize, _end: usize, f: &mut dyn FnMut(Feature)) {
        let obs = usize::from(seq.observations()[start]);
        for y in 0..2 {
            f(Feature::state(obs * 2 + y, y, 1.0));
            if start > 0 {
                for y_prev in 0..2 {
                    f(Feature::transition(4 + y_prev * 2 + y, y_prev, y, 1.0));
                }
            }
        }
    }
}

let mut train = vec![
    LabelSequence::new(vec![0u8, 1, 1, 0], &[0, 1, 1, 0]),
    LabelSequence::new(vec![1u8, 0, 0], &[1, 0, 0]),
];
let params = Params::parse(\"maxIters 50\").unwrap();
let mut crf = Crf::new(2, Indicators, params).unwrap();
crf.train(&mut train, None).unwrap();

let mut seq = LabelSequence::unlabeled(vec![1u8, 1, 0]);
crf.apply(&mut seq).unwrap();
assert_eq!(&[Some(1), Some(1), Some(0)], seq.labels());
```
"
)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod astar;
mod constraints;
mod errors;
mod feature;
mod forward_backward;
mod inference;
mod math;
mod model;
mod params;
mod scratch;
mod segment;
mod sequence;
mod span;
mod topology;
mod transition;
mod viterbi;

#[cfg(feature = "train")]
mod trainer;

#[cfg(test)]
mod test_utils;

pub use constraints::Constraints;
pub use errors::{CrfError, Result};
pub use feature::{Feature, FeatureCache, FeatureGenerator, FeatureSpace};
pub use model::{Crf, Marginals, Model};
pub use params::{InferenceKind, Params, Prior, TrainerKind};
pub use segment::{SegmentCrf, SegmentMarginal};
pub use sequence::{CandidateSegments, DataSequence, LabelSequence, SegmentSequence, SegmentedSequence};
pub use topology::Graph;

#[cfg(feature = "train")]
pub use trainer::Evaluator;
