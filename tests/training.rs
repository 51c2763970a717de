#![cfg(feature = "train")]

mod common;

use segcrf::{
    Crf, Feature, FeatureGenerator, FeatureSpace, LabelSequence, Params, SegmentCrf, SegmentedSequence,
};

use common::{init_logger, labels, separable, Indicators};

fn assert_reproduces(crf: &Crf<Indicators>, seqs: &[LabelSequence<u8>]) {
    for gold in seqs {
        let mut seq = LabelSequence::unlabeled(gold.observations().to_vec());
        crf.apply(&mut seq).unwrap();
        assert_eq!(labels(gold), labels(&seq));
    }
}

fn train_with(options: &str) -> Crf<Indicators> {
    init_logger();
    let mut seqs = separable();
    let params = Params::parse(options).unwrap();
    let mut crf = Crf::new(3, Indicators::new(3, 3), params).unwrap();
    crf.train(&mut seqs, None).unwrap();
    assert_reproduces(&crf, &seqs);
    crf
}

#[test]
fn test_log_likelihood() {
    train_with("maxIters 100");
}

#[test]
fn test_collins() {
    train_with("trainer collins maxIters 20");
}

#[test]
fn test_soft_margin() {
    train_with("trainer softMargin maxIters 100");
}

#[test]
fn test_soft_log_margin() {
    train_with("trainer softLogMargin maxIters 50");
}

#[test]
fn test_piecewise() {
    train_with("trainer piecewise maxIters 100");
}

#[test]
fn test_exponentiated_gradient() {
    train_with("trainer eg maxIters 10 C 10");
}

fn correct_labels(crf: &Crf<Indicators>, seqs: &[LabelSequence<u8>]) -> usize {
    seqs.iter()
        .map(|gold| {
            let mut seq = LabelSequence::unlabeled(gold.observations().to_vec());
            crf.apply(&mut seq).unwrap();
            labels(gold).iter().zip(labels(&seq)).filter(|(a, b)| **a == *b).count()
        })
        .sum()
}

#[test]
fn test_exponentiated_gradient_does_not_degrade() {
    init_logger();
    let total: usize = separable().iter().map(|seq| seq.labels().len()).sum();
    let mut previous = 0;
    for max_iters in [0, 2, 10, 30] {
        for c in ["10", "1000"] {
            let mut seqs = separable();
            let params = Params::parse(&format!("trainer eg maxIters {max_iters} C {c}")).unwrap();
            let mut crf = Crf::new(3, Indicators::new(3, 3), params).unwrap();
            crf.train(&mut seqs, None).unwrap();
            let correct = correct_labels(&crf, &seqs);
            assert_eq!(total, correct, "maxIters {max_iters} C {c}");
            if c == "10" {
                assert!(correct >= previous);
                previous = correct;
            }
        }
    }
}

#[test]
fn test_partial_labels() {
    init_logger();
    let gold = separable();
    let mut seqs: Vec<_> = gold
        .iter()
        .map(|seq| {
            let known: Vec<_> = seq
                .labels()
                .iter()
                .enumerate()
                .map(|(i, &l)| if i % 2 == 1 { None } else { l })
                .collect();
            LabelSequence::partial(seq.observations().to_vec(), &known)
        })
        .collect();
    let before = seqs.clone();
    let params = Params::parse("trainer partial maxIters 100").unwrap();
    let mut crf = Crf::new(3, Indicators::new(3, 3), params).unwrap();
    crf.train(&mut seqs, None).unwrap();
    assert_eq!(before, seqs);
    assert_reproduces(&crf, &gold);
}

#[test]
fn test_priors() {
    train_with("maxIters 100 prior laplaceApprox invSigmaSquare 0.1");

    let mut seqs = separable();
    let params = Params::parse("maxIters 100 prior exp initValue -2").unwrap();
    let mut crf = Crf::new(3, Indicators::new(3, 3), params).unwrap();
    crf.train(&mut seqs, None).unwrap();
    assert!(crf.model().weights().iter().all(|&w| w > 0.0));
}

#[test]
fn test_threads_and_cache() {
    train_with("maxIters 100 numThreads 3");
    train_with("maxIters 100 cache true");
}

#[test]
fn test_nested_graph_maps_labels() {
    init_logger();
    let mut seqs = vec![
        LabelSequence::new(vec![0u8, 0, 1, 1, 1], &[0, 0, 1, 1, 1]),
        LabelSequence::new(vec![1u8, 1, 0, 0], &[1, 1, 0, 0]),
        LabelSequence::new(vec![0u8, 0, 0, 1, 1], &[0, 0, 0, 1, 1]),
    ];
    let before = seqs.clone();
    let params = Params::parse("maxIters 100 modelGraph naive,BI*").unwrap();
    // two states per label
    let mut crf = Crf::new(2, Indicators::new(4, 2), params).unwrap();
    crf.train(&mut seqs, None).unwrap();
    assert_eq!(before, seqs);

    let mut seq = LabelSequence::unlabeled(vec![1u8, 1, 1, 0, 0]);
    crf.apply(&mut seq).unwrap();
    assert_eq!(vec![1, 1, 1, 0, 0], labels(&seq));
}

#[test]
fn test_evaluator_stops_training() {
    init_logger();
    let mut seqs = separable();
    let mut crf = Crf::new(3, Indicators::new(3, 3), Params::parse("maxIters 100").unwrap()).unwrap();
    let mut calls = 0;
    let mut evaluator = |_: u64, _: &[f64]| {
        calls += 1;
        calls < 2
    };
    crf.train(&mut seqs, Some(&mut evaluator)).unwrap();
    assert_eq!(2, calls);
    assert!(crf.model().weights().iter().any(|&w| w != 0.0));
}

/// A single feature firing on state 0 at even positions.
struct EvenPositions;

impl FeatureSpace for EvenPositions {
    fn num_features(&self) -> usize {
        1
    }
}

impl FeatureGenerator<LabelSequence<char>> for EvenPositions {
    fn scan(&self, _seq: &LabelSequence<char>, start: usize, _end: usize, f: &mut dyn FnMut(Feature)) {
        if start % 2 == 0 {
            f(Feature::state(0, 0, 1.0));
        }
    }
}

#[test]
fn test_even_positions_scenario() {
    init_logger();
    const A: usize = 0;
    const B: usize = 1;
    let mut seqs = vec![
        LabelSequence::new(vec!['w', 'x', 'y', 'z'], &[A, B, A, B]),
        LabelSequence::new(vec!['w', 'x', 'y', 'z'], &[A, A, A, A]),
    ];
    let mut crf = Crf::new(2, EvenPositions, Params::parse("maxIters 50").unwrap()).unwrap();
    crf.train(&mut seqs, None).unwrap();
    assert!(crf.model().weights()[0] > 0.0);

    for mut seq in [
        LabelSequence::new(vec!['w', 'x', 'y', 'z'], &[A, B, A, B]),
        LabelSequence::unlabeled(vec!['a', 'b', 'c', 'd']),
    ] {
        seq.clear_labels();
        crf.apply(&mut seq).unwrap();
        assert_eq!(Some(A), seq.labels()[0]);
        assert_eq!(Some(A), seq.labels()[2]);
    }
}

#[test]
fn test_segment_training() {
    init_logger();
    let seqs = vec![
        SegmentedSequence::new(vec![0u8, 0, 1, 2, 2], &[(0, 1, 0), (2, 2, 1), (3, 4, 2)], 2),
        SegmentedSequence::new(vec![1u8, 2, 2, 0, 0], &[(0, 0, 1), (1, 2, 2), (3, 4, 0)], 2),
        SegmentedSequence::new(vec![2u8, 2, 0, 0, 1], &[(0, 1, 2), (2, 3, 0), (4, 4, 1)], 2),
    ];
    let mut crf = SegmentCrf::new(3, Indicators::new(3, 3), Params::parse("maxIters 100").unwrap()).unwrap();
    crf.train(&seqs, None).unwrap();
    for gold in &seqs {
        let mut seq = SegmentedSequence::unlabeled(gold.observations().to_vec(), 2);
        crf.apply(&mut seq).unwrap();
        assert_eq!(gold.segments(), seq.segments());
    }
}

#[test]
fn test_missing_gold_segment_is_skipped() {
    init_logger();
    // the second sequence has a gold segment longer than any candidate
    let seqs = vec![
        SegmentedSequence::new(vec![0u8, 1], &[(0, 0, 0), (1, 1, 1)], 1),
        SegmentedSequence::new(vec![0u8, 0, 1], &[(0, 1, 0), (2, 2, 1)], 1),
    ];
    let mut crf = SegmentCrf::new(2, Indicators::new(2, 2), Params::parse("maxIters 20").unwrap()).unwrap();
    crf.train(&seqs, None).unwrap();
    let mut seq = SegmentedSequence::unlabeled(vec![1u8, 0], 1);
    crf.apply(&mut seq).unwrap();
    assert_eq!(vec![(0, 0, 1), (1, 1, 0)], seq.segments());
}
