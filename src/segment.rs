//! Semi-Markov CRFs over labeled segments.

use crate::constraints::Constraints;
use crate::errors::{CrfError, Result};
use crate::feature::{FeatureGenerator, FeatureSpace};
use crate::inference::{DecodeOptions, Inference};
use crate::model::{graph_from_params, Model};
use crate::params::Params;
use crate::sequence::{CandidateSegments, SegmentSequence};
use crate::span::{BoundedSpans, CandidateSpans, SpanView};
use crate::viterbi::Path;

#[cfg(feature = "train")]
use crate::feature::FeatureCache;
#[cfg(feature = "train")]
use crate::trainer::{self, Evaluator};

/// Posterior probability of a labeled segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentMarginal {
    /// First position.
    pub start: usize,
    /// Last position.
    pub end: usize,
    /// Label.
    pub label: usize,
    /// Probability that the segment appears in a labeling.
    pub probability: f64,
}

/// A CRF whose spans are variable-length segments, each taking a single
/// label.
///
/// Segments compete among the candidates a sequence enumerates
/// ([`CandidateSegments`]), or, through the `*_bounded` methods, among all
/// segments up to `maxMemory` positions long.
pub struct SegmentCrf<G> {
    model: Model,
    features: G,
    params: Params,
    options: DecodeOptions,
    max_memory: usize,
}

fn write_segments<S: SegmentSequence + ?Sized>(seq: &mut S, path: &Path) {
    for &(start, end, label) in path {
        seq.set_segment(start, end, label);
    }
}

impl<G> SegmentCrf<G> {
    /// Creates an untrained model over `num_labels` labels.
    ///
    /// # Errors
    ///
    /// Fails on invalid options, or if the `modelGraph` option gives a
    /// label more than one state.
    pub fn new(num_labels: usize, features: G, params: Params) -> Result<Self>
    where
        G: FeatureSpace,
    {
        let graph = graph_from_params(num_labels, &params)?;
        let weights = vec![0.0; features.num_features()];
        Self::with_model(Model::new(graph, weights), features, params)
    }

    /// Wraps a trained model.
    ///
    /// # Errors
    ///
    /// Fails on invalid options, on a graph with more states than labels,
    /// or if the weights do not match the feature generator.
    pub fn with_model(model: Model, features: G, params: Params) -> Result<Self>
    where
        G: FeatureSpace,
    {
        let graph = model.graph();
        if graph.num_states() != graph.num_labels() {
            return Err(CrfError::invalid_argument(
                "segment models need exactly one state per label",
            ));
        }
        if model.weights().len() != features.num_features() {
            return Err(CrfError::FeatureCountMismatch {
                expected: features.num_features(),
                found: model.weights().len(),
            });
        }
        let options = DecodeOptions::from_params(&params)?;
        let max_memory = params.misc_or("maxMemory", 1usize)?.max(1);
        Ok(Self {
            model,
            features,
            params,
            options,
            max_memory,
        })
    }

    /// Trained model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Mutable access to the model.
    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    /// Feature generator.
    pub fn features(&self) -> &G {
        &self.features
    }

    fn inference(&self) -> Inference<'_, G> {
        Inference::new(self.model.graph(), &self.features, self.model.weights(), &self.options)
    }

    #[cfg(feature = "train")]
    fn train_views<V>(&mut self, views: &[V], evaluator: Option<&mut dyn Evaluator>) -> Result<()>
    where
        V: SpanView + Sync,
        G: FeatureGenerator<V::Seq> + Sync,
    {
        let graph = self.model.graph();
        let weights = if self.params.cache {
            let cached = FeatureCache::new(&self.features);
            trainer::train(graph, &cached, views, &self.params, evaluator)?
        } else {
            trainer::train(graph, &self.features, views, &self.params, evaluator)?
        };
        self.model.set_weights(weights);
        Ok(())
    }

    /// Trains on segmented sequences. Each gold segment must be among the
    /// candidates of its sequence; sequences where one is not are skipped.
    ///
    /// # Errors
    ///
    /// Fails on malformed options or if the optimizer fails before
    /// producing any weights.
    #[cfg(feature = "train")]
    #[cfg_attr(docsrs, doc(cfg(feature = "train")))]
    pub fn train<S>(&mut self, seqs: &[S], evaluator: Option<&mut dyn Evaluator>) -> Result<()>
    where
        S: CandidateSegments + Sync,
        G: FeatureGenerator<S> + Sync,
    {
        let views: Vec<_> = seqs.iter().enumerate().map(|(i, s)| CandidateSpans::with_id(s, i)).collect();
        self.train_views(&views, evaluator)
    }

    /// Trains on sequences whose candidates are every segment of at most
    /// `maxMemory` positions.
    ///
    /// # Errors
    ///
    /// See [`SegmentCrf::train`].
    #[cfg(feature = "train")]
    #[cfg_attr(docsrs, doc(cfg(feature = "train")))]
    pub fn train_bounded<S>(&mut self, seqs: &[S], evaluator: Option<&mut dyn Evaluator>) -> Result<()>
    where
        S: SegmentSequence + Sync,
        G: FeatureGenerator<S> + Sync,
    {
        let max_memory = self.max_memory;
        let views: Vec<_> = seqs
            .iter()
            .enumerate()
            .map(|(i, s)| BoundedSpans::with_id(s, max_memory, i))
            .collect();
        self.train_views(&views, evaluator)
    }

    /// Segments and labels `seq`. Returns the score of the segmentation, or
    /// `None` if no complete segmentation exists.
    pub fn apply<S>(&self, seq: &mut S) -> Option<f64>
    where
        S: CandidateSegments + ?Sized,
        G: FeatureGenerator<S>,
    {
        self.apply_constrained(seq, &Constraints::new())
    }

    /// Like [`SegmentCrf::apply`], with label exclusions between segments.
    pub fn apply_constrained<S>(&self, seq: &mut S, constraints: &Constraints) -> Option<f64>
    where
        S: CandidateSegments + ?Sized,
        G: FeatureGenerator<S>,
    {
        let (score, path) = self.inference().best(&CandidateSpans::new(&*seq), Some(constraints))?;
        write_segments(seq, &path);
        Some(score)
    }

    /// Like [`SegmentCrf::apply`], over every segment of at most
    /// `maxMemory` positions.
    pub fn apply_bounded<S>(&self, seq: &mut S) -> Option<f64>
    where
        S: SegmentSequence + ?Sized,
        G: FeatureGenerator<S>,
    {
        let (score, path) = self
            .inference()
            .best(&BoundedSpans::new(&*seq, self.max_memory), None)?;
        write_segments(seq, &path);
        Some(score)
    }

    /// Like [`SegmentCrf::apply`], returning the probability of the
    /// segmentation.
    pub fn apply_and_score<S>(&self, seq: &mut S) -> Option<f64>
    where
        S: CandidateSegments + ?Sized,
        G: FeatureGenerator<S>,
    {
        let score = self.apply(seq)?;
        Some(self.inference().probability(&CandidateSpans::new(&*seq), score))
    }

    /// Up to `k` best segmentations of `seq` as `(score, segments)`, best
    /// first.
    pub fn segment_sequences<S>(&self, seq: &S, k: usize) -> Vec<(f64, Vec<(usize, usize, usize)>)>
    where
        S: CandidateSegments + ?Sized,
        G: FeatureGenerator<S>,
    {
        self.inference().top_k(&CandidateSpans::new(seq), k)
    }

    /// Score of the segmentation carried by `seq`, or `None` if it is not
    /// fully segmented into candidates.
    pub fn score<S>(&self, seq: &S) -> Option<f64>
    where
        S: CandidateSegments + ?Sized,
        G: FeatureGenerator<S>,
    {
        let view = CandidateSpans::new(seq);
        let path = view.gold_path()?;
        Some(self.inference().path_score(&view, &path))
    }

    /// Log partition function over the candidate segmentations of `seq`.
    pub fn log_z<S>(&self, seq: &S) -> f64
    where
        S: CandidateSegments + ?Sized,
        G: FeatureGenerator<S>,
    {
        self.inference().log_z(&CandidateSpans::new(seq))
    }

    /// Posterior probability of every candidate segment and label.
    pub fn segment_marginal_probabilities<S>(&self, seq: &S) -> Vec<SegmentMarginal>
    where
        S: CandidateSegments + ?Sized,
        G: FeatureGenerator<S>,
    {
        self.inference()
            .posteriors(&CandidateSpans::new(seq))
            .spans
            .into_iter()
            .map(|p| SegmentMarginal {
                start: p.start,
                end: p.end,
                label: p.state,
                probability: p.probability,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::params::InferenceKind;
    use crate::sequence::SegmentedSequence;
    use crate::test_utils::{best_path, toy_weights, ToyFeatures};
    use crate::topology::Graph;
    use crate::transition::TransitionCache;

    fn toy_crf(params: Params) -> SegmentCrf<ToyFeatures> {
        let model = Model::new(Graph::complete(2), toy_weights(8, 17));
        SegmentCrf::with_model(model, ToyFeatures::new(2, 2), params).unwrap()
    }

    #[test]
    fn test_rejects_multi_state_labels() {
        let params = Params::parse("modelGraph naive,BI*").unwrap();
        assert!(SegmentCrf::new(2, ToyFeatures::new(4, 2), params).is_err());
    }

    #[test]
    fn test_apply_matches_enumeration() {
        let crf = toy_crf(Params::new());
        let mut seq = SegmentedSequence::unlabeled(vec![0u8, 1, 1, 0, 1], 3);
        let cache = TransitionCache::build(
            crf.model().graph(),
            crf.features(),
            crf.model().weights(),
            &CandidateSpans::new(&seq),
            false,
        );
        let (expected, path) = best_path(crf.model().graph(), &cache);
        let score = crf.apply(&mut seq).unwrap();
        assert!((expected - score).abs() < 1e-9);
        assert_eq!(path, seq.segments());
        assert!((crf.score(&seq).unwrap() - score).abs() < 1e-9);
    }

    #[test]
    fn test_astar_agrees() {
        let viterbi = toy_crf(Params::new());
        let astar = toy_crf(Params::new().inference(InferenceKind::AStar));
        let mut a = SegmentedSequence::unlabeled(vec![1u8, 1, 0, 0], 2);
        let mut b = a.clone();
        let sa = viterbi.apply(&mut a).unwrap();
        let sb = astar.apply(&mut b).unwrap();
        assert!((sa - sb).abs() < 1e-9);
        assert_eq!(a.segments(), b.segments());
    }

    #[test]
    fn test_bounded_uses_max_memory() {
        let crf = toy_crf(Params::parse("maxMemory 2").unwrap());
        let mut bounded = SegmentedSequence::unlabeled(vec![0u8, 1, 1, 0], 4);
        let mut candidates = SegmentedSequence::unlabeled(vec![0u8, 1, 1, 0], 2);
        let sb = crf.apply_bounded(&mut bounded).unwrap();
        let sc = crf.apply(&mut candidates).unwrap();
        assert!((sb - sc).abs() < 1e-9);
        assert_eq!(bounded.segments(), candidates.segments());
    }

    #[test]
    fn test_marginals_cover_each_position_once() {
        let crf = toy_crf(Params::new());
        let seq = SegmentedSequence::unlabeled(vec![0u8, 1, 0, 1], 3);
        let marginals = crf.segment_marginal_probabilities(&seq);
        for pos in 0..4 {
            let covering: f64 = marginals
                .iter()
                .filter(|m| m.start <= pos && pos <= m.end)
                .map(|m| m.probability)
                .sum();
            assert!((covering - 1.0).abs() < 1e-3, "position {pos}: {covering}");
        }
        let ending_first: f64 = marginals.iter().filter(|m| m.end == 0).map(|m| m.probability).sum();
        let starting_first: f64 = marginals.iter().filter(|m| m.start == 0).map(|m| m.probability).sum();
        assert!((starting_first - 1.0).abs() < 1e-3);
        assert!(ending_first <= starting_first + 1e-9);
    }

    #[test]
    fn test_segment_sequences() {
        let crf = toy_crf(Params::new());
        let seq = SegmentedSequence::unlabeled(vec![0u8, 1, 1], 2);
        let top = crf.segment_sequences(&seq, 4);
        assert_eq!(4, top.len());
        assert!(top.windows(2).all(|w| w[0].0 >= w[1].0));
        let log_z = crf.log_z(&seq);
        let mass: f64 = top.iter().map(|(s, _)| (s - log_z).exp()).sum();
        assert!(mass <= 1.0 + 1e-3);
        let mut best = seq.clone();
        let p = crf.apply_and_score(&mut best).unwrap();
        assert!((p - (top[0].0 - log_z).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_constrained_segments() {
        let crf = toy_crf(Params::new());
        // label 0 at most once
        let constraints = Constraints::new().disallow(0, 0);
        let mut seq = SegmentedSequence::unlabeled(vec![0u8, 1, 0, 1, 0], 2);
        crf.apply_constrained(&mut seq, &constraints).unwrap();
        let zeros = seq.segments().iter().filter(|s| s.2 == 0).count();
        assert!(zeros <= 1);
    }
}
