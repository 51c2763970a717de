use std::io::{BufRead, Write};

use bincode::{
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
    Decode, Encode,
};

use crate::constraints::Constraints;
use crate::errors::{CrfError, Result};
use crate::feature::{FeatureGenerator, FeatureSpace};
use crate::inference::{DecodeOptions, Inference};
use crate::params::Params;
use crate::scratch::{Expectations, Scratch};
use crate::sequence::DataSequence;
use crate::span::{SpanView, UnitSpans};
use crate::topology::Graph;

#[cfg(feature = "train")]
use crate::feature::FeatureCache;
#[cfg(feature = "train")]
use crate::params::TrainerKind;
#[cfg(feature = "train")]
use crate::trainer::{self, Evaluator};

/// Topology and weights of a trained CRF.
#[derive(Clone, Debug, PartialEq)]
pub struct Model {
    graph: Graph,
    weights: Vec<f64>,
}

impl Model {
    /// Creates a model.
    pub fn new(graph: Graph, weights: Vec<f64>) -> Self {
        Self { graph, weights }
    }

    /// Internal state graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// One weight per feature.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    #[cfg(feature = "train")]
    pub(crate) fn set_weights(&mut self, weights: Vec<f64>) {
        self.weights = weights;
    }

    /// Writes the weights as a count line followed by one weight per line.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors of `wtr`.
    pub fn write_weights<W: Write>(&self, mut wtr: W) -> Result<()> {
        writeln!(wtr, "{}", self.weights.len())?;
        for w in &self.weights {
            writeln!(wtr, "{w}")?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Replaces the weights with the ones read from `rdr`, in the format of
    /// [`Model::write_weights`].
    ///
    /// # Errors
    ///
    /// [`CrfError::ParameterFormat`] is returned on malformed input and
    /// [`CrfError::FeatureCountMismatch`] if the count differs from the
    /// current number of weights.
    pub fn read_weights<R: BufRead>(&mut self, rdr: R) -> Result<()> {
        let mut lines = rdr.lines();
        let header = lines.next().transpose()?.ok_or_else(|| CrfError::ParameterFormat {
            line: 1,
            msg: "missing feature count".to_string(),
        })?;
        let count: usize = header.trim().parse().map_err(|_| CrfError::ParameterFormat {
            line: 1,
            msg: format!("invalid feature count {header:?}"),
        })?;
        if count != self.weights.len() {
            return Err(CrfError::FeatureCountMismatch {
                expected: self.weights.len(),
                found: count,
            });
        }
        let mut weights = Vec::with_capacity(count);
        for (i, line) in lines.enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let w = line.parse().map_err(|_| CrfError::ParameterFormat {
                line: i + 2,
                msg: format!("invalid weight {line:?}"),
            })?;
            weights.push(w);
        }
        if weights.len() != count {
            return Err(CrfError::ParameterFormat {
                line: weights.len() + 2,
                msg: format!("expected {count} weights, found {}", weights.len()),
            });
        }
        self.weights = weights;
        Ok(())
    }
}

impl<Context> Decode<Context> for Model {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let graph: Graph = Decode::decode(decoder)?;
        let weights: Vec<f64> = Decode::decode(decoder)?;
        if graph.num_states() == 0 {
            return Err(DecodeError::Other("graph without states"));
        }
        Ok(Self { graph, weights })
    }
}

impl Encode for Model {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        Encode::encode(&self.graph, encoder)?;
        Encode::encode(&self.weights, encoder)?;
        Ok(())
    }
}

/// Builds the graph named by the `modelGraph` option.
pub(crate) fn graph_from_params(num_labels: usize, params: &Params) -> Result<Graph> {
    Graph::new(num_labels, params.misc("modelGraph").unwrap_or("naive"))
}

/// Labels of the states along a path, one per position.
fn path_labels(graph: &Graph, path: &[(usize, usize, usize)]) -> Vec<usize> {
    let mut labels = vec![];
    for &(start, end, state) in path {
        labels.extend(core::iter::repeat(graph.label(state)).take(end - start + 1));
    }
    labels
}

/// Posterior marginals of a plain sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct Marginals {
    /// `nodes[i][y]`: probability of state `y` at position `i`.
    pub nodes: Vec<Vec<f64>>,

    /// `edges[i][y_prev][y]`: probability of the transition from `y_prev`
    /// at position `i - 1` to `y` at position `i`. `edges[0]` is all zero.
    pub edges: Vec<Vec<Vec<f64>>>,
}

/// A linear-chain CRF.
///
/// Labels of input sequences are logical labels; they are mapped onto the
/// internal states of the graph while training and back when decoding.
pub struct Crf<G> {
    model: Model,
    features: G,
    params: Params,
    options: DecodeOptions,
}

impl<G> Crf<G> {
    /// Creates an untrained CRF over `num_labels` labels whose graph is
    /// given by the `modelGraph` option (default `naive`).
    ///
    /// # Errors
    ///
    /// Fails if the graph specification or an option is invalid.
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
    /// [`CrfError::FeatureCountMismatch`] is returned if the model's weights
    /// do not match the feature generator.
    pub fn with_model(model: Model, features: G, params: Params) -> Result<Self>
    where
        G: FeatureSpace,
    {
        if model.weights.len() != features.num_features() {
            return Err(CrfError::FeatureCountMismatch {
                expected: features.num_features(),
                found: model.weights.len(),
            });
        }
        let options = DecodeOptions::from_params(&params)?;
        Ok(Self {
            model,
            features,
            params,
            options,
        })
    }

    /// Trained model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Mutable access to the model, e.g. to read weights.
    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    /// Feature generator.
    pub fn features(&self) -> &G {
        &self.features
    }

    /// Options.
    pub fn params(&self) -> &Params {
        &self.params
    }

    fn inference(&self) -> Inference<'_, G> {
        Inference::new(&self.model.graph, &self.features, &self.model.weights, &self.options)
    }

    /// Trains the weights on `seqs`.
    ///
    /// Labels are mapped to states in place for the duration of training
    /// and restored afterwards. The `partial` trainer leaves them as they
    /// are and marginalizes the positions without a label.
    ///
    /// # Errors
    ///
    /// Fails if a label run has no state path in the graph, an option is
    /// malformed, or the optimizer fails before producing any weights.
    #[cfg(feature = "train")]
    #[cfg_attr(docsrs, doc(cfg(feature = "train")))]
    pub fn train<S>(&mut self, seqs: &mut [S], evaluator: Option<&mut dyn Evaluator>) -> Result<()>
    where
        S: DataSequence + Sync,
        G: FeatureGenerator<S> + Sync,
    {
        let graph = &self.model.graph;
        let map_states = self.params.trainer != TrainerKind::Partial;
        if map_states {
            for i in 0..seqs.len() {
                if let Err(e) = graph.map_labels_to_states(&mut seqs[i]) {
                    seqs[..i].iter_mut().for_each(|seq| graph.map_states_to_labels(seq));
                    return Err(e);
                }
            }
        }
        let views: Vec<_> = seqs.iter().enumerate().map(|(i, s)| UnitSpans::with_id(s, i)).collect();
        let result = if self.params.cache {
            let cached = FeatureCache::new(&self.features);
            trainer::train(graph, &cached, &views, &self.params, evaluator)
        } else {
            trainer::train(graph, &self.features, &views, &self.params, evaluator)
        };
        if map_states {
            seqs.iter_mut().for_each(|seq| graph.map_states_to_labels(seq));
        }
        self.model.set_weights(result?);
        Ok(())
    }

    fn write_path<S: DataSequence + ?Sized>(&self, seq: &mut S, path: &[(usize, usize, usize)]) {
        for (i, label) in path_labels(&self.model.graph, path).into_iter().enumerate() {
            seq.set_y(i, label);
        }
    }

    /// Labels `seq` with the best labeling found by the configured decoder.
    /// Returns the score of that labeling, or `None` if no complete path
    /// exists in the graph.
    pub fn apply<S>(&self, seq: &mut S) -> Option<f64>
    where
        S: DataSequence + ?Sized,
        G: FeatureGenerator<S>,
    {
        self.apply_constrained(seq, &Constraints::new())
    }

    /// Like [`Crf::apply`], but the labeling respects `constraints`.
    pub fn apply_constrained<S>(&self, seq: &mut S, constraints: &Constraints) -> Option<f64>
    where
        S: DataSequence + ?Sized,
        G: FeatureGenerator<S>,
    {
        let (score, path) = self.inference().best(&UnitSpans::new(&*seq), Some(constraints))?;
        self.write_path(seq, &path);
        Some(score)
    }

    /// Like [`Crf::apply`], returning the probability of the labeling.
    pub fn apply_and_score<S>(&self, seq: &mut S) -> Option<f64>
    where
        S: DataSequence + ?Sized,
        G: FeatureGenerator<S>,
    {
        let score = self.apply(seq)?;
        Some(self.inference().probability(&UnitSpans::new(&*seq), score))
    }

    /// Up to `k` best labelings of `seq` with their probabilities, best
    /// first.
    pub fn top_k_label_sequences<S>(&self, seq: &S, k: usize) -> Vec<(f64, Vec<usize>)>
    where
        S: DataSequence + ?Sized,
        G: FeatureGenerator<S>,
    {
        let inference = self.inference();
        let view = UnitSpans::new(seq);
        let log_z = inference.log_z(&view);
        inference
            .top_k(&view, k)
            .into_iter()
            .map(|(score, path)| (crate::math::exp(score - log_z), path_labels(&self.model.graph, &path)))
            .collect()
    }

    /// Score of the labeling carried by `seq`, or `None` if it is partially
    /// labeled.
    ///
    /// # Errors
    ///
    /// Fails if a label run has no state path in the graph.
    pub fn score<S>(&self, seq: &mut S) -> Result<Option<f64>>
    where
        S: DataSequence + ?Sized,
        G: FeatureGenerator<S>,
    {
        self.model.graph.map_labels_to_states(seq)?;
        let view = UnitSpans::new(&*seq);
        let score = view.gold_path().map(|path| self.inference().path_score(&view, &path));
        self.model.graph.map_states_to_labels(seq);
        Ok(score)
    }

    /// Log partition function of `seq`.
    pub fn log_z<S>(&self, seq: &S) -> f64
    where
        S: DataSequence + ?Sized,
        G: FeatureGenerator<S>,
    {
        self.inference().log_z(&UnitSpans::new(seq))
    }

    /// Posterior state and transition marginals of `seq`.
    pub fn marginals<S>(&self, seq: &S) -> Marginals
    where
        S: DataSequence + ?Sized,
        G: FeatureGenerator<S>,
    {
        let n = self.model.graph.num_states();
        let posteriors = self.inference().posteriors(&UnitSpans::new(seq));
        let mut nodes = vec![vec![0.0; n]; seq.len()];
        let mut edges = vec![vec![vec![0.0; n]; n]; seq.len()];
        for p in posteriors.spans {
            nodes[p.end][p.state] = p.probability;
        }
        for (pos, yp, y, p) in posteriors.edges {
            edges[pos][yp][y] = p;
        }
        Marginals { nodes, edges }
    }

    /// Expected count of every feature, summed over `seqs`.
    pub fn expected_feature_values<S>(&self, seqs: &[S]) -> Vec<f64>
    where
        S: DataSequence,
        G: FeatureGenerator<S>,
    {
        let mut out = vec![0.0; self.model.weights.len()];
        let mut scratch = Scratch::new();
        let mut exp = Expectations::new(out.len());
        let inference = self.inference();
        for seq in seqs {
            inference.add_expectations(&UnitSpans::new(seq), &mut scratch, &mut exp, &mut out);
        }
        out
    }
}
