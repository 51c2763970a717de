//! Feature enumeration contract.

use std::sync::RwLock;

use hashbrown::HashMap;

/// One active feature on a span.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Feature {
    /// Index into the weight vector.
    pub index: usize,

    /// State of the span the feature fires on.
    pub y: usize,

    /// State of the preceding span, or `None` for a state feature.
    pub y_prev: Option<usize>,

    /// Feature value.
    pub value: f64,
}

impl Feature {
    /// Creates a state feature.
    #[inline(always)]
    pub const fn state(index: usize, y: usize, value: f64) -> Self {
        Self {
            index,
            y,
            y_prev: None,
            value,
        }
    }

    /// Creates a transition feature.
    #[inline(always)]
    pub const fn transition(index: usize, y_prev: usize, y: usize, value: f64) -> Self {
        Self {
            index,
            y,
            y_prev: Some(y_prev),
            value,
        }
    }
}

/// Size and naming of a feature space.
pub trait FeatureSpace {
    /// Number of distinct feature indices.
    fn num_features(&self) -> usize;

    /// Human-readable name of a feature.
    fn feature_name(&self, index: usize) -> String {
        format!("f{index}")
    }
}

/// Enumerates the features active on a span of a sequence.
///
/// Plain chains query single positions (`start == end`); segment models
/// query every candidate span. Transition features on a span refer to the
/// state of the span ending at `start - 1`.
pub trait FeatureGenerator<S: ?Sized>: FeatureSpace {
    /// Calls `f` for every feature active on `start..=end`.
    fn scan(&self, seq: &S, start: usize, end: usize, f: &mut dyn FnMut(Feature));

    /// Like [`FeatureGenerator::scan`], for a sequence identified by a
    /// caller-supplied id that stays stable across passes.
    fn scan_by_id(&self, id: usize, seq: &S, start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        let _ = id;
        self.scan(seq, start, end, f);
    }
}

impl<G: FeatureSpace + ?Sized> FeatureSpace for &G {
    fn num_features(&self) -> usize {
        (**self).num_features()
    }

    fn feature_name(&self, index: usize) -> String {
        (**self).feature_name(index)
    }
}

impl<S: ?Sized, G: FeatureGenerator<S> + ?Sized> FeatureGenerator<S> for &G {
    fn scan(&self, seq: &S, start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        (**self).scan(seq, start, end, f);
    }

    fn scan_by_id(&self, id: usize, seq: &S, start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        (**self).scan_by_id(id, seq, start, end, f);
    }
}

/// Memoizes the features of identified sequences.
///
/// Scans through [`FeatureGenerator::scan_by_id`] are computed once per
/// `(id, start, end)` and replayed afterwards; plain scans are forwarded.
pub struct FeatureCache<G> {
    inner: G,
    spans: RwLock<HashMap<(usize, usize, usize), Vec<Feature>>>,
}

impl<G> FeatureCache<G> {
    /// Wraps a generator.
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            spans: RwLock::new(HashMap::new()),
        }
    }

    /// Drops every memoized span.
    pub fn clear(&self) {
        if let Ok(mut spans) = self.spans.write() {
            spans.clear();
        }
    }

    /// Number of memoized spans.
    pub fn len(&self) -> usize {
        self.spans.read().map_or(0, |spans| spans.len())
    }

    /// Returns `true` if nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the wrapped generator.
    pub fn into_inner(self) -> G {
        self.inner
    }
}

impl<G: FeatureSpace> FeatureSpace for FeatureCache<G> {
    fn num_features(&self) -> usize {
        self.inner.num_features()
    }

    fn feature_name(&self, index: usize) -> String {
        self.inner.feature_name(index)
    }
}

impl<S: ?Sized, G: FeatureGenerator<S>> FeatureGenerator<S> for FeatureCache<G> {
    fn scan(&self, seq: &S, start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        self.inner.scan(seq, start, end, f);
    }

    fn scan_by_id(&self, id: usize, seq: &S, start: usize, end: usize, f: &mut dyn FnMut(Feature)) {
        let key = (id, start, end);
        if let Ok(spans) = self.spans.read() {
            if let Some(features) = spans.get(&key) {
                features.iter().copied().for_each(f);
                return;
            }
        }
        let mut features = vec![];
        self.inner.scan(seq, start, end, &mut |feature| features.push(feature));
        features.iter().copied().for_each(&mut *f);
        if let Ok(mut spans) = self.spans.write() {
            spans.insert(key, features);
        }
    }
}
