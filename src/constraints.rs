//! Pairwise label exclusions.

use hashbrown::{HashMap, HashSet};

/// Labels that must not appear together in one labeling.
///
/// Exclusions are symmetric and stated over canonical ids. Labels with the
/// same canonical id (say the begin, inside and end labels of one entity
/// type) share their exclusions. A label directly continuing a run of its
/// own canonical id is never in conflict, so a multi-position entity counts
/// once.
///
/// ```
/// use segcrf::Constraints;
///
/// // At most one entity of type 1, whose labels are 1 and 2.
/// let constraints = Constraints::new()
///     .disallow(1, 1)
///     .canonical(2, 1);
/// assert!(constraints.conflicting(2, 1));
/// assert!(!constraints.conflicting(0, 1));
/// ```
#[derive(Clone, Debug, Default)]
pub struct Constraints {
    disallowed: HashSet<(usize, usize)>,
    canonical: HashMap<usize, usize>,
}

impl Constraints {
    /// Creates an empty constraint set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forbids labels canonicalized to `a` and `b` in the same labeling.
    pub fn disallow(mut self, a: usize, b: usize) -> Self {
        self.disallowed.insert((a, b));
        self.disallowed.insert((b, a));
        self
    }

    /// Maps `label` to the canonical id `id`.
    pub fn canonical(mut self, label: usize, id: usize) -> Self {
        self.canonical.insert(label, id);
        self
    }

    /// Returns `true` if nothing is excluded.
    pub fn is_empty(&self) -> bool {
        self.disallowed.is_empty()
    }

    /// Canonical id of a label.
    #[inline(always)]
    pub fn canonical_id(&self, label: usize) -> usize {
        self.canonical.get(&label).copied().unwrap_or(label)
    }

    /// Returns `true` if `label` takes part in any exclusion.
    pub fn constrained(&self, label: usize) -> bool {
        let id = self.canonical_id(label);
        self.disallowed.iter().any(|&(a, _)| a == id)
    }

    /// Returns `true` if `a` and `b` must not co-occur.
    pub fn conflicting(&self, a: usize, b: usize) -> bool {
        self.disallowed
            .contains(&(self.canonical_id(a), self.canonical_id(b)))
    }

    /// Returns `true` if `label` may follow `prev` on a labeling that
    /// already carries `assigned`.
    ///
    /// `prev` is `None` when consecutive spans are separate entities even
    /// when they share a label.
    pub fn admits<I>(&self, assigned: I, label: usize, prev: Option<usize>) -> bool
    where
        I: IntoIterator<Item = usize>,
    {
        if self.is_empty() {
            return true;
        }
        if prev.is_some_and(|p| self.canonical_id(p) == self.canonical_id(label)) {
            return true;
        }
        if !self.constrained(label) {
            return true;
        }
        assigned.into_iter().all(|l| !self.conflicting(l, label))
    }

    /// Returns `true` if the labeling `labels` violates no exclusion.
    /// With `segmented`, every element is a separate span.
    pub fn satisfied_by(&self, labels: &[usize], segmented: bool) -> bool {
        labels.iter().enumerate().all(|(i, &label)| {
            let prev = (!segmented && i > 0).then(|| labels[i - 1]);
            self.admits(labels[..i].iter().copied(), label, prev)
        })
    }
}
