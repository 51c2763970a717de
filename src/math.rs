//! Log-domain arithmetic shared by the trainers and decoders.

use std::collections::VecDeque;
use std::sync::OnceLock;

/// Logarithm of zero.
pub const LOG0: f64 = f64::NEG_INFINITY;

/// Natural logarithm of two.
pub const LOG2: f64 = core::f64::consts::LN_2;

/// Gap beyond which the smaller operand of a log-sum is dropped.
pub const MINUS_LOG_EPSILON: f64 = 30.0;

const CUT_OFF: f64 = 7.0;
const NUM_FINE: usize = 100_000;
const NUM_COARSE: usize = 5_000;

/// Cached `log(1 + e^-x)` for `x` in `[0, MINUS_LOG_EPSILON]`.
///
/// The region below [`CUT_OFF`] is sampled finely; the tail, where the
/// function is nearly flat, is sampled coarsely.
fn log1p_exp_table() -> &'static [f64] {
    static TABLE: OnceLock<Vec<f64>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let fine = NUM_FINE * CUT_OFF as usize;
        let coarse = NUM_COARSE * (MINUS_LOG_EPSILON - CUT_OFF) as usize;
        let mut table = Vec::with_capacity(fine + coarse + 1);
        for i in 0..fine {
            let x = i as f64 / NUM_FINE as f64;
            table.push((-x).exp().ln_1p());
        }
        for i in 0..=coarse {
            let x = CUT_OFF + i as f64 / NUM_COARSE as f64;
            table.push((-x).exp().ln_1p());
        }
        table
    })
}

#[inline(always)]
fn log1p_exp_neg(x: f64) -> f64 {
    let table = log1p_exp_table();
    let idx = if x < CUT_OFF {
        (x * NUM_FINE as f64).round() as usize
    } else {
        NUM_FINE * CUT_OFF as usize + ((x - CUT_OFF) * NUM_COARSE as f64).round() as usize
    };
    table[idx.min(table.len() - 1)]
}

/// Returns `log(e^a + e^b)`.
///
/// Equal operands are combined exactly, and an operand more than
/// [`MINUS_LOG_EPSILON`] below the other is ignored.
#[inline(always)]
pub fn logsumexp(a: f64, b: f64) -> f64 {
    if a == b {
        if a.is_infinite() {
            return a;
        }
        return a + LOG2;
    }
    let (vmax, vmin) = if a > b { (a, b) } else { (b, a) };
    let gap = vmax - vmin;
    if gap > MINUS_LOG_EPSILON || gap.is_nan() {
        vmax
    } else {
        vmax + log1p_exp_neg(gap)
    }
}

/// Returns the log-sum of all values.
///
/// The two smallest values are combined first, repeatedly, which keeps the
/// accumulated rounding error bounded for long inputs.
pub fn logsumexp_all(values: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| *v != LOG0).collect();
    if sorted.is_empty() {
        return LOG0;
    }
    sorted.sort_unstable_by(f64::total_cmp);
    let mut inputs: VecDeque<f64> = sorted.into();
    let mut merged = VecDeque::with_capacity(inputs.len());
    // Merged sums come out in non-decreasing order, so the smallest value is
    // always at the front of one of the two queues.
    fn pop_min(inputs: &mut VecDeque<f64>, merged: &mut VecDeque<f64>) -> Option<f64> {
        match (inputs.front(), merged.front()) {
            (Some(a), Some(b)) if a <= b => inputs.pop_front(),
            (Some(_), None) => inputs.pop_front(),
            _ => merged.pop_front(),
        }
    }
    loop {
        let Some(a) = pop_min(&mut inputs, &mut merged) else {
            return LOG0;
        };
        let Some(b) = pop_min(&mut inputs, &mut merged) else {
            return a;
        };
        merged.push_back(logsumexp(a, b));
    }
}

/// Returns `log(e^a - e^b)`, or `None` when `a < b`.
pub fn log_minus_exp(a: f64, b: f64) -> Option<f64> {
    if a < b || a.is_nan() || b.is_nan() {
        return None;
    }
    if a == b {
        return Some(LOG0);
    }
    if a - b > MINUS_LOG_EPSILON {
        return Some(a);
    }
    Some(a + (-(b - a).exp_m1()).ln())
}

/// Exponentiates a log-domain value, flushing tiny results to zero.
#[inline(always)]
pub fn exp(x: f64) -> f64 {
    if x < -MINUS_LOG_EPSILON || x.is_nan() {
        return 0.0;
    }
    if x == f64::INFINITY {
        log::warn!("exp overflow clamped");
        return f64::MAX;
    }
    x.exp()
}

/// Natural logarithm mapping zero and negative values to [`LOG0`].
#[inline(always)]
pub fn log(x: f64) -> f64 {
    if x > 0.0 {
        x.ln()
    } else {
        if x < 0.0 {
            log::warn!("log of negative value {x} clamped");
        }
        LOG0
    }
}

/// Dense square matrix of log-domain potentials, indexed `[prev][curr]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Creates an `n x n` matrix filled with `value`.
    pub fn new(n: usize, value: f64) -> Self {
        Self {
            n,
            data: vec![value; n * n],
        }
    }

    /// Number of rows (and columns).
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.n
    }

    /// Returns the potential of the transition `prev -> curr`.
    #[inline(always)]
    pub fn get(&self, prev: usize, curr: usize) -> f64 {
        self.data[prev * self.n + curr]
    }

    /// Overwrites the potential of `prev -> curr`.
    #[inline(always)]
    pub fn set(&mut self, prev: usize, curr: usize, value: f64) {
        self.data[prev * self.n + curr] = value;
    }

    /// Adds to the potential of `prev -> curr`.
    #[inline(always)]
    pub fn add(&mut self, prev: usize, curr: usize, value: f64) {
        self.data[prev * self.n + curr] += value;
    }

    /// Resizes the matrix and fills it with `value`.
    pub fn reset(&mut self, n: usize, value: f64) {
        self.n = n;
        self.data.clear();
        self.data.resize(n * n, value);
    }

    /// Iterates over `(prev, curr, value)` of the entries above `LOG0`.
    pub fn finite_entries(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != LOG0)
            .map(|(i, &v)| (i / self.n, i % self.n, v))
    }
}

/// Log-domain matrix-vector product.
///
/// With `transpose`, computes `z[c] = logsumexp_p (m[p][c] + y[p])` (a forward
/// step); otherwise `z[p] = logsumexp_c (m[p][c] + y[c])` (a backward step).
/// When `accumulate` is false `z` is cleared first. If `edges` is given only
/// those `(prev, curr)` pairs are visited.
pub fn log_mult(
    m: &Matrix,
    y: &[f64],
    z: &mut [f64],
    accumulate: bool,
    transpose: bool,
    edges: Option<&[(usize, usize)]>,
) {
    if !accumulate {
        z.fill(LOG0);
    }
    let mut visit = |p: usize, c: usize| {
        if transpose {
            z[c] = logsumexp(z[c], m.get(p, c) + y[p]);
        } else {
            z[p] = logsumexp(z[p], m.get(p, c) + y[c]);
        }
    };
    match edges {
        Some(edges) => {
            for &(p, c) in edges {
                visit(p, c);
            }
        }
        None => {
            for p in 0..m.size() {
                for c in 0..m.size() {
                    visit(p, c);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE_EPS: f64 = 1e-5;

    #[test]
    fn test_logsumexp_small_1() {
        let a = 0.5f64;
        let b = 2f64;
        let expected = (a.exp() + b.exp()).ln();
        assert!((expected - logsumexp(a, b)).abs() < TABLE_EPS);
    }

    #[test]
    fn test_logsumexp_small_2() {
        let a = 12f64;
        let b = 5f64;
        let expected = (a.exp() + b.exp()).ln();
        assert!((expected - logsumexp(a, b)).abs() < TABLE_EPS);
    }

    #[test]
    fn test_logsumexp_large_1() {
        let a = 1234f64;
        let b = 1232f64;
        // log(exp(1234) + exp(1232))
        // = 1232 + log(exp(2) + 1)
        let expected = 1232.0 + (2f64.exp() + 1.0).ln();
        assert!((expected - logsumexp(a, b)).abs() < TABLE_EPS);

        let naive = (a.exp() + b.exp()).ln();
        assert!(naive.is_infinite());
    }

    #[test]
    fn test_logsumexp_tail() {
        let expected = 10.0 + (-20f64).exp().ln_1p();
        assert!((expected - logsumexp(-10.0, 10.0)).abs() < TABLE_EPS);
    }

    #[test]
    fn test_logsumexp_equal() {
        assert_eq!(3.0 + LOG2, logsumexp(3.0, 3.0));
    }

    #[test]
    fn test_logsumexp_cutoff() {
        assert_eq!(40.0, logsumexp(40.0, 5.0));
        assert_eq!(40.0, logsumexp(5.0, 40.0));
    }

    #[test]
    fn test_logsumexp_commutative() {
        for &(a, b) in &[(0.1, 0.7), (-3.0, 4.5), (100.0, 99.0), (-0.25, -6.0)] {
            assert_eq!(logsumexp(a, b), logsumexp(b, a));
        }
    }

    #[test]
    fn test_logsumexp_inf_1() {
        assert_eq!(2.0, logsumexp(LOG0, 2.0));
        assert_eq!(-7.5, logsumexp(-7.5, LOG0));
    }

    #[test]
    fn test_logsumexp_inf_2() {
        assert_eq!(LOG0, logsumexp(LOG0, LOG0));
    }

    #[test]
    fn test_logsumexp_inf_3() {
        assert_eq!(f64::INFINITY, logsumexp(f64::INFINITY, 2.0));
    }

    #[test]
    fn test_logsumexp_all() {
        let values = [0.3, -1.0, 2.5, 2.5, -40.0, 1.0];
        let expected = values.iter().map(|v: &f64| v.exp()).sum::<f64>().ln();
        assert!((expected - logsumexp_all(&values)).abs() < 1e-4);
    }

    #[test]
    fn test_logsumexp_all_empty() {
        assert_eq!(LOG0, logsumexp_all(&[]));
        assert_eq!(LOG0, logsumexp_all(&[LOG0, LOG0]));
        assert_eq!(1.5, logsumexp_all(&[LOG0, 1.5]));
    }

    #[test]
    fn test_log_minus_exp() {
        let expected = (3f64.exp() - 1f64.exp()).ln();
        let result = log_minus_exp(3.0, 1.0).unwrap();
        assert!((expected - result).abs() < 1e-12);
        assert_eq!(Some(LOG0), log_minus_exp(2.0, 2.0));
        assert_eq!(Some(50.0), log_minus_exp(50.0, 1.0));
        assert_eq!(None, log_minus_exp(1.0, 3.0));
    }

    #[test]
    fn test_exp_log_round_trip() {
        for &x in &[1e-9, 0.5, 1.0, 3.25, 1e6] {
            let y = exp(log(x));
            assert!((y - x).abs() <= 1e-12 * x.max(1.0));
        }
        for &x in &[-20.0, -1.0, 0.0, 2.0, 300.0] {
            assert!((log(exp(x)) - x).abs() < 1e-12);
        }
    }

    #[test]
    fn test_exp_floor() {
        assert_eq!(0.0, exp(-31.0));
        assert_eq!(0.0, exp(LOG0));
        assert_eq!(0.0, exp(f64::NAN));
        assert_eq!(f64::MAX, exp(f64::INFINITY));
    }

    #[test]
    fn test_log_nonpositive() {
        assert_eq!(LOG0, log(0.0));
        assert_eq!(LOG0, log(-1.0));
    }

    #[test]
    fn test_log_mult_forward_backward() {
        let mut m = Matrix::new(2, 0.0);
        m.set(0, 1, 1.0);
        m.set(1, 0, -1.0);
        let y = [0.5, 2.0];
        let mut z = [0.0; 2];

        log_mult(&m, &y, &mut z, false, true, None);
        let z0 = ((0.0f64 + 0.5).exp() + (-1.0f64 + 2.0).exp()).ln();
        let z1 = ((1.0f64 + 0.5).exp() + (0.0f64 + 2.0).exp()).ln();
        assert!((z[0] - z0).abs() < TABLE_EPS);
        assert!((z[1] - z1).abs() < TABLE_EPS);

        log_mult(&m, &y, &mut z, false, false, None);
        let z0 = ((0.0f64 + 0.5).exp() + (1.0f64 + 2.0).exp()).ln();
        let z1 = ((-1.0f64 + 0.5).exp() + (0.0f64 + 2.0).exp()).ln();
        assert!((z[0] - z0).abs() < TABLE_EPS);
        assert!((z[1] - z1).abs() < TABLE_EPS);
    }

    #[test]
    fn test_log_mult_edges() {
        let m = Matrix::new(3, 0.0);
        let y = [1.0, 2.0, 3.0];
        let mut z = [0.0; 3];
        log_mult(&m, &y, &mut z, false, true, Some(&[(0, 1), (2, 1)]));
        assert_eq!(LOG0, z[0]);
        assert!((z[1] - logsumexp(1.0, 3.0)).abs() < 1e-12);
        assert_eq!(LOG0, z[2]);

        log_mult(&m, &y, &mut z, true, true, Some(&[(1, 0)]));
        assert_eq!(2.0, z[0]);
    }
}
