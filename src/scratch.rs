//! Per-worker buffers of the forward-backward passes.

use crate::feature::Feature;
use crate::math::{logsumexp, Matrix, LOG0};

/// Grow-only buffers, sized for the longest sequence seen so far.
///
/// One instance belongs to one worker and is threaded through every call
/// that needs it; it is never shared between sequences processed at the
/// same time.
#[derive(Debug, Default)]
pub(crate) struct Scratch {
    pub m: Matrix,
    pub r: Vec<f64>,
    pub tmp: Vec<f64>,
    pub contrib: Vec<f64>,
    pub contrib_loss: Vec<f64>,
    pub alphas: Vec<Vec<f64>>,
    pub betas: Vec<Vec<f64>>,
    pub alpha_loss: Vec<Vec<f64>>,
    pub beta_loss: Vec<Vec<f64>>,
    pub features: Vec<Feature>,
    pub m_init_done: bool,
}

fn grow(table: &mut Vec<Vec<f64>>, len: usize, width: usize) {
    if table.len() < len {
        table.resize_with(len, Vec::new);
    }
    for row in &mut table[..len] {
        row.clear();
        row.resize(width, LOG0);
    }
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes room for a sequence of `len` positions and resets every table
    /// entry that pass will read to `LOG0`.
    pub fn prepare(&mut self, len: usize, num_states: usize) {
        if self.m.size() != num_states {
            self.m.reset(num_states, 0.0);
        }
        self.r.resize(num_states, 0.0);
        self.tmp.resize(num_states, LOG0);
        self.contrib.resize(num_states, LOG0);
        grow(&mut self.alphas, len, num_states);
        grow(&mut self.betas, len, num_states);
        self.m_init_done = false;
    }

    /// Also sizes the tables of the loss-weighted recursions.
    pub fn prepare_loss(&mut self, len: usize, num_states: usize) {
        self.contrib_loss.resize(num_states, LOG0);
        grow(&mut self.alpha_loss, len, num_states);
        grow(&mut self.beta_loss, len, num_states);
    }
}

/// Log-domain expected feature counts of one sequence.
#[derive(Debug, Default)]
pub(crate) struct Expectations {
    pub exp_f: Vec<f64>,
    pub touched: Vec<usize>,
}

impl Expectations {
    pub fn new(num_features: usize) -> Self {
        Self {
            exp_f: vec![LOG0; num_features],
            touched: vec![],
        }
    }

    /// Resets the counts touched by the previous sequence.
    pub fn clear(&mut self) {
        for &f in &self.touched {
            self.exp_f[f] = LOG0;
        }
        self.touched.clear();
    }

    /// Folds `value` into the log count of feature `f`.
    #[inline(always)]
    pub fn add(&mut self, f: usize, value: f64) {
        if value == LOG0 {
            return;
        }
        if self.exp_f[f] == LOG0 {
            self.touched.push(f);
        }
        self.exp_f[f] = logsumexp(self.exp_f[f], value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_only() {
        let mut scratch = Scratch::new();
        scratch.prepare(5, 3);
        assert_eq!(5, scratch.alphas.len());
        scratch.alphas[1][2] = 1.0;
        scratch.prepare(2, 3);
        assert_eq!(5, scratch.alphas.len());
        assert_eq!(LOG0, scratch.alphas[1][2]);
    }

    #[test]
    fn test_expectations() {
        let mut exp = Expectations::new(4);
        exp.add(2, 0.0);
        exp.add(2, 0.0);
        exp.add(1, LOG0);
        assert!((exp.exp_f[2] - 2f64.ln()).abs() < 1e-5);
        assert_eq!(vec![2], exp.touched);
        exp.clear();
        assert_eq!(LOG0, exp.exp_f[2]);
        assert!(exp.touched.is_empty());
    }
}
