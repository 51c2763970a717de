//! Training and decoding options.

use core::str::FromStr;

use hashbrown::HashMap;

use crate::errors::{CrfError, Result};

/// Training strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrainerKind {
    /// Maximum conditional log-likelihood.
    #[default]
    LogLikelihood,

    /// Collins' voted perceptron.
    Collins,

    /// Locally normalized piecewise likelihood.
    Piecewise,

    /// Likelihood with loss-augmented emission scores.
    SoftMargin,

    /// Log of the loss-weighted partition function.
    SoftLogMargin,

    /// Exponentiated gradient on the loss-augmented objective.
    ExponentiatedGradient,

    /// Log-likelihood of the known labels of partially labeled sequences.
    Partial,
}

impl FromStr for TrainerKind {
    type Err = CrfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ll" | "default" => Ok(Self::LogLikelihood),
            "collins" | "Collins" => Ok(Self::Collins),
            "piecewise" | "Piecewise" => Ok(Self::Piecewise),
            "softMargin" => Ok(Self::SoftMargin),
            "softLogMargin" => Ok(Self::SoftLogMargin),
            "eg" | "ExponentiatedGradient" => Ok(Self::ExponentiatedGradient),
            "partial" | "Partial" => Ok(Self::Partial),
            _ => Err(CrfError::malformed("trainer", s)),
        }
    }
}

/// Decoder used by `apply`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferenceKind {
    /// Beam Viterbi.
    #[default]
    Viterbi,

    /// A* search bounded by a backward Viterbi pass.
    AStar,
}

impl FromStr for InferenceKind {
    type Err = CrfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "viterbi" => Ok(Self::Viterbi),
            "astar" | "a*" => Ok(Self::AStar),
            _ => Err(CrfError::malformed("inferenceType", s)),
        }
    }
}

/// Regularizer added to the training objective.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Prior {
    /// `-s/2 * sum(w^2)`.
    #[default]
    Gaussian,

    /// `-s * sum(w)` with weights constrained to be positive.
    Exp,

    /// Smooth approximation of `-s * sum(|w|)`.
    LaplaceApprox,
}

impl FromStr for Prior {
    type Err = CrfError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("gaussian") {
            Ok(Self::Gaussian)
        } else if s.eq_ignore_ascii_case("exp") {
            Ok(Self::Exp)
        } else if s.eq_ignore_ascii_case("laplaceApprox") {
            Ok(Self::LaplaceApprox)
        } else {
            Err(CrfError::malformed("prior", s))
        }
    }
}

/// Options of a CRF.
///
/// Recognized keys are parsed into typed fields; any other key is kept
/// verbatim and looked up by the component that understands it.
#[derive(Clone, Debug)]
pub struct Params {
    pub(crate) max_iters: u64,
    pub(crate) eps_for_convergence: f64,
    pub(crate) inv_sigma_square: f64,
    pub(crate) m_for_hessian: usize,
    pub(crate) init_value: f64,
    pub(crate) trainer: TrainerKind,
    pub(crate) inference: InferenceKind,
    pub(crate) beam_size: Option<usize>,
    pub(crate) reuse_m: bool,
    pub(crate) prior: Prior,
    pub(crate) debug_lvl: u32,
    pub(crate) n_threads: usize,
    pub(crate) cache: bool,
    pub(crate) misc: HashMap<String, String>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_iters: 300,
            eps_for_convergence: 0.001,
            inv_sigma_square: 0.01,
            m_for_hessian: 7,
            init_value: 0.0,
            trainer: TrainerKind::default(),
            inference: InferenceKind::default(),
            beam_size: None,
            reuse_m: false,
            prior: Prior::default(),
            debug_lvl: 0,
            n_threads: 1,
            cache: false,
            misc: HashMap::new(),
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| CrfError::malformed(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(CrfError::malformed(key, value))
    }
}

impl Params {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses whitespace separated `key value` pairs.
    ///
    /// # Errors
    ///
    /// Fails when a key has no value or a value is malformed.
    pub fn parse(options: &str) -> Result<Self> {
        let mut params = Self::default();
        let mut tokens = options.split_whitespace();
        while let Some(key) = tokens.next() {
            let value = tokens.next().ok_or_else(|| CrfError::malformed(key, ""))?;
            params.set(key, value)?;
        }
        Ok(params)
    }

    /// Sets a single option.
    ///
    /// # Errors
    ///
    /// Fails when the value of a recognized key is malformed.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "maxIters" => self.max_iters = parse(key, value)?,
            "epsForConvergence" => self.eps_for_convergence = parse(key, value)?,
            "invSigmaSquare" => self.inv_sigma_square = parse(key, value)?,
            "mForHessian" => {
                let m: usize = parse(key, value)?;
                if m == 0 {
                    return Err(CrfError::malformed(key, value));
                }
                self.m_for_hessian = m;
            }
            "initValue" => self.init_value = parse(key, value)?,
            "trainer" => self.trainer = value.parse()?,
            "inferenceType" => self.inference = value.parse()?,
            "beamSize" => {
                let b: usize = parse(key, value)?;
                if b == 0 {
                    return Err(CrfError::malformed(key, value));
                }
                self.beam_size = Some(b);
            }
            "scale" | "robustScale" => {
                parse_bool(key, value)?;
                log::debug!("{key} has no effect on log-domain computation");
                self.misc.insert(key.to_string(), value.to_string());
            }
            "reuseM" => self.reuse_m = parse_bool(key, value)?,
            "prior" => self.prior = value.parse()?,
            "debugLvl" => self.debug_lvl = parse(key, value)?,
            "numThreads" => {
                let n: usize = parse(key, value)?;
                if n == 0 {
                    return Err(CrfError::malformed(key, value));
                }
                self.n_threads = n;
            }
            "cache" => self.cache = parse_bool(key, value)?,
            _ => {
                log::debug!("option {key} kept for its consumer");
                self.misc.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Sets the maximum number of iterations.
    pub fn max_iters(mut self, max_iters: u64) -> Result<Self> {
        if max_iters == 0 {
            return Err(CrfError::invalid_argument("max_iters must not be 0"));
        }
        self.max_iters = max_iters;
        Ok(self)
    }

    /// Sets the training strategy.
    pub fn trainer(mut self, trainer: TrainerKind) -> Self {
        self.trainer = trainer;
        self
    }

    /// Sets the decoder.
    pub fn inference(mut self, inference: InferenceKind) -> Self {
        self.inference = inference;
        self
    }

    /// Sets the prior and its strength.
    pub fn prior(mut self, prior: Prior, inv_sigma_square: f64) -> Result<Self> {
        if inv_sigma_square < 0.0 {
            return Err(CrfError::invalid_argument(
                "inv_sigma_square must be greater than or equal to 0.0",
            ));
        }
        self.prior = prior;
        self.inv_sigma_square = inv_sigma_square;
        Ok(self)
    }

    /// Sets the Viterbi beam size.
    pub fn beam_size(mut self, beam_size: usize) -> Result<Self> {
        if beam_size == 0 {
            return Err(CrfError::invalid_argument("beam_size must not be 0"));
        }
        self.beam_size = Some(beam_size);
        Ok(self)
    }

    /// Sets the number of gradient workers.
    pub fn n_threads(mut self, n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(CrfError::invalid_argument("n_threads must not be 0"));
        }
        self.n_threads = n_threads;
        Ok(self)
    }

    /// Returns the selected training strategy.
    pub fn trainer_kind(&self) -> TrainerKind {
        self.trainer
    }

    /// Returns the selected decoder.
    pub fn inference_kind(&self) -> InferenceKind {
        self.inference
    }

    /// Beam size used by `apply`.
    pub(crate) fn decode_beam(&self) -> usize {
        self.beam_size.unwrap_or(1)
    }

    /// Reads a typed value from the uninterpreted options.
    pub(crate) fn misc_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        self.misc
            .get(key)
            .map_or(Ok(default), |value| parse(key, value))
    }

    pub(crate) fn misc_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        self.misc
            .get(key)
            .map_or(Ok(default), |value| parse_bool(key, value))
    }

    /// Returns an uninterpreted option.
    pub fn misc(&self, key: &str) -> Option<&str> {
        self.misc.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = Params::default();
        assert_eq!(300, p.max_iters);
        assert_eq!(0.001, p.eps_for_convergence);
        assert_eq!(0.01, p.inv_sigma_square);
        assert_eq!(TrainerKind::LogLikelihood, p.trainer);
        assert_eq!(InferenceKind::Viterbi, p.inference);
        assert_eq!(1, p.decode_beam());
        assert_eq!(Prior::Gaussian, p.prior);
        assert!(!p.reuse_m);
    }

    #[test]
    fn test_parse() {
        let p = Params::parse(
            "maxIters 20 trainer collins beamSize 4 reuseM true prior laplaceApprox \
             inferenceType astar maxExpansions 50",
        )
        .unwrap();
        assert_eq!(20, p.max_iters);
        assert_eq!(TrainerKind::Collins, p.trainer);
        assert_eq!(4, p.decode_beam());
        assert!(p.reuse_m);
        assert_eq!(Prior::LaplaceApprox, p.prior);
        assert_eq!(InferenceKind::AStar, p.inference);
        assert_eq!(Some("50"), p.misc("maxExpansions"));
        assert_eq!(50usize, p.misc_or("maxExpansions", 7).unwrap());
        assert_eq!(TrainerKind::Partial, Params::parse("trainer partial").unwrap().trainer);
        assert_eq!(9usize, p.misc_or("queueSizeLimit", 9).unwrap());
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            Params::parse("maxIters ten"),
            Err(CrfError::MalformedOption { .. })
        ));
        assert!(Params::parse("trainer unknown").is_err());
        assert!(Params::parse("reuseM").is_err());
        assert!(Params::parse("beamSize 0").is_err());
    }

    #[test]
    fn test_builder() {
        assert!(Params::new().max_iters(0).is_err());
        assert!(Params::new().prior(Prior::Exp, -1.0).is_err());
        let p = Params::new()
            .max_iters(5)
            .unwrap()
            .prior(Prior::Exp, 0.5)
            .unwrap()
            .trainer(TrainerKind::Piecewise);
        assert_eq!(5, p.max_iters);
        assert_eq!(Prior::Exp, p.prior);
        assert_eq!(0.5, p.inv_sigma_square);
        assert_eq!(TrainerKind::Piecewise, p.trainer_kind());
    }
}
