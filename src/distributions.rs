/*!
Defines the collaborator traits the samplers and transforms are written against, together
with a few concrete implementations that cover the common cases.

- [`LogPdf`]: an (unnormalized) log-density over a parameter vector, optionally with its gradient.
- [`LogPrior`]: a log-density that can also be sampled from.
- [`ErrorMeasure`]: a scalar discrepancy over a parameter vector, optionally with its gradient.
- [`Boundaries`]: a box in parameter space.

[`GaussianKernel`] is the multivariate normal perturbation kernel used by the ABC-SMC sampler.

# Examples

```rust
use mini_abc::distributions::{GaussianPrior, LogPdf, LogPrior};
use rand::{rngs::SmallRng, SeedableRng};

let prior = GaussianPrior::standard(2);
let mut rng = SmallRng::seed_from_u64(42);
let xs = prior.sample(10, &mut rng);
assert_eq!(xs.len(), 10);
assert!(prior.log_prob(&xs[0]).is_finite());
```
*/

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::f64::consts::PI;

use crate::error::{check_dimension, Error, Result};

/// Jitter added to the diagonal of a covariance that is not positive definite.
const KERNEL_JITTER: f64 = 1e-10;
/// How many times the jitter is increased tenfold before giving up.
const KERNEL_JITTER_TRIES: usize = 8;

/// A log-density over an `n_parameters()`-dimensional vector.
pub trait LogPdf {
    /// Dimension of the parameter vectors this density is defined over.
    fn n_parameters(&self) -> usize;

    /// Returns the log-density at `x`, or negative infinity outside its support.
    fn log_prob(&self, x: &[f64]) -> f64;

    /// Returns the log-density at `x` and its gradient with respect to `x`.
    ///
    /// Optional; the default reports [`Error::Unsupported`].
    fn evaluate_s1(&self, _x: &[f64]) -> Result<(f64, Vec<f64>)> {
        Err(Error::Unsupported("LogPdf::evaluate_s1"))
    }
}

/// A log-density that can also produce independent samples.
pub trait LogPrior: LogPdf {
    /// Draws `n` independent samples.
    fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<Vec<f64>>;
}

/// A scalar error (or distance) over parameter vectors.
pub trait ErrorMeasure {
    fn n_parameters(&self) -> usize;

    /// Evaluates the error at `x`.
    fn evaluate(&self, x: &[f64]) -> f64;

    /// Returns the error at `x` and its gradient with respect to `x`.
    ///
    /// Optional; the default reports [`Error::Unsupported`].
    fn evaluate_s1(&self, _x: &[f64]) -> Result<(f64, Vec<f64>)> {
        Err(Error::Unsupported("ErrorMeasure::evaluate_s1"))
    }
}

/// A set of boundaries on parameter space.
pub trait Boundaries {
    fn n_parameters(&self) -> usize;

    /// Lower corner of the box.
    fn lower(&self) -> &[f64];

    /// Upper corner of the box.
    fn upper(&self) -> &[f64];

    /// Returns `true` if `x` lies within the boundaries.
    fn check(&self, x: &[f64]) -> bool;
}

/**
Axis-aligned boundaries `[lower, upper)` per coordinate.

# Examples

```rust
use mini_abc::distributions::{Boundaries, RectangularBoundaries};

let b = RectangularBoundaries::new(vec![0.0, 1.0], vec![4.0, 5.0]).unwrap();
assert!(b.check(&[0.0, 4.9]));
assert!(!b.check(&[4.0, 2.0]));
assert_eq!(b.range(), vec![4.0, 4.0]);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct RectangularBoundaries {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl RectangularBoundaries {
    /// Creates boundaries from a lower and an upper corner.
    ///
    /// Fails if the corners differ in length, are empty, or if any `upper[i] <= lower[i]`.
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        check_dimension(lower.len(), upper.len())?;
        if lower.is_empty() {
            return Err(Error::Validation(
                "boundaries need at least one parameter".to_string(),
            ));
        }
        if let Some(i) = lower.iter().zip(&upper).position(|(a, b)| !(b > a)) {
            return Err(Error::Validation(format!(
                "upper bound must exceed lower bound (parameter {i}: [{}, {}))",
                lower[i], upper[i]
            )));
        }
        Ok(Self { lower, upper })
    }

    /// Width of the box per coordinate.
    pub fn range(&self) -> Vec<f64> {
        self.upper
            .iter()
            .zip(&self.lower)
            .map(|(b, a)| b - a)
            .collect()
    }
}

impl Boundaries for RectangularBoundaries {
    fn n_parameters(&self) -> usize {
        self.lower.len()
    }

    fn lower(&self) -> &[f64] {
        &self.lower
    }

    fn upper(&self) -> &[f64] {
        &self.upper
    }

    fn check(&self, x: &[f64]) -> bool {
        x.len() == self.lower.len()
            && x
                .iter()
                .zip(self.lower.iter().zip(&self.upper))
                .all(|(v, (a, b))| v >= a && v < b)
    }
}

/**
Independent normal prior, `x_i ~ N(mean_i, std_i^2)`.

# Examples

```rust
use mini_abc::distributions::{GaussianPrior, LogPdf};

let prior = GaussianPrior::new(vec![0.0, 1.0], vec![1.0, 2.0]).unwrap();
assert_eq!(prior.n_parameters(), 2);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianPrior {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl GaussianPrior {
    /// Creates a prior from per-coordinate means and standard deviations.
    pub fn new(mean: Vec<f64>, std: Vec<f64>) -> Result<Self> {
        check_dimension(mean.len(), std.len())?;
        if mean.is_empty() {
            return Err(Error::Validation(
                "prior needs at least one parameter".to_string(),
            ));
        }
        if std.iter().any(|s| !(*s > 0.0 && s.is_finite())) {
            return Err(Error::Validation(
                "standard deviations must be positive and finite".to_string(),
            ));
        }
        Ok(Self { mean, std })
    }

    /// Independent standard normals over `n_parameters` coordinates.
    pub fn standard(n_parameters: usize) -> Self {
        Self {
            mean: vec![0.0; n_parameters],
            std: vec![1.0; n_parameters],
        }
    }
}

impl LogPdf for GaussianPrior {
    fn n_parameters(&self) -> usize {
        self.mean.len()
    }

    fn log_prob(&self, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.mean.len());
        x.iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(v, (m, s))| {
                let z = (v - m) / s;
                -0.5 * z * z - s.ln() - 0.5 * (2.0 * PI).ln()
            })
            .sum()
    }

    fn evaluate_s1(&self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        check_dimension(self.mean.len(), x.len())?;
        let grad = x
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(v, (m, s))| -(v - m) / (s * s))
            .collect();
        Ok((self.log_prob(x), grad))
    }
}

impl LogPrior for GaussianPrior {
    fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| {
                self.mean
                    .iter()
                    .zip(&self.std)
                    .map(|(m, s)| {
                        let z: f64 = StandardNormal.sample(rng);
                        m + s * z
                    })
                    .collect()
            })
            .collect()
    }
}

/**
Uniform prior over a [`RectangularBoundaries`] box.

The log-density is negative infinity outside the box.

# Examples

```rust
use mini_abc::distributions::{LogPdf, RectangularBoundaries, UniformPrior};

let prior = UniformPrior::new(RectangularBoundaries::new(vec![0.0], vec![2.0]).unwrap());
assert_eq!(prior.log_prob(&[1.0]), -(2.0f64).ln());
assert_eq!(prior.log_prob(&[3.0]), f64::NEG_INFINITY);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct UniformPrior {
    boundaries: RectangularBoundaries,
    log_density: f64,
}

impl UniformPrior {
    pub fn new(boundaries: RectangularBoundaries) -> Self {
        let log_density = -boundaries.range().iter().map(|w| w.ln()).sum::<f64>();
        Self {
            boundaries,
            log_density,
        }
    }

    pub fn boundaries(&self) -> &RectangularBoundaries {
        &self.boundaries
    }
}

impl LogPdf for UniformPrior {
    fn n_parameters(&self) -> usize {
        self.boundaries.n_parameters()
    }

    fn log_prob(&self, x: &[f64]) -> f64 {
        if self.boundaries.check(x) {
            self.log_density
        } else {
            f64::NEG_INFINITY
        }
    }

    fn evaluate_s1(&self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        check_dimension(self.n_parameters(), x.len())?;
        Ok((self.log_prob(x), vec![0.0; x.len()]))
    }
}

impl LogPrior for UniformPrior {
    fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<Vec<f64>> {
        let lower = self.boundaries.lower();
        let upper = self.boundaries.upper();
        (0..n)
            .map(|_| {
                lower
                    .iter()
                    .zip(upper)
                    .map(|(&a, &b)| rng.gen_range(a..b))
                    .collect()
            })
            .collect()
    }
}

/**
A multivariate normal kernel `N(x; center, cov)` with a fixed covariance.

The covariance is factorized once on construction. If it is not positive definite, an
increasing diagonal jitter is added before giving up with [`Error::Degenerate`].

# Examples

```rust
use mini_abc::distributions::GaussianKernel;
use nalgebra::DMatrix;
use rand::{rngs::SmallRng, SeedableRng};

let kernel = GaussianKernel::new(&DMatrix::identity(2, 2)).unwrap();
let mut rng = SmallRng::seed_from_u64(1);
let x = kernel.sample(&[0.0, 0.0], &mut rng);
assert_eq!(x.len(), 2);
assert!(kernel.log_pdf(&x, &[0.0, 0.0]).is_finite());
```
*/
#[derive(Debug, Clone)]
pub struct GaussianKernel {
    /// Lower Cholesky factor of the covariance.
    chol_l: DMatrix<f64>,
    /// `-d/2 log(2 pi) - 1/2 log|cov|`.
    log_norm: f64,
}

impl GaussianKernel {
    /// Factorizes `cov` and precomputes the normalization constant.
    pub fn new(cov: &DMatrix<f64>) -> Result<Self> {
        check_dimension(cov.nrows(), cov.ncols())?;
        if cov.nrows() == 0 {
            return Err(Error::Validation(
                "kernel covariance must not be empty".to_string(),
            ));
        }
        if cov.iter().any(|v| !v.is_finite()) {
            return Err(Error::Degenerate(
                "kernel covariance has non-finite entries".to_string(),
            ));
        }

        let dim = cov.nrows();
        let chol_l = match cov.clone().cholesky() {
            Some(chol) => chol.l(),
            None => {
                let scale = (cov.trace() / dim as f64).abs().max(1.0);
                let mut jitter = KERNEL_JITTER * scale;
                let mut found = None;
                for _ in 0..KERNEL_JITTER_TRIES {
                    let jittered = cov + DMatrix::identity(dim, dim) * jitter;
                    if let Some(chol) = jittered.cholesky() {
                        log::warn!(
                            "kernel covariance not positive definite; added jitter {jitter:e}"
                        );
                        found = Some(chol.l());
                        break;
                    }
                    jitter *= 10.0;
                }
                found.ok_or_else(|| {
                    Error::Degenerate(
                        "kernel covariance is not positive definite".to_string(),
                    )
                })?
            }
        };

        let log_det_half: f64 = chol_l.diagonal().iter().map(|d| d.ln()).sum();
        let log_norm = -0.5 * dim as f64 * (2.0 * PI).ln() - log_det_half;
        Ok(Self { chol_l, log_norm })
    }

    pub fn dim(&self) -> usize {
        self.chol_l.nrows()
    }

    /// Draws `center + L z` with `z ~ N(0, I)`.
    pub fn sample<R: Rng>(&self, center: &[f64], rng: &mut R) -> Vec<f64> {
        let dim = self.dim();
        debug_assert_eq!(center.len(), dim);
        let z = DVector::<f64>::from_fn(dim, |_, _| StandardNormal.sample(rng));
        let step = &self.chol_l * z;
        center.iter().zip(step.iter()).map(|(c, s)| c + s).collect()
    }

    /// Log-density of `x` under the kernel centered at `center`.
    pub fn log_pdf(&self, x: &[f64], center: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.dim());
        debug_assert_eq!(center.len(), self.dim());
        let diff = DVector::from_iterator(x.len(), x.iter().zip(center).map(|(a, b)| a - b));
        match self.chol_l.solve_lower_triangular(&diff) {
            Some(y) => self.log_norm - 0.5 * y.norm_squared(),
            None => f64::NEG_INFINITY,
        }
    }
}
