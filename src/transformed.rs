/*!
Adapters that let densities, priors, error measures and boundaries defined in model space be
used from search space.

Each adapter owns the inner object and a [`Transform`] of the same dimension (checked on
construction). Incoming vectors are mapped with [`Transform::to_model`] before they reach the
inner object. Densities additionally pick up the change-of-variables term
`log|det J(q)|`, and gradients are pulled back with the chain rule, `dE/dq = J^T dE/dp`.

```rust
use mini_abc::distributions::{GaussianPrior, LogPdf};
use mini_abc::transformation::LogTransform;
use mini_abc::transformed::TransformedLogPdf;

let pdf = TransformedLogPdf::new(GaussianPrior::standard(1), LogTransform::new(1)).unwrap();
// log N(1; 0, 1) + log|d exp(q)/dq| at q = 0
let expected = -0.5 * (2.0 * std::f64::consts::PI).ln() - 0.5;
assert!((pdf.log_prob(&[0.0]) - expected).abs() < 1e-12);
```
*/

use nalgebra::DVector;
use rand::Rng;

use crate::distributions::{Boundaries, ErrorMeasure, LogPdf, LogPrior};
use crate::error::{check_dimension, Error, Result};
use crate::transformation::Transform;

/// Pulls a model-space gradient back to search space: `J^T grad`.
fn pull_back<T: Transform>(transform: &T, q: &[f64], grad: Vec<f64>) -> Result<Vec<f64>> {
    let jac = transform.jacobian(q)?;
    check_dimension(jac.nrows(), grad.len())?;
    let grad = DVector::from_vec(grad);
    Ok(jac.tr_mul(&grad).iter().copied().collect())
}

/// A [`LogPdf`] evaluated in search space.
#[derive(Debug, Clone)]
pub struct TransformedLogPdf<L, T> {
    log_pdf: L,
    transform: T,
}

impl<L: LogPdf, T: Transform> TransformedLogPdf<L, T> {
    /// Fails if the dimensions differ, or if the transform cannot provide the
    /// log-Jacobian-determinant a density needs.
    pub fn new(log_pdf: L, transform: T) -> Result<Self> {
        check_dimension(log_pdf.n_parameters(), transform.n_parameters())?;
        if !transform.supports_log_jacobian_det() {
            return Err(Error::Unsupported("Transform::log_jacobian_det"));
        }
        Ok(Self { log_pdf, transform })
    }

    pub fn inner(&self) -> &L {
        &self.log_pdf
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }
}

impl<L: LogPdf, T: Transform> LogPdf for TransformedLogPdf<L, T> {
    fn n_parameters(&self) -> usize {
        self.log_pdf.n_parameters()
    }

    fn log_prob(&self, q: &[f64]) -> f64 {
        let p = self.transform.to_model(q);
        let lp = self.log_pdf.log_prob(&p);
        if lp == f64::NEG_INFINITY {
            return lp;
        }
        // Construction guarantees the capability.
        match self.transform.log_jacobian_det(q) {
            Ok(log_det) => lp + log_det,
            Err(_) => f64::NEG_INFINITY,
        }
    }

    fn evaluate_s1(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        check_dimension(self.n_parameters(), q.len())?;
        let p = self.transform.to_model(q);
        let (lp, dlp) = self.log_pdf.evaluate_s1(&p)?;
        let (log_det, dlog_det) = self.transform.log_jacobian_det_s1(q)?;
        let mut grad = pull_back(&self.transform, q, dlp)?;
        grad.iter_mut().zip(dlog_det).for_each(|(g, d)| *g += d);
        Ok((lp + log_det, grad))
    }
}

/// A [`LogPrior`] evaluated in search space.
///
/// The density includes the Jacobian correction, exactly like [`TransformedLogPdf`].
///
/// Note that [`LogPrior::sample`] does *not* sample from the transformed log-density: it
/// draws from the untransformed prior and maps every draw through
/// [`Transform::to_search`].
#[derive(Debug, Clone)]
pub struct TransformedLogPrior<L, T> {
    pdf: TransformedLogPdf<L, T>,
}

impl<L: LogPrior, T: Transform> TransformedLogPrior<L, T> {
    pub fn new(log_prior: L, transform: T) -> Result<Self> {
        Ok(Self {
            pdf: TransformedLogPdf::new(log_prior, transform)?,
        })
    }

    pub fn inner(&self) -> &L {
        self.pdf.inner()
    }

    pub fn transform(&self) -> &T {
        self.pdf.transform()
    }
}

impl<L: LogPrior, T: Transform> LogPdf for TransformedLogPrior<L, T> {
    fn n_parameters(&self) -> usize {
        self.pdf.n_parameters()
    }

    fn log_prob(&self, q: &[f64]) -> f64 {
        self.pdf.log_prob(q)
    }

    fn evaluate_s1(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        self.pdf.evaluate_s1(q)
    }
}

impl<L: LogPrior, T: Transform> LogPrior for TransformedLogPrior<L, T> {
    fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<Vec<f64>> {
        self.inner()
            .sample(n, rng)
            .iter()
            .map(|p| self.transform().to_search(p))
            .collect()
    }
}

/// An [`ErrorMeasure`] evaluated in search space. No Jacobian correction is applied to the
/// value; only the gradient is pulled back.
#[derive(Debug, Clone)]
pub struct TransformedErrorMeasure<E, T> {
    error: E,
    transform: T,
}

impl<E: ErrorMeasure, T: Transform> TransformedErrorMeasure<E, T> {
    pub fn new(error: E, transform: T) -> Result<Self> {
        check_dimension(error.n_parameters(), transform.n_parameters())?;
        Ok(Self { error, transform })
    }

    pub fn inner(&self) -> &E {
        &self.error
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }
}

impl<E: ErrorMeasure, T: Transform> ErrorMeasure for TransformedErrorMeasure<E, T> {
    fn n_parameters(&self) -> usize {
        self.error.n_parameters()
    }

    fn evaluate(&self, q: &[f64]) -> f64 {
        self.error.evaluate(&self.transform.to_model(q))
    }

    fn evaluate_s1(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        check_dimension(self.n_parameters(), q.len())?;
        let (e, de) = self.error.evaluate_s1(&self.transform.to_model(q))?;
        Ok((e, pull_back(&self.transform, q, de)?))
    }
}

/// [`Boundaries`] checked in search space.
///
/// [`Boundaries::lower`], [`Boundaries::upper`] and [`TransformedBoundaries::range`] map the
/// inner corners through [`Transform::to_search`]. That is only meaningful for transforms that
/// are monotonically increasing in every coordinate.
#[derive(Debug, Clone)]
pub struct TransformedBoundaries<B, T> {
    boundaries: B,
    transform: T,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl<B: Boundaries, T: Transform> TransformedBoundaries<B, T> {
    pub fn new(boundaries: B, transform: T) -> Result<Self> {
        check_dimension(boundaries.n_parameters(), transform.n_parameters())?;
        let lower = transform.to_search(boundaries.lower());
        let upper = transform.to_search(boundaries.upper());
        Ok(Self {
            boundaries,
            transform,
            lower,
            upper,
        })
    }

    /// Size of the search-space box, `to_search(upper) - to_search(lower)`.
    pub fn range(&self) -> Vec<f64> {
        self.upper
            .iter()
            .zip(&self.lower)
            .map(|(u, l)| u - l)
            .collect()
    }

    pub fn inner(&self) -> &B {
        &self.boundaries
    }
}

impl<B: Boundaries, T: Transform> Boundaries for TransformedBoundaries<B, T> {
    fn n_parameters(&self) -> usize {
        self.boundaries.n_parameters()
    }

    fn lower(&self) -> &[f64] {
        &self.lower
    }

    fn upper(&self) -> &[f64] {
        &self.upper
    }

    fn check(&self, q: &[f64]) -> bool {
        self.boundaries.check(&self.transform.to_model(q))
    }
}

/// Convenience constructors for the adapters, available on every sized [`Transform`].
pub trait TransformExt: Transform + Sized {
    fn apply_log_pdf<L: LogPdf>(self, log_pdf: L) -> Result<TransformedLogPdf<L, Self>> {
        TransformedLogPdf::new(log_pdf, self)
    }

    fn apply_log_prior<L: LogPrior>(self, log_prior: L) -> Result<TransformedLogPrior<L, Self>> {
        TransformedLogPrior::new(log_prior, self)
    }

    fn apply_error_measure<E: ErrorMeasure>(
        self,
        error: E,
    ) -> Result<TransformedErrorMeasure<E, Self>> {
        TransformedErrorMeasure::new(error, self)
    }

    fn apply_boundaries<B: Boundaries>(self, boundaries: B) -> Result<TransformedBoundaries<B, Self>> {
        TransformedBoundaries::new(boundaries, self)
    }
}

impl<T: Transform + Sized> TransformExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{GaussianPrior, RectangularBoundaries, UniformPrior};
    use crate::transformation::{
        ComposedTransform, IdentityTransform, LogTransform, LogitTransform,
        RectangularBoundariesTransform, ScalingTransform,
    };
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const FD_STEP: f64 = 1e-6;

    /// Squared distance to a fixed point, with gradient.
    struct SquaredDistance {
        target: Vec<f64>,
    }

    impl ErrorMeasure for SquaredDistance {
        fn n_parameters(&self) -> usize {
            self.target.len()
        }

        fn evaluate(&self, x: &[f64]) -> f64 {
            x.iter().zip(&self.target).map(|(a, b)| (a - b).powi(2)).sum()
        }

        fn evaluate_s1(&self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
            let grad = x.iter().zip(&self.target).map(|(a, b)| 2.0 * (a - b)).collect();
            Ok((self.evaluate(x), grad))
        }
    }

    fn finite_difference<F: Fn(&[f64]) -> f64>(f: F, q: &[f64]) -> Vec<f64> {
        (0..q.len())
            .map(|i| {
                let mut hi = q.to_vec();
                let mut lo = q.to_vec();
                hi[i] += FD_STEP;
                lo[i] -= FD_STEP;
                (f(&hi) - f(&lo)) / (2.0 * FD_STEP)
            })
            .collect()
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let err = TransformedLogPdf::new(GaussianPrior::standard(2), LogTransform::new(3));
        assert!(matches!(
            err,
            Err(Error::DimensionMismatch { expected: 2, found: 3 })
        ));
        assert!(TransformedErrorMeasure::new(
            SquaredDistance { target: vec![0.0] },
            IdentityTransform::new(2)
        )
        .is_err());
        let b = RectangularBoundaries::new(vec![0.0], vec![1.0]).unwrap();
        assert!(TransformedBoundaries::new(b, LogitTransform::new(2)).is_err());
    }

    #[test]
    fn log_pdf_adds_log_jacobian_det() {
        let inner = GaussianPrior::new(vec![1.0, 0.0], vec![2.0, 1.0]).unwrap();
        let transform = ComposedTransform::new(vec![
            Box::new(LogTransform::new(1)),
            Box::new(ScalingTransform::new(vec![2.0]).unwrap()),
        ])
        .unwrap();
        let q = [0.5, -1.0];
        let p = transform.to_model(&q);
        let expected = inner.log_prob(&p) + transform.log_jacobian_det(&q).unwrap();
        let pdf = TransformedLogPdf::new(inner, transform).unwrap();
        assert_abs_diff_eq!(pdf.log_prob(&q), expected, epsilon = 1e-12);
    }

    #[test]
    fn log_pdf_gradient_matches_finite_differences() {
        let inner = GaussianPrior::new(vec![0.3, 0.5], vec![1.0, 0.2]).unwrap();
        let transform = RectangularBoundariesTransform::new(vec![-2.0, 0.0], vec![2.0, 1.0]).unwrap();
        let pdf = transform.apply_log_pdf(inner).unwrap();
        let q = [0.4, -0.7];
        let (value, grad) = pdf.evaluate_s1(&q).unwrap();
        assert_abs_diff_eq!(value, pdf.log_prob(&q), epsilon = 1e-12);
        let fd = finite_difference(|x| pdf.log_prob(x), &q);
        for (a, b) in grad.iter().zip(&fd) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn log_pdf_stays_normalized() {
        // Integrate exp(log_prob) of a transformed uniform prior over search space.
        let prior = UniformPrior::new(RectangularBoundaries::new(vec![0.0], vec![3.0]).unwrap());
        let transform = RectangularBoundariesTransform::new(vec![0.0], vec![3.0]).unwrap();
        let pdf = TransformedLogPdf::new(prior, transform).unwrap();
        let h = 1e-3;
        let total: f64 = (-30_000..30_000)
            .map(|i| pdf.log_prob(&[i as f64 * h]).exp() * h)
            .sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn prior_samples_are_mapped_to_search_space() {
        let prior = UniformPrior::new(RectangularBoundaries::new(vec![1.0], vec![5.0]).unwrap());
        let transformed = TransformedLogPrior::new(prior, LogTransform::new(1)).unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        let qs = transformed.sample(200, &mut rng);
        assert_eq!(qs.len(), 200);
        for q in &qs {
            assert!(q[0] >= 0.0 && q[0] < 5.0f64.ln());
            assert!(transformed.log_prob(q).is_finite());
        }
    }

    #[test]
    fn error_measure_is_evaluated_in_model_space() {
        let error = SquaredDistance {
            target: vec![2.0, 0.25],
        };
        let transform = ComposedTransform::elementwise(vec![
            Box::new(LogTransform::new(1)),
            Box::new(LogitTransform::new(1)),
        ])
        .unwrap();
        let measure = TransformedErrorMeasure::new(error, transform).unwrap();
        let q = [2.0f64.ln(), (0.25f64 / 0.75).ln()];
        assert_abs_diff_eq!(measure.evaluate(&q), 0.0, epsilon = 1e-20);

        let q = [0.1, 0.3];
        let (value, grad) = measure.evaluate_s1(&q).unwrap();
        assert_abs_diff_eq!(value, measure.evaluate(&q), epsilon = 1e-15);
        let fd = finite_difference(|x| measure.evaluate(x), &q);
        for (a, b) in grad.iter().zip(&fd) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn error_measure_without_gradient_reports_unsupported() {
        struct NoGradient;
        impl ErrorMeasure for NoGradient {
            fn n_parameters(&self) -> usize {
                1
            }
            fn evaluate(&self, x: &[f64]) -> f64 {
                x[0].abs()
            }
        }
        let measure = TransformedErrorMeasure::new(NoGradient, LogTransform::new(1)).unwrap();
        assert_abs_diff_eq!(measure.evaluate(&[0.0]), 1.0, epsilon = 1e-15);
        assert!(matches!(measure.evaluate_s1(&[0.0]), Err(Error::Unsupported(_))));
    }

    #[test]
    fn boundaries_check_and_range() {
        let b = RectangularBoundaries::new(vec![1.0, 0.0], vec![10.0, 2.0]).unwrap();
        let transform = ComposedTransform::new(vec![
            Box::new(LogTransform::new(1)),
            Box::new(ScalingTransform::new(vec![0.5]).unwrap()),
        ])
        .unwrap();
        let tb = transform.apply_boundaries(b).unwrap();
        assert!(tb.check(&[2.0f64.ln(), 0.5]));
        assert!(!tb.check(&[20.0f64.ln(), 0.5]));
        let range = tb.range();
        assert_abs_diff_eq!(range[0], 10.0f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(range[1], 1.0, epsilon = 1e-12);
        assert_eq!(tb.lower().len(), 2);
    }

    #[test]
    fn rectangular_prior_vanishes_where_the_map_saturates() {
        let b = RectangularBoundaries::new(vec![0.0], vec![2.0]).unwrap();
        let prior = RectangularBoundariesTransform::from_boundaries(&b)
            .apply_log_prior(UniformPrior::new(b))
            .unwrap();
        assert!(prior.log_prob(&[30.0]).is_finite());
        assert_eq!(prior.log_prob(&[40.0]), f64::NEG_INFINITY);
    }
}
