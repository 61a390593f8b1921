/*!
# Parameter transformations

A [`Transform`] maps between the *model space*, where a parameter vector `p` lives, and a
*search space*, where a sampler or optimizer works on `q`:

```text
q = to_search(p)        p = to_model(q)
```

Besides the two maps a transform provides the Jacobian `J(q) = dp/dq` of `to_model`, the log
absolute Jacobian determinant and their derivatives. These are what a density needs to stay
normalized under the change of variables; see [`crate::transformed`].

Capabilities beyond the two maps are optional. Callers can query them with
[`Transform::supports_jacobian`] and [`Transform::supports_jacobian_s1`]; the methods
themselves report [`Error::Unsupported`] when a variant does not provide them.

## Provided transforms

| Transform | `q = to_search(p)` | element-wise |
|---|---|---|
| [`IdentityTransform`] | `p` | yes |
| [`LogTransform`] | `log(p)` | yes |
| [`LogitTransform`] | `log(p / (1 - p))` | yes |
| [`RectangularBoundariesTransform`] | `log(p - a) - log(b - p)` | yes |
| [`ScalingTransform`] | `s * (p + t)` | yes |
| [`ComposedTransform`] | each block by its own transform | if built with [`ComposedTransform::elementwise`] |

## Example

```rust
use mini_abc::transformation::{ComposedTransform, LogTransform, LogitTransform, Transform};

let t = ComposedTransform::new(vec![
    Box::new(LogTransform::new(1)),
    Box::new(LogitTransform::new(2)),
])
.unwrap();
assert_eq!(t.n_parameters(), 3);

let p = vec![2.0, 0.25, 0.5];
let q = t.to_search(&p);
let back = t.to_model(&q);
assert!((back[0] - 2.0).abs() < 1e-12);
```
*/

use nalgebra::DMatrix;
use std::ops::Range;

use crate::distributions::{Boundaries, RectangularBoundaries};
use crate::error::{check_dimension, Error, Result};
use crate::math::{log_sigmoid, logit, sigmoid, softplus};

/// A bijection between model space and search space.
pub trait Transform: Send + Sync {
    /// Dimension of the vectors this transform is defined over.
    fn n_parameters(&self) -> usize;

    /// Maps a search-space vector `q` to model space.
    ///
    /// `q` must have `n_parameters()` entries. This is checked with a debug assertion only;
    /// in release builds a vector of the wrong length is truncated to the shorter length.
    fn to_model(&self, q: &[f64]) -> Vec<f64>;

    /// Maps a model-space vector `p` to search space. Lengths are handled as in
    /// [`Transform::to_model`].
    fn to_search(&self, p: &[f64]) -> Vec<f64>;

    /// `true` if every coordinate is transformed independently of the others,
    /// which makes the Jacobian diagonal.
    fn elementwise(&self) -> bool {
        false
    }

    /// `true` if [`Transform::jacobian`] is available.
    fn supports_jacobian(&self) -> bool {
        false
    }

    /// `true` if [`Transform::jacobian_s1`] is available.
    fn supports_jacobian_s1(&self) -> bool {
        false
    }

    /// `true` if [`Transform::log_jacobian_det`] is available, either in closed form or
    /// through the Jacobian.
    fn supports_log_jacobian_det(&self) -> bool {
        self.supports_jacobian()
    }

    /// Jacobian `dp/dq` of [`Transform::to_model`] at `q`.
    fn jacobian(&self, _q: &[f64]) -> Result<DMatrix<f64>> {
        Err(Error::Unsupported("Transform::jacobian"))
    }

    /// Jacobian at `q` together with its partial derivatives: element `i` of the returned
    /// vector is `dJ/dq_i`.
    fn jacobian_s1(&self, _q: &[f64]) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>)> {
        Err(Error::Unsupported("Transform::jacobian_s1"))
    }

    /// `log|det J(q)|`.
    ///
    /// The default takes the determinant of [`Transform::jacobian`]; all provided transforms
    /// override it with a closed form.
    fn log_jacobian_det(&self, q: &[f64]) -> Result<f64> {
        let jac = self.jacobian(q)?;
        Ok(jac.determinant().abs().ln())
    }

    /// `log|det J(q)|` and its gradient with respect to `q`.
    ///
    /// The default uses `d/dq_i log|det J| = tr(J^-1 dJ/dq_i)` on top of
    /// [`Transform::jacobian_s1`].
    fn log_jacobian_det_s1(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        let (jac, djac) = self.jacobian_s1(q)?;
        let inv = jac
            .clone()
            .try_inverse()
            .ok_or_else(|| Error::Degenerate("Jacobian is singular".to_string()))?;
        let grad = djac.iter().map(|d| (&inv * d).trace()).collect();
        Ok((jac.determinant().abs().ln(), grad))
    }

    /// Converts a model-space covariance matrix to search space at `q`:
    /// `J^-1 C J^-T`.
    fn convert_covariance_matrix(&self, cov: &DMatrix<f64>, q: &[f64]) -> Result<DMatrix<f64>> {
        check_dimension(self.n_parameters(), cov.nrows())?;
        check_dimension(self.n_parameters(), cov.ncols())?;
        let inv = inverse_jacobian(self, q)?;
        Ok(&inv * cov * inv.transpose())
    }

    /// Converts model-space standard deviations `s` to search space at `q`.
    ///
    /// Element-wise transforms scale each entry by the inverse Jacobian diagonal; otherwise
    /// `s` is treated as a diagonal covariance and the square root of the diagonal of
    /// [`Transform::convert_covariance_matrix`] is returned.
    fn convert_standard_deviation(&self, s: &[f64], q: &[f64]) -> Result<Vec<f64>> {
        check_dimension(self.n_parameters(), s.len())?;
        if self.elementwise() {
            let jac = self.jacobian(q)?;
            return Ok(s
                .iter()
                .zip(jac.diagonal().iter())
                .map(|(si, ji)| si / ji.abs())
                .collect());
        }
        let cov = DMatrix::from_diagonal(&nalgebra::DVector::from_iterator(
            s.len(),
            s.iter().map(|v| v * v),
        ));
        let converted = self.convert_covariance_matrix(&cov, q)?;
        Ok(converted.diagonal().iter().map(|v| v.sqrt()).collect())
    }
}

fn inverse_jacobian<T: Transform + ?Sized>(transform: &T, q: &[f64]) -> Result<DMatrix<f64>> {
    transform
        .jacobian(q)?
        .try_inverse()
        .ok_or_else(|| Error::Degenerate("Jacobian is singular".to_string()))
}

/// Assembles a diagonal Jacobian and its derivatives from the per-coordinate
/// derivative `dp_i/dq_i` and second derivative `d^2 p_i/dq_i^2`.
fn diagonal_s1(diag: Vec<f64>, ddiag: Vec<f64>) -> (DMatrix<f64>, Vec<DMatrix<f64>>) {
    let n = diag.len();
    let jac = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(diag));
    let djac = ddiag
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            let mut m = DMatrix::zeros(n, n);
            m[(i, i)] = d;
            m
        })
        .collect();
    (jac, djac)
}

/// Leaves parameters untouched; the Jacobian is the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityTransform {
    n_parameters: usize,
}

impl IdentityTransform {
    pub fn new(n_parameters: usize) -> Self {
        Self { n_parameters }
    }
}

impl Transform for IdentityTransform {
    fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    fn to_model(&self, q: &[f64]) -> Vec<f64> {
        debug_assert_eq!(q.len(), self.n_parameters());
        q.iter().take(self.n_parameters).copied().collect()
    }

    fn to_search(&self, p: &[f64]) -> Vec<f64> {
        debug_assert_eq!(p.len(), self.n_parameters());
        p.iter().take(self.n_parameters).copied().collect()
    }

    fn elementwise(&self) -> bool {
        true
    }

    fn supports_jacobian(&self) -> bool {
        true
    }

    fn supports_jacobian_s1(&self) -> bool {
        true
    }

    fn jacobian(&self, _q: &[f64]) -> Result<DMatrix<f64>> {
        Ok(DMatrix::identity(self.n_parameters, self.n_parameters))
    }

    fn jacobian_s1(&self, q: &[f64]) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>)> {
        Ok(diagonal_s1(vec![1.0; q.len()], vec![0.0; q.len()]))
    }

    fn log_jacobian_det(&self, _q: &[f64]) -> Result<f64> {
        Ok(0.0)
    }

    fn log_jacobian_det_s1(&self, _q: &[f64]) -> Result<(f64, Vec<f64>)> {
        Ok((0.0, vec![0.0; self.n_parameters]))
    }
}

/**
Logarithmic transform, `q = log(p)`, for strictly positive parameters.

`J = diag(exp(q))`, so `log|det J| = sum(q)` and its gradient is all ones.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogTransform {
    n_parameters: usize,
}

impl LogTransform {
    pub fn new(n_parameters: usize) -> Self {
        Self { n_parameters }
    }
}

impl Transform for LogTransform {
    fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    fn to_model(&self, q: &[f64]) -> Vec<f64> {
        debug_assert_eq!(q.len(), self.n_parameters());
        q.iter().take(self.n_parameters).map(|v| v.exp()).collect()
    }

    fn to_search(&self, p: &[f64]) -> Vec<f64> {
        debug_assert_eq!(p.len(), self.n_parameters());
        p.iter().take(self.n_parameters).map(|v| v.ln()).collect()
    }

    fn elementwise(&self) -> bool {
        true
    }

    fn supports_jacobian(&self) -> bool {
        true
    }

    fn supports_jacobian_s1(&self) -> bool {
        true
    }

    fn jacobian(&self, q: &[f64]) -> Result<DMatrix<f64>> {
        Ok(self.jacobian_s1(q)?.0)
    }

    fn jacobian_s1(&self, q: &[f64]) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>)> {
        let diag: Vec<f64> = q.iter().map(|v| v.exp()).collect();
        Ok(diagonal_s1(diag.clone(), diag))
    }

    fn log_jacobian_det(&self, q: &[f64]) -> Result<f64> {
        Ok(q.iter().sum())
    }

    fn log_jacobian_det_s1(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        Ok((q.iter().sum(), vec![1.0; q.len()]))
    }
}

/**
Logit (log-odds) transform, `q = log(p / (1 - p))`, for parameters in `(0, 1)`.

`J = diag(s (1 - s))` with `s = sigmoid(q)`; the gradient of `log|det J|` is `1 - 2 s`.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogitTransform {
    n_parameters: usize,
}

impl LogitTransform {
    pub fn new(n_parameters: usize) -> Self {
        Self { n_parameters }
    }
}

impl Transform for LogitTransform {
    fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    fn to_model(&self, q: &[f64]) -> Vec<f64> {
        debug_assert_eq!(q.len(), self.n_parameters());
        q.iter().take(self.n_parameters).map(|&v| sigmoid(v)).collect()
    }

    fn to_search(&self, p: &[f64]) -> Vec<f64> {
        debug_assert_eq!(p.len(), self.n_parameters());
        p.iter().take(self.n_parameters).map(|&v| logit(v)).collect()
    }

    fn elementwise(&self) -> bool {
        true
    }

    fn supports_jacobian(&self) -> bool {
        true
    }

    fn supports_jacobian_s1(&self) -> bool {
        true
    }

    fn jacobian(&self, q: &[f64]) -> Result<DMatrix<f64>> {
        Ok(self.jacobian_s1(q)?.0)
    }

    fn jacobian_s1(&self, q: &[f64]) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>)> {
        let (diag, ddiag) = q
            .iter()
            .map(|&v| {
                let s = sigmoid(v);
                let d = s * (1.0 - s);
                (d, d * (1.0 - 2.0 * s))
            })
            .unzip();
        Ok(diagonal_s1(diag, ddiag))
    }

    fn log_jacobian_det(&self, q: &[f64]) -> Result<f64> {
        Ok(q.iter().map(|&v| log_sigmoid(v) + log_sigmoid(-v)).sum())
    }

    fn log_jacobian_det_s1(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        let grad = q.iter().map(|&v| 1.0 - 2.0 * sigmoid(v)).collect();
        Ok((self.log_jacobian_det(q)?, grad))
    }
}

/**
Maps a box `[a, b)` onto the whole real line, `q = log(p - a) - log(b - p)`.

This generalizes [`LogitTransform`], which is the special case `a = 0`, `b = 1`. The log
Jacobian determinant is evaluated as `log(b - a) - 2 softplus(-q) - q`, which stays finite
for large `|q|`.

The map itself does not: `sigmoid(q)` rounds to exactly `1` for `q` above roughly `37`, so
[`Transform::to_model`] returns `b`, which lies outside `[a, b)`. Densities wrapped with this
transform then evaluate to negative infinity there, and `to_search(to_model(q))` is infinite.
Round trips are exact only for moderate `|q|`.

# Examples

```rust
use mini_abc::transformation::{RectangularBoundariesTransform, Transform};

let t = RectangularBoundariesTransform::new(vec![0.0, 1.0, 2.0], vec![4.0, 5.0, 6.0]).unwrap();
let q = t.to_search(&[1.0, 2.0, 3.0]);
assert!(t.log_jacobian_det(&[800.0, -800.0, 0.0]).unwrap().is_finite());
assert_eq!(q.len(), 3);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct RectangularBoundariesTransform {
    lower: Vec<f64>,
    upper: Vec<f64>,
    log_width: Vec<f64>,
}

impl RectangularBoundariesTransform {
    /// Creates the transform from lower and upper bounds; the bounds are validated like
    /// [`RectangularBoundaries::new`].
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        let boundaries = RectangularBoundaries::new(lower, upper)?;
        Ok(Self::from_boundaries(&boundaries))
    }

    pub fn from_boundaries(boundaries: &RectangularBoundaries) -> Self {
        let lower = boundaries.lower().to_vec();
        let upper = boundaries.upper().to_vec();
        let log_width = boundaries.range().iter().map(|w| w.ln()).collect();
        Self {
            lower,
            upper,
            log_width,
        }
    }

    fn bounds(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.lower.iter().copied().zip(self.upper.iter().copied())
    }
}

impl Transform for RectangularBoundariesTransform {
    fn n_parameters(&self) -> usize {
        self.lower.len()
    }

    fn to_model(&self, q: &[f64]) -> Vec<f64> {
        debug_assert_eq!(q.len(), self.n_parameters());
        q.iter()
            .zip(self.bounds())
            .map(|(&v, (a, b))| (b - a) * sigmoid(v) + a)
            .collect()
    }

    fn to_search(&self, p: &[f64]) -> Vec<f64> {
        debug_assert_eq!(p.len(), self.n_parameters());
        p.iter()
            .zip(self.bounds())
            .map(|(&v, (a, b))| (v - a).ln() - (b - v).ln())
            .collect()
    }

    fn elementwise(&self) -> bool {
        true
    }

    fn supports_jacobian(&self) -> bool {
        true
    }

    fn supports_jacobian_s1(&self) -> bool {
        true
    }

    fn jacobian(&self, q: &[f64]) -> Result<DMatrix<f64>> {
        Ok(self.jacobian_s1(q)?.0)
    }

    fn jacobian_s1(&self, q: &[f64]) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>)> {
        let (diag, ddiag) = q
            .iter()
            .zip(&self.log_width)
            .map(|(&v, lw)| {
                let d = (lw + log_sigmoid(v) + log_sigmoid(-v)).exp();
                (d, d * (1.0 - 2.0 * sigmoid(v)))
            })
            .unzip();
        Ok(diagonal_s1(diag, ddiag))
    }

    fn log_jacobian_det(&self, q: &[f64]) -> Result<f64> {
        Ok(q.iter()
            .zip(&self.log_width)
            .map(|(&v, lw)| lw - 2.0 * softplus(-v) - v)
            .sum())
    }

    fn log_jacobian_det_s1(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        let grad = q.iter().map(|&v| 1.0 - 2.0 * sigmoid(v)).collect();
        Ok((self.log_jacobian_det(q)?, grad))
    }
}

/**
Linear rescaling, `q = s * (p + t)`, with an optional translation `t` (zero by default).

Useful to bring parameters of very different magnitudes onto a comparable scale.

# Examples

```rust
use mini_abc::transformation::{ScalingTransform, Transform};

let t = ScalingTransform::new(vec![10.0, 0.1])
    .unwrap()
    .with_translation(vec![1.0, 0.0])
    .unwrap();
assert_eq!(t.to_search(&[1.0, 50.0]), vec![20.0, 5.0]);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingTransform {
    scalings: Vec<f64>,
    translation: Vec<f64>,
}

impl ScalingTransform {
    /// Fails if any scaling factor is zero or not finite.
    pub fn new(scalings: Vec<f64>) -> Result<Self> {
        if scalings.is_empty() {
            return Err(Error::Validation(
                "scaling transform needs at least one parameter".to_string(),
            ));
        }
        if scalings.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(Error::Validation(
                "scaling factors must be finite and non-zero".to_string(),
            ));
        }
        let translation = vec![0.0; scalings.len()];
        Ok(Self {
            scalings,
            translation,
        })
    }

    /// Adds a translation applied before scaling.
    pub fn with_translation(mut self, translation: Vec<f64>) -> Result<Self> {
        check_dimension(self.scalings.len(), translation.len())?;
        self.translation = translation;
        Ok(self)
    }
}

impl Transform for ScalingTransform {
    fn n_parameters(&self) -> usize {
        self.scalings.len()
    }

    fn to_model(&self, q: &[f64]) -> Vec<f64> {
        debug_assert_eq!(q.len(), self.n_parameters());
        q.iter()
            .zip(self.scalings.iter().zip(&self.translation))
            .map(|(v, (s, t))| v / s - t)
            .collect()
    }

    fn to_search(&self, p: &[f64]) -> Vec<f64> {
        debug_assert_eq!(p.len(), self.n_parameters());
        p.iter()
            .zip(self.scalings.iter().zip(&self.translation))
            .map(|(v, (s, t))| s * (v + t))
            .collect()
    }

    fn elementwise(&self) -> bool {
        true
    }

    fn supports_jacobian(&self) -> bool {
        true
    }

    fn supports_jacobian_s1(&self) -> bool {
        true
    }

    fn jacobian(&self, q: &[f64]) -> Result<DMatrix<f64>> {
        Ok(self.jacobian_s1(q)?.0)
    }

    fn jacobian_s1(&self, _q: &[f64]) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>)> {
        let diag = self.scalings.iter().map(|s| 1.0 / s).collect();
        Ok(diagonal_s1(diag, vec![0.0; self.scalings.len()]))
    }

    fn log_jacobian_det(&self, _q: &[f64]) -> Result<f64> {
        Ok(-self.scalings.iter().map(|s| s.abs().ln()).sum::<f64>())
    }

    fn log_jacobian_det_s1(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        Ok((self.log_jacobian_det(q)?, vec![0.0; self.scalings.len()]))
    }
}

/**
Block-diagonal composition of independent transforms.

The parameter vector is split into consecutive blocks, one per sub-transform, in the order
the sub-transforms are given. The dimension is the sum of the sub-dimensions.

Two flavours exist: [`ComposedTransform::new`] accepts any sub-transforms and reports itself
as not element-wise, while [`ComposedTransform::elementwise`] requires every sub-transform to
be element-wise and is element-wise itself.
*/
pub struct ComposedTransform {
    transforms: Vec<Box<dyn Transform>>,
    n_parameters: usize,
    elementwise: bool,
}

impl ComposedTransform {
    /// Composes one or more transforms.
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Result<Self> {
        Self::build(transforms, false)
    }

    /// Composes one or more element-wise transforms; fails if any sub-transform is not
    /// element-wise.
    pub fn elementwise(transforms: Vec<Box<dyn Transform>>) -> Result<Self> {
        if let Some(i) = transforms.iter().position(|t| !t.elementwise()) {
            return Err(Error::Validation(format!(
                "sub-transform {i} is not element-wise"
            )));
        }
        Self::build(transforms, true)
    }

    fn build(transforms: Vec<Box<dyn Transform>>, elementwise: bool) -> Result<Self> {
        if transforms.is_empty() {
            return Err(Error::Validation(
                "must have at least one sub-transform".to_string(),
            ));
        }
        let n_parameters = transforms.iter().map(|t| t.n_parameters()).sum();
        Ok(Self {
            transforms,
            n_parameters,
            elementwise,
        })
    }

    /// Number of sub-transforms.
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Each sub-transform with the index range of its block.
    fn blocks(&self) -> impl Iterator<Item = (&dyn Transform, Range<usize>)> + '_ {
        let mut lo = 0;
        self.transforms.iter().map(move |t| {
            let hi = lo + t.n_parameters();
            let range = lo..hi;
            lo = hi;
            (&**t, range)
        })
    }

    fn map_blocks(&self, x: &[f64], f: impl Fn(&dyn Transform, &[f64]) -> Vec<f64>) -> Vec<f64> {
        debug_assert_eq!(
            x.len(),
            self.n_parameters,
            "composed transform called with a vector of the wrong length"
        );
        let mut out = Vec::with_capacity(x.len());
        for (t, range) in self.blocks() {
            if range.start >= x.len() {
                break;
            }
            out.extend(f(t, &x[range.start..range.end.min(x.len())]));
        }
        out
    }
}

impl Transform for ComposedTransform {
    fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    fn to_model(&self, q: &[f64]) -> Vec<f64> {
        self.map_blocks(q, |t, block| t.to_model(block))
    }

    fn to_search(&self, p: &[f64]) -> Vec<f64> {
        self.map_blocks(p, |t, block| t.to_search(block))
    }

    fn elementwise(&self) -> bool {
        self.elementwise
    }

    fn supports_jacobian(&self) -> bool {
        self.transforms.iter().all(|t| t.supports_jacobian())
    }

    fn supports_jacobian_s1(&self) -> bool {
        self.transforms.iter().all(|t| t.supports_jacobian_s1())
    }

    fn supports_log_jacobian_det(&self) -> bool {
        self.transforms.iter().all(|t| t.supports_log_jacobian_det())
    }

    fn jacobian(&self, q: &[f64]) -> Result<DMatrix<f64>> {
        check_dimension(self.n_parameters, q.len())?;
        let n = self.n_parameters;
        let mut out = DMatrix::zeros(n, n);
        for (t, range) in self.blocks() {
            let k = range.len();
            let jac = t.jacobian(&q[range.clone()])?;
            out.view_mut((range.start, range.start), (k, k))
                .copy_from(&jac);
        }
        Ok(out)
    }

    fn jacobian_s1(&self, q: &[f64]) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>)> {
        check_dimension(self.n_parameters, q.len())?;
        let n = self.n_parameters;
        let mut jac = DMatrix::zeros(n, n);
        let mut djac = Vec::with_capacity(n);
        for (t, range) in self.blocks() {
            let k = range.len();
            let lo = range.start;
            let (sub, dsub) = t.jacobian_s1(&q[range])?;
            jac.view_mut((lo, lo), (k, k)).copy_from(&sub);
            for d in dsub {
                let mut full = DMatrix::zeros(n, n);
                full.view_mut((lo, lo), (k, k)).copy_from(&d);
                djac.push(full);
            }
        }
        Ok((jac, djac))
    }

    fn log_jacobian_det(&self, q: &[f64]) -> Result<f64> {
        check_dimension(self.n_parameters, q.len())?;
        self.blocks()
            .map(|(t, range)| t.log_jacobian_det(&q[range]))
            .sum()
    }

    fn log_jacobian_det_s1(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        check_dimension(self.n_parameters, q.len())?;
        let mut value = 0.0;
        let mut grad = Vec::with_capacity(q.len());
        for (t, range) in self.blocks() {
            let (v, g) = t.log_jacobian_det_s1(&q[range])?;
            value += v;
            grad.extend(g);
        }
        Ok((value, grad))
    }
}
