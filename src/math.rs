//! Numerically stable scalar helpers shared by the transforms and the samplers.
//!
//! All functions are generic over the floating-point precision via
//! [`num_traits::Float`].

use num_traits::Float;

/// Stable `log(1 + exp(x))`.
///
/// Uses `max(x, 0) + log(1 + exp(-|x|))`, so `exp` never sees a positive argument.
#[inline]
pub fn softplus<T: Float>(x: T) -> T {
    x.max(T::zero()) + (-x.abs()).exp().ln_1p()
}

/// Stable logistic function `1 / (1 + exp(-x))`.
#[inline]
pub fn sigmoid<T: Float>(x: T) -> T {
    let e = (-x.abs()).exp();
    let recip = T::one() / (T::one() + e);
    if x >= T::zero() {
        recip
    } else {
        e * recip
    }
}

/// Stable `log(sigmoid(x)) = -softplus(-x)`.
#[inline]
pub fn log_sigmoid<T: Float>(x: T) -> T {
    -softplus(-x)
}

/// Logit (log-odds) `log(p / (1 - p))`.
#[inline]
pub fn logit<T: Float>(p: T) -> T {
    p.ln() - (-p).ln_1p()
}

/// `log(sum(exp(xs)))` without overflow.
///
/// Returns negative infinity for an empty slice or when every term is
/// negative infinity.
pub fn log_sum_exp<T: Float>(xs: &[T]) -> T {
    let max = xs.iter().copied().fold(T::neg_infinity(), T::max);
    if max == T::neg_infinity() {
        return max;
    }
    if max == T::infinity() {
        return max;
    }
    let sum = xs
        .iter()
        .fold(T::zero(), |acc, &x| acc + (x - max).exp());
    max + sum.ln()
}
