/*!
# Adaptive ABC-SMC (population Monte Carlo) sampler

Approximate Bayesian computation replaces the likelihood with a discrepancy between data
simulated from a candidate parameter and the observed data. This sampler evolves a weighted
population of particles through a sequence of shrinking acceptance thresholds `epsilon`,
in the spirit of Sisson, Fan and Tanaka (2007) with an adaptive threshold schedule and an
acceptance-rate based stopping rule.

## Protocol

The sampler does not simulate anything itself. A driving loop alternates between

1. [`AbcSmc::ask`], which proposes a batch of parameter vectors, and
2. [`AbcSmc::tell`], which receives one discrepancy per proposal, in the same order.

Calling either method out of turn is an [`Error::Protocol`].

- **Iteration 0** samples the batch from the prior. `tell` sets `epsilon` to the `N_l`-th
  smallest discrepancy, keeps the particles at or below it with uniform weights, and sets the
  proposal covariance to twice their weighted empirical covariance.
- **Later iterations** propose `n - N_l` particles by picking a parent with probability
  proportional to its weight and perturbing it with a Gaussian kernel, rejecting points
  outside the prior support. `tell` computes importance weights
  `prior(x) / sum_j w_j K(x; theta_j)` against the previous population and the fraction
  `p_acc` of the batch within the current `epsilon`. If `p_acc <= p_acc_min` the sampler has
  converged and returns its final population; otherwise `epsilon` becomes the `N_l`-th
  smallest discrepancy of old and new particles together, and both are filtered by it.

## Example

```rust
use mini_abc::abc_smc::{AbcSmc, TellOutcome};
use mini_abc::distributions::GaussianPrior;

let mut abc = AbcSmc::new(GaussianPrior::standard(2)).unwrap().set_seed(42);
abc.set_n_l(50).unwrap();

let xs = abc.ask(100).unwrap();
let fx: Vec<f64> = xs.iter().map(|x| x.iter().map(|v| v * v).sum::<f64>().sqrt()).collect();
assert_eq!(abc.tell(&fx).unwrap(), TellOutcome::Continue);
assert_eq!(abc.population().len(), 50);
```
*/

use nalgebra::{DMatrix, DVector};
use rand::prelude::*;
use rayon::prelude::*;

use crate::distributions::{GaussianKernel, LogPrior};
use crate::error::{check_dimension, Error, Result};
use crate::math::log_sum_exp;

/// Default cap on perturbation attempts per proposed particle.
pub const DEFAULT_MAX_ATTEMPTS: usize = 10_000;

/// Default minimum acceptance probability.
pub const DEFAULT_P_ACC_MIN: f64 = 0.5;

/// Lower bound for `1 - sum(w_i^2)` in [`weighted_covariance`]; reached when the weight is
/// concentrated on a single particle.
const DEGENERATE_WEIGHT_FLOOR: f64 = f64::EPSILON;

/// What a completed [`AbcSmc::tell`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TellOutcome {
    /// The population was updated; ask for the next batch.
    Continue,
    /// The acceptance rate dropped to `p_acc_min`. Holds the final population.
    Converged(Vec<Vec<f64>>),
}

/// State computed by `tell` before it is committed to the sampler.
enum Refinement {
    Next { population: Population, epsilon: f64 },
    Converged(Population),
}

#[derive(Debug, Clone)]
enum Phase {
    AwaitingAsk,
    AwaitingTell(Vec<Vec<f64>>),
    Converged,
}

/// The accepted particles of the current iteration and everything derived from them.
#[derive(Debug, Clone)]
struct Population {
    particles: Vec<Vec<f64>>,
    weights: Vec<f64>,
    discrepancies: Vec<f64>,
    proposal_cov: DMatrix<f64>,
    kernel: GaussianKernel,
}

impl Population {
    fn new(particles: Vec<Vec<f64>>, weights: Vec<f64>, discrepancies: Vec<f64>) -> Result<Self> {
        debug_assert_eq!(particles.len(), weights.len());
        debug_assert_eq!(particles.len(), discrepancies.len());
        let proposal_cov = weighted_covariance(&particles, &weights)? * 2.0;
        let kernel = GaussianKernel::new(&proposal_cov)?;
        Ok(Self {
            particles,
            weights,
            discrepancies,
            proposal_cov,
            kernel,
        })
    }

    /// Draws a parent by weight and perturbs it until the prior log-density is finite.
    fn perturb<P, R>(&self, prior: &P, total_weight: f64, max_attempts: usize, rng: &mut R) -> Result<Vec<f64>>
    where
        P: LogPrior,
        R: Rng,
    {
        for _ in 0..max_attempts {
            let parent = &self.particles[weighted_index(&self.weights, total_weight, rng)];
            let candidate = self.kernel.sample(parent, rng);
            if prior.log_prob(&candidate).is_finite() {
                return Ok(candidate);
            }
        }
        Err(Error::ProposalExhausted {
            attempts: max_attempts,
        })
    }

    /// `prior(x) / sum_j (w_j / W) K(theta_j; x)`, evaluated in log space.
    fn importance_weight<P: LogPrior>(&self, prior: &P, log_w: &[f64], x: &[f64]) -> Result<f64> {
        let terms: Vec<f64> = self
            .particles
            .iter()
            .zip(log_w)
            .map(|(theta, lw)| lw + self.kernel.log_pdf(theta, x))
            .collect();
        let log_norm = log_sum_exp(&terms);
        if log_norm == f64::NEG_INFINITY {
            return Err(Error::Degenerate(
                "candidate has zero kernel density under the previous population".to_string(),
            ));
        }
        let weight = (prior.log_prob(x) - log_norm).exp();
        if weight.is_finite() {
            Ok(weight)
        } else {
            Err(Error::Degenerate(format!(
                "importance weight is not finite ({weight})"
            )))
        }
    }
}

/**
The adaptive ABC-SMC sampler.

The sampler owns the prior, the accepted population with its weights and discrepancies, the
threshold schedule and the proposal covariance. It is driven through [`AbcSmc::ask`] and
[`AbcSmc::tell`]; see the [module documentation](self) for the algorithm.

# Configuration

- [`AbcSmc::set_n_l`]: the number of particles kept per iteration (required before the first
  `tell`).
- [`AbcSmc::set_p_acc_min`]: the acceptance probability at which the sampler stops
  (default `0.5`).
- [`AbcSmc::set_max_attempts`]: cap on perturbation attempts per proposal (default `10_000`).
- [`AbcSmc::set_seed`]: seed for the internal RNG.
*/
#[derive(Debug, Clone)]
pub struct AbcSmc<P> {
    prior: P,
    dim: usize,
    phase: Phase,
    iteration: usize,
    n_l: Option<usize>,
    p_acc_min: f64,
    max_attempts: usize,
    population: Option<Population>,
    epsilons: Vec<f64>,
    /// The random seed.
    pub seed: u64,
    rng: SmallRng,
}

impl<P> AbcSmc<P>
where
    P: LogPrior + Sync,
{
    /// Creates a sampler at iteration 0 for the given prior.
    pub fn new(prior: P) -> Result<Self> {
        let dim = prior.n_parameters();
        if dim == 0 {
            return Err(Error::Validation(
                "prior must have at least one parameter".to_string(),
            ));
        }
        let seed = thread_rng().gen::<u64>();
        Ok(Self {
            prior,
            dim,
            phase: Phase::AwaitingAsk,
            iteration: 0,
            n_l: None,
            p_acc_min: DEFAULT_P_ACC_MIN,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            population: None,
            epsilons: Vec::new(),
            seed,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    /// Re-seeds the internal RNG.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Sets `N_l`, the number of particles that must fall below each new threshold.
    pub fn set_n_l(&mut self, n_l: usize) -> Result<()> {
        if n_l == 0 {
            return Err(Error::InvalidConfig("N_l must be at least 1".to_string()));
        }
        self.n_l = Some(n_l);
        Ok(())
    }

    /// Sets the acceptance probability in `(0, 1]` at or below which the sampler stops.
    pub fn set_p_acc_min(&mut self, p_acc_min: f64) -> Result<()> {
        if !(p_acc_min > 0.0 && p_acc_min <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "p_acc_min must lie in (0, 1], got {p_acc_min}"
            )));
        }
        self.p_acc_min = p_acc_min;
        Ok(())
    }

    /// Sets the maximum number of perturbation attempts for a single proposal.
    pub fn set_max_attempts(&mut self, max_attempts: usize) -> Result<()> {
        if max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        self.max_attempts = max_attempts;
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        "ABC-Adaptive-PMC"
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    pub fn n_parameters(&self) -> usize {
        self.dim
    }

    /// Number of completed population updates; 0 until the first `tell`.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn n_l(&self) -> Option<usize> {
        self.n_l
    }

    pub fn p_acc_min(&self) -> f64 {
        self.p_acc_min
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Current threshold, once the first `tell` has completed.
    pub fn epsilon(&self) -> Option<f64> {
        self.epsilons.last().copied()
    }

    /// Every threshold so far, in order. Non-increasing.
    pub fn epsilon_history(&self) -> &[f64] {
        &self.epsilons
    }

    /// Accepted particles.
    pub fn population(&self) -> &[Vec<f64>] {
        self.population
            .as_ref()
            .map_or(&[], |p| p.particles.as_slice())
    }

    /// Importance weights, aligned with [`AbcSmc::population`]. Not normalized.
    pub fn weights(&self) -> &[f64] {
        self.population.as_ref().map_or(&[], |p| p.weights.as_slice())
    }

    /// Discrepancies, aligned with [`AbcSmc::population`].
    pub fn discrepancies(&self) -> &[f64] {
        self.population
            .as_ref()
            .map_or(&[], |p| p.discrepancies.as_slice())
    }

    /// Covariance of the perturbation kernel: twice the weighted empirical covariance of the
    /// population.
    pub fn proposal_covariance(&self) -> Option<&DMatrix<f64>> {
        self.population.as_ref().map(|p| &p.proposal_cov)
    }

    /// `true` once a `tell` has returned [`TellOutcome::Converged`].
    pub fn is_converged(&self) -> bool {
        matches!(self.phase, Phase::Converged)
    }

    /// `true` while a proposed batch awaits its discrepancies.
    pub fn is_awaiting_tell(&self) -> bool {
        matches!(self.phase, Phase::AwaitingTell(_))
    }

    fn require_n_l(&self) -> Result<usize> {
        self.n_l.ok_or(Error::MissingConfig("N_l must be set with set_n_l"))
    }

    /**
    Proposes a batch of parameter vectors.

    At iteration 0 this draws `n` samples from the prior. Afterwards it proposes `n - N_l`
    perturbed particles, so `n` must exceed `N_l`. Proposals are generated in parallel, each
    with its own RNG derived from the sampler RNG, so results only depend on the seed.

    # Errors

    - [`Error::Protocol`] if a batch is already waiting for `tell`, or after convergence.
    - [`Error::MissingConfig`] if `N_l` is needed but unset.
    - [`Error::ProposalExhausted`] if a proposal hit the attempt cap.
    */
    pub fn ask(&mut self, n: usize) -> Result<Vec<Vec<f64>>> {
        match self.phase {
            Phase::AwaitingAsk => {}
            Phase::AwaitingTell(_) => return Err(Error::Protocol("ask called before tell")),
            Phase::Converged => return Err(Error::Protocol("sampler has already converged")),
        }
        if n == 0 {
            return Err(Error::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }

        let xs = match &self.population {
            None => {
                let xs = self.prior.sample(n, &mut self.rng);
                for x in &xs {
                    check_dimension(self.dim, x.len())?;
                }
                xs
            }
            Some(population) => {
                let n_l = self.n_l.ok_or(Error::MissingConfig("N_l must be set with set_n_l"))?;
                if n <= n_l {
                    return Err(Error::InvalidConfig(format!(
                        "batch size {n} must exceed N_l = {n_l}"
                    )));
                }
                let total_weight: f64 = population.weights.iter().sum();
                let base_seed: u64 = self.rng.gen();
                let prior = &self.prior;
                let max_attempts = self.max_attempts;
                (0..n - n_l)
                    .into_par_iter()
                    .map(|slot| {
                        let mut rng = SmallRng::seed_from_u64(base_seed.wrapping_add(slot as u64));
                        population.perturb(prior, total_weight, max_attempts, &mut rng)
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };

        self.phase = Phase::AwaitingTell(xs.clone());
        Ok(xs)
    }

    /**
    Consumes the discrepancies for the batch returned by the last [`AbcSmc::ask`].

    `fx[i]` must belong to the `i`-th proposal. Returns [`TellOutcome::Converged`] with the
    final population once the acceptance probability has dropped to `p_acc_min`.

    # Errors

    - [`Error::Protocol`] if no batch is pending, or after convergence.
    - [`Error::DimensionMismatch`] if `fx` and the batch differ in length. The batch stays
      pending in that case.
    - [`Error::MissingConfig`] if `N_l` is unset. The batch stays pending.
    - [`Error::Degenerate`] if the weights or the covariance become unusable. The batch is
      discarded and the population is left as it was.
    */
    pub fn tell(&mut self, fx: &[f64]) -> Result<TellOutcome> {
        match &self.phase {
            Phase::AwaitingTell(xs) => check_dimension(xs.len(), fx.len())?,
            Phase::AwaitingAsk => return Err(Error::Protocol("tell called before ask")),
            Phase::Converged => return Err(Error::Protocol("sampler has already converged")),
        }
        let n_l = self.require_n_l()?;
        let xs = match std::mem::replace(&mut self.phase, Phase::AwaitingAsk) {
            Phase::AwaitingTell(xs) => xs,
            _ => return Err(Error::Protocol("tell called before ask")),
        };

        let refinement = match (&self.population, self.epsilon()) {
            (Some(previous), Some(epsilon)) => self.refine(previous, epsilon, xs, fx, n_l),
            _ => self.initialize(xs, fx, n_l),
        };
        let refinement = refinement.map_err(|e| {
            log::warn!("ABC-SMC tell failed at iteration {}: {e}", self.iteration);
            e
        })?;

        match refinement {
            Refinement::Next {
                population,
                epsilon,
            } => {
                self.population = Some(population);
                self.epsilons.push(epsilon);
                self.iteration += 1;
                Ok(TellOutcome::Continue)
            }
            Refinement::Converged(population) => {
                let particles = population.particles.clone();
                self.population = Some(population);
                self.phase = Phase::Converged;
                Ok(TellOutcome::Converged(particles))
            }
        }
    }

    fn initialize(&self, xs: Vec<Vec<f64>>, fx: &[f64], n_l: usize) -> Result<Refinement> {
        let epsilon = order_statistic(fx, n_l)?;
        let (particles, discrepancies): (Vec<_>, Vec<_>) = xs
            .into_iter()
            .zip(fx.iter().copied())
            .filter(|(_, f)| *f <= epsilon)
            .unzip();
        let weights = vec![1.0 / particles.len() as f64; particles.len()];

        log::debug!(
            "ABC-SMC initialized: epsilon={epsilon}, accepted {} of {}",
            particles.len(),
            fx.len()
        );
        Ok(Refinement::Next {
            population: Population::new(particles, weights, discrepancies)?,
            epsilon,
        })
    }

    fn refine(
        &self,
        previous: &Population,
        epsilon: f64,
        xs: Vec<Vec<f64>>,
        fx: &[f64],
        n_l: usize,
    ) -> Result<Refinement> {
        let total_weight: f64 = previous.weights.iter().sum();
        if !(total_weight > 0.0 && total_weight.is_finite()) {
            return Err(Error::Degenerate(format!(
                "population weights sum to {total_weight}"
            )));
        }
        let log_w: Vec<f64> = previous
            .weights
            .iter()
            .map(|w| (w / total_weight).ln())
            .collect();
        let prior = &self.prior;
        let new_weights = xs
            .par_iter()
            .map(|x| previous.importance_weight(prior, &log_w, x))
            .collect::<Result<Vec<f64>>>()?;

        let accepted = fx.iter().filter(|f| **f <= epsilon).count();
        let p_acc = accepted as f64 / fx.len() as f64;

        if p_acc <= self.p_acc_min {
            log::info!(
                "ABC-SMC converged after {} iterations: p_acc={p_acc}, epsilon={epsilon}",
                self.iteration
            );
            let mut particles = previous.particles.clone();
            let mut weights = previous.weights.clone();
            let mut discrepancies = previous.discrepancies.clone();
            particles.extend(xs);
            weights.extend(new_weights);
            discrepancies.extend_from_slice(fx);
            return Ok(Refinement::Converged(Population::new(
                particles,
                weights,
                discrepancies,
            )?));
        }

        let combined: Vec<f64> = previous.discrepancies.iter().chain(fx).copied().collect();
        let next_epsilon = order_statistic(&combined, n_l)?;

        let capacity = previous.particles.len() + xs.len();
        let mut particles = Vec::with_capacity(capacity);
        let mut weights = Vec::with_capacity(capacity);
        let mut discrepancies = Vec::with_capacity(capacity);
        let old = previous
            .particles
            .iter()
            .cloned()
            .zip(previous.weights.iter().copied())
            .zip(previous.discrepancies.iter().copied());
        let new = xs.into_iter().zip(new_weights).zip(fx.iter().copied());
        for ((x, w), f) in old.chain(new) {
            if f <= next_epsilon {
                particles.push(x);
                weights.push(w);
                discrepancies.push(f);
            }
        }

        log::debug!(
            "ABC-SMC iteration {}: p_acc={p_acc}, epsilon {epsilon} -> {next_epsilon}, population {}",
            self.iteration,
            particles.len()
        );
        Ok(Refinement::Next {
            population: Population::new(particles, weights, discrepancies)?,
            epsilon: next_epsilon,
        })
    }
}

/// Returns the `k`-th smallest value (1-based) of `values`, ignoring NaNs.
///
/// # Errors
///
/// [`Error::InvalidConfig`] if `k` is zero, [`Error::Degenerate`] if fewer than `k` values are
/// not NaN.
pub fn order_statistic(values: &[f64], k: usize) -> Result<f64> {
    if k == 0 {
        return Err(Error::InvalidConfig(
            "order statistic index must be at least 1".to_string(),
        ));
    }
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.len() < k {
        return Err(Error::Degenerate(format!(
            "need at least {k} comparable discrepancies, got {}",
            sorted.len()
        )));
    }
    sorted.sort_unstable_by(f64::total_cmp);
    Ok(sorted[k - 1])
}

/// Picks an index with probability proportional to `weights`.
///
/// Draws `r` uniformly from `[0, total)` and returns the first index whose cumulative weight
/// exceeds `r`.
pub fn weighted_index<R: Rng>(weights: &[f64], total: f64, rng: &mut R) -> usize {
    let r = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if cumulative > r {
            return i;
        }
    }
    // Rounding can leave the cumulative sum just below `r`.
    weights.iter().rposition(|w| *w > 0.0).unwrap_or(weights.len() - 1)
}

/**
Weighted empirical covariance with the unbiased correction for normalized weights,

```text
C = sum_i w_i (x_i - m)(x_i - m)^T / (1 - sum_i w_i^2),   m = sum_i w_i x_i,
```

where the weights are normalized to sum to one first. When the weight is concentrated on a
single particle the denominator is floored at machine epsilon instead of reaching zero.

# Errors

[`Error::Degenerate`] if the population is empty, the weights do not have a positive finite
sum, or the result is not finite.
*/
pub fn weighted_covariance(points: &[Vec<f64>], weights: &[f64]) -> Result<DMatrix<f64>> {
    check_dimension(points.len(), weights.len())?;
    let first = points
        .first()
        .ok_or_else(|| Error::Degenerate("population is empty".to_string()))?;
    let dim = first.len();
    let total: f64 = weights.iter().sum();
    if !(total > 0.0 && total.is_finite()) {
        return Err(Error::Degenerate(format!("weights sum to {total}")));
    }

    let vectors = points
        .iter()
        .map(|x| {
            check_dimension(dim, x.len())?;
            Ok(DVector::from_column_slice(x))
        })
        .collect::<Result<Vec<_>>>()?;
    let normalized: Vec<f64> = weights.iter().map(|w| w / total).collect();

    let mut mean = DVector::zeros(dim);
    for (x, w) in vectors.iter().zip(&normalized) {
        mean.axpy(*w, x, 1.0);
    }

    let mut scatter = DMatrix::zeros(dim, dim);
    for (x, w) in vectors.iter().zip(&normalized) {
        let diff = x - &mean;
        scatter.ger(*w, &diff, &diff, 1.0);
    }

    let sum_sq: f64 = normalized.iter().map(|w| w * w).sum();
    let mut denom = 1.0 - sum_sq;
    if denom < DEGENERATE_WEIGHT_FLOOR {
        log::warn!("weights concentrated on a single particle; flooring covariance correction");
        denom = DEGENERATE_WEIGHT_FLOOR;
    }
    let cov = scatter / denom;
    if cov.iter().any(|v| !v.is_finite()) {
        return Err(Error::Degenerate(
            "weighted covariance is not finite".to_string(),
        ));
    }
    Ok(cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{GaussianPrior, LogPdf, RectangularBoundaries, UniformPrior};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use ndarray_stats::CorrelationExt;

    fn norm(x: &[f64]) -> f64 {
        x.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    fn seeded(n_l: usize) -> AbcSmc<GaussianPrior> {
        let mut abc = AbcSmc::new(GaussianPrior::standard(2)).unwrap().set_seed(42);
        abc.set_n_l(n_l).unwrap();
        abc
    }

    #[test]
    fn ask_twice_is_a_protocol_violation() {
        let mut abc = seeded(5);
        abc.ask(10).unwrap();
        assert!(matches!(abc.ask(10), Err(Error::Protocol(_))));
    }

    #[test]
    fn tell_before_ask_is_a_protocol_violation() {
        let mut abc = seeded(5);
        assert!(matches!(abc.tell(&[1.0; 10]), Err(Error::Protocol(_))));
    }

    #[test]
    fn missing_n_l_keeps_batch_pending() {
        let mut abc = AbcSmc::new(GaussianPrior::standard(2)).unwrap().set_seed(1);
        let xs = abc.ask(20).unwrap();
        let fx: Vec<f64> = xs.iter().map(|x| norm(x)).collect();
        assert!(matches!(abc.tell(&fx), Err(Error::MissingConfig(_))));
        assert!(abc.is_awaiting_tell());
        abc.set_n_l(10).unwrap();
        assert_eq!(abc.tell(&fx).unwrap(), TellOutcome::Continue);
    }

    #[test]
    fn wrong_number_of_discrepancies_keeps_batch_pending() {
        let mut abc = seeded(5);
        abc.ask(10).unwrap();
        assert!(matches!(
            abc.tell(&[0.0; 9]),
            Err(Error::DimensionMismatch { expected: 10, found: 9 })
        ));
        assert!(abc.is_awaiting_tell());
    }

    #[test]
    fn configuration_is_validated() {
        let mut abc = seeded(5);
        assert!(abc.set_n_l(0).is_err());
        assert!(abc.set_p_acc_min(0.0).is_err());
        assert!(abc.set_p_acc_min(1.5).is_err());
        assert!(abc.set_p_acc_min(f64::NAN).is_err());
        assert!(abc.set_p_acc_min(1.0).is_ok());
        assert!(abc.set_max_attempts(0).is_err());
        assert_eq!(abc.name(), "ABC-Adaptive-PMC");
    }

    #[test]
    fn first_iteration_keeps_n_l_particles() {
        let mut abc = seeded(50);
        let xs = abc.ask(100).unwrap();
        assert_eq!(xs.len(), 100);
        assert!(xs.iter().all(|x| x.len() == 2));

        let fx: Vec<f64> = xs.iter().map(|x| norm(x)).collect();
        let mut sorted = fx.clone();
        sorted.sort_by(f64::total_cmp);

        assert_eq!(abc.tell(&fx).unwrap(), TellOutcome::Continue);
        assert_eq!(abc.epsilon(), Some(sorted[49]));
        assert_eq!(abc.iteration(), 1);
        assert_eq!(abc.population().len(), 50);
        assert!(abc.weights().iter().all(|w| (w - 1.0 / 50.0).abs() < 1e-15));
        assert!(abc.discrepancies().iter().all(|d| *d <= sorted[49]));
    }

    #[test]
    fn batch_size_must_exceed_n_l_after_first_iteration() {
        let mut abc = seeded(10);
        let xs = abc.ask(20).unwrap();
        let fx: Vec<f64> = xs.iter().map(|x| norm(x)).collect();
        abc.tell(&fx).unwrap();
        assert!(matches!(abc.ask(10), Err(Error::InvalidConfig(_))));
        assert_eq!(abc.ask(25).unwrap().len(), 15);
    }

    #[test]
    fn p_acc_min_of_one_converges_on_first_refinement() {
        let mut abc = seeded(50);
        abc.set_p_acc_min(1.0).unwrap();
        let xs = abc.ask(100).unwrap();
        abc.tell(&xs.iter().map(|x| norm(x)).collect::<Vec<_>>()).unwrap();

        let xs = abc.ask(100).unwrap();
        assert_eq!(xs.len(), 50);
        let outcome = abc.tell(&xs.iter().map(|x| norm(x)).collect::<Vec<_>>()).unwrap();
        match outcome {
            TellOutcome::Converged(population) => assert_eq!(population.len(), 100),
            TellOutcome::Continue => panic!("expected convergence"),
        }
        assert!(abc.is_converged());
        assert_eq!(abc.population().len(), abc.weights().len());
        assert_eq!(abc.population().len(), abc.discrepancies().len());
        assert!(matches!(abc.ask(100), Err(Error::Protocol(_))));
    }

    #[test]
    fn importance_weights_follow_kernel_density_of_previous_population() {
        let mut abc = seeded(20);
        abc.set_p_acc_min(1.0).unwrap();
        let xs = abc.ask(40).unwrap();
        abc.tell(&xs.iter().map(|x| norm(x)).collect::<Vec<_>>()).unwrap();

        let old_particles = abc.population().to_vec();
        let old_weights = abc.weights().to_vec();
        let kernel = GaussianKernel::new(abc.proposal_covariance().unwrap()).unwrap();

        let xs = abc.ask(40).unwrap();
        abc.tell(&xs.iter().map(|x| norm(x)).collect::<Vec<_>>()).unwrap();
        let new_weights = &abc.weights()[old_particles.len()..];

        let total: f64 = old_weights.iter().sum();
        for (x, w) in xs.iter().zip(new_weights) {
            let denom: f64 = old_particles
                .iter()
                .zip(&old_weights)
                .map(|(theta, wj)| wj / total * kernel.log_pdf(theta, x).exp())
                .sum();
            let expected = abc.prior().log_prob(x).exp() / denom;
            assert_abs_diff_eq!(*w, expected, epsilon = 1e-9 * expected.max(1.0));
        }
    }

    #[test]
    fn epsilon_is_non_increasing_and_population_stays_aligned() {
        // Deterministic simulator: the discrepancy is the distance to the observation.
        let observed = [1.0, -0.5];
        let mut abc = seeded(100);
        abc.set_p_acc_min(0.01).unwrap();
        for _ in 0..8 {
            let xs = abc.ask(200).unwrap();
            let fx: Vec<f64> = xs
                .iter()
                .map(|x| ((x[0] - observed[0]).powi(2) + (x[1] - observed[1]).powi(2)).sqrt())
                .collect();
            let outcome = abc.tell(&fx).unwrap();
            assert_eq!(abc.population().len(), abc.weights().len());
            assert_eq!(abc.population().len(), abc.discrepancies().len());
            assert!(abc.population().len() >= 100);
            if outcome != TellOutcome::Continue {
                break;
            }
        }
        let history = abc.epsilon_history();
        assert!(history.len() >= 2);
        for pair in history.windows(2) {
            assert!(pair[1] <= pair[0], "epsilon increased: {pair:?}");
        }
        assert!(history[history.len() - 1] < history[0]);
    }

    #[test]
    fn same_seed_same_proposals() {
        let run = || {
            let mut abc = seeded(10);
            let xs = abc.ask(30).unwrap();
            abc.tell(&xs.iter().map(|x| norm(x)).collect::<Vec<_>>()).unwrap();
            abc.ask(30).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn proposals_respect_prior_support() {
        let prior = UniformPrior::new(RectangularBoundaries::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap());
        let mut abc = AbcSmc::new(prior).unwrap().set_seed(9);
        abc.set_n_l(20).unwrap();
        let xs = abc.ask(40).unwrap();
        abc.tell(&xs.iter().map(|x| norm(x)).collect::<Vec<_>>()).unwrap();
        for x in abc.ask(60).unwrap() {
            assert!(abc.prior().log_prob(&x).is_finite());
        }
    }

    /// A prior whose support is a finite set of points, so every perturbation leaves it.
    struct PointPrior;

    impl LogPdf for PointPrior {
        fn n_parameters(&self) -> usize {
            1
        }
        fn log_prob(&self, x: &[f64]) -> f64 {
            if x[0] == 0.0 || x[0] == 1.0 {
                0.0
            } else {
                f64::NEG_INFINITY
            }
        }
    }

    impl LogPrior for PointPrior {
        fn sample<R: Rng>(&self, n: usize, _rng: &mut R) -> Vec<Vec<f64>> {
            (0..n).map(|i| vec![(i % 2) as f64]).collect()
        }
    }

    #[test]
    fn rejection_loop_is_capped() {
        let mut abc = AbcSmc::new(PointPrior).unwrap().set_seed(3);
        abc.set_n_l(4).unwrap();
        abc.set_max_attempts(5).unwrap();
        let xs = abc.ask(4).unwrap();
        abc.tell(&xs.iter().map(|x| x[0]).collect::<Vec<_>>()).unwrap();
        assert_eq!(
            abc.ask(8),
            Err(Error::ProposalExhausted { attempts: 5 })
        );
        // The failed ask leaves the sampler ready for another attempt.
        assert!(!abc.is_awaiting_tell());
    }

    /// Finite log-density at 0 and 1, positive infinity everywhere else.
    struct SpikyPrior;

    impl LogPdf for SpikyPrior {
        fn n_parameters(&self) -> usize {
            1
        }
        fn log_prob(&self, x: &[f64]) -> f64 {
            if x[0] == 0.0 || x[0] == 1.0 {
                0.0
            } else {
                f64::INFINITY
            }
        }
    }

    impl LogPrior for SpikyPrior {
        fn sample<R: Rng>(&self, n: usize, _rng: &mut R) -> Vec<Vec<f64>> {
            (0..n).map(|i| vec![(i % 2) as f64]).collect()
        }
    }

    #[test]
    fn infinite_prior_density_is_not_feasible() {
        let mut abc = AbcSmc::new(SpikyPrior).unwrap().set_seed(5);
        abc.set_n_l(4).unwrap();
        abc.set_max_attempts(5).unwrap();
        let xs = abc.ask(4).unwrap();
        abc.tell(&xs.iter().map(|x| x[0]).collect::<Vec<_>>()).unwrap();
        assert_eq!(
            abc.ask(8),
            Err(Error::ProposalExhausted { attempts: 5 })
        );
    }

    #[test]
    fn order_statistic_picks_kth_smallest() {
        let values = [5.0, 1.0, f64::NAN, 3.0, 2.0];
        assert_eq!(order_statistic(&values, 1).unwrap(), 1.0);
        assert_eq!(order_statistic(&values, 3).unwrap(), 3.0);
        assert!(matches!(order_statistic(&values, 5), Err(Error::Degenerate(_))));
        assert!(order_statistic(&values, 0).is_err());
    }

    #[test]
    fn weighted_index_skips_zero_weights() {
        let mut rng = SmallRng::seed_from_u64(0);
        let weights = [0.0, 2.0, 0.0, 1.0, 0.0];
        let mut counts = [0usize; 5];
        for _ in 0..3000 {
            counts[weighted_index(&weights, 3.0, &mut rng)] += 1;
        }
        assert_eq!(counts[0] + counts[2] + counts[4], 0);
        assert!((counts[1] as f64 / 3000.0 - 2.0 / 3.0).abs() < 0.05);
    }

    #[test]
    fn uniform_weighted_covariance_matches_sample_covariance() {
        let mut rng = SmallRng::seed_from_u64(5);
        let prior = GaussianPrior::new(vec![0.0, 1.0, -1.0], vec![1.0, 2.0, 0.5]).unwrap();
        let points = prior.sample(50, &mut rng);
        let cov = weighted_covariance(&points, &[0.3; 50]).unwrap();

        let flat: Vec<f64> = points.iter().flatten().copied().collect();
        let arr = Array2::from_shape_vec((50, 3), flat).unwrap();
        let reference = arr.t().cov(1.0).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(cov[(i, j)], reference[[i, j]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn weighted_covariance_is_symmetric_psd() {
        let mut rng = SmallRng::seed_from_u64(11);
        let points = GaussianPrior::standard(3).sample(30, &mut rng);
        let weights: Vec<f64> = (0..30).map(|_| rng.gen::<f64>()).collect();
        let cov = weighted_covariance(&points, &weights).unwrap() * 2.0;
        assert_abs_diff_eq!((&cov - cov.transpose()).abs().max(), 0.0, epsilon = 1e-12);
        let eig = cov.symmetric_eigen();
        assert!(eig.eigenvalues.iter().all(|l| *l >= -1e-12));
    }

    #[test]
    fn weighted_covariance_guards_degenerate_weights() {
        let points = vec![vec![0.0, 1.0], vec![2.0, 3.0], vec![4.0, 5.0]];
        let cov = weighted_covariance(&points, &[1.0, 0.0, 0.0]).unwrap();
        assert!(cov.iter().all(|v| v.is_finite()));
        assert!(matches!(
            weighted_covariance(&points, &[0.0, 0.0, 0.0]),
            Err(Error::Degenerate(_))
        ));
        assert!(matches!(
            weighted_covariance(&[], &[]),
            Err(Error::Degenerate(_))
        ));
    }
}
