/*!
Driving loop for [`AbcSmc`].

[`AbcController`] repeatedly asks the sampler for a batch, evaluates an [`ErrorMeasure`] on
every proposal, and tells the sampler the results, until the sampler converges or an
iteration cap is reached.

```rust
use mini_abc::abc_smc::AbcSmc;
use mini_abc::controller::AbcController;
use mini_abc::distributions::{ErrorMeasure, GaussianPrior};

struct DistanceTo(f64);

impl ErrorMeasure for DistanceTo {
    fn n_parameters(&self) -> usize {
        1
    }
    fn evaluate(&self, x: &[f64]) -> f64 {
        (x[0] - self.0).abs()
    }
}

let sampler = AbcSmc::new(GaussianPrior::standard(1)).unwrap().set_seed(7);
let mut controller = AbcController::new(sampler, DistanceTo(0.5)).unwrap();
controller.set_n_samples(200).unwrap();
controller.set_max_iterations(5);

let run = controller.run().unwrap();
assert_eq!(run.samples.ncols(), 1);
assert_eq!(run.samples.nrows(), run.weights.len());
```
*/

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use rayon::prelude::*;

use crate::abc_smc::{AbcSmc, TellOutcome};
use crate::distributions::{ErrorMeasure, LogPrior};
use crate::error::{Error, Result};

const DEFAULT_N_SAMPLES: usize = 1000;
const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// The outcome of a controller run.
#[derive(Debug, Clone, PartialEq)]
pub struct AbcRun {
    /// Final population, one particle per row.
    pub samples: Array2<f64>,
    /// Importance weights aligned with the rows of `samples`.
    pub weights: Vec<f64>,
    /// Threshold after every completed iteration.
    pub epsilons: Vec<f64>,
    /// Completed population updates, as reported by [`AbcSmc::iteration`].
    pub iterations: usize,
    /// `false` if the run stopped at the iteration cap.
    pub converged: bool,
}

impl AbcRun {
    /// Weighted mean of the samples.
    pub fn weighted_mean(&self) -> Vec<f64> {
        let total: f64 = self.weights.iter().sum();
        self.samples
            .columns()
            .into_iter()
            .map(|col| col.iter().zip(&self.weights).map(|(x, w)| x * w).sum::<f64>() / total)
            .collect()
    }
}

/// Runs an [`AbcSmc`] sampler against an [`ErrorMeasure`].
pub struct AbcController<P, E> {
    sampler: AbcSmc<P>,
    error_measure: E,
    n_samples: usize,
    max_iterations: usize,
    parallel: bool,
}

impl<P, E> AbcController<P, E>
where
    P: LogPrior + Sync,
    E: ErrorMeasure + Sync,
{
    pub fn new(sampler: AbcSmc<P>, error_measure: E) -> Result<Self> {
        if sampler.n_parameters() != error_measure.n_parameters() {
            return Err(Error::DimensionMismatch {
                expected: sampler.n_parameters(),
                found: error_measure.n_parameters(),
            });
        }
        Ok(Self {
            sampler,
            error_measure,
            n_samples: DEFAULT_N_SAMPLES,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            parallel: true,
        })
    }

    /// Sets the batch size passed to [`AbcSmc::ask`]. If the sampler has no `N_l` when the run
    /// starts, half of this is used.
    pub fn set_n_samples(&mut self, n_samples: usize) -> Result<()> {
        if n_samples < 2 {
            return Err(Error::InvalidConfig(format!(
                "n_samples must be at least 2, got {n_samples}"
            )));
        }
        self.n_samples = n_samples;
        Ok(())
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) {
        self.max_iterations = max_iterations;
    }

    /// Evaluate the error measure with rayon (the default) or sequentially.
    pub fn set_parallel(&mut self, parallel: bool) {
        self.parallel = parallel;
    }

    pub fn sampler(&self) -> &AbcSmc<P> {
        &self.sampler
    }

    pub fn into_sampler(self) -> AbcSmc<P> {
        self.sampler
    }

    /// Runs until convergence or `max_iterations` completed iterations.
    pub fn run(&mut self) -> Result<AbcRun> {
        self.run_inner(None)
    }

    /// Like [`AbcController::run`], with a progress bar showing the current threshold.
    pub fn run_with_progress(&mut self) -> Result<AbcRun> {
        let pb = ProgressBar::new(self.max_iterations as u64);
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        pb.set_style(style);
        pb.set_prefix(self.sampler.name());

        let run = self.run_inner(Some(&pb));
        match &run {
            Ok(r) if r.converged => pb.finish_with_message("Converged"),
            Ok(_) => pb.finish_with_message("Iteration cap reached"),
            Err(e) => pb.abandon_with_message(e.to_string()),
        }
        run
    }

    fn run_inner(&mut self, pb: Option<&ProgressBar>) -> Result<AbcRun> {
        if self.sampler.n_l().is_none() {
            let n_l = self.n_samples / 2;
            log::debug!("N_l not set, using {n_l}");
            self.sampler.set_n_l(n_l)?;
        }

        let mut converged = self.sampler.is_converged();
        let mut completed = 0;
        while !converged && completed < self.max_iterations {
            let xs = self.sampler.ask(self.n_samples)?;
            let fx = self.evaluate(&xs);
            converged = matches!(self.sampler.tell(&fx)?, TellOutcome::Converged(_));
            completed += 1;

            if let Some(pb) = pb {
                pb.inc(1);
                if let Some(eps) = self.sampler.epsilon() {
                    pb.set_message(format!("epsilon={eps:.4e}"));
                }
            }
        }
        if !converged {
            log::info!(
                "stopped after {} iterations without converging",
                self.max_iterations
            );
        }

        let population = self.sampler.population();
        let dim = self.sampler.n_parameters();
        let flat: Vec<f64> = population.iter().flatten().copied().collect();
        let samples = Array2::from_shape_vec((population.len(), dim), flat)
            .map_err(|e| Error::Validation(e.to_string()))?;

        Ok(AbcRun {
            samples,
            weights: self.sampler.weights().to_vec(),
            epsilons: self.sampler.epsilon_history().to_vec(),
            iterations: self.sampler.iteration(),
            converged,
        })
    }

    fn evaluate(&self, xs: &[Vec<f64>]) -> Vec<f64> {
        let em = &self.error_measure;
        if self.parallel {
            xs.par_iter().map(|x| em.evaluate(x)).collect()
        } else {
            xs.iter().map(|x| em.evaluate(x)).collect()
        }
    }
}
