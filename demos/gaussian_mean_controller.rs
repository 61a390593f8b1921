//! Infers the mean and standard deviation of a Gaussian from summary statistics, searching an
//! unconstrained space mapped onto a box by a rectangular boundaries transform.

use mini_abc::abc_smc::AbcSmc;
use mini_abc::controller::AbcController;
use mini_abc::distributions::{ErrorMeasure, RectangularBoundaries, UniformPrior};
use mini_abc::transformation::{RectangularBoundariesTransform, Transform};
use mini_abc::transformed::TransformExt;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Simulates `mu + sigma * z` with fixed standard normal draws `z` and compares the sample mean
/// and standard deviation against the observed ones.
struct SummaryDistance {
    noise: Vec<f64>,
    observed: [f64; 2],
}

fn summaries(data: &[f64]) -> [f64; 2] {
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let var = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    [mean, var.sqrt()]
}

impl ErrorMeasure for SummaryDistance {
    fn n_parameters(&self) -> usize {
        2
    }

    fn evaluate(&self, x: &[f64]) -> f64 {
        let simulated: Vec<f64> = self.noise.iter().map(|z| x[0] + x[1] * z).collect();
        let s = summaries(&simulated);
        ((s[0] - self.observed[0]).powi(2) + (s[1] - self.observed[1]).powi(2)).sqrt()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    const SEED: u64 = 42;
    let (true_mu, true_sigma) = (1.5, 0.8);

    let mut rng = SmallRng::seed_from_u64(SEED);
    let data: Vec<f64> = (0..200)
        .map(|_| true_mu + true_sigma * rng.sample::<f64, _>(StandardNormal))
        .collect();
    let noise: Vec<f64> = (0..200).map(|_| rng.sample(StandardNormal)).collect();
    let error = SummaryDistance {
        noise,
        observed: summaries(&data),
    };

    let boundaries = RectangularBoundaries::new(vec![-5.0, 0.05], vec![5.0, 3.0])?;
    let transform = RectangularBoundariesTransform::from_boundaries(&boundaries);
    let prior = transform.clone().apply_log_prior(UniformPrior::new(boundaries))?;
    let error = transform.clone().apply_error_measure(error)?;

    let sampler = AbcSmc::new(prior)?.set_seed(SEED);
    let mut controller = AbcController::new(sampler, error)?;
    controller.set_n_samples(1000)?;
    controller.set_max_iterations(40);
    let run = controller.run_with_progress()?;

    let model_mean = {
        let rows: Vec<Vec<f64>> = run
            .samples
            .rows()
            .into_iter()
            .map(|row| transform.to_model(&row.to_vec()))
            .collect();
        let total: f64 = run.weights.iter().sum();
        (0..2)
            .map(|d| rows.iter().zip(&run.weights).map(|(r, w)| r[d] * w).sum::<f64>() / total)
            .collect::<Vec<_>>()
    };

    println!("Converged: {} after {} iterations", run.converged, run.iterations);
    println!("Epsilon schedule: {:?}", run.epsilons);
    println!(
        "Posterior mean: mu = {:.3}, sigma = {:.3} (true: {true_mu}, {true_sigma})",
        model_mean[0], model_mean[1]
    );
    Ok(())
}
