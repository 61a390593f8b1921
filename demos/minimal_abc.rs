use mini_abc::abc_smc::{AbcSmc, TellOutcome};
use mini_abc::distributions::GaussianPrior;

fn main() {
    // Infer a 2D location from a deterministic "simulator": the discrepancy is the
    // distance between the candidate and the observation.
    let observed = [0.7, -1.2];
    let mut abc = AbcSmc::new(GaussianPrior::standard(2)).unwrap().set_seed(42);
    abc.set_n_l(250).unwrap();
    abc.set_p_acc_min(0.1).unwrap();

    for _ in 0..30 {
        let xs = abc.ask(500).unwrap();
        let fx: Vec<f64> = xs
            .iter()
            .map(|x| ((x[0] - observed[0]).powi(2) + (x[1] - observed[1]).powi(2)).sqrt())
            .collect();
        if let TellOutcome::Converged(population) = abc.tell(&fx).unwrap() {
            println!("Converged with {} particles", population.len());
            break;
        }
    }

    let total: f64 = abc.weights().iter().sum();
    let mean: Vec<f64> = (0..2)
        .map(|d| {
            abc.population()
                .iter()
                .zip(abc.weights())
                .map(|(x, w)| x[d] * w)
                .sum::<f64>()
                / total
        })
        .collect();
    println!("Iterations: {}", abc.iteration());
    println!("Final epsilon: {:.4e}", abc.epsilon().unwrap());
    println!("Weighted mean: ({:.3}, {:.3})", mean[0], mean[1]);
}
