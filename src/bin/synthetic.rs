extern crate pretty_env_logger;
extern crate rand;
extern crate rotavg;
extern crate structopt;

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::SeedableRng;
use structopt::StructOpt;

use rotavg::synthetic::*;
use rotavg::*;

#[derive(StructOpt, Debug)]
#[structopt(name = "synthetic")]
/// Generate a random view graph with known rotations, estimate the rotations and report the
/// error against the ground truth.
struct Opt {
    /// Number of views.
    #[structopt(long = "views", default_value = "50")]
    num_views: usize,

    /// Probability of an edge between two views, on top of a chain through all views.
    #[structopt(long = "edge-probability", default_value = "0.3")]
    edge_probability: f64,

    /// Standard deviation of the noise on the relative rotations in degrees.
    #[structopt(long = "noise", default_value = "1")]
    noise: f64,

    /// Fraction of edges replaced by random rotations.
    #[structopt(long = "outlier-ratio", default_value = "0")]
    outlier_ratio: f64,

    #[structopt(long = "seed", default_value = "0")]
    seed: u64,

    /// SDP solver: rbr-bcm, rank-deficient-bcm or riemannian-staircase.
    #[structopt(long = "solver", default_value = "rbr-bcm")]
    solver: SdpSolverType,

    /// Split the view graph into clusters of at most this many views.
    #[structopt(long = "cluster-size")]
    cluster_size: Option<usize>,

    /// Run the L1 refinement before IRLS.
    #[structopt(long)]
    l1: bool,

    #[structopt(long = "threads", default_value = "1")]
    num_threads: usize,

    /// Compute the worst case error bound of the view graph.
    #[structopt(long = "error-bound")]
    error_bound: bool,

    #[structopt(short = "v", long)]
    verbose: bool,
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let opt = Opt::from_args();

    let mut rng = StdRng::seed_from_u64(opt.seed);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: opt.num_views,
            edge_probability: opt.edge_probability,
            noise_std: opt.noise.to_radians(),
            outlier_ratio: opt.outlier_ratio,
        },
    );
    println!("{}", problem.view_graph);
    println!("{} outlier edges", problem.outliers.len());

    let options = HybridRotationOptions {
        sdp: SdpSolverOptions {
            solver_type: opt.solver,
            seed: opt.seed,
            ..Default::default()
        },
        irls: IrlsRefinerOptions {
            num_threads: opt.num_threads,
            ..Default::default()
        },
        l1: if opt.l1 {
            Some(L1RotationOptions::default())
        } else {
            None
        },
        max_views_per_cluster: opt.cluster_size,
        compute_error_bound: opt.error_bound,
        verbose: opt.verbose,
    };
    let mut rotations = GlobalRotationMap::new();
    let summary =
        HybridRotationEstimator::new(options).estimate_rotations(&problem.view_graph, &mut rotations)?;

    let errors = rotation_errors(&rotations, &problem.ground_truth)
        .values()
        .map(|e| e.to_degrees())
        .sorted_by(|a, b| a.total_cmp(b))
        .collect::<Vec<_>>();
    let mean = errors.iter().sum::<f64>() / errors.len().max(1) as f64;
    let median = errors.get(errors.len() / 2).copied().unwrap_or(0.0);
    let max = errors.last().copied().unwrap_or(0.0);

    println!(
        "{} clusters, {} IRLS iterations (converged: {})",
        summary.num_clusters, summary.irls.num_iterations, summary.irls.converged
    );
    if let Some(bound) = summary.error_bound {
        println!("error bound: {:.4} degrees", bound.to_degrees());
    }
    println!("mean rotation error: {:.4} degrees", mean);
    println!("median rotation error: {:.4} degrees", median);
    println!("max rotation error: {:.4} degrees", max);
    Ok(())
}
