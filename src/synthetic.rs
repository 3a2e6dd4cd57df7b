//! Synthetic view graphs with known ground truth, and error measures against that truth.
//!
//! All randomness comes from the generator passed in, so a seeded `StdRng` reproduces a problem
//! exactly.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use std::collections::{HashMap, HashSet};

use crate::rotation::{
    angular_distance, from_rodrigues, multiply_rotations, project_to_rotation, to_rodrigues,
};
use crate::viewgraph::{GlobalRotationMap, PairwiseRotation, ViewGraph, ViewId, ViewPair};

#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    pub num_views: usize,
    /// Probability of an edge between two views beyond the spanning chain.
    pub edge_probability: f64,
    /// Standard deviation of the angular noise on every relative rotation, in radians.
    pub noise_std: f64,
    /// Fraction of the non-chain edges replaced by random rotations.
    pub outlier_ratio: f64,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        SyntheticOptions {
            num_views: 30,
            edge_probability: 0.3,
            noise_std: 0.0,
            outlier_ratio: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticViewGraph {
    pub view_graph: ViewGraph,
    pub ground_truth: GlobalRotationMap,
    /// Edges whose measurement is a random rotation.
    pub outliers: HashSet<ViewPair>,
}

fn unit_random<R: Rng>(rng: &mut R) -> Vector3<f64> {
    loop {
        let v = Vector3::from_fn(|_, _| rng.sample::<f64, _>(StandardNormal));
        let norm = v.norm();
        if norm > 1e-12 {
            return v / norm;
        }
    }
}

/// Rotation drawn uniformly from SO(3), as a Rodrigues vector.
pub fn random_rotation<R: Rng>(rng: &mut R) -> Vector3<f64> {
    loop {
        let q = Quaternion::new(
            rng.sample::<f64, _>(StandardNormal),
            rng.sample::<f64, _>(StandardNormal),
            rng.sample::<f64, _>(StandardNormal),
            rng.sample::<f64, _>(StandardNormal),
        );
        if q.norm() > 1e-12 {
            return UnitQuaternion::from_quaternion(q).scaled_axis();
        }
    }
}

/// `exp(n) * R(rotation)` with `n` a rotation about a random axis by a Gaussian angle.
pub fn perturb_rotation<R: Rng>(
    rng: &mut R,
    rotation: &Vector3<f64>,
    std: f64,
) -> Vector3<f64> {
    if std <= 0.0 {
        return *rotation;
    }
    let angle = match Normal::new(0.0, std) {
        Ok(normal) => normal.sample(rng),
        Err(_) => 0.0,
    };
    multiply_rotations(&(unit_random(rng) * angle), rotation)
}

/// Random view graph over views `0..num_views`.
///
/// The views form a chain `0 - 1 - ... - n-1` so the graph is connected; every other pair is
/// an edge with probability `edge_probability`. Relative rotations are computed from random
/// ground truth rotations and perturbed by `noise_std`. Outliers only replace non-chain edges.
pub fn synthetic_view_graph<R: Rng>(
    rng: &mut R,
    options: &SyntheticOptions,
) -> SyntheticViewGraph {
    let n = options.num_views as ViewId;
    let ground_truth: GlobalRotationMap = (0..n).map(|id| (id, random_rotation(rng))).collect();

    let mut view_graph = ViewGraph::new();
    let mut outliers = HashSet::new();
    for a in 0..n {
        for b in a + 1..n {
            let chain = b == a + 1;
            if !chain && !rng.gen_bool(options.edge_probability.clamp(0.0, 1.0)) {
                continue;
            }
            let score = rng.gen_range(20..200);
            let rotation = if !chain && rng.gen_bool(options.outlier_ratio.clamp(0.0, 1.0)) {
                outliers.insert(ViewPair::new(a, b));
                random_rotation(rng)
            } else {
                let r_ab = from_rodrigues(&ground_truth[&b])
                    * from_rodrigues(&ground_truth[&a]).transpose();
                perturb_rotation(rng, &to_rodrigues(&r_ab), options.noise_std)
            };
            view_graph.add_edge(a, b, PairwiseRotation::with_score(rotation, score));
        }
    }

    SyntheticViewGraph {
        view_graph,
        ground_truth,
        outliers,
    }
}

/// Angular error in radians of every view present in both maps, after removing the global
/// rotation that best aligns `estimated` with `truth` in the chordal sense.
pub fn rotation_errors(
    estimated: &GlobalRotationMap,
    truth: &GlobalRotationMap,
) -> HashMap<ViewId, f64> {
    let common = estimated
        .keys()
        .filter(|id| truth.contains_key(id))
        .copied()
        .collect::<Vec<_>>();
    let sum = common.iter().fold(Matrix3::zeros(), |acc, id| {
        acc + from_rodrigues(&truth[id]).transpose() * from_rodrigues(&estimated[id])
    });
    let gauge = to_rodrigues(&project_to_rotation(&sum));
    common
        .into_iter()
        .map(|id| {
            let aligned = multiply_rotations(&truth[&id], &gauge);
            (id, angular_distance(&estimated[&id], &aligned))
        })
        .collect()
}

#[cfg(test)]
use rand::{rngs::StdRng, SeedableRng};

#[test]
fn test_same_seed_same_graph() {
    let options = SyntheticOptions {
        num_views: 12,
        noise_std: 0.01,
        outlier_ratio: 0.2,
        ..Default::default()
    };
    let a = synthetic_view_graph(&mut StdRng::seed_from_u64(4), &options);
    let b = synthetic_view_graph(&mut StdRng::seed_from_u64(4), &options);
    assert_eq!(a.ground_truth, b.ground_truth);
    assert_eq!(a.view_graph.edges(), b.view_graph.edges());
    assert_eq!(a.outliers, b.outliers);
}

#[test]
fn test_graph_is_connected_and_consistent() {
    let mut rng = StdRng::seed_from_u64(10);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 25,
            edge_probability: 0.2,
            ..Default::default()
        },
    );
    let graph = &problem.view_graph;
    assert_eq!(graph.num_views(), 25);
    assert_eq!(graph.connected_components().len(), 1);
    assert!(problem.outliers.is_empty());
    for (pair, measurement) in graph.edges() {
        let expected = from_rodrigues(&problem.ground_truth[&pair.second])
            * from_rodrigues(&problem.ground_truth[&pair.first]).transpose();
        let measured = from_rodrigues(&measurement.rotation);
        assert!((expected - measured).norm() < 1e-9);
    }
}

#[test]
fn test_outliers_avoid_chain() {
    let mut rng = StdRng::seed_from_u64(1);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 20,
            edge_probability: 0.5,
            outlier_ratio: 0.5,
            ..Default::default()
        },
    );
    assert!(!problem.outliers.is_empty());
    assert!(problem.outliers.iter().all(|p| p.second != p.first + 1));
}

#[test]
fn test_errors_ignore_global_rotation() {
    let mut rng = StdRng::seed_from_u64(6);
    let truth: GlobalRotationMap = (0..10).map(|id| (id, random_rotation(&mut rng))).collect();
    let g = Vector3::new(0.3, -0.2, 2.0);
    let shifted: GlobalRotationMap = truth
        .iter()
        .map(|(&id, r)| (id, multiply_rotations(r, &g)))
        .collect();
    let errors = rotation_errors(&shifted, &truth);
    assert_eq!(errors.len(), 10);
    assert!(errors.values().all(|&e| e < 1e-9));

    let mut wrong = shifted.clone();
    wrong.insert(3, multiply_rotations(&Vector3::new(0.0, 0.5, 0.0), &shifted[&3]));
    let errors = rotation_errors(&wrong, &truth);
    assert!(errors[&3] > 0.3);
}

#[test]
fn test_perturbation_angle() {
    let mut rng = StdRng::seed_from_u64(0);
    let r = Vector3::new(0.1, 0.2, 0.3);
    assert_eq!(perturb_rotation(&mut rng, &r, 0.0), r);
    let angles = (0..2000)
        .map(|_| angular_distance(&r, &perturb_rotation(&mut rng, &r, 0.05)))
        .collect::<Vec<_>>();
    let rms = (angles.iter().map(|a| a * a).sum::<f64>() / angles.len() as f64).sqrt();
    assert!((rms - 0.05).abs() < 0.005, "{}", rms);
}
