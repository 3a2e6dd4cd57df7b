use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;

use rotavg::synthetic::*;
use rotavg::*;

fn median_degrees(estimated: &GlobalRotationMap, truth: &GlobalRotationMap) -> f64 {
    let mut errors = rotation_errors(estimated, truth)
        .values()
        .map(|e| e.to_degrees())
        .collect::<Vec<_>>();
    errors.sort_by(|a, b| a.total_cmp(b));
    errors[errors.len() / 2]
}

#[test]
fn every_solver_recovers_noise_free_rotations() {
    let problem = synthetic_view_graph(
        &mut StdRng::seed_from_u64(21),
        &SyntheticOptions {
            num_views: 25,
            edge_probability: 0.3,
            ..Default::default()
        },
    );
    for solver_type in [
        SdpSolverType::RbrBcm,
        SdpSolverType::RankDeficientBcm,
        SdpSolverType::RiemannianStaircase,
    ] {
        let mut rotations = problem.view_graph.identity_rotations();
        let mut estimator = LagrangeDualRotationEstimator::new(
            rotations.len(),
            3,
            SdpSolverOptions {
                solver_type,
                ..Default::default()
            },
        );
        estimator
            .estimate_rotations(problem.view_graph.edges(), &mut rotations)
            .unwrap();
        assert_relative_eq!(rotations[&0].norm(), 0.0, epsilon = 1e-9);
        let errors = rotation_errors(&rotations, &problem.ground_truth);
        assert!(
            errors.values().all(|&e| e < 1e-3),
            "{} failed: {:?}",
            solver_type,
            errors
        );
    }
}

#[test]
fn pipeline_handles_noise_and_outliers() {
    let problem = synthetic_view_graph(
        &mut StdRng::seed_from_u64(5),
        &SyntheticOptions {
            num_views: 40,
            edge_probability: 0.4,
            noise_std: 1f64.to_radians(),
            outlier_ratio: 0.1,
        },
    );
    assert!(!problem.outliers.is_empty());
    let options = HybridRotationOptions {
        l1: Some(L1RotationOptions::default()),
        irls: IrlsRefinerOptions {
            num_threads: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut rotations = GlobalRotationMap::new();
    let summary = HybridRotationEstimator::new(options)
        .estimate_rotations(&problem.view_graph, &mut rotations)
        .unwrap();
    assert!(summary.l1.is_some());
    assert!(summary.irls.num_iterations > 0);
    assert!(median_degrees(&rotations, &problem.ground_truth) < 3.0);
}

#[test]
fn clustered_pipeline_matches_single_cluster() {
    let problem = synthetic_view_graph(
        &mut StdRng::seed_from_u64(17),
        &SyntheticOptions {
            num_views: 60,
            edge_probability: 0.15,
            noise_std: 0.5f64.to_radians(),
            ..Default::default()
        },
    );
    let mut whole = GlobalRotationMap::new();
    HybridRotationEstimator::new(HybridRotationOptions::default())
        .estimate_rotations(&problem.view_graph, &mut whole)
        .unwrap();
    let mut clustered = GlobalRotationMap::new();
    let summary = HybridRotationEstimator::new(HybridRotationOptions {
        max_views_per_cluster: Some(20),
        ..Default::default()
    })
    .estimate_rotations(&problem.view_graph, &mut clustered)
    .unwrap();
    assert!(summary.num_clusters >= 3);
    assert_eq!(clustered.len(), 60);
    assert!(median_degrees(&clustered, &problem.ground_truth) < 1.0);
    assert!(median_degrees(&whole, &problem.ground_truth) < 1.0);
}

#[test]
fn partition_of_view_graph_is_balanced() {
    let problem = synthetic_view_graph(
        &mut StdRng::seed_from_u64(2),
        &SyntheticOptions {
            num_views: 90,
            edge_probability: 0.05,
            ..Default::default()
        },
    );
    let labels = problem.view_graph.partition(3);
    assert_eq!(labels.len(), 90);
    let mut sizes = [0usize; 3];
    for &part in labels.values() {
        sizes[part] += 1;
    }
    // ceil(1.05 * 90 / 3)
    assert!(sizes.iter().all(|&s| s > 0 && s <= 32), "{:?}", sizes);
}

#[test]
fn components_of_view_graph() {
    let mut graph = ViewGraph::new();
    for (a, b) in [(0, 1), (1, 2), (10, 11), (20, 21), (21, 22), (22, 23)] {
        graph.add_edge(a, b, PairwiseRotation::new(nalgebra::Vector3::zeros()));
    }
    assert_eq!(graph.connected_components().len(), 3);
    let largest = graph.largest_connected_component();
    assert_eq!(
        largest.view_ids().into_iter().collect::<Vec<_>>(),
        vec![20, 21, 22, 23]
    );

    let mut forest = DisjointSetForest::with_nodes([3, 5, 9]);
    assert!(forest.union(3, 9).unwrap());
    assert!(!forest.union(9, 3).unwrap());
    assert!(forest.connected(3, 9).unwrap());
    assert!(!forest.connected(3, 5).unwrap());
    assert!(forest.union(3, 4).is_err());
}
