//! Linearization of rotation averaging around the current global rotations.
//!
//! Every view `i` except the gauge view (index 0) gets a three parameter update `δ_i` applied
//! as `R_i <- R_i exp(δ_i)`. Every edge `(i, j)` contributes the residual
//! `log(R_j^T R_ij R_i)`, which to first order changes by `δ_i - δ_j`. Stacking the edges in
//! ascending pair order gives the Jacobian rows `-δ_i + δ_j`, one block of three rows per edge.

use itertools::Itertools;
use nalgebra::{DVector, Vector3};
use std::collections::HashMap;

use crate::rotation::multiply_rotations;
use crate::sparse::SparseMatrix;
use crate::viewgraph::{GlobalRotationMap, RelativeRotations, ViewId, ViewPair};
use crate::{Error, Result};

/// Index of the view whose rotation is held constant.
pub const CONSTANT_ROTATION_INDEX: usize = 0;

/// Relative rotations in ascending pair order.
pub fn sorted_edges(pairs: &RelativeRotations) -> Vec<(ViewPair, Vector3<f64>)> {
    pairs
        .iter()
        .map(|(pair, rotation)| (*pair, rotation.rotation))
        .sorted_by_key(|(pair, _)| *pair)
        .collect()
}

fn index_of(view_id_to_index: &HashMap<ViewId, usize>, num_views: usize, id: ViewId) -> Result<usize> {
    match view_id_to_index.get(&id) {
        Some(&i) if i < num_views => Ok(i),
        _ => Err(Error::UnknownView(id)),
    }
}

/// Jacobian of the edge residuals with respect to the tangent updates of all views but the
/// gauge view. Row block `e` belongs to `edges[e]`; column block `i - 1` to view index `i`.
pub fn setup_linear_system(
    edges: &[(ViewPair, Vector3<f64>)],
    num_views: usize,
    view_id_to_index: &HashMap<ViewId, usize>,
) -> Result<SparseMatrix> {
    let mut entries = Vec::with_capacity(edges.len() * 6);
    for (row, (pair, _)) in edges.iter().enumerate() {
        let i = index_of(view_id_to_index, num_views, pair.first)?;
        let j = index_of(view_id_to_index, num_views, pair.second)?;
        for k in 0..3 {
            if i != CONSTANT_ROTATION_INDEX {
                entries.push((3 * row + k, 3 * (i - 1) + k, -1.0));
            }
            if j != CONSTANT_ROTATION_INDEX {
                entries.push((3 * row + k, 3 * (j - 1) + k, 1.0));
            }
        }
    }
    SparseMatrix::from_triplets(
        3 * edges.len(),
        3 * num_views.saturating_sub(1),
        &entries,
    )
}

/// Write `log(R_j^T R_ij R_i)` of every edge into `residual`.
pub fn compute_residuals(
    edges: &[(ViewPair, Vector3<f64>)],
    rotations: &GlobalRotationMap,
    residual: &mut DVector<f64>,
) -> Result<()> {
    if residual.len() != 3 * edges.len() {
        *residual = DVector::zeros(3 * edges.len());
    }
    for (row, (pair, relative)) in edges.iter().enumerate() {
        let r1 = rotations
            .get(&pair.first)
            .ok_or(Error::UnknownView(pair.first))?;
        let r2 = rotations
            .get(&pair.second)
            .ok_or(Error::UnknownView(pair.second))?;
        let error = multiply_rotations(&-r2, &multiply_rotations(relative, r1));
        residual.fixed_rows_mut::<3>(3 * row).copy_from(&error);
    }
    Ok(())
}

/// Apply `R_i <- R_i exp(δ_i)` to every view but the gauge view.
pub fn update_global_rotations(
    step: &DVector<f64>,
    view_id_to_index: &HashMap<ViewId, usize>,
    rotations: &mut GlobalRotationMap,
) -> Result<()> {
    let num_views = step.len() / 3 + 1;
    for (&view_id, rotation) in rotations.iter_mut() {
        let index = index_of(view_id_to_index, num_views, view_id)?;
        if index == CONSTANT_ROTATION_INDEX {
            continue;
        }
        let change: Vector3<f64> = step.fixed_rows::<3>(3 * (index - 1)).into_owned();
        *rotation = multiply_rotations(rotation, &change);
    }
    Ok(())
}

/// Mean norm of the per-view updates in `step`.
pub fn average_step_size(step: &DVector<f64>) -> f64 {
    let num_views = step.len() / 3;
    if num_views == 0 {
        return 0.0;
    }
    let total: f64 = (0..num_views)
        .map(|k| step.fixed_rows::<3>(3 * k).norm())
        .sum();
    total / num_views as f64
}

#[cfg(test)]
use crate::viewgraph::{view_id_to_ascent_index, PairwiseRotation};

#[test]
fn test_jacobian_layout() {
    let mut pairs = RelativeRotations::new();
    pairs.insert(ViewPair::new(5, 8), PairwiseRotation::new(Vector3::zeros()));
    pairs.insert(ViewPair::new(2, 5), PairwiseRotation::new(Vector3::zeros()));
    let edges = sorted_edges(&pairs);
    assert_eq!(edges[0].0, ViewPair::new(2, 5));

    let index = view_id_to_ascent_index(&[2, 5, 8]);
    let jacobian = setup_linear_system(&edges, 3, &index).unwrap();
    assert_eq!((jacobian.nrows(), jacobian.ncols()), (6, 6));
    assert_eq!(jacobian.nnz(), 9);
    // edge (2, 5): view 2 is the gauge and has no column
    assert_eq!(jacobian.get(0, 0), 1.0);
    // edge (5, 8)
    assert_eq!(jacobian.get(4, 1), -1.0);
    assert_eq!(jacobian.get(4, 4), 1.0);
}

#[test]
fn test_consistent_rotations_have_zero_residual() {
    use crate::rotation::{from_rodrigues, to_rodrigues};
    let rotations: GlobalRotationMap = vec![
        (0, Vector3::new(0.1, 0.2, 0.3)),
        (1, Vector3::new(-0.5, 0.0, 0.2)),
        (2, Vector3::new(0.0, 1.2, -0.4)),
    ]
    .into_iter()
    .collect();
    let mut pairs = RelativeRotations::new();
    for (a, b) in [(0, 1), (1, 2), (0, 2)].iter() {
        let r_ab = from_rodrigues(&rotations[b]) * from_rodrigues(&rotations[a]).transpose();
        pairs.insert(ViewPair::new(*a, *b), PairwiseRotation::new(to_rodrigues(&r_ab)));
    }
    let mut residual = DVector::zeros(0);
    compute_residuals(&sorted_edges(&pairs), &rotations, &mut residual).unwrap();
    assert_eq!(residual.len(), 9);
    assert!(residual.norm() < 1e-12);
}

#[test]
fn test_update_skips_gauge_view() {
    let index = view_id_to_ascent_index(&[4, 9]);
    let mut rotations: GlobalRotationMap = vec![(4, Vector3::zeros()), (9, Vector3::zeros())]
        .into_iter()
        .collect();
    let step = DVector::from_vec(vec![0.0, 0.0, 0.5]);
    update_global_rotations(&step, &index, &mut rotations).unwrap();
    assert_eq!(rotations[&4], Vector3::zeros());
    assert!((rotations[&9] - Vector3::new(0.0, 0.0, 0.5)).norm() < 1e-12);
    assert!((average_step_size(&step) - 0.5).abs() < 1e-12);
}
