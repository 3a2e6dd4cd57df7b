//! Conversions and small utilities for 3D rotations.
//!
//! Rotations are passed around as Rodrigues (angle-axis) vectors and converted to matrices only
//! where linear algebra is needed.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// Convert a Rodrigues vector to a rotation matrix.
pub fn from_rodrigues(x: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::from_scaled_axis(*x).into_inner()
}

/// Convert a rotation matrix to a Rodrigues vector.
///
/// Goes through a unit quaternion so that angles close to pi keep an accurate axis.
pub fn to_rodrigues(m: &Matrix3<f64>) -> Vector3<f64> {
    let r = Rotation3::from_matrix_unchecked(*m);
    UnitQuaternion::from_rotation_matrix(&r).scaled_axis()
}

/// Rodrigues vector of the product `R(a) * R(b)`.
pub fn multiply_rotations(a: &Vector3<f64>, b: &Vector3<f64>) -> Vector3<f64> {
    let q = UnitQuaternion::from_scaled_axis(*a) * UnitQuaternion::from_scaled_axis(*b);
    q.scaled_axis()
}

/// Closest rotation to `m` in the Frobenius norm.
///
/// Uses `U * diag(1, 1, det(U V^T)) * V^T` from the SVD of `m`, so improper inputs are mapped to
/// proper rotations.
pub fn project_to_rotation(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Rotation3::from_matrix(m).into_inner();
    };
    let mut d = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    u * d * v_t
}

/// Rotation minimizing the summed chordal distance to `rotations`.
pub fn chordal_mean<'a, I>(rotations: I) -> Matrix3<f64>
where
    I: IntoIterator<Item = &'a Matrix3<f64>>,
{
    let sum = rotations
        .into_iter()
        .fold(Matrix3::zeros(), |acc, r| acc + r);
    project_to_rotation(&sum)
}

/// Angle in radians of the rotation taking `R(a)` to `R(b)`.
pub fn angular_distance(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let qa = UnitQuaternion::from_scaled_axis(*a);
    let qb = UnitQuaternion::from_scaled_axis(*b);
    qa.angle_to(&qb)
}

#[test]
fn test_rodrigues_round_trip_near_pi() {
    let axis = Vector3::new(1.0, -2.0, 0.5).normalize();
    let aa = axis * (std::f64::consts::PI - 1e-6);
    let back = to_rodrigues(&from_rodrigues(&aa));
    assert!((back - aa).norm() < 1e-8);
}

#[test]
fn test_multiply_rotations_matches_matrix_product() {
    let a = Vector3::new(0.1, -0.4, 0.3);
    let b = Vector3::new(-0.7, 0.2, 0.05);
    let product = from_rodrigues(&a) * from_rodrigues(&b);
    let composed = from_rodrigues(&multiply_rotations(&a, &b));
    assert!((product - composed).norm() < 1e-12);
}

#[test]
fn test_inverse_rotation_is_negated_vector() {
    let a = Vector3::new(0.3, 0.2, -0.9);
    assert!(multiply_rotations(&-a, &a).norm() < 1e-12);
}

#[test]
fn test_project_fixes_reflection() {
    let r = from_rodrigues(&Vector3::new(0.2, 0.3, -0.1));
    let projected = project_to_rotation(&(-r));
    assert!((projected.determinant() - 1.0).abs() < 1e-10);
    let noisy = r + Matrix3::new(0.01, 0.0, 0.0, 0.0, -0.02, 0.0, 0.0, 0.0, 0.015);
    let projected = project_to_rotation(&noisy);
    assert!((projected.transpose() * projected - Matrix3::identity()).norm() < 1e-10);
    assert!((projected - r).norm() < 0.05);
}

#[test]
fn test_angular_distance() {
    let a = Vector3::new(0.0, 0.0, 0.25);
    let b = Vector3::new(0.0, 0.0, -0.5);
    assert!((angular_distance(&a, &b) - 0.75).abs() < 1e-12);
}
