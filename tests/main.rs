use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn synthetic_default() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("synthetic")?;
    cmd.arg("--views").arg("20");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("View graph with 20 views"))
        .stdout(predicate::str::contains("mean rotation error"))
        .stdout(predicate::str::contains("max rotation error"));

    Ok(())
}

#[test]
fn synthetic_clustered_with_outliers() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("synthetic")?;
    cmd.arg("--views")
        .arg("40")
        .arg("--cluster-size")
        .arg("15")
        .arg("--outlier-ratio")
        .arg("0.05")
        .arg("--l1")
        .arg("--threads")
        .arg("2")
        .arg("--error-bound");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("error bound"))
        .stdout(predicate::str::contains("median rotation error"));

    Ok(())
}

#[test]
fn synthetic_staircase() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("synthetic")?;
    cmd.arg("--views")
        .arg("15")
        .arg("--solver")
        .arg("riemannian_staircase");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("rotation error"));

    Ok(())
}

#[test]
fn unknown_solver_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("synthetic")?;
    cmd.arg("--solver").arg("interior-point");
    cmd.assert().failure();

    Ok(())
}
