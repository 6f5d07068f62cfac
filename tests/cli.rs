mod common;

use assert_cmd::prelude::*;
use predicates::str::contains;
use std::process::Command;

#[test]
fn cli_prints_scene_summary() {
    let dir = tempfile::tempdir().expect("temp asset dir");
    common::write_assets(dir.path());

    let mut cmd = Command::cargo_bin("reign-engine").expect("binary exists");
    cmd.arg(dir.path()).arg("--frames").arg("3").arg("--summary-only");
    cmd.assert()
        .success()
        .stdout(contains("Loaded scene with 4 instances"))
        .stdout(contains(" - hero #0 (skinned mesh) pos=(3.00, 0.00, 0.00)"))
        .stdout(contains("motion=idle"))
        .stdout(contains("effect=fx/aura"))
        .stdout(contains("Cache: 2 models"));
}

#[test]
fn cli_rejects_unknown_flags() {
    let dir = tempfile::tempdir().expect("temp asset dir");
    let mut cmd = Command::cargo_bin("reign-engine").expect("binary exists");
    cmd.arg(dir.path()).arg("--bogus");
    cmd.assert()
        .failure()
        .stderr(contains("Unknown argument: --bogus"));
}

#[test]
fn cli_reports_missing_asset_directory() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("nowhere");
    let mut cmd = Command::cargo_bin("reign-engine").expect("binary exists");
    cmd.arg(&missing).arg("--summary-only");
    cmd.assert()
        .failure()
        .stderr(contains("failed to open asset directory"));
}
