use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const ALUMINIUM_DOCUMENT: &str = r#"
{
  "schemaVersion": 1,
  "peaks": [
    { "position": 38.4686, "intensity": 100.0 },
    { "position": 44.7163, "intensity": 47.0 },
    { "position": 65.0897, "intensity": 22.0 },
    { "position": 78.2204, "intensity": 24.0 },
    { "position": 82.4265, "intensity": 7.0 }
  ],
  "instrument": { "type": "constantWavelength", "wavelength": 1.5406, "zero": 0.0 }
}
"#;

fn run_cellindex(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cellindex"))
        .args(args)
        .output()
        .expect("cellindex binary should run")
}

fn write_file(path: &Path, content: &str) {
    fs::write(path, content).expect("fixture file should be written");
}

fn read_json(path: &Path) -> Value {
    let content = fs::read_to_string(path).expect("document should be readable");
    serde_json::from_str(&content).expect("document should be valid JSON")
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("temp paths are UTF-8")
}

#[test]
fn index_with_write_stores_and_selects_the_best_cell() {
    let temp = TempDir::new().expect("tempdir should be created");
    let document = temp.path().join("aluminium.json");
    write_file(&document, ALUMINIUM_DOCUMENT);

    let output = run_cellindex(&[
        "index",
        path_arg(&document),
        "--lattices",
        "Fm-3m,Pm-3m",
        "--write",
    ]);
    assert!(
        output.status.success(),
        "index should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Fm-3m"), "stdout: {stdout}");

    let stored = read_json(&document);
    assert_eq!(stored["schemaVersion"], 1);
    assert_eq!(stored["candidates"]["selected"], 0);
    let best = &stored["candidates"]["cells"][0]["trial"];
    assert_eq!(best["bravais"], "CubicF");
    let a = best["cell"]["a"].as_f64().expect("cell length");
    assert!((a - 4.05).abs() < 1.0e-3, "a = {a}");
    assert_eq!(stored["peaks"][0]["hkl"], serde_json::json!([1, 1, 1]));

    let refine = run_cellindex(&["refine", path_arg(&document)]);
    assert!(
        refine.status.success(),
        "refine should succeed, stderr: {}",
        String::from_utf8_lossy(&refine.stderr)
    );
}

#[test]
fn reflections_lists_the_working_cell() {
    let temp = TempDir::new().expect("tempdir should be created");
    let document = temp.path().join("cell.json");
    write_file(
        &document,
        r#"
        {
          "schemaVersion": 1,
          "instrument": { "type": "constantWavelength", "wavelength": 1.5406, "zero": 0.0 },
          "controls": {
            "cell": {
              "bravais": "CubicF",
              "cell": { "a": 4.05, "b": 4.05, "c": 4.05, "alpha": 90.0, "beta": 90.0, "gamma": 90.0 }
            }
          }
        }
        "#,
    );

    let output = run_cellindex(&["reflections", path_arg(&document)]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let rows: Vec<&str> = stdout.lines().skip(1).collect();
    assert_eq!(rows.len(), 6, "stdout: {stdout}");
    assert!(rows[0].starts_with("   1   1   1"));
}

#[test]
fn migrate_rewrites_legacy_documents() {
    let temp = TempDir::new().expect("tempdir should be created");
    let legacy = temp.path().join("legacy.json");
    let migrated = temp.path().join("migrated.json");
    write_file(
        &legacy,
        r#"
        {
          "controls": [0, false, 0.0, 5, 25.0, "Fm-3m", 4.05, 4.05, 4.05, 90, 90, 90, 66.4],
          "cells": [[731.0, 0, 0, 4.05, 4.05, 4.05, 90, 90, 90, 66.4, true, true]],
          "indexPeaks": [[38.4686, 100.0, true, true, 1, 1, 1, 2.338, 2.338]]
        }
        "#,
    );

    let output = run_cellindex(&[
        "migrate",
        path_arg(&legacy),
        "--output",
        path_arg(&migrated),
    ]);
    assert!(
        output.status.success(),
        "migrate should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stored = read_json(&migrated);
    assert_eq!(stored["schemaVersion"], 1);
    assert_eq!(stored["candidates"]["selected"], 0);
    assert_eq!(stored["candidates"]["cells"][0]["keep"], true);
    assert_eq!(stored["controls"]["cell"]["bravais"], "CubicF");
}

#[test]
fn failures_map_to_category_exit_codes() {
    let temp = TempDir::new().expect("tempdir should be created");
    let missing = temp.path().join("missing.json");
    let output = run_cellindex(&["reflections", path_arg(&missing)]);
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[IO.DOCUMENT_READ]"), "stderr: {stderr}");
    assert!(stderr.contains("FATAL EXIT CODE: 3"));

    let document = temp.path().join("aluminium.json");
    write_file(&document, ALUMINIUM_DOCUMENT);
    let output = run_cellindex(&["index", path_arg(&document), "--lattices", "Xyz"]);
    assert_eq!(output.status.code(), Some(2));

    let output = run_cellindex(&["subgroups-filter", path_arg(&document), "--max-atoms", "4"]);
    assert_eq!(output.status.code(), Some(6));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[INCOMPATIBLE.NO_PARENT]"), "stderr: {stderr}");

    let empty = temp.path().join("empty.json");
    write_file(&empty, r#"{ "schemaVersion": 1 }"#);
    let output = run_cellindex(&["index", path_arg(&empty)]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[INPUT.NO_PEAKS]"));
}

const SUBGROUP_DOCUMENT: &str = r#"
{
  "schemaVersion": 1,
  "subgroups": {
    "phases": [
      { "symbol": "R-3m", "parentSpaceGroup": "Fm-3m",
        "transform": [[1, 0, 0], [0, 1, 0], [0, 0, 1]], "originShift": [0, 0, 0],
        "cell": { "a": 3.615, "b": 3.615, "c": 3.615, "alpha": 90, "beta": 90, "gamma": 90 },
        "conjugacyClass": 0, "keep": true },
      { "symbol": "I4/mmm", "parentSpaceGroup": "Fm-3m",
        "transform": [[1, 0, 0], [0, 1, 0], [0, 0, 1]], "originShift": [0, 0, 0],
        "cell": { "a": 3.615, "b": 3.615, "c": 3.615, "alpha": 90, "beta": 90, "gamma": 90 },
        "conjugacyClass": 1, "keep": false },
      { "symbol": "R-3m", "parentSpaceGroup": "Fm-3m",
        "transform": [[1, 0, 0], [0, 1, 0], [0, 0, 1]], "originShift": [0, 0, 0],
        "cell": { "a": 3.615, "b": 3.615, "c": 3.615, "alpha": 90, "beta": 90, "gamma": 90 },
        "conjugacyClass": 0, "keep": true }
    ]
  }
}
"#;

#[test]
fn subgroups_lists_classes_and_steps_the_selection() {
    let temp = TempDir::new().expect("tempdir should be created");
    let document = temp.path().join("subgroups.json");
    write_file(&document, SUBGROUP_DOCUMENT);

    let output = run_cellindex(&["subgroups", path_arg(&document)]);
    assert!(
        output.status.success(),
        "listing should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let headers: Vec<&str> = stdout.lines().filter(|line| line.starts_with("class")).collect();
    assert_eq!(headers, vec!["class 0", "class 1"], "stdout: {stdout}");

    for expected in [0, 2, 0] {
        let output = run_cellindex(&["subgroups", path_arg(&document), "--next"]);
        assert!(output.status.success());
        assert_eq!(read_json(&document)["subgroups"]["selected"], expected);
    }
    let output = run_cellindex(&["subgroups", path_arg(&document), "--previous"]);
    assert!(output.status.success());
    assert_eq!(read_json(&document)["subgroups"]["selected"], 2);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("*   2  R-3m"), "stdout: {stdout}");
}

#[test]
fn help_exits_cleanly() {
    let output = run_cellindex(&["--help"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("index"));
}
