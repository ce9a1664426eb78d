use std::fs;
use std::process::{Command, Output};

use serde_json::Value;

fn notegraph(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_notegraph"))
        .args(args)
        .output()
        .expect("Failed to execute notegraph")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "notegraph exited with error: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

#[test]
fn layout_writes_positioned_graph() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("layout.json");

    let output = notegraph(&[
        "layout",
        "--input",
        "tests/fixtures/notes.json",
        "--output",
        output_path.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "notegraph exited with error");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("WARN"), "Rejected edge not logged as a warning");
    assert!(stderr.contains("skipping edge"), "Missing rejected edge warning");
    assert!(stderr.contains("missing-note"), "Warning does not name the endpoint");

    let data: Value = serde_json::from_str(&fs::read_to_string(&output_path).unwrap()).unwrap();
    let nodes = data["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 7);
    assert_eq!(data["edges"].as_array().unwrap().len(), 6);
    assert!(nodes.iter().all(|node| node["attrs"]["x"].is_f64()));

    let pinned = nodes
        .iter()
        .find(|node| node["id"] == "reading-list")
        .unwrap();
    assert_eq!(pinned["attrs"]["x"], 120.0);
    assert_eq!(pinned["attrs"]["y"], -40.0);
    assert_eq!(pinned["attrs"]["pinned"], true);

    let note = nodes.iter().find(|node| node["id"] == "rust-notes").unwrap();
    assert_eq!(note["attrs"]["title"], "Rust notes");
}

#[test]
fn layout_prints_to_stdout_and_reads_yaml() {
    let output = notegraph(&["layout", "--input", "tests/fixtures/notes.yaml"]);
    let data = stdout_json(&output);
    assert_eq!(data["nodes"].as_array().unwrap().len(), 3);
}

#[test]
fn layout_runs_on_background_worker_with_config() {
    // The config sets a worker threshold of 2 nodes
    let output = notegraph(&[
        "layout",
        "--input",
        "tests/fixtures/notes.yaml",
        "--config",
        "tests/fixtures/engine.yaml",
    ]);
    let data = stdout_json(&output);
    assert_eq!(data["nodes"].as_array().unwrap().len(), 3);
}

#[test]
fn analyze_reports_centrality_and_communities() {
    let output = notegraph(&["analyze", "--input", "tests/fixtures/notes.json", "--top", "3"]);
    let report = stdout_json(&output);

    assert_eq!(report["betweenness_method"], "approximate");
    assert_eq!(report["scores"].as_object().unwrap().len(), 7);
    assert_eq!(report["scores"]["orphan"]["degree"], 0);
    assert_eq!(report["top"]["degree"].as_array().unwrap().len(), 3);
    assert!(report["communities"].as_array().unwrap().len() >= 2);
}

#[test]
fn analyze_honors_config_file() {
    let output = notegraph(&[
        "analyze",
        "--input",
        "tests/fixtures/notes.json",
        "--config",
        "tests/fixtures/engine.yaml",
    ]);
    let report = stdout_json(&output);
    assert_eq!(report["betweenness_method"], "exact");
}

#[test]
fn path_finds_shortest_route() {
    let output = notegraph(&[
        "path",
        "--input",
        "tests/fixtures/notes.json",
        "--from",
        "inbox",
        "--to",
        "lifetimes",
    ]);
    let result = stdout_json(&output);

    assert_eq!(result["status"], "found");
    assert_eq!(result["distance"], 3);
    assert_eq!(result["path"][0], "inbox");
    assert_eq!(result["path"][3], "lifetimes");
}

#[test]
fn path_reports_unreachable_target() {
    let output = notegraph(&[
        "path",
        "--input",
        "tests/fixtures/notes.json",
        "--from",
        "inbox",
        "--to",
        "orphan",
    ]);
    let result = stdout_json(&output);
    assert_eq!(result["status"], "not_found");
}

#[test]
fn unsupported_input_fails() {
    let output = notegraph(&["analyze", "--input", "tests/fixtures/notes.csv"]);
    assert!(!output.status.success());
}
