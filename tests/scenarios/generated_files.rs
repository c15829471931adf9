//! Test: listing files, rendered configs and the metadata fallback

use crate::helpers::*;
use pretty_assertions::assert_eq;
use ssx_pipeline::core::{ParameterSet, PipelineError};
use ssx_pipeline::render::phil;
use std::path::Path;

fn prime_data_dir(root: &Path, metadata: Option<&str>) {
    touch(root, "proc/int-0002.pickle");
    touch(root, "proc/int-0001.pickle");
    touch(root, "proc/log-0001.txt");
    if let Some(body) = metadata {
        std::fs::write(root.join("beamline_run7.json"), body).unwrap();
    }
}

const METADATA: &str = r#"{"user_input": {"unit_cell": "79.1,79.1,38.2,90,90,90", "space_group": "P6522"}}"#;

fn params(root: &Path) -> ParameterSet {
    data_params(root).with("run_num", 7i64).with("chip_name", "chip1")
}

/// The listing names every pickle; the config points prime.run at it
#[tokio::test]
async fn test_listing_and_config_are_written() {
    let dir = tempfile::TempDir::new().unwrap();
    prime_data_dir(dir.path(), Some(METADATA));

    let (result, mock) = run_with_mock(&builtin("stills"), &params(dir.path()), MockDispatch::new()).await;
    result.unwrap();

    let prime = dir.path().join("prime");
    let proc_dir = dir.path().join("proc");
    let listing = prime.join("chip1_2_ints.txt");
    assert_eq!(
        std::fs::read_to_string(&listing).unwrap(),
        format!(
            "{}\n{}\n",
            proc_dir.join("int-0001.pickle").display(),
            proc_dir.join("int-0002.pickle").display()
        )
    );

    let config_path = prime.join("chip1_2_prime.phil");
    let entries = phil::parse(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
    assert_eq!(phil::lookup(&entries, "data"), Some(listing.display().to_string().as_str()));
    assert_eq!(phil::lookup(&entries, "run_no"), Some("chip1_2_prime"));
    assert_eq!(phil::lookup(&entries, "target_unit_cell"), Some("79.1,79.1,38.2,90,90,90"));
    assert_eq!(phil::lookup(&entries, "target_space_group"), Some("P6522"));
    assert_eq!(phil::lookup(&entries, "postref.scale.d_min"), Some("2.1"));
    assert_eq!(phil::lookup(&entries, "n_processors"), Some("32"));

    let prime_run = mock
        .requests()
        .into_iter()
        .find(|r| r.command.contains("prime.run"))
        .unwrap();
    assert_eq!(
        prime_run.command,
        format!("source /dials/dials && timeout 1200 prime.run {}", config_path.display())
    );
    assert_eq!(prime_run.working_dir, prime);
}

/// Caller-supplied values beat the beamline metadata
#[tokio::test]
async fn test_caller_values_win_over_metadata() {
    let dir = tempfile::TempDir::new().unwrap();
    prime_data_dir(dir.path(), Some(METADATA));

    let params = params(dir.path()).with("unit_cell", "78.95,78.85,38.10,90,90,90");
    let (result, _mock) = run_with_mock(&builtin("stills"), &params, MockDispatch::new()).await;
    result.unwrap();

    let text = std::fs::read_to_string(dir.path().join("prime/chip1_2_prime.phil")).unwrap();
    let entries = phil::parse(&text).unwrap();
    assert_eq!(phil::lookup(&entries, "target_unit_cell"), Some("78.95,78.85,38.10,90,90,90"));
    assert_eq!(phil::lookup(&entries, "target_space_group"), Some("P6522"));
}

/// Unreadable metadata falls back to what the caller supplied
#[tokio::test]
async fn test_malformed_metadata_uses_supplied_values() {
    let dir = tempfile::TempDir::new().unwrap();
    prime_data_dir(dir.path(), Some("{ not json"));

    let params = params(dir.path())
        .with("unit_cell", "78.95,78.85,38.10,90,90,90")
        .with("space_group", "P43212");
    let (result, _mock) = run_with_mock(&builtin("stills"), &params, MockDispatch::new()).await;
    result.unwrap();

    let text = std::fs::read_to_string(dir.path().join("prime/chip1_2_prime.phil")).unwrap();
    assert!(text.contains("target_space_group = P43212"));
}

/// Without metadata or caller values the config cannot be rendered, and nothing is written
#[tokio::test]
async fn test_unrenderable_config_writes_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    prime_data_dir(dir.path(), None);

    let (result, mock) = run_with_mock(&builtin("stills"), &params(dir.path()), MockDispatch::new()).await;
    let (stage, cause, _run) = expect_aborted(result);

    assert_eq!(stage, "dials_prime");
    assert!(matches!(cause, PipelineError::MissingParameter { ref key, .. } if key == "unit_cell"));
    assert_eq!(mock.launches_matching("prime.run"), 0);
    assert!(!dir.path().join("prime/chip1_2_ints.txt").exists());
    assert!(!dir.path().join("prime/chip1_2_prime.phil").exists());
}

/// A listing left by another run stops the stage without touching anything
#[tokio::test]
async fn test_existing_listing_means_already_running() {
    let dir = tempfile::TempDir::new().unwrap();
    prime_data_dir(dir.path(), Some(METADATA));
    std::fs::create_dir_all(dir.path().join("prime")).unwrap();
    std::fs::write(dir.path().join("prime/chip1_2_ints.txt"), "claimed by another run\n").unwrap();

    let (result, mock) = run_with_mock(&builtin("stills"), &params(dir.path()), MockDispatch::new()).await;
    let (stage, cause, run) = expect_aborted(result);

    assert_eq!(stage, "dials_prime");
    match cause {
        PipelineError::AlreadyRunning { path } => assert_eq!(path, dir.path().join("prime/chip1_2_ints.txt")),
        other => panic!("Expected AlreadyRunning, got {:?}", other),
    }
    assert!(run.stage("dials_prime").unwrap().outcomes.is_empty());
    assert_eq!(mock.launches_matching("prime.run"), 0);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("prime/chip1_2_ints.txt")).unwrap(),
        "claimed by another run\n"
    );
    assert!(!dir.path().join("prime/chip1_2_prime.phil").exists());
}

/// A template that renders to malformed config text fails before launch
#[tokio::test]
async fn test_malformed_config_fails_before_launch() {
    let dir = tempfile::TempDir::new().unwrap();
    touch(dir.path(), "in/a.dat");

    let pipeline = pipeline_from_yaml(
        r#"
name: broken-config
templates:
  unclosed: |
    scale {
      d_min = {{ dmin }}
stages:
  - name: scale
    input: "{{ data_dir }}/in"
    output: "{{ data_dir }}/out"
    defaults:
      dmin: 2.0
    config:
      template: unclosed
      file: scale.phil
    command: "scale {{ config_file }}"
"#,
    );

    let (result, mock) = run_with_mock(&pipeline, &data_params(dir.path()), MockDispatch::new()).await;
    let (_, cause, _) = expect_aborted(result);

    assert!(matches!(cause, PipelineError::ConfigSyntax { .. }));
    assert_eq!(mock.launches(), 0);
    assert!(!dir.path().join("out/scale.phil").exists());
}

/// A config that cannot be placed releases the listing, so a re-run is not locked out
#[tokio::test]
async fn test_failed_config_write_releases_listing() {
    let dir = tempfile::TempDir::new().unwrap();
    touch(dir.path(), "in/int-0001.pickle");

    let pipeline = pipeline_from_yaml(
        r#"
name: unplaceable-config
templates:
  simple: |
    data = {{ listing_file }}
stages:
  - name: merge
    input: "{{ data_dir }}/in"
    output: "{{ data_dir }}/out"
    units:
      regex: '\.pickle$'
    listing: "ints.txt"
    config:
      template: simple
      file: "missing/merge.phil"
    command: "merge {{ config_file }}"
"#,
    );

    for _ in 0..2 {
        let (result, mock) = run_with_mock(&pipeline, &data_params(dir.path()), MockDispatch::new()).await;
        let (_, cause, _) = expect_aborted(result);

        assert!(matches!(cause, PipelineError::Io { .. }), "got {:?}", cause);
        assert_eq!(mock.launches(), 0);
        assert!(!dir.path().join("out/ints.txt").exists());
    }
}
