//! Test: abort-on-failure versus best-effort stages

use crate::helpers::*;
use pretty_assertions::assert_eq;
use ssx_pipeline::core::{ExecutionStatus, OutcomeStatus, ParameterSet, PipelineError, StageState};

fn stills_data_dir(root: &std::path::Path) {
    for image in ["chip1_7_00001.cbf", "chip1_7_00002.cbf", "chip1_7_00003.cbf"] {
        touch(root, image);
    }
    touch(root, "proc/int-00001.pickle");
    touch(root, "proc/int-00003.pickle");
    std::fs::write(
        root.join("beamline_run7.json"),
        r#"{"user_input": {"unit_cell": "79.1,79.1,38.2,90,90,90", "space_group": "P43212"}}"#,
    )
    .unwrap();
}

fn stills_params(root: &std::path::Path) -> ParameterSet {
    data_params(root)
        .with("run_num", 7i64)
        .with("chip_name", "chip1")
        .with("cbf_num", 3i64)
        .with("stills_batch_size", 3i64)
}

/// A best-effort stage failing on one unit does not stop the pipeline
#[tokio::test]
async fn test_best_effort_stage_failure_continues() {
    let dir = tempfile::TempDir::new().unwrap();
    stills_data_dir(dir.path());

    let (result, mock) = run_with_mock(
        &builtin("stills"),
        &stills_params(dir.path()),
        MockDispatch::new().fail_when("/chip1_7_00002.cbf", 1),
    )
    .await;
    let run = result.unwrap();

    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(run.stage_names(), vec!["dials_stills", "dials_prime"]);

    let stills = run.stage("dials_stills").unwrap();
    let statuses: Vec<_> = stills.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![OutcomeStatus::Succeeded, OutcomeStatus::Failed, OutcomeStatus::Succeeded]
    );
    assert_eq!(stills.failed_units, vec![dir.path().join("chip1_7_00002.cbf")]);
    assert_eq!(stills.state(), StageState::Failed);

    assert!(run.stage("dials_prime").unwrap().is_success());
    assert_eq!(run.failed_stages(), vec!["dials_stills"]);
    assert_eq!(mock.launches(), 4);
}

/// Every unit of the sequential stage runs in the shared processing directory
#[tokio::test]
async fn test_sequential_stage_shares_output_dir() {
    let dir = tempfile::TempDir::new().unwrap();
    stills_data_dir(dir.path());

    let (result, mock) = run_with_mock(&builtin("stills"), &stills_params(dir.path()), MockDispatch::new()).await;
    result.unwrap();

    let requests = mock.requests();
    let proc_dir = dir.path().join("proc");
    for request in requests.iter().filter(|r| r.command.contains("dials.stills_process")) {
        assert_eq!(request.working_dir, proc_dir);
        assert!(!request.abort_on_failure);
    }
    assert!(requests[0].command.contains(&format!("{}/process_7.phil", proc_dir.display())));
    assert!(requests[0].command.ends_with("> log-chip1_7_00001.txt"));
}

/// An abort-on-failure stage stops the run and reports the failing command
#[tokio::test]
async fn test_failure_aborts_remaining_stages() {
    let dir = tempfile::TempDir::new().unwrap();
    ssx_data_dir(dir.path(), &["run1", "run2"]);

    let (result, mock) = run_with_mock(
        &builtin("ssx"),
        &data_params(dir.path()),
        MockDispatch::new().fail_when("xia2.ssx image=", 2),
    )
    .await;
    let (stage, cause, run) = expect_aborted(result);

    assert_eq!(stage, "initial_proc");
    assert_eq!(run.status, ExecutionStatus::Aborted);
    assert_eq!(run.stage_names(), vec!["initial_proc"]);
    assert_eq!(mock.launches(), 1);

    match cause {
        PipelineError::ExternalProcessFailure {
            command,
            exit_code,
            stderr,
        } => {
            assert!(command.starts_with("xia2.ssx image="));
            assert_eq!(exit_code, Some(2));
            assert!(stderr.contains("scripted failure"));
        }
        other => panic!("Expected ExternalProcessFailure, got {:?}", other),
    }
}

/// A timed out stage is reported as a timeout, not a failure
#[tokio::test]
async fn test_timeout_aborts_with_timeout_error() {
    let dir = tempfile::TempDir::new().unwrap();
    ssx_data_dir(dir.path(), &["run1", "run2"]);

    let (result, _mock) = run_with_mock(
        &builtin("ssx"),
        &data_params(dir.path()),
        MockDispatch::new()
            .with_effect(xia2_writes_batches)
            .time_out_when("xia2.ssx_reduce"),
    )
    .await;
    let (stage, cause, run) = expect_aborted(result);

    assert_eq!(stage, "merge_all");
    assert!(matches!(cause, PipelineError::ExternalProcessTimeout { .. }));
    assert_eq!(run.stage("merge_all").unwrap().state(), StageState::TimedOut);
    assert_eq!(run.stage("merge_all").unwrap().status, OutcomeStatus::TimedOut);
}

/// A missing required parameter fails before anything is launched or created
#[tokio::test]
async fn test_missing_parameter_launches_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    stills_data_dir(dir.path());
    std::fs::remove_dir_all(dir.path().join("proc")).unwrap();

    let params = data_params(dir.path()).with("chip_name", "chip1");
    let (result, mock) = run_with_mock(&builtin("stills"), &params, MockDispatch::new()).await;
    let (stage, cause, run) = expect_aborted(result);

    // dials_stills is best effort, so the run reaches dials_prime before aborting
    assert_eq!(stage, "dials_prime");
    match cause {
        PipelineError::MissingParameter { key, .. } => assert_eq!(key, "run_num"),
        other => panic!("Expected MissingParameter, got {:?}", other),
    }
    let stills = run.stage("dials_stills").unwrap();
    assert!(stills.error.as_deref().unwrap_or_default().contains("run_num"));
    assert!(stills.outcomes.is_empty());

    assert_eq!(mock.launches(), 0);
    assert!(!dir.path().join("proc").exists());
    assert!(!dir.path().join("prime").exists());
}
