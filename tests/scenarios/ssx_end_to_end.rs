//! Test: the bundled ssx pipeline from raw master files to the PRIME config

use crate::helpers::*;
use pretty_assertions::assert_eq;
use ssx_pipeline::core::{ExecutionStatus, OutcomeStatus, PipelineError, PipelineRun};
use ssx_pipeline::render::phil;

#[tokio::test]
async fn test_ssx_pipeline_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let data = dir.path();
    ssx_data_dir(data, &["run1", "run2", "run3"]);

    let params = data_params(data).with("compute_endpoint", "hpc-a");
    let (result, mock) = run_with_mock(
        &builtin("ssx"),
        &params,
        MockDispatch::new().with_effect(xia2_writes_batches),
    )
    .await;
    let run = result.unwrap();

    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(
        run.stage_names(),
        vec!["initial_proc", "refined_proc", "merge_all", "run_prime"]
    );
    assert_eq!(mock.launches(), 6);
    assert!(mock.requests().iter().all(|r| r.endpoint.as_deref() == Some("hpc-a")));

    // One per-run directory for each master file, each using the refined geometry
    let refined = data.join("refined");
    let mut run_dirs: Vec<_> = mock
        .requests()
        .into_iter()
        .filter(|r| r.command.contains("reference_geometry="))
        .map(|r| {
            assert!(r.command.ends_with(&format!(
                "reference_geometry={}/initial_refinement/geometry_refinement/refined.expt",
                data.display()
            )));
            r.working_dir
        })
        .collect();
    run_dirs.sort();
    assert_eq!(
        run_dirs,
        vec![refined.join("ref_run1"), refined.join("ref_run2"), refined.join("ref_run3")]
    );

    let merge = mock
        .requests()
        .into_iter()
        .find(|r| r.command.contains("xia2.ssx_reduce"))
        .unwrap();
    assert_eq!(
        merge.command,
        format!(
            "source /dials/dials && xia2.ssx_reduce directory={0}/ref_run1/batch_1 \
             directory={0}/ref_run2/batch_1 directory={0}/ref_run3/batch_1 --phil {1}/run.phil",
            refined.display(),
            data.display()
        )
    );
    assert_eq!(merge.working_dir, data.join("final_merge"));

    let prime_dir = data.join("prime_results");
    let config = std::fs::read_to_string(prime_dir.join("prime.phil")).unwrap();
    let entries = phil::parse(&config).unwrap();
    assert_eq!(
        phil::lookup_all(&entries, "input.directory"),
        vec![
            refined.join("ref_run1/batch_1").display().to_string(),
            refined.join("ref_run2/batch_1").display().to_string(),
            refined.join("ref_run3/batch_1").display().to_string(),
        ]
    );
    assert_eq!(phil::lookup(&entries, "target_space_group"), Some("P43212"));
    assert_eq!(phil::lookup(&entries, "merging.d_min"), Some("1.5"));

    let prime = mock.requests().into_iter().last().unwrap();
    assert_eq!(prime.command, format!("prime {}", prime_dir.join("prime.phil").display()));
    assert_eq!(prime.working_dir, prime_dir);
}

/// One failing run does not stop its siblings, but does stop the pipeline
#[tokio::test]
async fn test_refined_fan_out_reports_failed_unit() {
    let dir = tempfile::TempDir::new().unwrap();
    let data = dir.path();
    ssx_data_dir(data, &["runA", "runB", "runC"]);

    let params = data_params(data).with("n_files", 1i64);
    let (result, mock) = run_with_mock(
        &builtin("ssx"),
        &params,
        MockDispatch::new()
            .with_effect(xia2_writes_batches)
            .fail_when("runB_master.h5", 1),
    )
    .await;
    let (stage, cause, run) = expect_aborted(result);

    assert_eq!(stage, "refined_proc");
    assert_eq!(run.stage_names(), vec!["initial_proc", "refined_proc"]);
    assert_eq!(mock.launches(), 4);

    let record = run.stage("refined_proc").unwrap();
    let statuses: Vec<_> = record.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![OutcomeStatus::Succeeded, OutcomeStatus::Failed, OutcomeStatus::Succeeded]
    );
    assert_eq!(record.failed_units, vec![data.join("raster/runB_master.h5")]);

    match cause {
        PipelineError::ExternalProcessFailure { command, .. } => {
            assert!(command.contains("runB_master.h5"));
            assert!(!command.contains("runA_master.h5"));
        }
        other => panic!("Expected ExternalProcessFailure, got {:?}", other),
    }
    assert!(data.join("refined/ref_runA/batch_1").is_dir());
    assert!(data.join("refined/ref_runC/batch_1").is_dir());
}

/// The run report survives a JSON round trip
#[tokio::test]
async fn test_run_report_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    ssx_data_dir(dir.path(), &["run1", "run2"]);

    let (result, _mock) = run_with_mock(
        &builtin("ssx"),
        &data_params(dir.path()),
        MockDispatch::new().with_effect(xia2_writes_batches),
    )
    .await;
    let run = result.unwrap();

    let json = run.to_json().unwrap();
    let back: PipelineRun = serde_json::from_str(&json).unwrap();

    assert_eq!(back.run_id, run.run_id);
    assert_eq!(back.status, ExecutionStatus::Completed);
    assert_eq!(back.stage_names(), run.stage_names());
    let refined = back.stage("refined_proc").unwrap();
    assert_eq!(refined.outcomes.len(), 2);
    assert_eq!(refined.output_dir, Some(dir.path().join("refined")));
}
