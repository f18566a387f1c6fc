use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};

use simlab_core::{ensure_dir, BundleStatus, Error, Result, SimulationBundle, Table};
use simlab_runner::{call_experiment, ExperimentOptions};

fn temp_workspace(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "simlab_e2e_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&dir).expect("temp dir");
    dir
}

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("experiment.yaml");
    fs::write(&path, "baseline_parameters:\n  r0: 2.5\n  recovery: 0.2\n").expect("config");
    path
}

fn epidemic_runner(mut bundle: SimulationBundle) -> Result<SimulationBundle> {
    let data = Table::from_columns(vec![
        (
            "t".to_string(),
            vec![json!(0), json!(1), json!(2)],
        ),
        (
            "infected".to_string(),
            vec![json!(5), json!(9), json!(14)],
        ),
    ])?;
    let mut results = BTreeMap::new();
    results.insert(0u64, data);
    bundle.set_results(results);
    Ok(bundle)
}

fn peak_summarizer(_replicate: u64, results: &Table) -> Result<Value> {
    let peak = results
        .rows()
        .iter()
        .filter_map(|row| row.last().and_then(Value::as_i64))
        .max()
        .unwrap_or(0);
    Ok(json!({"peak": [peak], "n_points": [results.n_rows()]}))
}

#[test]
fn end_to_end_test_mode_writes_data_and_reports() {
    let dir = temp_workspace("full");
    let config = write_config(&dir);

    let options = ExperimentOptions {
        working_dir: Some(dir.clone()),
        runner: Some(Box::new(epidemic_runner)),
        summarizer: Some(Box::new(peak_summarizer)),
        ..Default::default()
    };
    let bundle = call_experiment(&config, "test", &["simulations", "summaries"], options)
        .expect("experiment");

    // Test mode without an explicit seed resolves to 0.
    assert_eq!(bundle.inputs().get(0, "randomSeed"), Some(&json!(0)));
    assert_eq!(bundle.status(), BundleStatus::Executed);
    assert_eq!(bundle.baseline_params()["r0"], json!(2.5));

    let data_path = dir
        .join("test")
        .join("simulations")
        .join("simulation_0")
        .join("data.csv");
    let data = fs::read_to_string(&data_path).expect("data.csv");
    assert_eq!(data, "t,infected\n0,5\n1,9\n2,14\n");

    let report_path = dir
        .join("test")
        .join("summaries")
        .join("simulation_0")
        .join("report.csv");
    let report = fs::read_to_string(&report_path).expect("report.csv");
    assert_eq!(report, "n_points,peak\n3,14\n");

    let summaries = bundle.summary_metrics().expect("summaries");
    assert_eq!(summaries[&0]["peak"], json!([14]));

    let manifest: Value = serde_json::from_str(
        &fs::read_to_string(dir.join("test").join("manifest.json")).expect("manifest"),
    )
    .expect("manifest json");
    assert_eq!(manifest["experiment_mode"], json!("test"));
    assert_eq!(manifest["project_seed"], json!(0));

    let inventory: Value = serde_json::from_str(
        &fs::read_to_string(dir.join("test").join("inventory.json")).expect("inventory"),
    )
    .expect("inventory json");
    let listed: Vec<&str> = inventory["files"]
        .as_array()
        .expect("files")
        .iter()
        .filter_map(|f| f["path"].as_str())
        .collect();
    assert!(listed.contains(&"simulations/simulation_0/data.csv"));
    assert!(listed.contains(&"summaries/simulation_0/report.csv"));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn parameters_category_coexists_with_result_categories() {
    let dir = temp_workspace("params");
    let config = write_config(&dir);

    let options = ExperimentOptions {
        working_dir: Some(dir.clone()),
        runner: Some(Box::new(epidemic_runner)),
        ..Default::default()
    };
    call_experiment(&config, "test", &["parameters", "simulations"], options)
        .expect("experiment");

    assert!(dir
        .join("test")
        .join("parameters")
        .join("simulation_0")
        .join("parameters.csv")
        .exists());
    assert!(dir
        .join("test")
        .join("simulations")
        .join("simulation_0")
        .join("data.csv")
        .exists());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn unrecognized_category_fails_before_any_stage_runs() {
    let dir = temp_workspace("badcat");
    let config = write_config(&dir);

    let options = ExperimentOptions {
        working_dir: Some(dir.clone()),
        runner: Some(Box::new(epidemic_runner)),
        summarizer: Some(Box::new(peak_summarizer)),
        ..Default::default()
    };
    let err = call_experiment(&config, "test", &["plots"], options).expect_err("bad category");
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("invalid write option"));
    assert!(
        !dir.join("test").exists(),
        "no artifacts may be written for a rejected category set"
    );

    let _ = fs::remove_dir_all(dir);
}
