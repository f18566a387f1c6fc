use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use simlab_core::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir, Error, Result,
    SimulationBundle, Table,
};

const TEST_MODE: &str = "test";
const DEFAULT_SAMPLER_METHOD: &str = "sobol";

/// How the project seed should be obtained when the caller does not fix it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedSource {
    /// Use this value verbatim.
    Explicit(u64),
    /// Draw a fresh seed over the full u32 range.
    Random,
}

/// Artifact categories a caller may request to be materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCategory {
    Parameters,
    Simulations,
    Summaries,
}

impl WriteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteCategory::Parameters => "parameters",
            WriteCategory::Simulations => "simulations",
            WriteCategory::Summaries => "summaries",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "parameters" => Ok(WriteCategory::Parameters),
            "simulations" => Ok(WriteCategory::Simulations),
            "summaries" => Ok(WriteCategory::Summaries),
            other => Err(Error::configuration(format!(
                "invalid write option: {}",
                other
            ))),
        }
    }

    fn carries_results(&self) -> bool {
        matches!(self, WriteCategory::Simulations | WriteCategory::Summaries)
    }
}

/// Produces the baseline parameter set when the caller builds it in code
/// instead of loading it from the experiment config.
pub trait ParamsInitializer {
    fn initial_params(&self) -> Value;
}

impl<F> ParamsInitializer for F
where
    F: Fn() -> Value,
{
    fn initial_params(&self) -> Value {
        self()
    }
}

/// Draws per-replicate simulation parameters.
pub trait ParameterSampler {
    fn draw(&self, n_simulations: usize, method: &str, seed: u64) -> Result<Table>;
}

impl<F> ParameterSampler for F
where
    F: Fn(usize, &str, u64) -> Result<Table>,
{
    fn draw(&self, n_simulations: usize, method: &str, seed: u64) -> Result<Table> {
        self(n_simulations, method, seed)
    }
}

/// Executes a bundle and returns it with `results` populated.
pub trait SimulationRunner {
    fn run(&self, input_bundle: SimulationBundle) -> Result<SimulationBundle>;
}

impl<F> SimulationRunner for F
where
    F: Fn(SimulationBundle) -> Result<SimulationBundle>,
{
    fn run(&self, input_bundle: SimulationBundle) -> Result<SimulationBundle> {
        self(input_bundle)
    }
}

/// Reduces one replicate's results to summary metrics.
///
/// The returned value is only required to be tabular when the caller asks
/// for the `summaries` write category; validation happens at write time.
pub trait ReplicateSummarizer {
    fn summarize(&self, replicate: u64, results: &Table) -> Result<Value>;
}

impl<F> ReplicateSummarizer for F
where
    F: Fn(u64, &Table) -> Result<Value>,
{
    fn summarize(&self, replicate: u64, results: &Table) -> Result<Value> {
        self(replicate, results)
    }
}

/// Storage backend handle used to mirror persisted artifacts.
pub trait RemoteStore {
    fn upload_file(&self, local_path: &Path, container: &str, remote_key: &str) -> Result<()>;
}

/// Handles produced by a remote backend initializer. Any element may be
/// absent to signal partial initialization failure.
pub struct RemoteHandles {
    pub client: Option<Arc<dyn RemoteStore>>,
    pub storage_container: Option<String>,
    pub job_prefix: Option<String>,
}

/// Establishes the remote execution backend for one orchestration call.
pub trait RemoteInitializer {
    fn initialize(
        &self,
        config: &Path,
        experiment_mode: &str,
        create_pool: bool,
    ) -> Result<RemoteHandles>;
}

impl<F> RemoteInitializer for F
where
    F: Fn(&Path, &str, bool) -> Result<RemoteHandles>,
{
    fn initialize(
        &self,
        config: &Path,
        experiment_mode: &str,
        create_pool: bool,
    ) -> Result<RemoteHandles> {
        self(config, experiment_mode, create_pool)
    }
}

/// Call-scoped remote execution context.
///
/// `requested` stays true even when initialization only partially succeeded;
/// the unusable context then surfaces as a hard failure if the runner path
/// is taken, and as a skipped upload during mirroring.
pub struct RemoteContext {
    pub requested: bool,
    pub client: Option<Arc<dyn RemoteStore>>,
    pub storage_container: Option<String>,
    pub job_prefix: Option<String>,
}

impl RemoteContext {
    pub fn disabled() -> Self {
        Self {
            requested: false,
            client: None,
            storage_container: None,
            job_prefix: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.client.is_some() && self.storage_container.is_some() && self.job_prefix.is_some()
    }
}

/// Optional capabilities for one `call_experiment` invocation.
#[derive(Default)]
pub struct ExperimentOptions {
    pub project_seed: Option<SeedSource>,
    pub initializer: Option<Box<dyn ParamsInitializer>>,
    pub bundle: Option<SimulationBundle>,
    pub sampler: Option<Box<dyn ParameterSampler>>,
    pub sampler_method: Option<String>,
    pub replicates: Option<usize>,
    pub downloader: Option<Box<dyn RemoteInitializer>>,
    pub create_pool: bool,
    pub runner: Option<Box<dyn SimulationRunner>>,
    pub summarizer: Option<Box<dyn ReplicateSummarizer>>,
    pub working_dir: Option<PathBuf>,
    pub preserve: bool,
    pub param_overrides: BTreeMap<String, Value>,
}

pub fn resolve_project_seed(
    project_seed: Option<SeedSource>,
    experiment_mode: &str,
) -> Result<u64> {
    match project_seed {
        Some(SeedSource::Explicit(seed)) => Ok(seed),
        // TODO: try reading a test-mode seed from the experiment config
        // before falling back to 0.
        _ if experiment_mode == TEST_MODE => {
            info!("test mode selected without an explicit seed, defaulting to 0");
            Ok(0)
        }
        None => Err(Error::configuration("random seed not specified")),
        Some(SeedSource::Random) => {
            let seed = rand::thread_rng().gen::<u32>() as u64;
            debug!(seed, "drew random project seed");
            Ok(seed)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExperimentConfigFile {
    baseline_parameters: BTreeMap<String, Value>,
}

/// Load baseline parameters from the YAML experiment config, merging
/// `overrides` on top. Returns the parameters and a one-line human-readable
/// summary of what was loaded.
pub fn load_baseline_params(
    config: &Path,
    overrides: &BTreeMap<String, Value>,
) -> Result<(Value, String)> {
    let raw = fs::read_to_string(config).map_err(|e| {
        Error::configuration(format!("cannot read config {}: {}", config.display(), e))
    })?;
    let parsed: ExperimentConfigFile = serde_yaml::from_str(&raw).map_err(|e| {
        Error::configuration(format!("malformed config {}: {}", config.display(), e))
    })?;

    let mut params = serde_json::Map::new();
    for (key, value) in parsed.baseline_parameters {
        params.insert(key, value);
    }
    for (key, value) in overrides {
        params.insert(key.clone(), value.clone());
    }

    let rendered: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    let summary = format!(
        "loaded {} baseline parameters: {}",
        params.len(),
        rendered.join(", ")
    );
    Ok((Value::Object(params), summary))
}

fn resolve_baseline_params(config: &Path, options: &ExperimentOptions) -> Result<Arc<Value>> {
    if let Some(initializer) = &options.initializer {
        debug!("baseline parameters supplied by initializer");
        return Ok(Arc::new(initializer.initial_params()));
    }
    if let Some(bundle) = &options.bundle {
        debug!("baseline parameters shared from the supplied bundle");
        return Ok(bundle.baseline_params_handle());
    }
    let (params, summary) = load_baseline_params(config, &options.param_overrides)?;
    info!(config = %config.display(), "{}", summary);
    Ok(Arc::new(params))
}

fn establish_remote_context(
    config: &Path,
    experiment_mode: &str,
    options: &ExperimentOptions,
) -> Result<RemoteContext> {
    let Some(downloader) = &options.downloader else {
        return Ok(RemoteContext::disabled());
    };
    let handles = downloader.initialize(config, experiment_mode, options.create_pool)?;
    let context = RemoteContext {
        requested: true,
        client: handles.client,
        storage_container: handles.storage_container,
        job_prefix: handles.job_prefix,
    };
    if context.is_ready() {
        info!(
            container = context.storage_container.as_deref().unwrap_or(""),
            "remote execution client initialized"
        );
    } else {
        warn!("failed to fully initialize the remote execution client");
    }
    Ok(context)
}

fn construct_bundle(
    options: &ExperimentOptions,
    seed: u64,
    baseline_params: Arc<Value>,
) -> Result<SimulationBundle> {
    if let Some(source) = &options.bundle {
        return Ok(SimulationBundle::duplicate_from(source));
    }
    let inputs = if let Some(sampler) = &options.sampler {
        let n_simulations = options.replicates.ok_or_else(|| {
            Error::configuration("replicates must be set when a sampler is supplied")
        })?;
        let method = options
            .sampler_method
            .as_deref()
            .unwrap_or(DEFAULT_SAMPLER_METHOD);
        sampler.draw(n_simulations, method, seed)?
    } else {
        Table::single_row(vec![("simulation", json!(0)), ("randomSeed", json!(seed))])
    };
    Ok(SimulationBundle::new(inputs, 0, baseline_params))
}

/// Remove prior artifacts under `<dir>/<experiment_mode>/<suffix>`.
pub fn delete_experiment_artifacts(dir: &Path, experiment_mode: &str, suffix: &str) -> Result<()> {
    let mut target = dir.join(experiment_mode);
    if !suffix.is_empty() {
        target = target.join(suffix);
    }
    if target.exists() {
        fs::remove_dir_all(&target)?;
        debug!(path = %target.display(), "removed prior experiment artifacts");
    }
    Ok(())
}

fn mirror_to_remote(remote: &RemoteContext, root: &Path, path: &Path) -> Result<()> {
    if !remote.requested {
        return Ok(());
    }
    match (&remote.client, &remote.storage_container) {
        (Some(client), Some(container)) => {
            let key = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            client.upload_file(path, container, &key)
        }
        _ => {
            warn!(
                path = %path.display(),
                "remote mirroring requested but the context is not ready, skipping upload"
            );
            Ok(())
        }
    }
}

fn persist_parameter_inputs(
    bundle: &SimulationBundle,
    dir: &Path,
    experiment_mode: &str,
    categories: &[WriteCategory],
    remote: &RemoteContext,
) -> Result<()> {
    let inputs = bundle.writer_inputs();
    for category in categories {
        let category_dir = dir.join(experiment_mode).join(category.as_str());
        for (id, row) in &inputs {
            let sim_dir = category_dir.join(format!("simulation_{}", id));
            ensure_dir(&sim_dir)?;
            let path = sim_dir.join("parameters.csv");
            atomic_write_bytes(&path, row.to_csv().as_bytes())?;
            mirror_to_remote(remote, dir, &path)?;
        }
    }
    Ok(())
}

fn write_experiment_manifest(
    bundle: &SimulationBundle,
    dir: &Path,
    experiment_mode: &str,
    project_seed: u64,
    categories: &[WriteCategory],
) -> Result<()> {
    let manifest = json!({
        "schema_version": "experiment_manifest_v1",
        "experiment_mode": experiment_mode,
        "project_seed": project_seed,
        "step_number": bundle.step_number(),
        "status": bundle.status().as_str(),
        "write": categories.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        "baseline_digest": canonical_json_digest(bundle.baseline_params()),
        "created_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&dir.join(experiment_mode).join("manifest.json"), &manifest)
}

fn persist_result_artifacts(
    bundle: &SimulationBundle,
    dir: &Path,
    experiment_mode: &str,
    categories: &[WriteCategory],
    remote: &RemoteContext,
) -> Result<()> {
    for category in categories {
        let category_dir = dir.join(experiment_mode).join(category.as_str());
        match category {
            // Materialized before execution; nothing result-bearing to add.
            WriteCategory::Parameters => {}
            WriteCategory::Simulations => {
                let results = bundle.results()?;
                for (id, data) in results {
                    let path = category_dir
                        .join(format!("simulation_{}", id))
                        .join("data.csv");
                    atomic_write_bytes(&path, data.to_csv().as_bytes())?;
                    mirror_to_remote(remote, dir, &path)?;
                }
            }
            WriteCategory::Summaries => {
                let summaries = bundle.summary_metrics()?;
                for (id, value) in summaries {
                    let report = Table::from_value(value)?;
                    let path = category_dir
                        .join(format!("simulation_{}", id))
                        .join("report.csv");
                    atomic_write_bytes(&path, report.to_csv().as_bytes())?;
                    mirror_to_remote(remote, dir, &path)?;
                }
            }
        }
    }
    Ok(())
}

fn write_artifact_inventory(dir: &Path, experiment_mode: &str) -> Result<()> {
    let root = dir.join(experiment_mode);
    let mut files = Vec::new();
    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name() == "inventory.json" {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(&root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        files.push(json!({"path": rel, "bytes": bytes}));
    }
    let inventory = json!({
        "schema_version": "artifact_inventory_v1",
        "experiment_mode": experiment_mode,
        "generated_at": Utc::now().to_rfc3339(),
        "files": files,
    });
    atomic_write_json_pretty(&root.join("inventory.json"), &inventory)
}

fn execute_and_summarize(
    bundle: SimulationBundle,
    options: &ExperimentOptions,
    remote: &RemoteContext,
) -> Result<SimulationBundle> {
    let Some(runner) = &options.runner else {
        return Ok(bundle);
    };
    if remote.requested {
        return Err(Error::unsupported(
            "remote batch execution is not implemented",
        ));
    }
    let mut executed = runner.run(bundle)?;
    if !executed.has_results() {
        return Err(Error::state("runner returned a bundle without results"));
    }
    debug!(replicates = executed.results()?.len(), "bundle executed");
    if let Some(summarizer) = &options.summarizer {
        let mut summaries = BTreeMap::new();
        for (id, data) in executed.results()? {
            summaries.insert(*id, summarizer.summarize(*id, data)?);
        }
        executed.set_summary_metrics(summaries);
        debug!("summary metrics calculated");
    }
    Ok(executed)
}

fn parse_write_categories(write: &[&str]) -> Result<Vec<WriteCategory>> {
    write.iter().map(|raw| WriteCategory::parse(raw)).collect()
}

/// Run one experiment step end to end and return the final bundle.
///
/// Stages run in a fixed order: seed resolution, baseline parameter
/// resolution, remote gate, bundle construction, pre-execution persistence,
/// execution + summarization, post-execution persistence. The first failure
/// aborts the call; artifacts already written stay on disk.
pub fn call_experiment(
    config: &Path,
    experiment_mode: &str,
    write: &[&str],
    options: ExperimentOptions,
) -> Result<SimulationBundle> {
    let categories = parse_write_categories(write)?;
    let project_seed = resolve_project_seed(options.project_seed, experiment_mode)?;
    let baseline_params = resolve_baseline_params(config, &options)?;
    let remote = establish_remote_context(config, experiment_mode, &options)?;
    let bundle = construct_bundle(&options, project_seed, baseline_params)?;

    let dir = options
        .working_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    if !categories.is_empty() {
        if !options.preserve {
            delete_experiment_artifacts(&dir, experiment_mode, "")?;
        }
        persist_parameter_inputs(&bundle, &dir, experiment_mode, &categories, &remote)?;
        write_experiment_manifest(&bundle, &dir, experiment_mode, project_seed, &categories)?;
    }

    let bundle = execute_and_summarize(bundle, &options, &remote)?;

    let result_categories: Vec<WriteCategory> = categories
        .iter()
        .copied()
        .filter(WriteCategory::carries_results)
        .collect();
    if !result_categories.is_empty() {
        persist_result_artifacts(&bundle, &dir, experiment_mode, &result_categories, &remote)?;
    }
    if !categories.is_empty() {
        write_artifact_inventory(&dir, experiment_mode)?;
    }
    Ok(bundle)
}
