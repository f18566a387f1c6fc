use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

use simlab_core::canonical_json_digest;
use simlab_runner::{
    call_experiment, delete_experiment_artifacts, load_baseline_params, ExperimentOptions,
    SeedSource,
};

#[derive(Parser)]
#[command(name = "simlab", version = "0.1.0", about = "Simulation experiment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the experiment plan, build the bundle, and persist the
    /// requested artifact categories.
    Run {
        config: PathBuf,
        #[arg(long)]
        mode: String,
        #[arg(long = "write")]
        write: Vec<String>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        random_seed: bool,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        wd: Option<PathBuf>,
        #[arg(long)]
        preserve: bool,
        #[arg(long)]
        json: bool,
    },
    /// Load and report the baseline parameters from a config file.
    Describe {
        config: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Delete all persisted artifacts under an experiment-mode namespace.
    Clean {
        #[arg(long)]
        mode: String,
        #[arg(long)]
        wd: Option<PathBuf>,
    },
}

fn parse_set_values(values: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut map = BTreeMap::new();
    for raw in values {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected key=value", raw))?;
        let parsed =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.to_string(), parsed);
    }
    Ok(map)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            mode,
            write,
            seed,
            random_seed,
            set_values,
            wd,
            preserve,
            json,
        } => {
            let project_seed = match (seed, random_seed) {
                (Some(value), _) => Some(SeedSource::Explicit(value)),
                (None, true) => Some(SeedSource::Random),
                (None, false) => None,
            };
            let options = ExperimentOptions {
                project_seed,
                working_dir: wd.clone(),
                preserve,
                param_overrides: parse_set_values(&set_values)?,
                ..Default::default()
            };
            let write_refs: Vec<&str> = write.iter().map(String::as_str).collect();
            let bundle = call_experiment(&config, &mode, &write_refs, options)?;
            let artifacts_dir = wd
                .unwrap_or_else(|| PathBuf::from("."))
                .join(&mode);
            if json {
                println!(
                    "{}",
                    json!({
                        "experiment_mode": mode,
                        "status": bundle.status().as_str(),
                        "step_number": bundle.step_number(),
                        "replicates": bundle.inputs().n_rows(),
                        "write": write,
                        "artifacts_dir": artifacts_dir.to_string_lossy(),
                    })
                );
            } else {
                println!("experiment: {}", mode);
                println!("status: {}", bundle.status());
                println!("step: {}", bundle.step_number());
                println!("replicates: {}", bundle.inputs().n_rows());
                if !write.is_empty() {
                    println!("artifacts: {}", artifacts_dir.display());
                }
            }
        }
        Commands::Describe {
            config,
            set_values,
            json,
        } => {
            let overrides = parse_set_values(&set_values)?;
            let (params, summary) = load_baseline_params(&config, &overrides)?;
            let digest = canonical_json_digest(&params);
            if json {
                println!(
                    "{}",
                    json!({
                        "config": config.to_string_lossy(),
                        "baseline_digest": digest,
                        "baseline_parameters": params,
                    })
                );
            } else {
                println!("config: {}", config.display());
                println!("{}", summary);
                println!("digest: {}", digest);
            }
        }
        Commands::Clean { mode, wd } => {
            let dir = wd.unwrap_or_else(|| PathBuf::from("."));
            delete_experiment_artifacts(&dir, &mode, "")?;
            println!("removed artifacts under {}", dir.join(&mode).display());
        }
    }
    Ok(())
}
