#![doc = include_str!("../README.md")]

use std::env;

use clap::Parser;
use log::{
    info,
    warn,
};
use serde_json::{
    Map,
    Value,
};
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;

mod backend;
mod command;
mod config;
mod error;
mod identity;
mod job;
mod launcher;
mod plugins;
mod registry;
mod stager;
mod template;
mod validate;

use identity::RunIdentity;
use job::JobInput;
use launcher::{
    Launcher,
    Submission,
};
use registry::Registries;

// CLI
#[derive(Parser, Debug)]
#[command(name = "nflaunch")]
#[command(version = "0.1")]
#[command(about = "Launches Nextflow pipelines on Google Cloud Batch.", long_about = None)]
struct Cli {
    /// TOML job file; flags given here override its values
    #[arg(long)]
    job_file: Option<String>,

    /// Cancel a submitted job (job id or full resource name) and exit
    #[arg(long, value_name = "JOB")]
    cancel: Option<String>,

    /// Storage root, `gs://bucket` or `bucket`
    #[arg(short = 'b', long, value_parser = validate::bucket_name)]
    base_bucket: Option<String>,

    #[arg(short = 'i', long)]
    container_image: Option<String>,

    /// Sample label; `TUMOR,NORMAL` for paired plugins
    #[arg(short = 's', long)]
    sample_id: Option<String>,

    /// Write what would be submitted under the run folder, touch nothing remote
    #[arg(short = 'd', long, action, overrides_with = "no_dry_run")]
    dry_run: bool,

    /// Submit for real even if the job file asks for a dry run
    #[arg(long, action, overrides_with = "dry_run")]
    no_dry_run: bool,

    #[arg(short = 'e', long, value_parser = validate::backend_alias)]
    backend: Option<String>,

    #[arg(short = 'c', long)]
    remote_cache_path: Option<String>,

    #[arg(short = 'r', long)]
    remote_run_path: Option<String>,

    #[arg(long)]
    project_id: Option<String>,

    #[arg(long)]
    region: Option<String>,

    #[arg(long, value_parser = validate::service_account_email)]
    service_account_email: Option<String>,

    #[arg(long)]
    network: Option<String>,

    #[arg(long)]
    subnetwork: Option<String>,

    /// Give the VM an external IP address
    #[arg(long, action, overrides_with = "private_address")]
    public_address: bool,

    #[arg(long, action, overrides_with = "public_address")]
    private_address: bool,

    #[arg(long, action, overrides_with = "no_spot")]
    spot: bool,

    #[arg(long, action, overrides_with = "spot")]
    no_spot: bool,

    /// Resource labels as a JSON object
    #[arg(long, value_parser = validate::labels)]
    labels: Option<BTreeMap<String, String>>,

    /// Concurrent uploads, 0 for one per core
    #[arg(long)]
    upload_max_workers: Option<usize>,

    #[arg(long, value_parser = validate::positive_int)]
    cpu_milli: Option<u32>,

    #[arg(long, value_parser = validate::positive_int)]
    memory_mib: Option<u32>,

    #[arg(long)]
    machine_type: Option<String>,

    /// Repository (`nf-core/rnaseq`), local `.nf` script or local project folder
    #[arg(long)]
    pipeline_name: Option<String>,

    #[arg(long)]
    nextflow_version: Option<String>,

    #[arg(long)]
    pipeline_version: Option<String>,

    #[arg(long)]
    profile: Option<String>,

    #[arg(long)]
    params_file: Option<String>,

    #[arg(long)]
    config_file: Option<String>,

    /// Use this executor config instead of rendering one
    #[arg(long)]
    executor_config_file: Option<String>,

    #[arg(long)]
    samplesheet: Option<String>,

    /// `WORKFLOWRUN_ID,SESSION_ID` of the run to resume
    #[arg(long)]
    resume: Option<String>,

    #[arg(short = 'p', long)]
    plugin: Option<String>,

    /// Plugin options as a JSON object
    #[arg(short = 'o', long, value_parser = validate::json_object)]
    plugin_options: Option<Map<String, Value>>,
}

impl Cli {
    fn job_input(&self) -> JobInput {
        let spot = switch(self.spot, self.no_spot);
        JobInput {
            backend: self.backend.clone(),
            base_bucket: self.base_bucket.clone(),
            container_image: self.container_image.clone(),
            sample_id: self.sample_id.clone(),
            dry_run: switch(self.dry_run, self.no_dry_run),
            remote_cache_path: self.remote_cache_path.clone(),
            remote_run_path: self.remote_run_path.clone(),
            project_id: self.project_id.clone(),
            region: self.region.clone(),
            service_account_email: self.service_account_email.clone(),
            network: self.network.clone(),
            subnetwork: self.subnetwork.clone(),
            use_private_address: switch(self.private_address, self.public_address),
            labels: self.labels.clone(),
            spot,
            machine_type: self.machine_type.clone(),
            cpu_milli: self.cpu_milli,
            memory_mib: self.memory_mib,
            upload_max_workers: self.upload_max_workers,
            pipeline_name: self.pipeline_name.clone(),
            nextflow_version: self.nextflow_version.clone(),
            pipeline_version: self.pipeline_version.clone(),
            profile: self.profile.clone(),
            params_file: self.params_file.clone(),
            config_file: self.config_file.clone(),
            executor_config_file: self.executor_config_file.clone(),
            samplesheet: self.samplesheet.clone(),
            resume: self.resume.clone(),
            plugin: self.plugin.clone(),
            plugin_options: self.plugin_options.clone(),
        }
    }
}

// `--x` / `--no-x` pairs: unset unless one of them was given
fn switch(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

// `RUST_LOG` wins over `NF_LAUNCH_LOG_LEVEL`; default is `info`
fn init_logging() {
    let directives = env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| env::var("NF_LAUNCH_LOG_LEVEL").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let registries = Registries::builtin()?;

    // env < job file < flags
    let mut input = JobInput::from_env();
    if let Some(job_file) = &cli.job_file {
        input = input.overlay(JobInput::from_file(&job::resolve_path(job_file))?);
    }
    let input = input.overlay(cli.job_input());

    let launcher = Launcher::new(&registries, job::tmp_root());

    if let Some(reference) = &cli.cancel {
        let backend = input
            .backend
            .clone()
            .unwrap_or_else(|| config::DEFAULT_BACKEND.to_string());
        if launcher.cancel(&backend, reference, &input).await? {
            info!("Job `{reference}` is being cancelled");
        } else {
            warn!("Backend did not acknowledge cancellation of `{reference}`");
        }
        return Ok(());
    }

    let mut identity = RunIdentity::new();
    let launch = launcher.launch(input, &mut identity).await?;
    match &launch.submission {
        Submission::Submitted(handle) => {
            info!("Job `{}` submitted as `{}`", launch.spec.job_name(), handle.name);
        }
        Submission::Previewed(artifacts) => {
            info!(
                "[DRY-RUN] Nothing was submitted; artifacts for run `{}` are in `{}`",
                launch.spec.run_id(),
                artifacts.dir.display()
            );
        }
    }
    Ok(())
}
