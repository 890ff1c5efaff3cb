use std::{
    collections::BTreeMap,
    env,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

use anyhow::Context;
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    Map,
    Value,
};

use crate::identity::{
    RunId,
    StorageLayout,
};

// where the engine sees the run path inside the container
pub const CONFIG_MOUNT_PATH: &str = "/etc/nextflow";

// job template as read in(from disk and/or the command line), nothing resolved yet
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobInput {
    pub backend: Option<String>,
    pub base_bucket: Option<String>,
    pub container_image: Option<String>,
    pub sample_id: Option<String>,
    pub dry_run: Option<bool>,
    pub remote_cache_path: Option<String>,
    pub remote_run_path: Option<String>,

    // placement
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub service_account_email: Option<String>,
    pub network: Option<String>,
    pub subnetwork: Option<String>,
    pub use_private_address: Option<bool>,
    pub labels: Option<BTreeMap<String, String>>,

    // compute shape
    pub spot: Option<bool>,
    pub machine_type: Option<String>,
    pub cpu_milli: Option<u32>,
    pub memory_mib: Option<u32>,
    // 0 => one worker per available core
    pub upload_max_workers: Option<usize>,

    // pipeline
    pub pipeline_name: Option<String>,
    pub nextflow_version: Option<String>,
    pub pipeline_version: Option<String>,
    pub profile: Option<String>,
    pub params_file: Option<String>,
    pub config_file: Option<String>,
    pub executor_config_file: Option<String>,
    pub samplesheet: Option<String>,
    pub resume: Option<String>,

    pub plugin: Option<String>,
    pub plugin_options: Option<Map<String, Value>>,
}

impl JobInput {
    pub fn from_file(path: &Path) -> anyhow::Result<JobInput> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file `{}`", path.display()))?;
        let input: JobInput = toml::from_str(&text)
            .with_context(|| format!("Failed to parse job file `{}`", path.display()))?;
        Ok(input)
    }

    // `NF_LAUNCH_<FIELD>` for the placement fields commonly shared by a team
    pub fn from_env() -> JobInput {
        Self::from_vars(|name| env::var(name).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> JobInput {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        JobInput {
            base_bucket: var("NF_LAUNCH_BASE_BUCKET"),
            project_id: var("NF_LAUNCH_PROJECT_ID"),
            region: var("NF_LAUNCH_REGION"),
            service_account_email: var("NF_LAUNCH_SERVICE_ACCOUNT_EMAIL"),
            network: var("NF_LAUNCH_NETWORK"),
            subnetwork: var("NF_LAUNCH_SUBNETWORK"),
            ..Default::default()
        }
    }

    // fields set in `over` win
    pub fn overlay(self, over: JobInput) -> JobInput {
        JobInput {
            backend: over.backend.or(self.backend),
            base_bucket: over.base_bucket.or(self.base_bucket),
            container_image: over.container_image.or(self.container_image),
            sample_id: over.sample_id.or(self.sample_id),
            dry_run: over.dry_run.or(self.dry_run),
            remote_cache_path: over.remote_cache_path.or(self.remote_cache_path),
            remote_run_path: over.remote_run_path.or(self.remote_run_path),
            project_id: over.project_id.or(self.project_id),
            region: over.region.or(self.region),
            service_account_email: over.service_account_email.or(self.service_account_email),
            network: over.network.or(self.network),
            subnetwork: over.subnetwork.or(self.subnetwork),
            use_private_address: over.use_private_address.or(self.use_private_address),
            labels: over.labels.or(self.labels),
            spot: over.spot.or(self.spot),
            machine_type: over.machine_type.or(self.machine_type),
            cpu_milli: over.cpu_milli.or(self.cpu_milli),
            memory_mib: over.memory_mib.or(self.memory_mib),
            upload_max_workers: over.upload_max_workers.or(self.upload_max_workers),
            pipeline_name: over.pipeline_name.or(self.pipeline_name),
            nextflow_version: over.nextflow_version.or(self.nextflow_version),
            pipeline_version: over.pipeline_version.or(self.pipeline_version),
            profile: over.profile.or(self.profile),
            params_file: over.params_file.or(self.params_file),
            config_file: over.config_file.or(self.config_file),
            executor_config_file: over.executor_config_file.or(self.executor_config_file),
            samplesheet: over.samplesheet.or(self.samplesheet),
            resume: over.resume.or(self.resume),
            plugin: over.plugin.or(self.plugin),
            plugin_options: over.plugin_options.or(self.plugin_options),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRole {
    ParamsFile,
    Samplesheet,
    CustomConfig,
    ExecutorConfig,
    Pipeline,
}

impl InputRole {
    // sub-folder of the run path the file lands in
    pub fn remote_subdir(&self) -> &'static str {
        match self {
            InputRole::ParamsFile | InputRole::Samplesheet => "input",
            _ => "config",
        }
    }

    // the job input field the file came from
    pub fn field_name(&self) -> &'static str {
        match self {
            InputRole::ParamsFile => "params_file",
            InputRole::Samplesheet => "samplesheet",
            InputRole::CustomConfig => "config_file",
            InputRole::ExecutorConfig => "executor_config_file",
            InputRole::Pipeline => "pipeline_name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputFile {
    // absolute local path, or a `gs://` uri that is never staged
    pub path: String,
    pub role: InputRole,
    // produced during this run rather than supplied by the user
    pub generated: bool,
}

impl InputFile {
    pub fn is_remote(&self) -> bool {
        is_remote_uri(&self.path)
    }

    pub fn file_name(&self) -> Option<&str> {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
    }
}

pub fn is_remote_uri(path: &str) -> bool {
    path.starts_with("gs://")
}

/// One file to stage: where it is, where it goes, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub local_path: PathBuf,
    // `<bucket>/<object>` without scheme
    pub remote_path: String,
    pub role: InputRole,
}

impl ManifestEntry {
    pub fn new(local_path: impl Into<PathBuf>, remote_path: impl Into<String>, role: InputRole) -> Self {
        ManifestEntry {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineKind {
    // repository name, fetched by the engine
    Remote,
    // local `.nf` file, staged to `config/`
    Script { path: PathBuf },
    // local project folder, staged to `config/<dir>/`
    Directory { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resume {
    pub run_name: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineTarget {
    pub name: String,
    pub kind: PipelineKind,
    pub version: Option<String>,
    pub nextflow_version: String,
    pub profile: Option<String>,
    pub container_image: String,
    pub resume: Option<Resume>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resources {
    pub machine_type: String,
    pub cpu_milli: u32,
    pub memory_mib: u32,
    pub spot: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub project_id: String,
    pub region: String,
    pub service_account_email: String,
    pub network: Option<String>,
    pub subnetwork: Option<String>,
    pub use_private_address: bool,
    pub labels: BTreeMap<String, String>,
}

/// The job record threaded through every launch stage.
///
/// Identity and storage fields are private: they are fixed by the config
/// builder and only readable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct JobSpecification {
    run_id: RunId,
    job_name: String,
    storage: StorageLayout,
    inputs: Vec<InputFile>,

    pub launched_at: DateTime<Utc>,
    pub backend: String,
    pub sample_id: Option<String>,
    pub pipeline: PipelineTarget,
    pub resources: Resources,
    pub placement: Placement,
    // `--key value` pipeline params, written by plugins
    pub extra_params: BTreeMap<String, String>,
    pub plugin: Option<String>,
    pub plugin_options: Map<String, Value>,
    pub upload_max_workers: usize,
    pub executor_template: String,
    pub config_mount_path: String,
    pub tmp_dir: PathBuf,

    // mode is not part of the job itself, so snapshots of a dry run and a
    // real run of the same input are identical
    #[serde(skip)]
    pub dry_run: bool,
}

pub(crate) struct Identity {
    pub run_id: RunId,
    pub job_name: String,
    pub storage: StorageLayout,
}

impl JobSpecification {
    pub(crate) fn assemble(
        identity: Identity,
        inputs: Vec<InputFile>,
        rest: SpecificationParts,
    ) -> JobSpecification {
        JobSpecification {
            run_id: identity.run_id,
            job_name: identity.job_name,
            storage: identity.storage,
            inputs,
            launched_at: rest.launched_at,
            backend: rest.backend,
            sample_id: rest.sample_id,
            pipeline: rest.pipeline,
            resources: rest.resources,
            placement: rest.placement,
            extra_params: BTreeMap::new(),
            plugin: rest.plugin,
            plugin_options: rest.plugin_options,
            upload_max_workers: rest.upload_max_workers,
            executor_template: rest.executor_template,
            config_mount_path: CONFIG_MOUNT_PATH.to_string(),
            tmp_dir: rest.tmp_dir,
            dry_run: rest.dry_run,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }

    pub fn inputs(&self) -> &[InputFile] {
        &self.inputs
    }

    pub fn input(&self, role: InputRole) -> Option<&InputFile> {
        self.inputs.iter().find(|i| i.role == role)
    }

    // replaces the file already holding `role`, keeping its position
    pub(crate) fn set_input(&mut self, file: InputFile) {
        match self.inputs.iter_mut().find(|i| i.role == file.role) {
            Some(existing) => *existing = file,
            None => self.inputs.push(file),
        }
    }

    /// Staging entries for the user inputs that live in `input/`.
    ///
    /// Config-role files are produced by the template renderer and pipeline
    /// sources by the stager, so they are not listed here.
    pub fn input_entries(&self) -> Vec<ManifestEntry> {
        self.inputs
            .iter()
            .filter(|i| matches!(i.role, InputRole::ParamsFile | InputRole::Samplesheet))
            .filter(|i| !i.is_remote())
            .filter_map(|i| {
                let name = i.file_name()?;
                Some(ManifestEntry::new(
                    &i.path,
                    format!("{}/{}", self.storage.input_dir(), name),
                    i.role,
                ))
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub(crate) struct SpecificationParts {
    pub launched_at: DateTime<Utc>,
    pub backend: String,
    pub sample_id: Option<String>,
    pub pipeline: PipelineTarget,
    pub resources: Resources,
    pub placement: Placement,
    pub plugin: Option<String>,
    pub plugin_options: Map<String, Value>,
    pub upload_max_workers: usize,
    pub executor_template: String,
    pub tmp_dir: PathBuf,
    pub dry_run: bool,
}

// base folder for per-run local artifacts
pub fn tmp_root() -> PathBuf {
    let base = env::var("NF_LAUNCH_TMPDIR")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| env::var("TMPDIR").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| ".tmp".to_string());
    resolve_path(&base)
}

// expand `~` and `$VAR`, then make absolute
pub fn resolve_path(value: &str) -> PathBuf {
    let expanded = expand_vars(value.trim());
    let expanded = match expanded.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match home::home_dir() {
            Some(home) => format!("{}{rest}", home.display()),
            None => expanded,
        },
        _ => expanded,
    };
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

fn expand_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }
        match env::var(&name) {
            Ok(v) if !name.is_empty() => out.push_str(&v),
            // unknown variables are kept as written
            _ => {
                out.push('$');
                if braced {
                    out.push('{');
                    out.push_str(&name);
                    out.push('}');
                } else {
                    out.push_str(&name);
                }
            }
        }
    }
    out
}
