//! Compute backends: remote storage, object lookup and job submission.
//!
//! A backend is registered as a [`BackendFactory`]. The factory is pure: it
//! knows the backend's defaults and how to shape a [`JobRequest`], so a
//! dry run can use it without ever touching the network. Network clients are
//! only created through [`BackendFactory::connect`].

pub mod gcp;

use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use log::info;
use serde::Serialize;

use crate::{
    command::CommandSpec,
    error::{
        LaunchError,
        Result,
    },
    job::JobSpecification,
};

pub const SPEC_SNAPSHOT_FILE: &str = "job_config.json";
pub const REQUEST_FILE: &str = "job_request.json";

/// Values used for every optional field the user left unset.
#[derive(Debug, Clone)]
pub struct BackendDefaults {
    pub container_image: &'static str,
    pub nextflow_version: &'static str,
    pub machine_type: &'static str,
    pub cpu_milli: u32,
    pub memory_mib: u32,
    pub spot: bool,
    pub use_private_address: bool,
    // name of the executor config template, also the staged file name
    pub executor_template: &'static str,
}

pub trait BackendFactory: Send + Sync {
    fn defaults(&self) -> BackendDefaults;

    fn build_request(&self, spec: &JobSpecification, command: &CommandSpec) -> Result<JobRequest>;

    // creates clients; must not perform any network call itself
    fn connect(&self) -> anyhow::Result<BackendClients>;

    // handle for a job submitted earlier, from its id or full name
    fn handle_for(&self, reference: &str, project_id: Option<&str>, region: Option<&str>) -> Result<JobHandle>;

    // hints printed once the job is accepted
    fn follow_up(&self, _spec: &JobSpecification, _handle: &JobHandle) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Clone)]
pub struct BackendClients {
    pub storage: Arc<dyn ObjectStore>,
    pub catalog: Arc<dyn ObjectCatalog>,
    pub batch: Arc<dyn BatchClient>,
}

/// `<bucket>/<object>` split at the first slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    pub bucket: String,
    pub object: String,
}

impl ObjectPath {
    pub fn parse(remote_path: &str) -> anyhow::Result<ObjectPath> {
        let trimmed = remote_path.trim_start_matches("gs://");
        match trimmed.split_once('/') {
            Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => Ok(ObjectPath {
                bucket: bucket.to_string(),
                object: object.to_string(),
            }),
            _ => anyhow::bail!("`{remote_path}` is not a `<bucket>/<object>` path"),
        }
    }

    // bucket with an optional (possibly empty) prefix, e.g. `gs://bucket/samples`
    pub fn parse_prefix(uri: &str) -> anyhow::Result<ObjectPath> {
        let Some(rest) = uri.strip_prefix("gs://") else {
            anyhow::bail!("Invalid GCS URI `{uri}`: must start with `gs://`");
        };
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            anyhow::bail!("Invalid GCS URI `{uri}`: bucket is empty");
        }
        Ok(ObjectPath {
            bucket: bucket.to_string(),
            object: prefix.trim_matches('/').to_string(),
        })
    }

    pub fn uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.object)
    }
}

/// Idempotent overwrite upload of one local file.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, local: &Path, remote: &ObjectPath) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub name: String,
    pub updated: DateTime<Utc>,
}

/// Read-only listing, the only storage access plugins get.
#[async_trait]
pub trait ObjectCatalog: Send + Sync {
    async fn list(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<ObjectInfo>>;
}

// most recently updated object under `uri` whose basename starts with
// `name_prefix` and ends with `extension`
pub async fn latest_object(
    catalog: &dyn ObjectCatalog,
    uri: &str,
    name_prefix: Option<&str>,
    extension: &str,
) -> anyhow::Result<Option<String>> {
    let location = ObjectPath::parse_prefix(uri)?;
    let objects = catalog.list(&location.bucket, &location.object).await?;
    let latest = objects
        .into_iter()
        .filter(|o| o.name.ends_with(extension))
        .filter(|o| {
            let basename = o.name.rsplit('/').next().unwrap_or(&o.name);
            name_prefix.map_or(true, |p| basename.starts_with(p))
        })
        .max_by(|a, b| a.updated.cmp(&b.updated).then_with(|| a.name.cmp(&b.name)));
    Ok(latest.map(|o| format!("gs://{}/{}", location.bucket, o.name)))
}

/// Backend-specific submission payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRequest {
    pub backend: String,
    pub parent: String,
    pub job_id: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: String,
    // fully qualified resource name, used for cancellation
    pub name: String,
    pub uid: Option<String>,
}

#[async_trait]
pub trait BatchClient: Send + Sync {
    // exactly one call to the backend, never retried
    async fn submit(&self, request: &JobRequest) -> Result<JobHandle>;

    // best effort; `true` if the backend acknowledged
    async fn cancel(&self, handle: &JobHandle) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunArtifacts {
    pub dir: PathBuf,
    pub spec_path: PathBuf,
    pub request_path: PathBuf,
}

/// Writes what a submission would have sent, next to the final
/// specification, under the run's local folder. No network access.
pub fn preview(spec: &JobSpecification, request: &JobRequest) -> Result<DryRunArtifacts> {
    let dir = spec.tmp_dir.clone();
    fs::create_dir_all(&dir).map_err(|e| LaunchError::io(&dir, e))?;

    let spec_path = dir.join(SPEC_SNAPSHOT_FILE);
    let spec_json = spec
        .to_json()
        .map_err(|e| LaunchError::Internal(format!("job specification is not serializable: {e}")))?;
    fs::write(&spec_path, spec_json).map_err(|e| LaunchError::io(&spec_path, e))?;

    let request_path = dir.join(REQUEST_FILE);
    let request_json = serde_json::to_string_pretty(request)
        .map_err(|e| LaunchError::Internal(format!("job request is not serializable: {e}")))?;
    fs::write(&request_path, request_json).map_err(|e| LaunchError::io(&request_path, e))?;

    info!("[DRY-RUN] Job specification written to `{}`", spec_path.display());
    info!("[DRY-RUN] Will submit the following job request: `{}`", request_path.display());
    Ok(DryRunArtifacts {
        dir,
        spec_path,
        request_path,
    })
}
