use std::{
    collections::HashMap,
    fs,
    num::NonZeroUsize,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    thread,
    time::Duration,
};

use futures::{
    stream,
    StreamExt,
};
use log::{
    debug,
    info,
    warn,
};
use serde::Serialize;
use walkdir::WalkDir;

use crate::{
    backend::{
        ObjectPath,
        ObjectStore,
    },
    error::{
        LaunchError,
        Result,
        StagingFailure,
    },
    job::{
        InputRole,
        JobSpecification,
        ManifestEntry,
        PipelineKind,
    },
};

pub const MANIFEST_FILE: &str = "staging_manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadStatus {
    Uploaded,
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub entry: ManifestEntry,
    pub status: UploadStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    // delay after failed attempt `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

pub enum StageMode {
    Upload(Arc<dyn ObjectStore>),
    // write the manifest to `snapshot` instead of uploading
    DryRun { snapshot: PathBuf },
}

/// Uploads manifest entries with a bounded number of concurrent workers.
pub struct Stager {
    mode: StageMode,
    policy: RetryPolicy,
}

#[derive(Serialize)]
struct ManifestLine<'a> {
    local_path: &'a PathBuf,
    remote_uri: String,
    role: InputRole,
}

impl Stager {
    pub fn new(mode: StageMode) -> Self {
        Stager {
            mode,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Stage every entry; succeeds only if none permanently failed.
    ///
    /// Outcomes are returned in manifest order whatever order the uploads
    /// finished in.
    pub async fn stage(&self, entries: Vec<ManifestEntry>, max_workers: usize) -> Result<Vec<UploadOutcome>> {
        let store = match &self.mode {
            StageMode::DryRun { snapshot } => return write_manifest(snapshot, entries),
            StageMode::Upload(store) => store,
        };

        let workers = resolve_workers(max_workers);
        info!("Staging {} file(s) with {workers} worker(s)", entries.len());

        let mut finished: Vec<(usize, UploadOutcome)> = stream::iter(entries.into_iter().enumerate())
            .map(|(index, entry)| async move { (index, self.upload(store.as_ref(), entry).await) })
            .buffer_unordered(workers)
            .collect()
            .await;
        finished.sort_by_key(|(index, _)| *index);
        let outcomes: Vec<UploadOutcome> = finished.into_iter().map(|(_, o)| o).collect();

        let failed: Vec<(String, String)> = outcomes
            .iter()
            .filter_map(|o| match &o.status {
                UploadStatus::Failed { error } => Some((o.entry.local_path.display().to_string(), error.clone())),
                _ => None,
            })
            .collect();
        if !failed.is_empty() {
            return Err(LaunchError::Staging(StagingFailure { failed, outcomes }));
        }
        info!("Staged {} file(s)", outcomes.len());
        Ok(outcomes)
    }

    #[tracing::instrument(skip_all, fields(remote = %entry.remote_path))]
    async fn upload(&self, store: &dyn ObjectStore, entry: ManifestEntry) -> UploadOutcome {
        let target = match ObjectPath::parse(&entry.remote_path) {
            Ok(target) => target,
            Err(e) => {
                return UploadOutcome {
                    entry,
                    status: UploadStatus::Failed { error: e.to_string() },
                    attempts: 0,
                }
            }
        };

        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts < self.policy.max_attempts {
            attempts += 1;
            let result = tokio::time::timeout(
                self.policy.attempt_timeout,
                store.upload(&entry.local_path, &target),
            )
            .await;
            match result {
                Ok(Ok(())) => {
                    debug!("Uploaded `{}` to `{}`", entry.local_path.display(), target.uri());
                    return UploadOutcome {
                        entry,
                        status: UploadStatus::Uploaded,
                        attempts,
                    };
                }
                Ok(Err(e)) => last_error = format!("{e:#}"),
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.policy.attempt_timeout)
                }
            }
            warn!(
                "Upload of `{}` failed (attempt {attempts}/{}): {last_error}",
                entry.local_path.display(),
                self.policy.max_attempts
            );
            if attempts < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff(attempts)).await;
            }
        }
        UploadOutcome {
            entry,
            status: UploadStatus::Failed { error: last_error },
            attempts,
        }
    }
}

/// Fails when two entries would be uploaded to the same object.
pub fn ensure_distinct_targets(entries: &[ManifestEntry]) -> Result<()> {
    let mut seen: HashMap<&str, &ManifestEntry> = HashMap::new();
    for entry in entries {
        if let Some(first) = seen.insert(entry.remote_path.as_str(), entry) {
            return Err(LaunchError::validation(
                entry.role.field_name(),
                format!(
                    "`{}` and `{}` would both be staged to `gs://{}`; rename one of them",
                    first.local_path.display(),
                    entry.local_path.display(),
                    entry.remote_path
                ),
            ));
        }
    }
    Ok(())
}

// 0 means one worker per available core
pub fn resolve_workers(max_workers: usize) -> usize {
    if max_workers > 0 {
        return max_workers;
    }
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .max(1)
}

fn write_manifest(snapshot: &Path, entries: Vec<ManifestEntry>) -> Result<Vec<UploadOutcome>> {
    let lines: Vec<ManifestLine> = entries
        .iter()
        .map(|e| ManifestLine {
            local_path: &e.local_path,
            remote_uri: format!("gs://{}", e.remote_path),
            role: e.role,
        })
        .collect();
    let json = serde_json::to_string_pretty(&lines)
        .map_err(|e| LaunchError::Internal(format!("staging manifest is not serializable: {e}")))?;
    if let Some(dir) = snapshot.parent() {
        fs::create_dir_all(dir).map_err(|e| LaunchError::io(dir, e))?;
    }
    fs::write(snapshot, json).map_err(|e| LaunchError::io(snapshot, e))?;

    for line in &lines {
        info!("[DRY-RUN] Will upload `{}` to `{}`", line.local_path.display(), line.remote_uri);
    }
    info!("[DRY-RUN] Staging manifest written to `{}`", snapshot.display());
    Ok(entries
        .into_iter()
        .map(|entry| UploadOutcome {
            entry,
            status: UploadStatus::Skipped,
            attempts: 0,
        })
        .collect())
}

/// Entries for a local pipeline: the script itself, or every file of the
/// project folder except under `.git`.
pub fn pipeline_entries(spec: &JobSpecification) -> Result<Vec<ManifestEntry>> {
    let config_dir = spec.storage().config_dir();
    match &spec.pipeline.kind {
        PipelineKind::Remote => Ok(Vec::new()),
        PipelineKind::Script { path } => {
            let name = path
                .file_name()
                .ok_or_else(|| LaunchError::validation("pipeline_name", "script has no file name"))?;
            Ok(vec![ManifestEntry::new(
                path,
                format!("{config_dir}/{}", name.to_string_lossy()),
                InputRole::Pipeline,
            )])
        }
        PipelineKind::Directory { path } => {
            let name = path
                .file_name()
                .ok_or_else(|| LaunchError::validation("pipeline_name", "directory has no name"))?
                .to_string_lossy()
                .into_owned();
            let mut entries = Vec::new();
            let walker = WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git");
            for item in walker {
                let item = item.map_err(|e| {
                    let at = e.path().map(PathBuf::from).unwrap_or_else(|| path.clone());
                    LaunchError::io(at, e.into())
                })?;
                if !item.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = item.path().strip_prefix(path) else {
                    continue;
                };
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push(ManifestEntry::new(
                    item.path(),
                    format!("{config_dir}/{name}/{relative}"),
                    InputRole::Pipeline,
                ));
            }
            Ok(entries)
        }
    }
}
