//! Google Cloud Batch + Cloud Storage, spoken over their REST APIs.

use std::{
    env,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use log::{
    debug,
    info,
    warn,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;

use super::{
    BackendClients,
    BackendDefaults,
    BackendFactory,
    BatchClient,
    JobHandle,
    JobRequest,
    ObjectCatalog,
    ObjectInfo,
    ObjectPath,
    ObjectStore,
};
use crate::{
    command::CommandSpec,
    error::{
        LaunchError,
        Result,
    },
    job::JobSpecification,
};

pub const BACKEND_NAME: &str = "google-batch";

const STORAGE_API: &str = "https://storage.googleapis.com";
const BATCH_API: &str = "https://batch.googleapis.com/v1";
const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

pub struct GoogleBatchFactory;

impl BackendFactory for GoogleBatchFactory {
    fn defaults(&self) -> BackendDefaults {
        BackendDefaults {
            container_image: "nextflow/nextflow",
            nextflow_version: "25.04.6",
            machine_type: "e2-small",
            cpu_milli: 2000,
            memory_mib: 2000,
            spot: true,
            use_private_address: true,
            executor_template: "gcp.config",
        }
    }

    fn build_request(&self, spec: &JobSpecification, command: &CommandSpec) -> Result<JobRequest> {
        let placement = &spec.placement;
        let resources = &spec.resources;

        let mut image_uri = spec.pipeline.container_image.clone();
        if !image_has_tag(&image_uri) {
            image_uri = format!("{image_uri}:{}", spec.pipeline.nextflow_version);
        }

        let mut network_interface = json!({
            "noExternalIpAddress": placement.use_private_address,
        });
        if let Some(network) = &placement.network {
            network_interface["network"] = json!(network);
        }
        if let Some(subnetwork) = &placement.subnetwork {
            network_interface["subnetwork"] = json!(subnetwork);
        }

        let body = json!({
            "taskGroups": [{
                "taskCount": 1,
                "taskSpec": {
                    "runnables": [{
                        "container": {
                            "imageUri": image_uri,
                            "entrypoint": "/bin/bash",
                            "commands": ["-c", command.as_str()],
                        }
                    }],
                    "volumes": [{
                        "gcs": { "remotePath": spec.storage().run_path },
                        "mountPath": spec.config_mount_path,
                    }],
                    "computeResource": {
                        "cpuMilli": resources.cpu_milli,
                        "memoryMib": resources.memory_mib,
                    },
                },
            }],
            "allocationPolicy": {
                "instances": [{
                    "policy": {
                        "machineType": resources.machine_type,
                        "provisioningModel": if resources.spot { "SPOT" } else { "STANDARD" },
                    }
                }],
                "network": { "networkInterfaces": [network_interface] },
                "serviceAccount": { "email": placement.service_account_email },
            },
            "logsPolicy": { "destination": "CLOUD_LOGGING" },
            "labels": placement.labels,
        });

        Ok(JobRequest {
            backend: BACKEND_NAME.to_string(),
            parent: format!(
                "projects/{}/locations/{}",
                placement.project_id, placement.region
            ),
            job_id: spec.job_name().to_string(),
            body,
        })
    }

    fn connect(&self) -> anyhow::Result<BackendClients> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build the HTTP client")?;
        let api = Arc::new(GoogleApi {
            http,
            token: TokenSource::default(),
        });
        Ok(BackendClients {
            storage: api.clone(),
            catalog: api.clone(),
            batch: api,
        })
    }

    fn handle_for(&self, reference: &str, project_id: Option<&str>, region: Option<&str>) -> Result<JobHandle> {
        job_handle_from(reference, project_id, region)
    }

    fn follow_up(&self, spec: &JobSpecification, handle: &JobHandle) -> Vec<String> {
        let region = &spec.placement.region;
        let job_id = &handle.job_id;
        vec![
            format!(
                "Job logs:   https://console.cloud.google.com/batch/jobsDetail/regions/{region}/jobs/{job_id}/logs?project={}",
                spec.placement.project_id
            ),
            format!("Job status: gcloud batch jobs describe --location={region} {job_id} | grep 'state:'"),
            format!("Cancel job: nflaunch --cancel {}", handle.name),
        ]
    }
}

// `repo/image:tag` or `host:port/repo/image:tag` or `image@sha256:..`
fn image_has_tag(image: &str) -> bool {
    if image.contains('@') {
        return true;
    }
    let last = image.rsplit('/').next().unwrap_or(image);
    last.contains(':')
}

// oauth bearer token, fetched once
#[derive(Default)]
struct TokenSource {
    cell: OnceCell<String>,
}

impl TokenSource {
    async fn get(&self) -> anyhow::Result<&str> {
        let token = self
            .cell
            .get_or_try_init(|| async {
                if let Ok(token) = env::var(TOKEN_ENV) {
                    if !token.trim().is_empty() {
                        debug!("Using access token from `{TOKEN_ENV}`");
                        return Ok(token.trim().to_string());
                    }
                }
                let output = tokio::process::Command::new("gcloud")
                    .args(["auth", "print-access-token"])
                    .output()
                    .await
                    .with_context(|| format!("`{TOKEN_ENV}` is unset and `gcloud` could not be run"))?;
                if !output.status.success() {
                    anyhow::bail!(
                        "`gcloud auth print-access-token` failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            })
            .await?;
        Ok(token.as_str())
    }
}

struct GoogleApi {
    http: reqwest::Client,
    token: TokenSource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    updated: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct JobResource {
    name: String,
    uid: Option<String>,
}

#[async_trait]
impl ObjectStore for GoogleApi {
    async fn upload(&self, local: &Path, remote: &ObjectPath) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(local)
            .await
            .with_context(|| format!("Failed to read `{}`", local.display()))?;
        let token = self.token.get().await?;
        // media upload replaces any existing object with the same name
        let response = self
            .http
            .post(format!("{STORAGE_API}/upload/storage/v1/b/{}/o", remote.bucket))
            .query(&[("uploadType", "media"), ("name", remote.object.as_str())])
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("upload to `{}` failed with HTTP {status}: {body}", remote.uri());
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectCatalog for GoogleApi {
    async fn list(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<ObjectInfo>> {
        let token = self.token.get().await?;
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("prefix", prefix.to_string()), ("fields", "items(name,updated),nextPageToken".to_string())];
            if let Some(page) = &page_token {
                query.push(("pageToken", page.clone()));
            }
            let response = self
                .http
                .get(format!("{STORAGE_API}/storage/v1/b/{bucket}/o"))
                .query(&query)
                .bearer_auth(token)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("listing `gs://{bucket}/{prefix}` failed with HTTP {status}: {body}");
            }
            let page: ObjectList = response.json().await?;
            objects.extend(page.items.into_iter().map(|o| ObjectInfo {
                name: o.name,
                updated: o.updated,
            }));
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }
}

#[async_trait]
impl BatchClient for GoogleApi {
    async fn submit(&self, request: &JobRequest) -> Result<JobHandle> {
        let rejected = |status: Option<u16>, diagnostic: String| LaunchError::Submission {
            backend: BACKEND_NAME.to_string(),
            status,
            diagnostic,
        };
        let token = self
            .token
            .get()
            .await
            .map_err(|e| rejected(None, format!("{e:#}")))?;
        let response = self
            .http
            .post(format!("{BATCH_API}/{}/jobs", request.parent))
            .query(&[("job_id", request.job_id.as_str())])
            .bearer_auth(token)
            .json(&request.body)
            .send()
            .await
            .map_err(|e| rejected(None, e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| rejected(Some(status.as_u16()), e.to_string()))?;
        if !status.is_success() {
            return Err(rejected(Some(status.as_u16()), body));
        }
        let job: JobResource = serde_json::from_str(&body)
            .map_err(|e| rejected(Some(status.as_u16()), format!("unreadable response ({e}): {body}")))?;
        info!("Job `{}` accepted as `{}`", request.job_id, job.name);
        Ok(JobHandle {
            job_id: request.job_id.clone(),
            name: job.name,
            uid: job.uid,
        })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        let token = match self.token.get().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Cannot cancel `{}`: {e:#}", handle.name);
                return Ok(false);
            }
        };
        let response = self
            .http
            .post(format!("{BATCH_API}/{}:cancel", handle.name))
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => Ok(true),
            Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                warn!("Cancellation of `{}` was refused with HTTP {status}: {body}", handle.name);
                Ok(false)
            }
            Err(e) => {
                warn!("Cancellation of `{}` failed: {e}", handle.name);
                Ok(false)
            }
        }
    }
}

// `projects/<p>/locations/<r>/jobs/<id>` or, with a project and region, a bare job id
pub fn job_handle_from(reference: &str, project_id: Option<&str>, region: Option<&str>) -> Result<JobHandle> {
    if reference.starts_with("projects/") {
        let job_id = reference.rsplit('/').next().unwrap_or(reference).to_string();
        return Ok(JobHandle {
            job_id,
            name: reference.to_string(),
            uid: None,
        });
    }
    match (project_id, region) {
        (Some(project), Some(region)) => Ok(JobHandle {
            job_id: reference.to_string(),
            name: format!("projects/{project}/locations/{region}/jobs/{reference}"),
            uid: None,
        }),
        _ => Err(LaunchError::validation(
            "cancel",
            "a bare job id needs `--project-id` and `--region`",
        )),
    }
}
