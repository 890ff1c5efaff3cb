//! Drives one launch through its stages, strictly in order:
//! config, plugin, templates, staging, command, submission.

use std::path::PathBuf;

use log::info;

use crate::{
    backend::{
        preview,
        BackendClients,
        DryRunArtifacts,
        JobHandle,
        JobRequest,
    },
    command::{
        self,
        CommandSpec,
    },
    config::{
        Built,
        ConfigBuilder,
    },
    error::{
        LaunchError,
        Result,
    },
    identity::RunIdentity,
    job::{
        JobInput,
        JobSpecification,
    },
    plugins::PluginHost,
    registry::Registries,
    stager::{
        ensure_distinct_targets,
        pipeline_entries,
        RetryPolicy,
        StageMode,
        Stager,
        UploadOutcome,
        MANIFEST_FILE,
    },
    template::TemplateRenderer,
};

#[derive(Debug)]
pub enum Submission {
    Submitted(JobHandle),
    Previewed(DryRunArtifacts),
}

/// Everything a finished launch produced.
#[derive(Debug)]
pub struct Launch {
    pub spec: JobSpecification,
    pub command: CommandSpec,
    pub request: JobRequest,
    pub staged: Vec<UploadOutcome>,
    pub submission: Submission,
}

pub struct Launcher<'a> {
    registries: &'a Registries,
    tmp_root: PathBuf,
    retry: RetryPolicy,
}

impl<'a> Launcher<'a> {
    pub fn new(registries: &'a Registries, tmp_root: impl Into<PathBuf>) -> Self {
        Launcher {
            registries,
            tmp_root: tmp_root.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn launch(&self, input: JobInput, identity: &mut RunIdentity) -> Result<Launch> {
        let Built { mut spec, backend } = ConfigBuilder::new(&self.tmp_root).build(
            input,
            &self.registries.backends,
            identity,
        )?;
        let dry_run = spec.dry_run;
        let prefix = if dry_run { "[DRY-RUN] " } else { "" };
        info!("{prefix}Launching job `{}` (run `{}`)", spec.job_name(), spec.run_id());

        // a dry run never gets clients, so it cannot reach the network
        let clients: Option<BackendClients> = if dry_run {
            None
        } else {
            Some(backend.connect().map_err(|e| LaunchError::Submission {
                backend: spec.backend.clone(),
                status: None,
                diagnostic: format!("{e:#}"),
            })?)
        };

        PluginHost::apply(
            &mut spec,
            &self.registries.plugins,
            clients.as_ref().map(|c| c.catalog.as_ref()),
        )
        .await?;

        let rendered = TemplateRenderer::render(&spec)?;
        let mut entries = spec.input_entries();
        entries.extend(TemplateRenderer::materialize(&rendered)?);
        entries.extend(pipeline_entries(&spec)?);
        ensure_distinct_targets(&entries)?;

        let mode = match &clients {
            Some(c) => StageMode::Upload(c.storage.clone()),
            None => StageMode::DryRun {
                snapshot: spec.tmp_dir.join(MANIFEST_FILE),
            },
        };
        let staged = Stager::new(mode)
            .with_policy(self.retry.clone())
            .stage(entries, spec.upload_max_workers)
            .await?;

        let command = command::build(&spec)?;
        info!("{prefix}Command: {command}");
        let request = backend.build_request(&spec, &command)?;

        let submission = match &clients {
            None => Submission::Previewed(preview(&spec, &request)?),
            Some(c) => {
                let handle = c.batch.submit(&request).await?;
                info!("Submitted job `{}`", handle.name);
                for hint in backend.follow_up(&spec, &handle) {
                    info!("{hint}");
                }
                Submission::Submitted(handle)
            }
        };

        Ok(Launch {
            spec,
            command,
            request,
            staged,
            submission,
        })
    }

    /// Best-effort cancellation of a job submitted earlier.
    pub async fn cancel(&self, backend: &str, reference: &str, input: &JobInput) -> Result<bool> {
        let factory = self.registries.backends.resolve(backend)?;
        let handle = factory.handle_for(reference, input.project_id.as_deref(), input.region.as_deref())?;
        let clients = factory.connect().map_err(|e| LaunchError::Submission {
            backend: backend.to_string(),
            status: None,
            diagnostic: format!("{e:#}"),
        })?;
        let acknowledged = clients.batch.cancel(&handle).await?;
        if acknowledged {
            info!("Cancellation of `{}` acknowledged", handle.name);
        }
        Ok(acknowledged)
    }
}
