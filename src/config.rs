use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use log::debug;

use crate::{
    backend::BackendFactory,
    error::{
        LaunchError,
        Result,
    },
    identity::{
        RunIdentity,
        StorageLayout,
    },
    job::{
        is_remote_uri,
        resolve_path,
        Identity,
        InputFile,
        InputRole,
        JobInput,
        JobSpecification,
        PipelineKind,
        PipelineTarget,
        Placement,
        Resources,
        Resume,
        SpecificationParts,
    },
    registry::Registry,
    validate,
};

pub const DEFAULT_BACKEND: &str = crate::backend::gcp::BACKEND_NAME;
pub const RUN_ID_LABEL: &str = "workflowrun_id";

/// A settled job plus the backend it was built for.
pub struct Built {
    pub spec: JobSpecification,
    pub backend: Arc<dyn BackendFactory>,
}

/// Turns merged user input into the job specification.
///
/// The only side effects are drawing from the run identity and checking that
/// local files exist.
pub struct ConfigBuilder {
    tmp_root: PathBuf,
}

impl ConfigBuilder {
    pub fn new(tmp_root: impl Into<PathBuf>) -> Self {
        ConfigBuilder {
            tmp_root: tmp_root.into(),
        }
    }

    pub fn build(
        &self,
        input: JobInput,
        backends: &Registry<dyn BackendFactory>,
        identity: &mut RunIdentity,
    ) -> Result<Built> {
        let backend_name = input.backend.clone().unwrap_or_else(|| DEFAULT_BACKEND.to_string());
        let backend = backends.resolve(&backend_name)?;
        let defaults = backend.defaults();

        let base_bucket = normalize_bucket(&required(input.base_bucket, "base_bucket")?);
        let pipeline_name = required(input.pipeline_name, "pipeline_name")?;
        let project_id = required(input.project_id, "project_id")?;
        let region = required(input.region, "region")?;
        let service_account_email = required(input.service_account_email, "service_account_email")?;
        // flags are checked by the parser, job files and env are not
        validate::service_account_email(&service_account_email)
            .map_err(|reason| LaunchError::validation("service_account_email", reason))?;

        let run_id = identity.run_id().clone();
        let storage = StorageLayout::derive(
            &base_bucket,
            &run_id,
            input.remote_cache_path.as_deref(),
            input.remote_run_path.as_deref(),
        )?;
        let sample_id = input.sample_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let job_name = identity.job_name(sample_id.as_deref());
        let tmp_dir = self.tmp_root.join(run_id.as_str());
        debug!("Run `{run_id}` uses local folder `{}`", tmp_dir.display());

        let mut inputs = Vec::new();
        if let Some(params) = input.params_file {
            inputs.push(user_file(&params, InputRole::ParamsFile, "params_file")?);
        }
        if let Some(sheet) = input.samplesheet {
            inputs.push(user_file(&sheet, InputRole::Samplesheet, "samplesheet")?);
        }
        if let Some(config) = input.config_file {
            inputs.push(local_file(&config, InputRole::CustomConfig, "config_file")?);
        }
        let executor_template = defaults.executor_template.to_string();
        inputs.push(match input.executor_config_file {
            Some(path) => local_file(&path, InputRole::ExecutorConfig, "executor_config_file")?,
            None => InputFile {
                path: tmp_dir.join(&executor_template).to_string_lossy().into_owned(),
                role: InputRole::ExecutorConfig,
                generated: true,
            },
        });

        let pipeline = PipelineTarget {
            kind: pipeline_kind(&pipeline_name)?,
            name: pipeline_name,
            version: input.pipeline_version,
            nextflow_version: input
                .nextflow_version
                .unwrap_or_else(|| defaults.nextflow_version.to_string()),
            profile: input.profile,
            container_image: input
                .container_image
                .unwrap_or_else(|| defaults.container_image.to_string()),
            resume: input.resume.as_deref().map(parse_resume).transpose()?,
        };

        let resources = Resources {
            machine_type: input
                .machine_type
                .unwrap_or_else(|| defaults.machine_type.to_string()),
            cpu_milli: positive(input.cpu_milli, defaults.cpu_milli, "cpu_milli")?,
            memory_mib: positive(input.memory_mib, defaults.memory_mib, "memory_mib")?,
            spot: input.spot.unwrap_or(defaults.spot),
        };

        let mut labels = input.labels.unwrap_or_default();
        labels.insert(RUN_ID_LABEL.to_string(), run_id.to_string());
        let placement = Placement {
            project_id,
            region,
            service_account_email,
            network: input.network,
            subnetwork: input.subnetwork,
            use_private_address: input
                .use_private_address
                .unwrap_or(defaults.use_private_address),
            labels,
        };

        let spec = JobSpecification::assemble(
            Identity {
                run_id,
                job_name,
                storage,
            },
            inputs,
            SpecificationParts {
                launched_at: identity.launched_at(),
                backend: backend_name,
                sample_id,
                pipeline,
                resources,
                placement,
                plugin: input.plugin,
                plugin_options: input.plugin_options.unwrap_or_default(),
                upload_max_workers: input.upload_max_workers.unwrap_or(0),
                executor_template,
                tmp_dir,
                dry_run: input.dry_run.unwrap_or(false),
            },
        );
        Ok(Built { spec, backend })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LaunchError::validation(field, "is required"))
}

fn positive(value: Option<u32>, default: u32, field: &str) -> Result<u32> {
    match value {
        Some(0) => Err(LaunchError::validation(field, "must be greater than zero")),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

pub fn normalize_bucket(value: &str) -> String {
    value
        .trim()
        .trim_start_matches("gs://")
        .trim_end_matches('/')
        .to_string()
}

// remote uris are checked when the engine reads them
fn user_file(value: &str, role: InputRole, field: &str) -> Result<InputFile> {
    if is_remote_uri(value.trim()) {
        return Ok(InputFile {
            path: value.trim().to_string(),
            role,
            generated: false,
        });
    }
    local_file(value, role, field)
}

fn local_file(value: &str, role: InputRole, field: &str) -> Result<InputFile> {
    let path = resolve_path(value);
    if !path.is_file() {
        return Err(LaunchError::validation(
            field,
            format!("`{}` does not exist or is not a file", path.display()),
        ));
    }
    Ok(InputFile {
        path: path.to_string_lossy().into_owned(),
        role,
        generated: false,
    })
}

fn pipeline_kind(name: &str) -> Result<PipelineKind> {
    if name.ends_with(".nf") {
        let path = resolve_path(name);
        if !path.is_file() {
            return Err(LaunchError::validation(
                "pipeline_name",
                format!("workflow script `{}` does not exist", path.display()),
            ));
        }
        return Ok(PipelineKind::Script { path });
    }
    let path = resolve_path(name);
    if looks_local(name) || path.is_dir() {
        if !path.is_dir() {
            return Err(LaunchError::validation(
                "pipeline_name",
                format!("pipeline directory `{}` does not exist", path.display()),
            ));
        }
        return Ok(PipelineKind::Directory { path });
    }
    Ok(PipelineKind::Remote)
}

// `./x`, `../x`, `/x` and `~/x` can only mean a local folder
fn looks_local(name: &str) -> bool {
    let path = Path::new(name);
    path.is_absolute() || name.starts_with("./") || name.starts_with("../") || name.starts_with("~/")
}

/// `WORKFLOWRUN_ID,SESSION_ID`
pub fn parse_resume(value: &str) -> Result<Resume> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [run_name, session_id] if !run_name.is_empty() && !session_id.is_empty() => Ok(Resume {
            run_name: run_name.to_string(),
            session_id: session_id.to_string(),
        }),
        _ => Err(LaunchError::validation(
            "resume",
            format!("expected `WORKFLOWRUN_ID,SESSION_ID`, got `{value}`"),
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::Registries;
    use chrono::{
        TimeZone,
        Utc,
    };
    use std::fs;

    pub fn fixture_input() -> JobInput {
        JobInput {
            base_bucket: Some("gs://my-bucket/".into()),
            sample_id: Some("TUMOR123".into()),
            project_id: Some("genomics-prod".into()),
            region: Some("europe-west4".into()),
            service_account_email: Some("runner@genomics-prod.iam.gserviceaccount.com".into()),
            pipeline_name: Some("nf-core/rnaseq".into()),
            pipeline_version: Some("3.14.0".into()),
            profile: Some("docker".into()),
            ..Default::default()
        }
    }

    pub fn identity() -> RunIdentity {
        RunIdentity::from_seed(2025, Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap())
    }

    pub fn build_with(input: JobInput, tmp_root: &Path) -> Result<JobSpecification> {
        let registries = Registries::builtin()?;
        let built = ConfigBuilder::new(tmp_root).build(input, &registries.backends, &mut identity())?;
        Ok(built.spec)
    }

    pub fn spec_from(input: JobInput) -> JobSpecification {
        build_with(input, Path::new("/tmp/nflaunch-tests")).unwrap()
    }

    fn is_lower_hex(s: &str) -> bool {
        s.len() == 8 && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    }

    #[test]
    fn job_name_and_run_path_follow_the_layout() {
        let spec = spec_from(fixture_input());
        let run_id = spec.run_id().to_string();

        let suffix = spec
            .job_name()
            .strip_prefix("nf-runner-tumor123-")
            .expect("job name prefix");
        assert!(is_lower_hex(suffix), "got: {}", spec.job_name());
        assert_eq!(spec.storage().root, "my-bucket");
        assert_eq!(spec.storage().run_path, format!("my-bucket/run/{run_id}"));
        assert_eq!(spec.placement.labels[RUN_ID_LABEL], run_id);
        assert!(spec.tmp_dir.ends_with(&run_id));
    }

    #[test]
    fn defaults_come_from_the_backend() {
        let spec = spec_from(fixture_input());
        assert_eq!(spec.backend, "google-batch");
        assert_eq!(spec.pipeline.container_image, "nextflow/nextflow");
        assert_eq!(spec.pipeline.nextflow_version, "25.04.6");
        assert_eq!(spec.resources.machine_type, "e2-small");
        assert_eq!((spec.resources.cpu_milli, spec.resources.memory_mib), (2000, 2000));
        assert!(spec.resources.spot);
        assert!(spec.placement.use_private_address);
        assert_eq!(spec.upload_max_workers, 0);
        assert_eq!(spec.pipeline.kind, PipelineKind::Remote);

        let executor = spec.input(InputRole::ExecutorConfig).unwrap();
        assert!(executor.generated);
        assert!(executor.path.ends_with("/gcp.config"));
    }

    #[test]
    fn missing_required_field_is_a_validation_error() {
        let mut input = fixture_input();
        input.project_id = None;
        let err = build_with(input, Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, LaunchError::Validation { ref field, .. } if field == "project_id"));
    }

    #[test]
    fn missing_local_params_file_is_rejected() {
        let mut input = fixture_input();
        input.params_file = Some("/definitely/not/here/params.yaml".into());
        let err = build_with(input, Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, LaunchError::Validation { ref field, .. } if field == "params_file"));
    }

    #[test]
    fn remote_samplesheet_skips_the_existence_check() {
        let mut input = fixture_input();
        input.samplesheet = Some("gs://samples/sheet.csv".into());
        let spec = spec_from(input);
        let sheet = spec.input(InputRole::Samplesheet).unwrap();
        assert!(sheet.is_remote());
        assert!(spec.input_entries().is_empty());
    }

    #[test]
    fn local_inputs_are_absolute_and_listed_for_staging() {
        let dir = tempfile::tempdir().unwrap();
        let params = dir.path().join("params.yaml");
        fs::write(&params, "outdir: gs://out\n").unwrap();

        let mut input = fixture_input();
        input.params_file = Some(params.to_string_lossy().into_owned());
        let spec = build_with(input, dir.path()).unwrap();

        let entries = spec.input_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].local_path, params);
        assert_eq!(
            entries[0].remote_path,
            format!("my-bucket/run/{}/input/params.yaml", spec.run_id())
        );
    }

    #[test]
    fn local_pipeline_kinds_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("main.nf");
        fs::write(&script, "workflow {}\n").unwrap();
        assert_eq!(
            pipeline_kind(&script.to_string_lossy()).unwrap(),
            PipelineKind::Script { path: script.clone() }
        );
        assert_eq!(
            pipeline_kind(&dir.path().to_string_lossy()).unwrap(),
            PipelineKind::Directory { path: dir.path().to_path_buf() }
        );
        assert!(pipeline_kind("./no-such-pipeline").is_err());
        assert!(pipeline_kind("/nowhere/missing.nf").is_err());
        assert_eq!(pipeline_kind("nf-core/sarek").unwrap(), PipelineKind::Remote);
    }

    #[test]
    fn resume_needs_exactly_two_parts() {
        let resume = parse_resume("a1b2c3, 0f0f-11").unwrap();
        assert_eq!(resume.run_name, "a1b2c3");
        assert_eq!(resume.session_id, "0f0f-11");
        assert!(parse_resume("only-one").is_err());
        assert!(parse_resume("a,b,c").is_err());
        assert!(parse_resume(",b").is_err());
    }

    #[test]
    fn zero_cpu_is_rejected() {
        let mut input = fixture_input();
        input.cpu_milli = Some(0);
        assert!(build_with(input, Path::new("/tmp")).is_err());
    }

    #[test]
    fn unknown_backend_is_not_found() {
        let mut input = fixture_input();
        input.backend = Some("aws-batch".into());
        let err = build_with(input, Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { kind: "backend", .. }));
    }

    #[test]
    fn job_file_service_account_is_checked() {
        let mut input = fixture_input();
        input.service_account_email = Some("runner@example.com".into());
        let err = build_with(input, Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, LaunchError::Validation { ref field, .. } if field == "service_account_email"));
    }
}
