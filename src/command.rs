use std::fmt;

use serde::Serialize;

use crate::{
    error::{
        LaunchError,
        Result,
    },
    job::{
        InputFile,
        InputRole,
        JobSpecification,
        PipelineKind,
    },
};

/// The shell line the container runs, `/bin/bash -c <CommandSpec>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CommandSpec(String);

impl CommandSpec {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds the engine invocation from the settled specification.
///
/// Flag order is fixed: `-log`, `run <target>` (`-revision`), executor `-c`,
/// `-name` (`-resume`), custom `-c`, `-params-file`, `-profile`, `--input`,
/// then plugin params by key.
pub fn build(spec: &JobSpecification) -> Result<CommandSpec> {
    let mount = spec.config_mount_path.as_str();
    let pipeline = &spec.pipeline;

    let executor = spec
        .input(InputRole::ExecutorConfig)
        .ok_or_else(|| missing("executor config file"))?;
    let executor_name = executor
        .file_name()
        .ok_or_else(|| missing("executor config file name"))?;

    let mut engine = String::from("nextflow");
    let target = match &pipeline.kind {
        PipelineKind::Remote => match &pipeline.version {
            Some(version) => format!("{} -revision {}", shell_word(&pipeline.name), shell_word(version)),
            None => shell_word(&pipeline.name),
        },
        PipelineKind::Script { path } => {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| missing("pipeline script name"))?;
            shell_word(&format!("{mount}/config/{name}"))
        }
        PipelineKind::Directory { path } => {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| missing("pipeline directory name"))?;
            engine = format!("cd {} && nextflow", shell_word(&format!("{mount}/config/{name}")));
            ".".to_string()
        }
    };

    let mut parts = vec![
        engine,
        format!("-log {}", shell_word(&format!("{mount}/logs/nextflow.log"))),
        format!("run {target}"),
        format!("-c {}", shell_word(&format!("{mount}/config/{executor_name}"))),
    ];

    match &pipeline.resume {
        Some(resume) => parts.push(format!(
            "-name {} -resume {}",
            shell_word(&resume.run_name),
            shell_word(&resume.session_id)
        )),
        None => parts.push(format!("-name {}", shell_word(&spec.run_id().to_string()))),
    }

    if let Some(custom) = spec.input(InputRole::CustomConfig) {
        let name = custom
            .file_name()
            .ok_or_else(|| missing("custom config file name"))?;
        parts.push(format!("-c {}", shell_word(&format!("{mount}/config/{name}"))));
    }
    if let Some(params) = spec.input(InputRole::ParamsFile) {
        parts.push(format!("-params-file {}", mounted_input(mount, params)?));
    }
    if let Some(profile) = &pipeline.profile {
        parts.push(format!("-profile {}", shell_word(profile)));
    }
    if let Some(samplesheet) = spec.input(InputRole::Samplesheet) {
        parts.push(format!("--input {}", mounted_input(mount, samplesheet)?));
    }
    // BTreeMap, so already sorted
    for (key, value) in &spec.extra_params {
        parts.push(format!("--{} {}", shell_word(key), shell_word(value)));
    }

    let cache = format!(
        "export NXF_CLOUDCACHE_PATH={} && export NXF_IGNORE_RESUME_HISTORY=true",
        shell_word(&format!("gs://{}", spec.storage().cache_path))
    );
    Ok(CommandSpec(format!("{cache} && {}", parts.join(" "))))
}

// local inputs are read from the mounted run path, remote ones as given;
// either way the result is a single quoted shell word
fn mounted_input(mount: &str, file: &InputFile) -> Result<String> {
    if file.is_remote() {
        return Ok(shell_word(&file.path));
    }
    let name = file
        .file_name()
        .ok_or_else(|| missing("input file name"))?;
    Ok(shell_word(&format!("{mount}/{}/{name}", file.role.remote_subdir())))
}

// every interpolated value goes through here; the line runs under `bash -c`
fn shell_word(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+%".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn missing(what: &str) -> LaunchError {
    LaunchError::Internal(format!("cannot build command: {what} is not set"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::tests::{
            fixture_input,
            spec_from,
        },
        job::Resume,
    };

    #[test]
    fn remote_pipeline_command_has_fixed_layout() {
        let spec = spec_from(fixture_input());
        let command = build(&spec).unwrap();
        let expected = format!(
            "export NXF_CLOUDCACHE_PATH=gs://my-bucket/cache && export NXF_IGNORE_RESUME_HISTORY=true \
             && nextflow -log /etc/nextflow/logs/nextflow.log run nf-core/rnaseq -revision 3.14.0 \
             -c /etc/nextflow/config/gcp.config -name {} -profile docker",
            spec.run_id()
        );
        assert_eq!(command.as_str(), expected);
    }

    #[test]
    fn building_twice_is_byte_identical() {
        let mut spec = spec_from(fixture_input());
        spec.extra_params.insert("genome".into(), "GRCh38".into());
        spec.extra_params.insert("outdir".into(), "gs://out/results".into());
        assert_eq!(build(&spec).unwrap(), build(&spec).unwrap());
    }

    #[test]
    fn optional_flags_follow_documented_order() {
        let mut spec = spec_from(fixture_input());
        spec.set_input(InputFile {
            path: "/data/custom.config".into(),
            role: InputRole::CustomConfig,
            generated: false,
        });
        spec.set_input(InputFile {
            path: "/data/params.yaml".into(),
            role: InputRole::ParamsFile,
            generated: false,
        });
        spec.set_input(InputFile {
            path: "/tmp/run/samplesheet.csv".into(),
            role: InputRole::Samplesheet,
            generated: true,
        });
        spec.extra_params.insert("zeta".into(), "last".into());
        spec.extra_params.insert("alpha".into(), "has space".into());
        spec.pipeline.resume = Some(Resume {
            run_name: "a1b2c3".into(),
            session_id: "0f0f-11".into(),
        });

        let command = build(&spec).unwrap().to_string();
        let tail = command.split(" && ").last().unwrap();
        assert!(tail.ends_with(
            "-name a1b2c3 -resume 0f0f-11 \
             -c /etc/nextflow/config/custom.config \
             -params-file /etc/nextflow/input/params.yaml \
             -profile docker \
             --input /etc/nextflow/input/samplesheet.csv \
             --alpha 'has space' --zeta last"
        ), "got: {tail}");
    }

    #[test]
    fn remote_samplesheet_is_passed_through() {
        let mut spec = spec_from(fixture_input());
        spec.set_input(InputFile {
            path: "gs://samples/sheet.csv".into(),
            role: InputRole::Samplesheet,
            generated: false,
        });
        let command = build(&spec).unwrap();
        assert!(command.as_str().contains("--input gs://samples/sheet.csv"));
    }

    #[test]
    fn local_script_and_directory_targets() {
        let mut spec = spec_from(fixture_input());
        spec.pipeline.kind = PipelineKind::Script {
            path: "/work/main.nf".into(),
        };
        let command = build(&spec).unwrap();
        assert!(command.as_str().contains("run /etc/nextflow/config/main.nf -c"));
        assert!(!command.as_str().contains("-revision"));

        spec.pipeline.kind = PipelineKind::Directory {
            path: "/work/my-pipeline".into(),
        };
        let command = build(&spec).unwrap();
        assert!(command
            .as_str()
            .contains("&& cd /etc/nextflow/config/my-pipeline && nextflow -log"));
        assert!(command.as_str().contains(" run . -c "));
    }

    #[test]
    fn file_names_with_spaces_and_metacharacters_stay_one_word() {
        let mut spec = spec_from(fixture_input());
        spec.set_input(InputFile {
            path: "/data/my params.yaml".into(),
            role: InputRole::ParamsFile,
            generated: false,
        });
        spec.set_input(InputFile {
            path: "/data/sheet;echo pwned.csv".into(),
            role: InputRole::Samplesheet,
            generated: false,
        });
        spec.pipeline.profile = Some("docker,test $(id)".into());

        let command = build(&spec).unwrap().to_string();
        assert!(command.contains("-params-file '/etc/nextflow/input/my params.yaml'"), "got: {command}");
        assert!(command.contains("--input '/etc/nextflow/input/sheet;echo pwned.csv'"), "got: {command}");
        assert!(command.contains("-profile 'docker,test $(id)'"), "got: {command}");
    }
}
