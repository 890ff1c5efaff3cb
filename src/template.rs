//! Executor config rendering.
//!
//! Templates are compiled into the binary. Placeholders are `$name` or
//! `${name}`; `$$` is a literal dollar.

use std::{
    collections::BTreeMap,
    fs,
};

use log::info;

use crate::{
    error::{
        LaunchError,
        Result,
    },
    job::{
        InputFile,
        InputRole,
        JobSpecification,
        ManifestEntry,
    },
};

const LOG_SUFFIX_FORMAT: &str = "%Y%m%d_%H%M%S";

// name -> (body, raw extras appended after substitution)
fn template_source(name: &str) -> Option<(&'static str, &'static str)> {
    match name {
        "gcp.config" => Some((
            include_str!("../templates/gcp.config.template"),
            include_str!("../templates/gcp.extras.template"),
        )),
        _ => None,
    }
}

/// One config-role file to stage, with its contents when it is generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub entry: ManifestEntry,
    // `None` for a user file copied as-is
    pub contents: Option<String>,
}

pub struct TemplateRenderer;

impl TemplateRenderer {
    /// Pure: the same specification always renders to the same files.
    pub fn render(spec: &JobSpecification) -> Result<Vec<RenderedFile>> {
        let config_dir = spec.storage().config_dir();
        let mut out = Vec::new();
        for input in spec.inputs() {
            if !matches!(input.role, InputRole::ExecutorConfig | InputRole::CustomConfig) {
                continue;
            }
            let name = file_name(input)?;
            let entry = ManifestEntry::new(&input.path, format!("{config_dir}/{name}"), input.role);
            let contents = if input.generated && input.role == InputRole::ExecutorConfig {
                Some(render_executor_config(spec)?)
            } else {
                None
            };
            out.push(RenderedFile { entry, contents });
        }
        Ok(out)
    }

    /// Writes generated files to their local paths and returns the entries
    /// to stage.
    pub fn materialize(files: &[RenderedFile]) -> Result<Vec<ManifestEntry>> {
        for file in files {
            let Some(contents) = &file.contents else {
                continue;
            };
            let path = &file.entry.local_path;
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|e| LaunchError::io(dir, e))?;
            }
            fs::write(path, contents).map_err(|e| LaunchError::io(path, e))?;
            info!("Executor config written to `{}`", path.display());
        }
        Ok(files.iter().map(|f| f.entry.clone()).collect())
    }
}

fn file_name(input: &InputFile) -> Result<&str> {
    input
        .file_name()
        .ok_or_else(|| LaunchError::Internal(format!("`{}` has no file name", input.path)))
}

fn render_executor_config(spec: &JobSpecification) -> Result<String> {
    let name = spec.executor_template.as_str();
    let (body, extras) = template_source(name).ok_or_else(|| LaunchError::Template {
        name: name.to_string(),
        reason: "no such template".to_string(),
    })?;
    let rendered = substitute(name, body, &executor_vars(spec))?;
    Ok(format!("{rendered}{extras}"))
}

fn executor_vars(spec: &JobSpecification) -> BTreeMap<&'static str, String> {
    let storage = spec.storage();
    let placement = &spec.placement;
    let resource_labels = placement
        .labels
        .iter()
        .map(|(k, v)| format!("{}: {}", groovy_string(k), groovy_string(v)))
        .collect::<Vec<_>>()
        .join(", ");

    BTreeMap::from([
        ("base_bucket", storage.root.clone()),
        ("cache_path", storage.cache_path.clone()),
        ("work_path", storage.work_path.clone()),
        ("run_path", storage.run_path.clone()),
        ("workflowrun_id", spec.run_id().to_string()),
        ("log_suffix", spec.launched_at.format(LOG_SUFFIX_FORMAT).to_string()),
        ("project_id", placement.project_id.clone()),
        ("region", placement.region.clone()),
        ("use_private_address", placement.use_private_address.to_string()),
        ("spot", spec.resources.spot.to_string()),
        ("network", placement.network.clone().unwrap_or_default()),
        ("subnetwork", placement.subnetwork.clone().unwrap_or_default()),
        ("service_account_email", placement.service_account_email.clone()),
        ("resource_labels", resource_labels),
    ])
}

// double-quoted config literal; `$` would otherwise start an interpolation
fn groovy_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

pub fn substitute(name: &str, text: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
    let error = |reason: String| LaunchError::Template {
        name: name.to_string(),
        reason,
    };
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }
        let (key, tail) = if let Some(braced) = after.strip_prefix('{') {
            let end = braced
                .find('}')
                .ok_or_else(|| error("unterminated `${`".to_string()))?;
            (&braced[..end], &braced[end + 1..])
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], &after[end..])
        };
        if key.is_empty() {
            return Err(error("`$` without a placeholder name".to_string()));
        }
        let value = vars
            .get(key)
            .ok_or_else(|| error(format!("unknown placeholder `{key}`")))?;
        out.push_str(value);
        rest = tail;
    }
    out.push_str(rest);
    Ok(out)
}
