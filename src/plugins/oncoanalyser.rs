//! Paired tumor/normal samplesheet for nf-core/oncoanalyser.
//!
//! Looks up the newest alignment of each sample in a bucket and writes
//! `samplesheet.csv` next to the run's other local artifacts.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use log::info;
use serde_json::{
    Map,
    Value,
};

use super::{
    Plugin,
    PluginFactory,
    PluginScope,
};
use crate::{
    backend::{
        latest_object,
        ObjectCatalog,
        ObjectPath,
    },
    error::{
        LaunchError,
        Result,
    },
    job::JobSpecification,
};

pub const PLUGIN_NAME: &str = "oncoanalyser";
pub const SAMPLESHEET_FILE: &str = "samplesheet.csv";

const HEADER: &str = "group_id,subject_id,sample_id,sample_type,sequence_type,filetype,filepath";

pub struct OncoanalyserFactory;

impl PluginFactory for OncoanalyserFactory {
    fn construct(&self, spec: &JobSpecification, options: &Map<String, Value>) -> Result<Box<dyn Plugin>> {
        let bucket_uri = required_str(options, "remote_sample_bucket_uri")?;
        ObjectPath::parse_prefix(&bucket_uri)
            .map_err(|e| option_error("remote_sample_bucket_uri", e.to_string()))?;
        let filetype = required_str(options, "filetype")?;

        let sample_id = spec.sample_id.as_deref().unwrap_or_default();
        let (tumor, normal) = sample_id
            .split_once(',')
            .map(|(t, n)| (t.trim(), n.trim()))
            .filter(|(t, n)| !t.is_empty() && !n.is_empty())
            .ok_or_else(|| option_error("sample_id", "expected `TUMOR_ID,NORMAL_ID`"))?;

        Ok(Box::new(Oncoanalyser {
            bucket_uri,
            filetype,
            tumor_id: tumor.to_string(),
            normal_id: normal.to_string(),
        }))
    }
}

fn required_str(options: &Map<String, Value>, key: &str) -> Result<String> {
    match options.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(other) => Err(option_error(key, format!("expected a non-empty string, got `{other}`"))),
        None => Err(option_error(key, "is required")),
    }
}

fn option_error(key: &str, reason: impl Into<String>) -> LaunchError {
    LaunchError::PluginOption {
        plugin: PLUGIN_NAME.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug)]
struct Oncoanalyser {
    bucket_uri: String,
    filetype: String,
    tumor_id: String,
    normal_id: String,
}

impl Oncoanalyser {
    async fn latest(&self, catalog: &dyn ObjectCatalog, sample: &str) -> anyhow::Result<String> {
        latest_object(catalog, &self.bucket_uri, Some(sample), &self.filetype)
            .await?
            .with_context(|| {
                format!(
                    "no `{}` object for sample `{sample}` under `{}`",
                    self.filetype, self.bucket_uri
                )
            })
    }

    fn samplesheet(&self, tumor_path: &str, normal_path: &str) -> String {
        let group = format!("{}_{}", self.tumor_id, self.normal_id);
        let mut out = String::from(HEADER);
        out.push('\n');
        for (sample, kind, path) in [
            (&self.tumor_id, "tumor", tumor_path),
            (&self.normal_id, "normal", normal_path),
        ] {
            out.push_str(&format!("{group},{group},{sample},{kind},dna,bam,{path}\n"));
            out.push_str(&format!("{group},{group},{sample},{kind},dna,bai,{path}.bai\n"));
        }
        out
    }
}

#[async_trait]
impl Plugin for Oncoanalyser {
    async fn apply(&self, scope: &mut PluginScope<'_>, catalog: Option<&dyn ObjectCatalog>) -> anyhow::Result<()> {
        let tmp_dir = scope.spec().tmp_dir.clone();
        let sheet = tmp_dir.join(SAMPLESHEET_FILE);
        let sheet_path = sheet.to_string_lossy().into_owned();

        if scope.dry_run() {
            info!("[DRY-RUN] Samplesheet will be written to `{sheet_path}`");
            scope.set_samplesheet(sheet_path);
            return Ok(());
        }

        let catalog = catalog.context("no object catalog available for sample lookup")?;
        let tumor = self.latest(catalog, &self.tumor_id).await?;
        let normal = self.latest(catalog, &self.normal_id).await?;

        write_file(&sheet, &self.samplesheet(&tumor, &normal))?;
        info!("Samplesheet written to `{sheet_path}`");
        scope.set_samplesheet(sheet_path);
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create `{}`", dir.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("Failed to write `{}`", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::ObjectInfo,
        config::tests::{
            fixture_input,
            spec_from,
        },
        job::InputRole,
    };
    use chrono::{
        TimeZone,
        Utc,
    };
    use serde_json::json;
    use std::sync::atomic::{
        AtomicUsize,
        Ordering,
    };

    struct Catalog {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectCatalog for Catalog {
        async fn list(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<ObjectInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!((bucket, prefix), ("samples", "wgs"));
            let at = |h| Utc.with_ymd_and_hms(2025, 2, 1, h, 0, 0).unwrap();
            Ok(vec![
                ObjectInfo { name: "wgs/T1.v1.bam".into(), updated: at(1) },
                ObjectInfo { name: "wgs/T1.v2.bam".into(), updated: at(3) },
                ObjectInfo { name: "wgs/N1.bam".into(), updated: at(2) },
                ObjectInfo { name: "wgs/N1.bam.bai".into(), updated: at(4) },
            ])
        }
    }

    fn options(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn construct_err(spec: &JobSpecification, value: Value) -> LaunchError {
        match OncoanalyserFactory.construct(spec, &options(value)) {
            Err(e) => e,
            Ok(_) => panic!("construction should have failed"),
        }
    }

    fn paired_spec(dir: &Path, dry_run: bool) -> JobSpecification {
        let mut input = fixture_input();
        input.sample_id = Some("T1,N1".into());
        let mut spec = spec_from(input);
        spec.tmp_dir = dir.to_path_buf();
        spec.dry_run = dry_run;
        spec
    }

    #[test]
    fn missing_filetype_is_named() {
        let spec = paired_spec(Path::new("/unused"), false);
        let err = construct_err(&spec, json!({ "remote_sample_bucket_uri": "gs://samples/wgs" }));
        match err {
            LaunchError::PluginOption { plugin, key, .. } => {
                assert_eq!(plugin, "oncoanalyser");
                assert_eq!(key, "filetype");
            }
            other => panic!("expected PluginOption, got {other:?}"),
        }
    }

    #[test]
    fn single_sample_id_is_rejected() {
        let spec = spec_from(fixture_input());
        let err = construct_err(
            &spec,
            json!({ "remote_sample_bucket_uri": "gs://samples/wgs", "filetype": ".bam" }),
        );
        assert!(matches!(err, LaunchError::PluginOption { ref key, .. } if key == "sample_id"));
    }

    #[tokio::test]
    async fn writes_paired_samplesheet() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = paired_spec(dir.path(), false);
        let plugin = OncoanalyserFactory
            .construct(
                &spec,
                &options(json!({ "remote_sample_bucket_uri": "gs://samples/wgs", "filetype": ".bam" })),
            )
            .unwrap();
        let catalog = Catalog { calls: AtomicUsize::new(0) };
        plugin
            .apply(&mut PluginScope::new(&mut spec), Some(&catalog))
            .await
            .unwrap();

        let sheet = dir.path().join(SAMPLESHEET_FILE);
        let text = std::fs::read_to_string(&sheet).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[1], "T1_N1,T1_N1,T1,tumor,dna,bam,gs://samples/wgs/T1.v2.bam");
        assert_eq!(lines[2], "T1_N1,T1_N1,T1,tumor,dna,bai,gs://samples/wgs/T1.v2.bam.bai");
        assert_eq!(lines[3], "T1_N1,T1_N1,N1,normal,dna,bam,gs://samples/wgs/N1.bam");
        assert_eq!(lines[4], "T1_N1,T1_N1,N1,normal,dna,bai,gs://samples/wgs/N1.bam.bai");
        assert_eq!(lines.len(), 5);

        let input = spec.input(InputRole::Samplesheet).unwrap();
        assert_eq!(Path::new(&input.path), sheet);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dry_run_sets_path_without_lookup_or_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = paired_spec(dir.path(), true);
        let plugin = OncoanalyserFactory
            .construct(
                &spec,
                &options(json!({ "remote_sample_bucket_uri": "gs://samples/wgs", "filetype": ".bam" })),
            )
            .unwrap();
        let catalog = Catalog { calls: AtomicUsize::new(0) };
        plugin
            .apply(&mut PluginScope::new(&mut spec), Some(&catalog))
            .await
            .unwrap();

        let sheet = dir.path().join(SAMPLESHEET_FILE);
        assert!(!sheet.exists());
        assert_eq!(Path::new(&spec.input(InputRole::Samplesheet).unwrap().path), sheet);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 0);
    }
}
