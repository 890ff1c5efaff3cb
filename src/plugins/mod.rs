//! Named extensions that may adjust the job before anything is staged.

pub mod oncoanalyser;

use async_trait::async_trait;
use log::{
    debug,
    info,
};
use serde_json::{
    Map,
    Value,
};

use crate::{
    backend::ObjectCatalog,
    error::{
        LaunchError,
        Result,
    },
    job::{
        InputFile,
        InputRole,
        JobSpecification,
    },
    registry::Registry,
};

/// Validates a plugin's options and builds it. Construction must not touch
/// the network or the filesystem.
pub trait PluginFactory: Send + Sync {
    fn construct(&self, spec: &JobSpecification, options: &Map<String, Value>) -> Result<Box<dyn Plugin>>;
}

#[async_trait]
pub trait Plugin: Send + Sync {
    // `catalog` is `None` in dry runs
    async fn apply(&self, scope: &mut PluginScope<'_>, catalog: Option<&dyn ObjectCatalog>) -> anyhow::Result<()>;
}

/// What a plugin is allowed to see and change.
///
/// Reads go through [`PluginScope::spec`]; the only writes are the
/// samplesheet input and `--key value` pipeline params. Identity and storage
/// are unreachable from here.
pub struct PluginScope<'a> {
    spec: &'a mut JobSpecification,
}

impl<'a> PluginScope<'a> {
    pub fn new(spec: &'a mut JobSpecification) -> Self {
        PluginScope { spec }
    }

    pub fn spec(&self) -> &JobSpecification {
        self.spec
    }

    pub fn dry_run(&self) -> bool {
        self.spec.dry_run
    }

    pub fn set_samplesheet(&mut self, path: impl Into<String>) {
        let path = path.into();
        debug!("Plugin sets samplesheet to `{path}`");
        self.spec.set_input(InputFile {
            path,
            role: InputRole::Samplesheet,
            generated: true,
        });
    }

    pub fn set_extra_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.spec.extra_params.insert(key.into(), value.into());
    }
}

pub struct PluginHost;

impl PluginHost {
    /// Resolve, construct and run the plugin named by the job, if any.
    pub async fn apply(
        spec: &mut JobSpecification,
        plugins: &Registry<dyn PluginFactory>,
        catalog: Option<&dyn ObjectCatalog>,
    ) -> Result<()> {
        let Some(name) = spec.plugin.clone() else {
            return Ok(());
        };
        let factory = plugins.resolve(&name)?;
        let plugin = factory.construct(spec, &spec.plugin_options)?;

        let prefix = if spec.dry_run { "[DRY-RUN] " } else { "" };
        info!("{prefix}Running plugin `{name}`");
        let mut scope = PluginScope::new(spec);
        plugin
            .apply(&mut scope, catalog)
            .await
            .map_err(|source| LaunchError::PluginExecution {
                plugin: name.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{
        fixture_input,
        spec_from,
    };
    use std::sync::Arc;

    struct ParamSetter;

    #[async_trait]
    impl Plugin for ParamSetter {
        async fn apply(&self, scope: &mut PluginScope<'_>, _catalog: Option<&dyn ObjectCatalog>) -> anyhow::Result<()> {
            let sample = scope.spec().sample_id.clone().unwrap_or_default();
            scope.set_extra_param("sample", sample);
            scope.set_samplesheet("/tmp/generated.csv");
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Plugin for Failing {
        async fn apply(&self, _scope: &mut PluginScope<'_>, _catalog: Option<&dyn ObjectCatalog>) -> anyhow::Result<()> {
            anyhow::bail!("lookup exploded")
        }
    }

    struct Factory(bool);

    impl PluginFactory for Factory {
        fn construct(&self, _spec: &JobSpecification, _options: &Map<String, Value>) -> Result<Box<dyn Plugin>> {
            if self.0 {
                Ok(Box::new(ParamSetter))
            } else {
                Ok(Box::new(Failing))
            }
        }
    }

    fn registry() -> Registry<dyn PluginFactory> {
        let mut registry: Registry<dyn PluginFactory> = Registry::new("plugin");
        registry.register("setter", Arc::new(Factory(true))).unwrap();
        registry.register("failing", Arc::new(Factory(false))).unwrap();
        registry
    }

    #[tokio::test]
    async fn no_plugin_is_a_no_op() {
        let mut spec = spec_from(fixture_input());
        let before = spec.to_json().unwrap();
        PluginHost::apply(&mut spec, &registry(), None).await.unwrap();
        assert_eq!(spec.to_json().unwrap(), before);
    }

    #[tokio::test]
    async fn plugin_writes_only_its_fields() {
        let mut spec = spec_from(fixture_input());
        spec.plugin = Some("setter".into());
        let run_id = spec.run_id().clone();
        let storage = spec.storage().clone();

        PluginHost::apply(&mut spec, &registry(), None).await.unwrap();

        assert_eq!(spec.extra_params["sample"], "TUMOR123");
        let sheet = spec.input(InputRole::Samplesheet).unwrap();
        assert_eq!(sheet.path, "/tmp/generated.csv");
        assert!(sheet.generated);
        assert_eq!(spec.run_id(), &run_id);
        assert_eq!(spec.storage(), &storage);
    }

    #[tokio::test]
    async fn unknown_plugin_is_not_found() {
        let mut spec = spec_from(fixture_input());
        spec.plugin = Some("nope".into());
        let err = PluginHost::apply(&mut spec, &registry(), None).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { kind: "plugin", .. }));
    }

    #[tokio::test]
    async fn hook_failure_names_the_plugin() {
        let mut spec = spec_from(fixture_input());
        spec.plugin = Some("failing".into());
        let err = PluginHost::apply(&mut spec, &registry(), None).await.unwrap_err();
        match err {
            LaunchError::PluginExecution { plugin, source } => {
                assert_eq!(plugin, "failing");
                assert_eq!(source.to_string(), "lookup exploded");
            }
            other => panic!("expected PluginExecution, got {other:?}"),
        }
    }
}
