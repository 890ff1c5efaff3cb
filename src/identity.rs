use std::fmt;

use chrono::{
    DateTime,
    Utc,
};
use rand::{
    rngs::StdRng,
    Rng,
    SeedableRng,
};
use serde::Serialize;

use crate::error::{
    LaunchError,
    Result,
};

pub const JOB_NAME_PREFIX: &str = "nf-runner";

// storage sub-paths relative to the storage root
pub const CACHE_DIR: &str = "cache";
pub const WORK_DIR: &str = "work";
pub const RUN_DIR: &str = "run";

/// Opaque per-invocation token. Only `RunIdentity` can mint one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    // the first eight characters, used in job names
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of the run id and of every random token derived for one invocation.
///
/// The run id is drawn once, at construction, so every caller within the
/// same invocation observes the same value.
pub struct RunIdentity {
    run_id: RunId,
    launched_at: DateTime<Utc>,
    rng: StdRng,
}

impl RunIdentity {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng(), Utc::now())
    }

    // deterministic identity for reproducible previews and tests
    pub fn from_seed(seed: u64, launched_at: DateTime<Utc>) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), launched_at)
    }

    fn with_rng(mut rng: StdRng, launched_at: DateTime<Utc>) -> Self {
        let run_id = generate_run_id(&mut rng);
        RunIdentity {
            run_id,
            launched_at,
            rng,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    /// `nf-runner-<sample label or random token>-<first 8 of run id>`
    pub fn job_name(&mut self, sample_label: Option<&str>) -> String {
        let label = match sample_label.map(str::trim).filter(|s| !s.is_empty()) {
            Some(label) => normalize_label(label),
            None => self.random_token(),
        };
        format!("{JOB_NAME_PREFIX}-{label}-{}", self.run_id.short())
    }

    // fresh 8 hex characters, never taken from the run id
    pub fn random_token(&mut self) -> String {
        let bytes: [u8; 4] = self.rng.random();
        hex::encode(bytes)
    }
}

impl Default for RunIdentity {
    fn default() -> Self {
        Self::new()
    }
}

// v4 uuid from the seeded source; the first character is forced into `a-f`
// so the id is a valid engine run name and stays hex
fn generate_run_id(rng: &mut StdRng) -> RunId {
    let bytes: [u8; 16] = rng.random();
    let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
    let text = uuid.hyphenated().to_string();
    let lead = (b'a' + rng.random_range(0..6u8)) as char;
    RunId(format!("{lead}{}", &text[1..]))
}

fn normalize_label(label: &str) -> String {
    label.replace(',', "-").to_lowercase()
}

/// Remote storage layout for one run. Every path is prefixed by `root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageLayout {
    pub root: String,
    pub cache_path: String,
    pub work_path: String,
    pub run_path: String,
}

impl StorageLayout {
    /// Derive `root/cache`, `root/work` and `root/run/<runId>`.
    ///
    /// An override may be a bare folder name (resolved to `root/<folder>`,
    /// verbatim, no run id suffix) or a path already under `root`.
    pub fn derive(
        root: &str,
        run_id: &RunId,
        cache_override: Option<&str>,
        run_override: Option<&str>,
    ) -> Result<Self> {
        let root = root.trim_end_matches('/').to_string();
        if root.is_empty() {
            return Err(LaunchError::validation("base_bucket", "storage root is empty"));
        }
        let cache_path = match cache_override {
            Some(o) => resolve_override(&root, "remote_cache_path", o)?,
            None => format!("{root}/{CACHE_DIR}"),
        };
        let run_path = match run_override {
            Some(o) => resolve_override(&root, "remote_run_path", o)?,
            None => format!("{root}/{RUN_DIR}/{run_id}"),
        };
        Ok(StorageLayout {
            work_path: format!("{root}/{WORK_DIR}"),
            root,
            cache_path,
            run_path,
        })
    }

    pub fn input_dir(&self) -> String {
        format!("{}/input", self.run_path)
    }

    pub fn config_dir(&self) -> String {
        format!("{}/config", self.run_path)
    }
}

fn resolve_override(root: &str, field: &str, value: &str) -> Result<String> {
    let value = value
        .trim()
        .trim_start_matches("gs://")
        .trim_end_matches('/');
    if value.is_empty() {
        return Err(LaunchError::validation(field, "override is empty"));
    }
    if value == root || value.starts_with(&format!("{root}/")) {
        return Ok(value.to_string());
    }
    if value.contains('/') {
        return Err(LaunchError::validation(
            field,
            format!("`{value}` must be a folder name or a path under `{root}`"),
        ));
    }
    Ok(format!("{root}/{value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap()
    }

    fn is_hex(s: &str) -> bool {
        s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }

    #[test]
    fn run_id_is_stable_within_one_identity() {
        let mut identity = RunIdentity::new();
        let first = identity.run_id().clone();
        let _ = identity.job_name(None);
        let _ = identity.random_token();
        assert_eq!(&first, identity.run_id());
    }

    #[test]
    fn run_ids_differ_across_invocations() {
        let a = RunIdentity::new();
        let b = RunIdentity::new();
        assert_ne!(a.run_id(), b.run_id());
    }

    #[test]
    fn seeded_identity_is_reproducible() {
        let a = RunIdentity::from_seed(7, fixed_time());
        let b = RunIdentity::from_seed(7, fixed_time());
        assert_eq!(a.run_id(), b.run_id());
        assert_eq!(a.launched_at(), b.launched_at());
    }

    #[test]
    fn run_id_is_a_lowercase_v4_uuid() {
        let identity = RunIdentity::from_seed(42, fixed_time());
        let id = identity.run_id().as_str();
        assert_eq!(id.len(), 36);
        assert!(id.chars().next().unwrap().is_ascii_lowercase());
        assert!(is_hex(&id.replace('-', "")));
        // version nibble
        assert_eq!(&id[14..15], "4");
        assert!(uuid::Uuid::parse_str(&format!("0{}", &id[1..])).is_ok());
    }

    #[test]
    fn job_name_uses_normalized_sample_label() {
        let mut identity = RunIdentity::from_seed(1, fixed_time());
        let name = identity.job_name(Some("TUMOR123"));
        let expected = format!("nf-runner-tumor123-{}", identity.run_id().short());
        assert_eq!(name, expected);
        let suffix = name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(is_hex(suffix));

        let paired = identity.job_name(Some("TUMOR,NORMAL"));
        assert!(paired.starts_with("nf-runner-tumor-normal-"));
    }

    #[test]
    fn job_name_without_label_uses_fresh_token() {
        let mut identity = RunIdentity::from_seed(3, fixed_time());
        let name = identity.job_name(None);
        let parts: Vec<&str> = name.split('-').collect();
        // nf, runner, token, short id
        assert_eq!(parts.len(), 4);
        let token = parts[2];
        assert_eq!(token.len(), 8);
        assert!(is_hex(token));
        assert_ne!(token, identity.run_id().short());
    }

    #[test]
    fn default_layout_is_under_root() {
        let identity = RunIdentity::from_seed(5, fixed_time());
        let run_id = identity.run_id();
        let layout = StorageLayout::derive("my-bucket", run_id, None, None).unwrap();
        assert_eq!(layout.cache_path, "my-bucket/cache");
        assert_eq!(layout.work_path, "my-bucket/work");
        assert_eq!(layout.run_path, format!("my-bucket/run/{run_id}"));
        for path in [&layout.cache_path, &layout.work_path, &layout.run_path] {
            assert!(path.starts_with("my-bucket/"));
        }
        assert_eq!(layout.input_dir(), format!("my-bucket/run/{run_id}/input"));
    }

    #[test]
    fn bare_folder_override_is_used_verbatim() {
        let identity = RunIdentity::from_seed(5, fixed_time());
        let layout = StorageLayout::derive(
            "my-bucket",
            identity.run_id(),
            Some("nf-cache"),
            Some("runs-2025"),
        )
        .unwrap();
        assert_eq!(layout.cache_path, "my-bucket/nf-cache");
        assert_eq!(layout.run_path, "my-bucket/runs-2025");
    }

    #[test]
    fn override_outside_root_is_rejected() {
        let identity = RunIdentity::from_seed(5, fixed_time());
        let err = StorageLayout::derive(
            "my-bucket",
            identity.run_id(),
            Some("gs://other-bucket/cache"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LaunchError::Validation { ref field, .. } if field == "remote_cache_path"));

        let ok = StorageLayout::derive(
            "my-bucket",
            identity.run_id(),
            Some("gs://my-bucket/shared/cache/"),
            None,
        )
        .unwrap();
        assert_eq!(ok.cache_path, "my-bucket/shared/cache");
    }
}
