//! Configuration file handling
use crate::consts::{DEFAULT_API_URL, DEFAULT_GIT_ANNEX_JOBS, DEFAULT_WORKERS};
use crate::httputil::HttpUrl;
use anyhow::Context;
use regex::Regex;
use serde::{de::Deserializer, Deserialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// How to decide whether a Dandiset needs to be synced at all
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Mode {
    /// Sync when the draft `modified` timestamp advanced since the last run
    #[default]
    Timestamp,
    /// Sync unconditionally, but raise `UnexpectedChange` on any mutation
    /// when the timestamp did not advance
    Verify,
    /// Sync unconditionally
    Force,
}

/// How to decide whether a Zarr needs to be synced
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum ZarrMode {
    /// Compare S3 object timestamps against the `s3sync.json` cursor
    #[default]
    Timestamp,
    /// Compare the stored tree checksum against the server's
    Checksum,
    /// Additionally gate on the Zarr asset's `modified` timestamp
    AssetChecksum,
    /// Sync unconditionally
    Force,
}

/// A git-annex special remote to register in freshly-created datasets
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct Remote {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) remote_type: String,
    #[serde(default)]
    pub(crate) options: BTreeMap<String, String>,
}

/// Where one class of backup repositories (Dandisets or Zarrs) lives, and
/// where it gets published
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct ResourceConfig {
    pub(crate) path: PathBuf,
    #[serde(default)]
    pub(crate) github_org: Option<String>,
    #[serde(default)]
    pub(crate) remote: Option<Remote>,
}

impl ResourceConfig {
    fn new<P: Into<PathBuf>>(path: P) -> ResourceConfig {
        ResourceConfig {
            path: path.into(),
            github_org: None,
            remote: None,
        }
    }
}

/// A regular expression deserialized from a config or CLI string
#[derive(Clone, Debug)]
pub(crate) struct Filter(Regex);

impl Filter {
    pub(crate) fn is_match(&self, s: &str) -> bool {
        self.0.is_match(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Filter {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Filter, regex::Error> {
        Regex::new(s).map(Filter)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Filter, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<Filter>().map_err(serde::de::Error::custom)
    }
}

fn default_api_url() -> HttpUrl {
    DEFAULT_API_URL
        .parse::<HttpUrl>()
        .expect("default API URL should be a valid URL")
}

fn default_s3bucket() -> String {
    String::from("dandiarchive")
}

fn default_content_url_regex() -> Filter {
    "amazonaws.com/.*blobs/"
        .parse::<Filter>()
        .expect("default content URL regex should be a valid regex")
}

fn default_dandisets() -> ResourceConfig {
    ResourceConfig::new("dandisets")
}

fn default_jobs() -> usize {
    DEFAULT_GIT_ANNEX_JOBS
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_enable_tags() -> bool {
    true
}

/// The complete backup configuration, loaded from a YAML file and adjusted by
/// command-line options
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BackupConfig {
    #[serde(default = "default_api_url")]
    pub(crate) dandi_api_url: HttpUrl,
    #[serde(default = "default_s3bucket")]
    pub(crate) s3bucket: String,
    #[serde(default)]
    pub(crate) s3endpoint: Option<HttpUrl>,
    #[serde(default = "default_content_url_regex")]
    pub(crate) content_url_regex: Filter,
    #[serde(default = "default_dandisets")]
    pub(crate) dandisets: ResourceConfig,
    #[serde(default)]
    pub(crate) zarrs: Option<ResourceConfig>,

    // Also settable via CLI options:
    #[serde(default)]
    pub(crate) backup_root: PathBuf,
    #[serde(default)]
    pub(crate) asset_filter: Option<Filter>,
    #[serde(default = "default_jobs")]
    pub(crate) jobs: usize,
    #[serde(default = "default_workers")]
    pub(crate) workers: usize,
    #[serde(default)]
    pub(crate) force: Option<String>,
    #[serde(default = "default_enable_tags")]
    pub(crate) enable_tags: bool,
    #[serde(default)]
    pub(crate) gc_assets: bool,
    #[serde(default)]
    pub(crate) mode: Mode,
    #[serde(default)]
    pub(crate) zarr_mode: ZarrMode,
    #[serde(default)]
    pub(crate) force_push: BTreeSet<String>,
}

impl Default for BackupConfig {
    fn default() -> BackupConfig {
        BackupConfig {
            dandi_api_url: default_api_url(),
            s3bucket: default_s3bucket(),
            s3endpoint: None,
            content_url_regex: default_content_url_regex(),
            dandisets: default_dandisets(),
            zarrs: None,
            backup_root: PathBuf::new(),
            asset_filter: None,
            jobs: default_jobs(),
            workers: default_workers(),
            force: None,
            enable_tags: true,
            gc_assets: false,
            mode: Mode::default(),
            zarr_mode: ZarrMode::default(),
            force_push: BTreeSet::new(),
        }
    }
}

impl BackupConfig {
    pub(crate) fn load_yaml(filepath: &Path) -> anyhow::Result<BackupConfig> {
        let src = std::fs::read_to_string(filepath)
            .with_context(|| format!("failed to read {}", filepath.display()))?;
        let cfg = serde_yaml::from_str::<BackupConfig>(&src)
            .with_context(|| format!("failed to parse {}", filepath.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.gh_org().is_some() != self.zarr_gh_org().is_some() {
            anyhow::bail!(
                "dandisets.github_org and zarrs.github_org must be either both set or both unset"
            );
        }
        Ok(())
    }

    /// Base URL for unversioned object access on the backup bucket
    pub(crate) fn bucket_url(&self) -> String {
        match &self.s3endpoint {
            Some(endpoint) => format!("{}/{}", endpoint.as_str().trim_end_matches('/'), self.s3bucket),
            None => format!("https://{}.s3.amazonaws.com", self.s3bucket),
        }
    }

    pub(crate) fn dandiset_root(&self) -> PathBuf {
        self.backup_root.join(&self.dandisets.path)
    }

    pub(crate) fn zarr_root(&self) -> Option<PathBuf> {
        self.zarrs
            .as_ref()
            .map(|z| self.backup_root.join(&z.path))
    }

    pub(crate) fn gh_org(&self) -> Option<&str> {
        self.dandisets.github_org.as_deref()
    }

    pub(crate) fn zarr_gh_org(&self) -> Option<&str> {
        self.zarrs.as_ref().and_then(|z| z.github_org.as_deref())
    }

    pub(crate) fn match_asset(&self, asset_path: &str) -> bool {
        self.asset_filter
            .as_ref()
            .map_or(true, |rgx| rgx.is_match(asset_path))
    }

    pub(crate) fn forced_assets_update(&self) -> bool {
        self.force.as_deref() == Some("assets-update")
    }

    pub(crate) fn should_force_push_dandisets(&self) -> bool {
        self.force_push.contains("all") || self.force_push.contains("dandisets")
    }

    pub(crate) fn should_force_push_zarrs(&self) -> bool {
        self.force_push.contains("all") || self.force_push.contains("zarrs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let cfg = serde_yaml::from_str::<BackupConfig>("{}").unwrap();
        assert_eq!(cfg.s3bucket, "dandiarchive");
        assert_eq!(cfg.dandi_api_url.as_str(), "https://api.dandiarchive.org/api");
        assert_eq!(cfg.jobs, DEFAULT_GIT_ANNEX_JOBS);
        assert_eq!(cfg.workers, DEFAULT_WORKERS);
        assert_eq!(cfg.mode, Mode::Timestamp);
        assert_eq!(cfg.zarr_mode, ZarrMode::Timestamp);
        assert!(cfg.enable_tags);
        assert!(cfg.zarrs.is_none());
        assert_eq!(cfg.bucket_url(), "https://dandiarchive.s3.amazonaws.com");
    }

    #[test]
    fn full_config() {
        let cfg = serde_yaml::from_str::<BackupConfig>(indoc! {"
            dandi_api_url: https://api.sandbox.dandiarchive.org/api
            s3bucket: dandi-sandbox
            s3endpoint: http://127.0.0.1:9000
            backup_root: /backups
            dandisets:
                path: dandisets
                github_org: dandisets
                remote:
                    name: backup
                    type: rclone
                    options:
                        encryption: none
            zarrs:
                path: zarrs
                github_org: dandizarrs
            asset_filter: '\\.nwb$'
            zarr_mode: asset-checksum
            mode: verify
            force_push: [zarrs]
        "})
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.gh_org(), Some("dandisets"));
        assert_eq!(cfg.zarr_gh_org(), Some("dandizarrs"));
        assert_eq!(cfg.mode, Mode::Verify);
        assert_eq!(cfg.zarr_mode, ZarrMode::AssetChecksum);
        assert_eq!(cfg.bucket_url(), "http://127.0.0.1:9000/dandi-sandbox");
        assert_eq!(cfg.dandiset_root(), PathBuf::from("/backups/dandisets"));
        assert_eq!(cfg.zarr_root(), Some(PathBuf::from("/backups/zarrs")));
        assert!(cfg.match_asset("sub-01/sub-01.nwb"));
        assert!(!cfg.match_asset("sub-01/sub-01.json"));
        assert!(!cfg.should_force_push_dandisets());
        assert!(cfg.should_force_push_zarrs());
        let remote = cfg.dandisets.remote.unwrap();
        assert_eq!(remote.name, "backup");
        assert_eq!(remote.remote_type, "rclone");
    }

    #[test]
    fn mismatched_github_orgs() {
        let cfg = serde_yaml::from_str::<BackupConfig>(indoc! {"
            dandisets:
                path: dandisets
                github_org: dandisets
            zarrs:
                path: zarrs
        "})
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn no_asset_filter_matches_everything() {
        let cfg = BackupConfig::default();
        assert!(cfg.match_asset("anything/at/all"));
    }
}
