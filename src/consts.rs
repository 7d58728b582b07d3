//! Constants and program-wide compile-time configuration

/// The "User-Agent" value sent in outgoing HTTP requests
pub(crate) static USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CARGO_PKG_REPOSITORY"),
    ")",
);

/// The default value of the `dandi_api_url` config setting
pub(crate) static DEFAULT_API_URL: &str = "https://api.dandiarchive.org/api";

/// The branch on which backups of Dandisets are built
pub(crate) static DEFAULT_BRANCH: &str = "draft";

/// Options passed to every `git` invocation in a backup repository.
///
/// Automatic garbage collection must not fire while long-lived `git-annex`
/// batch processes hold the repository open.
pub(crate) static GIT_OPTIONS: [&str; 4] = ["-c", "receive.autogc=0", "-c", "gc.auto=0"];

/// Name & e-mail recorded as the author of backup commits
pub(crate) static COMMIT_AUTHOR_NAME: &str = "DANDI User";
pub(crate) static COMMIT_AUTHOR_EMAIL: &str = "info@dandiarchive.org";

/// Default number of jobs passed to `git-annex addurl`
pub(crate) const DEFAULT_GIT_ANNEX_JOBS: usize = 10;

/// Default number of Dandisets to back up concurrently
pub(crate) const DEFAULT_WORKERS: usize = 5;

/// Maximum number of Zarrs to sync at once
pub(crate) const ZARR_LIMIT: usize = 32;

/// Maximum number of times to repeatedly sync a Zarr in case of
/// local-vs.-server checksum mismatch
pub(crate) const MAX_ZARR_SYNCS: usize = 5;

/// Minimum `git-annex` version supporting `annex.alwayscompact=false`
pub(crate) static MINIMUM_GIT_ANNEX_VERSION: &str = "10.20220724";

/// An asset classified as text larger than this many bytes indicates a
/// corrupted classification and aborts the sync
pub(crate) const MAX_TEXT_SIZE: i64 = 10 << 20;

/// Server blobs older than this without a SHA256 digest are reported as
/// errors at the end of a sync
pub(crate) const UNHASHED_MAX_AGE: time::Duration = time::Duration::DAY;

/// Repository-config key (in `.datalad/config`) recording the embargo status
pub(crate) static EMBARGO_STATUS_KEY: &str = "dandi.dandiset.embargo-status";

/// Name of the file at the root of a Dandiset in which the Dandiset's
/// metadata is stored as YAML
pub(crate) static DANDISET_METADATA_FILE: &str = "dandiset.yaml";

/// File extensions (case sensitive) for Zarrs, including the leading periods
pub(crate) static ZARR_EXTENSIONS: [&str; 2] = [".zarr", ".ngff"];

/// Delays, in seconds, between retries of a `git rm` that lost a race on the
/// index lock
pub(crate) static RM_RETRY_DELAYS: [u64; 5] = [1, 2, 6, 15, 36];
