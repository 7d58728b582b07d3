//! Top-level orchestration: iterate over Dandisets with a bounded worker
//! pool, sync each one, tag published versions, and keep the superdataset
//! and hosted-repository metadata up to date.
use crate::config::{Filter, Mode};
use crate::consts::{
    COMMIT_AUTHOR_EMAIL, COMMIT_AUTHOR_NAME, DANDISET_METADATA_FILE, GIT_OPTIONS,
    MINIMUM_GIT_ANNEX_VERSION,
};
use crate::dandi::{Asset, DandiClient, Dandiset, DandisetId, EmbargoStatus, RemoteDandiset};
use crate::dataset::{AsyncDataset, DatasetStats, ObjectType};
use crate::manager::Manager;
use crate::syncer::{extract_repo_name, Syncer};
use crate::tracker::AssetTracker;
use crate::util::{assets_eq, quantify, version_key, yaml_dump};
use anyhow::Context;
use futures_util::TryStreamExt;
use std::collections::BTreeMap;
use tracing::Instrument;
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use tokio::process::Command;
use tokio::task::JoinSet;

/// Refuse to run against a git-annex too old for
/// `annex.alwayscompact=false`
pub(crate) async fn check_git_annex_version() -> anyhow::Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(["annex", "version"]);
    let output = crate::procio::read_command(&mut cmd)
        .await
        .context("git-annex not installed")?;
    let version = output
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("git-annex version:"))
        .map(str::trim)
        .context("unparseable `git annex version` output")?;
    if version_key(version) < version_key(MINIMUM_GIT_ANNEX_VERSION) {
        anyhow::bail!(
            "git-annex {MINIMUM_GIT_ANNEX_VERSION} or later required, but version {version} found"
        );
    }
    Ok(())
}

/// Backs up Dandisets from one Archive instance into one backup root
#[derive(Clone, Debug)]
pub(crate) struct DandiDatasetter {
    client: DandiClient,
    manager: Manager,
}

impl DandiDatasetter {
    pub(crate) fn new(client: DandiClient, manager: Manager) -> DandiDatasetter {
        DandiDatasetter { client, manager }
    }

    pub(crate) async fn ensure_superdataset(&self) -> anyhow::Result<AsyncDataset> {
        let superds = AsyncDataset::new(self.manager.config.dandiset_root());
        if !superds.is_installed() {
            tracing::info!("Creating superdataset");
            superds
                .ensure_installed(
                    "superdataset",
                    None,
                    None,
                    "SHA256E",
                    true,
                    EmbargoStatus::Open,
                )
                .await?;
        }
        Ok(superds)
    }

    async fn get_dandisets(
        &self,
        dandiset_ids: &[DandisetId],
        exclude: Option<&Filter>,
    ) -> anyhow::Result<Vec<Dandiset>> {
        let mut dandisets = if dandiset_ids.is_empty() {
            self.client
                .get_all_dandisets()
                .try_collect::<Vec<_>>()
                .await?
        } else {
            let mut ds = Vec::with_capacity(dandiset_ids.len());
            for did in dandiset_ids {
                ds.push(self.client.get_dandiset(did).await?);
            }
            ds
        };
        dandisets.retain(|d| {
            if exclude.is_some_and(|rgx| rgx.is_match(d.identifier.as_str())) {
                tracing::debug!(dandiset = %d.identifier, "Skipping dandiset");
                false
            } else {
                true
            }
        });
        Ok(dandisets)
    }

    /// Sync every selected Dandiset, each under its own task tree, bounded
    /// by the configured worker count.  A failure in one Dandiset does not
    /// cancel the others; the run fails at the end if any of them failed.
    pub(crate) async fn update_from_backup(
        &self,
        dandiset_ids: &[DandisetId],
        exclude: Option<&Filter>,
    ) -> anyhow::Result<()> {
        check_git_annex_version().await?;
        let superds = self.ensure_superdataset().await?;
        let dandisets = self.get_dandisets(dandiset_ids, exclude).await?;
        let workers = Arc::new(tokio::sync::Semaphore::new(self.manager.config.workers));
        let mut tasks: JoinSet<(DandisetId, anyhow::Result<Option<DatasetStats>>)> =
            JoinSet::new();
        for d in dandisets {
            let this = self.clone();
            let workers = workers.clone();
            tasks.spawn(async move {
                let id = d.identifier.clone();
                let _permit = workers
                    .acquire_owned()
                    .await
                    .expect("worker semaphore unexpectedly closed");
                let span = tracing::info_span!("dandiset", dandiset = %id);
                let outcome = this.sync_one_dandiset(d).instrument(span).await;
                (id, outcome)
            });
        }
        let mut ds_stats = Vec::new();
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (id, outcome) = joined.context("Dandiset sync task panicked")?;
            match outcome {
                Ok(stats) => ds_stats.extend(stats),
                Err(e) => {
                    failed += 1;
                    tracing::error!(dandiset = %id, "Backup failed: {e:#}");
                }
            }
        }
        tracing::debug!("Committing superdataset");
        superds.save("CRON update", None).await?;
        tracing::debug!("Superdataset committed");
        if self.manager.config.gh_org().is_some() && dandiset_ids.is_empty() && exclude.is_none() {
            self.set_superds_description(&superds, &ds_stats).await?;
        }
        if failed > 0 {
            anyhow::bail!("{} failed to sync", quantify(failed, "Dandiset"));
        }
        Ok(())
    }

    async fn sync_one_dandiset(&self, d: Dandiset) -> anyhow::Result<Option<DatasetStats>> {
        let id = d.identifier.clone();
        let version = d
            .draft_version
            .clone()
            .with_context(|| format!("Dandiset {id} has no draft version"))?;
        let dandiset = self.client.remote_dandiset(&d, version);
        let dsdir = self.manager.config.dandiset_root().join(id.as_str());
        let ds = Arc::new(AsyncDataset::new(dsdir));
        ds.ensure_installed(
            &format!("Dandiset {id}"),
            Some(dandiset.version().created),
            self.manager.config.dandisets.remote.as_ref(),
            "SHA256E",
            true,
            d.embargo_status,
        )
        .await?;
        if d.embargo_status == EmbargoStatus::Embargoed {
            ds.ensure_dandi_provider(self.client.api_url().as_str())
                .await?;
        }
        let changed = self.sync_dataset(&dandiset, &ds).await?;
        ds.assert_no_duplicates_in_gitmodules().await?;
        self.ensure_github_remote(&ds, &id).await?;
        self.tag_releases(&dandiset, &ds, self.manager.config.gh_org().is_some())
            .await?;
        if self.manager.config.gh_org().is_none() {
            return Ok(None);
        }
        if changed {
            tracing::info!("Pushing to sibling");
            ds.push(
                "github",
                self.manager.config.jobs,
                self.manager.config.should_force_push_dandisets(),
            )
            .await?;
        }
        Ok(Some(self.set_dandiset_gh_metadata(&dandiset, &ds).await?))
    }

    /// Sync one version of one Dandiset into its repository.  Returns `true`
    /// if any commits were made.
    pub(crate) async fn sync_dataset(
        &self,
        dandiset: &RemoteDandiset,
        ds: &Arc<AsyncDataset>,
    ) -> anyhow::Result<bool> {
        tracing::info!(dandiset = %dandiset.identifier(), "Syncing");
        if ds.is_dirty().await? {
            anyhow::bail!(
                "Dirty Dandiset {}; clean or save before running",
                dandiset.identifier(),
            );
        }
        let error_on_change = match self.manager.config.mode {
            Mode::Force => false,
            mode => match ds.get_assets_state()? {
                Some(state) if dandiset.version().modified <= state.timestamp => {
                    if mode == Mode::Verify {
                        true
                    } else {
                        tracing::info!(
                            dandiset = %dandiset.identifier(),
                            "Not modified on server since last backup; skipping",
                        );
                        return Ok(false);
                    }
                }
                _ => false,
            },
        };
        let tracker = Arc::new(Mutex::new(AssetTracker::from_dataset(ds).await?));
        let mut syncer = Syncer::new(
            self.manager.clone(),
            dandiset.clone(),
            ds.clone(),
            tracker,
            error_on_change,
        );
        syncer.update_embargo_status().await?;
        update_dandiset_metadata(dandiset, ds).await?;
        syncer.sync_assets().await?;
        syncer.prune_deleted().await?;
        syncer.dump_asset_metadata().await?;
        tracing::debug!("Checking whether repository is dirty ...");
        if ds.is_dirty().await? {
            tracing::info!("Committing changes");
            ds.save(
                &syncer.get_commit_message(),
                Some(dandiset.version().modified),
            )
            .await?;
            tracing::debug!("Commit made");
            syncer.report.commits += 1;
        } else {
            tracing::debug!("Repository is clean");
        }
        tracing::debug!("Running `git gc`");
        ds.gc().await?;
        tracing::debug!("Finished running `git gc`");
        Ok(syncer.report.commits > 0)
    }

    async fn ensure_github_remote(
        &self,
        ds: &Arc<AsyncDataset>,
        dandiset_id: &DandisetId,
    ) -> anyhow::Result<()> {
        let Some(org) = self.manager.config.gh_org() else {
            return Ok(());
        };
        if ds.has_github_remote().await? {
            return Ok(());
        }
        let repo = crate::github::GHRepo::new(org, dandiset_id.as_str());
        if let Some(gh) = self.manager.gh.as_ref() {
            let private = ds.get_embargo_status().await? == EmbargoStatus::Embargoed;
            gh.create_repository(&repo, private).await?;
        }
        ds.create_github_sibling(
            org,
            dandiset_id.as_str(),
            self.manager.config.dandisets.remote.as_ref(),
        )
        .await?;
        if let Some(gh) = self.manager.gh.as_ref() {
            gh.edit_repository(
                &repo,
                &crate::github::RepoEdits {
                    homepage: Some(format!("https://identifiers.org/DANDI:{dandiset_id}")),
                    ..crate::github::RepoEdits::default()
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Tag each published version at the commit whose `assets.json` matches
    /// that version's assets, and keep the draft branch descended from the
    /// latest tag via an ours-merge
    pub(crate) async fn tag_releases(
        &self,
        dandiset: &RemoteDandiset,
        ds: &Arc<AsyncDataset>,
        push: bool,
    ) -> anyhow::Result<()> {
        if !self.manager.config.enable_tags {
            return Ok(());
        }
        tracing::info!(dandiset = %dandiset.identifier(), "Tagging releases");
        let versions = dandiset
            .get_versions()
            .try_filter(|v| std::future::ready(!v.version.is_draft()))
            .try_collect::<Vec<_>>()
            .await?;
        for v in &versions {
            let tag = ds.read_git(["tag", "-l", v.version.as_str()]).await?;
            if !tag.is_empty() {
                tracing::debug!(version = %v.version, "Version already tagged");
            } else {
                tracing::info!(version = %v.version, "Tagging version");
                self.mkrelease(&dandiset.for_version(v.clone()), ds, push)
                    .await?;
            }
        }
        if versions.is_empty() {
            return Ok(());
        }
        let latest = versions
            .iter()
            .map(|v| v.version.as_str())
            .max_by_key(|v| version_key(v))
            .expect("versions is nonempty");
        let description = ds
            .read_git(["describe", "--tags", "--long", "--always"])
            .await?;
        let merge = match parse_describe(&description) {
            // No tags on default branch
            None => true,
            Some(tag) => version_key(latest) > version_key(tag),
        };
        if merge {
            tracing::debug!(tag = %latest, "Merging latest tag into drafts branch");
            ds.call_git([
                "merge",
                "-s",
                "ours",
                "-m",
                &format!("Merge '{latest}' into drafts branch (no differences in content merged)"),
                latest,
            ])
            .await?;
        }
        if push {
            ds.push(
                "github",
                self.manager.config.jobs,
                self.manager.config.should_force_push_dandisets(),
            )
            .await?;
        }
        Ok(())
    }

    /// Create the release tag for one published version.  `dandiset` must
    /// have its version set to the published version.
    async fn mkrelease(
        &self,
        dandiset: &RemoteDandiset,
        ds: &Arc<AsyncDataset>,
        push: bool,
    ) -> anyhow::Result<()> {
        let version_id = dandiset.version_id().clone();
        let remote_assets = dandiset
            .stream_assets()
            .try_collect::<Vec<_>>()
            .await?;
        // --before orders by commit date, not author date, so we filter
        // commits ourselves.
        let commits = ds
            .read_git([
                "log",
                r"--grep=\[backups2datalad\]",
                "--format=%H %aI",
            ])
            .await?;
        let mut candidates: Vec<String> = Vec::new();
        for cmt in commits.lines() {
            let (chash, cdate) = cmt
                .split_once(' ')
                .with_context(|| format!("unparseable `git log` line {cmt:?}"))?;
            let ts = time::OffsetDateTime::parse(cdate, &Rfc3339)
                .with_context(|| format!("unparseable commit date {cdate:?}"))?;
            if ts <= dandiset.version().created {
                candidates.push(chash.to_owned());
                break;
            }
        }
        let base = candidates
            .first()
            .cloned()
            .context("expected at least a single backup commit before the version's creation")?;
        // --reverse is applied after -n 1, so we cannot use it to get just
        // one commit in chronological order after the first candidate; get
        // all and take the last.
        let later = ds
            .read_git([
                "rev-list",
                r"--grep=\[backups2datalad\]",
                &format!("{base}..HEAD"),
            ])
            .await?;
        if let Some(last) = later.split_whitespace().last() {
            candidates.push(last.to_owned());
        }
        let mut matching = Vec::new();
        for chash in &candidates {
            if self
                .commit_has_assets(ds, chash, &remote_assets)
                .await?
            {
                matching.push(chash.clone());
            }
        }
        if matching.len() >= 2 {
            anyhow::bail!(
                "Commits both before and after {} have matching asset metadata",
                dandiset.version().created,
            );
        }
        let release_branch = format!("release-{version_id}");
        if let Some(commitish) = matching.first() {
            tracing::info!(
                commit = %commitish,
                "Found commit with matching asset metadata; updating Dandiset metadata",
            );
            ds.call_git(["checkout", "-b", &release_branch, commitish])
                .await?;
            update_dandiset_metadata(dandiset, ds).await?;
            tracing::debug!("Committing changes");
            ds.save(
                &format!("[backups2datalad] {DANDISET_METADATA_FILE} updated"),
                Some(dandiset.version().created),
            )
            .await?;
            tracing::debug!("Commit made");
        } else {
            tracing::info!(
                version = %version_id,
                "Assets in candidate commits do not match assets in version; syncing",
            );
            ds.call_git(["checkout", "-b", &release_branch, &base])
                .await?;
            self.sync_dataset(dandiset, ds).await?;
        }
        {
            let mut cmd = Command::new("git");
            cmd.args(GIT_OPTIONS)
                .args([
                    "tag",
                    "-m",
                    &format!(
                        "Version {version_id} of Dandiset {}",
                        dandiset.identifier()
                    ),
                    version_id.as_str(),
                ])
                .current_dir(ds.path())
                .env("GIT_COMMITTER_NAME", COMMIT_AUTHOR_NAME)
                .env("GIT_COMMITTER_EMAIL", COMMIT_AUTHOR_EMAIL);
            if let Ok(date) = dandiset.version().created.format(&Rfc3339) {
                cmd.env("GIT_COMMITTER_DATE", date);
            }
            crate::procio::run_command(&mut cmd).await?;
        }
        ds.call_git(["checkout", crate::consts::DEFAULT_BRANCH])
            .await?;
        ds.call_git(["branch", "-D", &release_branch]).await?;
        if push {
            ds.call_git(["push", "github", version_id.as_str()]).await?;
        }
        Ok(())
    }

    /// Does `assets.json` at the given commit describe exactly the given
    /// remote assets?
    async fn commit_has_assets(
        &self,
        ds: &Arc<AsyncDataset>,
        commit_hash: &str,
        remote_assets: &[Asset],
    ) -> anyhow::Result<bool> {
        let Ok(blob) = ds
            .read_git(["show", &format!("{commit_hash}:.dandi/assets.json")])
            .await
        else {
            return Ok(false);
        };
        let Ok(repo_assets) = serde_json::from_str::<Vec<serde_json::Value>>(&blob) else {
            return Ok(false);
        };
        if remote_assets.is_empty() && repo_assets.is_empty() {
            return Ok(true);
        }
        let well_formed = repo_assets
            .first()
            .is_some_and(|a| a.is_object() && a.get("asset_id").is_some());
        Ok(well_formed && assets_eq(remote_assets, &repo_assets))
    }

    /// Total file count & byte size of a Dandiset, Zarr submodules included,
    /// plus the per-Zarr stats
    async fn get_dandiset_stats(
        &self,
        ds: &Arc<AsyncDataset>,
    ) -> anyhow::Result<(DatasetStats, BTreeMap<String, DatasetStats>)> {
        if let Some(stats) = ds.get_stored_stats().await? {
            // Stats were stored and the dataset has not changed since then
            return Ok((stats, BTreeMap::new()));
        }
        tracing::info!("Counting up files ...");
        let mut files = 0;
        let mut size = 0;
        let mut substats: BTreeMap<String, DatasetStats> = BTreeMap::new();
        let submodules = ds
            .get_submodules()
            .await?
            .into_iter()
            .map(|sub| (sub.path.clone(), sub))
            .collect::<BTreeMap<_, _>>();
        for filestat in ds.get_file_stats().await? {
            if crate::util::is_meta_file(&filestat.path, true) {
                continue;
            }
            if filestat.kind == ObjectType::Commit {
                // The Zarr need not be present locally as an installed
                // submodule, so its stats come from its own repository.
                let sub = submodules.get(&filestat.path).with_context(|| {
                    format!("no .gitmodules entry for submodule {:?}", filestat.path)
                })?;
                let zarr_id = extract_repo_name(&sub.url);
                let zarr_stat = match substats.get(&zarr_id) {
                    Some(stat) => *stat,
                    None => {
                        let zarr_root = self
                            .manager
                            .config
                            .zarr_root()
                            .context("Zarr submodule found but Zarr backups not configured")?;
                        let zarr_ds = AsyncDataset::new(zarr_root.join(&zarr_id));
                        let stat = zarr_ds.get_flat_stats().await?;
                        substats.insert(zarr_id, stat);
                        stat
                    }
                };
                files += zarr_stat.files;
                size += zarr_stat.size;
            } else {
                files += 1;
                size += u64::try_from(filestat.size.unwrap_or(0)).unwrap_or(0);
            }
        }
        tracing::info!("Done counting up files");
        let stats = DatasetStats { files, size };
        ds.store_stats(stats).await?;
        Ok((stats, substats))
    }

    async fn set_dandiset_gh_metadata(
        &self,
        dandiset: &RemoteDandiset,
        ds: &Arc<AsyncDataset>,
    ) -> anyhow::Result<DatasetStats> {
        let (stats, zarrstats) = self.get_dandiset_stats(ds).await?;
        let (Some(gh), Some(org)) = (self.manager.gh.as_ref(), self.manager.config.gh_org())
        else {
            return Ok(stats);
        };
        let repo = crate::github::GHRepo::new(org, dandiset.identifier().as_str());
        tracing::info!(%repo, "Setting metadata");
        gh.edit_repository(
            &repo,
            &crate::github::RepoEdits {
                homepage: Some(format!(
                    "https://identifiers.org/DANDI:{}",
                    dandiset.identifier()
                )),
                description: Some(self.describe_dandiset(dandiset, &stats).await?),
                ..crate::github::RepoEdits::default()
            },
        )
        .await?;
        if let Some(zarr_org) = self.manager.config.zarr_gh_org() {
            for (zarr_id, zarr_stat) in &zarrstats {
                let zarr_repo = crate::github::GHRepo::new(zarr_org, zarr_id);
                tracing::info!(repo = %zarr_repo, "Setting metadata");
                gh.edit_repository(
                    &zarr_repo,
                    &crate::github::RepoEdits {
                        description: Some(crate::zarr::describe_zarr(zarr_stat)),
                        ..crate::github::RepoEdits::default()
                    },
                )
                .await?;
            }
        }
        Ok(stats)
    }

    /// `"<releases>, <contact>, <name>"` prefixed with file count and total
    /// size, for the hosted repository's description
    async fn describe_dandiset(
        &self,
        dandiset: &RemoteDandiset,
        stats: &DatasetStats,
    ) -> anyhow::Result<String> {
        let metadata = dandiset.get_raw_metadata().await?;
        let mut desc = metadata
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let contact = metadata
            .get("contributor")
            .and_then(serde_json::Value::as_array)
            .map(|contributors| {
                contributors
                    .iter()
                    .filter(|c| {
                        c.get("roleName")
                            .and_then(serde_json::Value::as_array)
                            .is_some_and(|roles| {
                                roles
                                    .iter()
                                    .any(|r| r.as_str() == Some("dandi:ContactPerson"))
                            })
                    })
                    .filter_map(|c| c.get("name").and_then(serde_json::Value::as_str))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        if !contact.is_empty() {
            desc = format!("{contact}, {desc}");
        }
        let releases = dandiset
            .get_versions()
            .try_filter(|v| std::future::ready(!v.version.is_draft()))
            .try_fold(0usize, |acc, _| std::future::ready(Ok(acc + 1)))
            .await?;
        if releases > 0 {
            desc = format!("{}, {desc}", quantify(releases, "release"));
        }
        let size = humansize::format_size(stats.size, humansize::DECIMAL);
        Ok(format!(
            "{}, {size}, {desc}",
            quantify(usize::try_from(stats.files).unwrap_or(usize::MAX), "file"),
        ))
    }

    async fn set_superds_description(
        &self,
        superds: &AsyncDataset,
        ds_stats: &[DatasetStats],
    ) -> anyhow::Result<()> {
        let (Some(gh), Ok(url)) = (self.manager.gh.as_ref(), superds.get_remote_url().await)
        else {
            return Ok(());
        };
        tracing::info!("Setting repository description for superdataset");
        let repo = crate::github::GHRepo::parse_url(&url)?;
        let total_size =
            humansize::format_size(ds_stats.iter().map(|s| s.size).sum::<u64>(), humansize::DECIMAL);
        let desc = format!(
            "{}, {total_size} total.  DataLad super-dataset of all Dandisets from https://github.com/dandisets",
            quantify(ds_stats.len(), "Dandiset"),
        );
        gh.edit_repository(
            &repo,
            &crate::github::RepoEdits {
                description: Some(desc),
                ..crate::github::RepoEdits::default()
            },
        )
        .await?;
        Ok(())
    }
}

/// Refresh the `dandiset.yaml` file from the server's raw version metadata
pub(crate) async fn update_dandiset_metadata(
    dandiset: &RemoteDandiset,
    ds: &AsyncDataset,
) -> anyhow::Result<()> {
    tracing::info!("Updating metadata file");
    let metadata = dandiset.get_raw_metadata().await?;
    let filepath = ds.path().join(DANDISET_METADATA_FILE);
    tokio::fs::write(&filepath, yaml_dump(&metadata))
        .await
        .with_context(|| format!("failed to write {}", filepath.display()))?;
    ds.add(DANDISET_METADATA_FILE).await?;
    Ok(())
}

/// Extract the tag name from `git describe --tags --long --always` output;
/// `None` when there are no tags on the branch
fn parse_describe(description: &str) -> Option<&str> {
    let (prefix, rev) = description.rsplit_once("-g")?;
    if rev.is_empty() || !rev.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let (tag, distance) = prefix.rsplit_once('-')?;
    if distance.is_empty() || !distance.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("0.210831.2033-0-g4ba4f77", Some("0.210831.2033"))]
    #[case("0.210831.2033-17-gdeadbeef", Some("0.210831.2033"))]
    #[case("4ba4f77", None)]
    #[case("", None)]
    fn parse_describe_output(#[case] description: &str, #[case] tag: Option<&str>) {
        assert_eq!(parse_describe(description), tag);
    }

    #[test]
    fn tag_ordering_uses_numeric_components() {
        assert!(version_key("0.220101.0001") > version_key("0.210831.2033"));
        assert!(version_key("0.210831.2033") > version_key("0.210831.1924"));
    }
}
