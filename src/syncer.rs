//! Per-Dandiset sync driver: embargo transitions, asset sync, deletion
//! pruning, metadata dump, and the summary commit message
use crate::dandi::{EmbargoStatus, RemoteDandiset};
use crate::dataset::AsyncDataset;
use crate::downloader::{async_assets, Report};
use crate::github::{GHRepo, RepoEdits};
use crate::manager::Manager;
use crate::register_s3::register_s3urls;
use crate::tracker::AssetTracker;
use crate::util::{quantify, UnexpectedChange};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Convert an SSH GitHub URL to an HTTPS URL.
///
/// Example: `git@github.com:org/repo` → `https://github.com/org/repo`
pub(crate) fn ssh_to_https_url(url: &str) -> String {
    match url
        .strip_prefix("git@github.com:")
        .map(|path| path.strip_suffix(".git").unwrap_or(path))
    {
        Some(path) => format!("https://github.com/{path}"),
        None => url.to_owned(),
    }
}

/// Convert an HTTPS GitHub URL to an SSH URL.
///
/// Example: `https://github.com/org/repo` → `git@github.com:org/repo`
pub(crate) fn https_to_ssh_url(url: &str) -> String {
    match url
        .strip_prefix("https://github.com/")
        .map(|path| path.strip_suffix(".git").unwrap_or(path))
    {
        Some(path) => format!("git@github.com:{path}"),
        None => url.to_owned(),
    }
}

/// Extract the repository name from a GitHub URL (SSH or HTTPS), falling
/// back to the final path component for plain filesystem URLs
pub(crate) fn extract_repo_name(url: &str) -> String {
    if let Ok(repo) = GHRepo::parse_url(url) {
        return repo.name;
    }
    let name = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
    name.strip_suffix(".git").unwrap_or(name).to_owned()
}

#[derive(Clone, Debug)]
struct SubmoduleUpdate {
    status: &'static str,
    new_url: String,
    full_path: std::path::PathBuf,
    url_changed: bool,
}

/// Drives one Dandiset's backup from start to finish
#[derive(Debug)]
pub(crate) struct Syncer {
    pub(crate) manager: Manager,
    pub(crate) dandiset: RemoteDandiset,
    pub(crate) ds: Arc<AsyncDataset>,
    pub(crate) tracker: Arc<Mutex<AssetTracker>>,
    pub(crate) error_on_change: bool,
    pub(crate) deleted: usize,
    pub(crate) garbage_assets: Vec<String>,
    pub(crate) report: Report,
}

impl Syncer {
    pub(crate) fn new(
        manager: Manager,
        dandiset: RemoteDandiset,
        ds: Arc<AsyncDataset>,
        tracker: Arc<Mutex<AssetTracker>>,
        error_on_change: bool,
    ) -> Syncer {
        Syncer {
            manager,
            dandiset,
            ds,
            tracker,
            error_on_change,
            deleted: 0,
            garbage_assets: Vec::new(),
            report: Report::default(),
        }
    }

    /// Reconcile the repository's recorded embargo status with the server's,
    /// performing the URL re-registration and privacy flips an
    /// embargoed → open transition requires
    pub(crate) async fn update_embargo_status(&mut self) -> anyhow::Result<()> {
        let old_status = self.ds.get_embargo_status().await?;
        let new_status = self.dandiset.embargo_status();
        if old_status == new_status {
            return Ok(());
        }
        if self.error_on_change {
            return Err(UnexpectedChange(format!(
                "Dandiset {}: Embargo status changed from {old_status} to {new_status} but timestamp was not updated on server",
                self.dandiset.identifier(),
            ))
            .into());
        }
        tracing::info!(
            dandiset = %self.dandiset.identifier(),
            %old_status,
            %new_status,
            "Updating embargo status",
        );
        self.ds.set_embargo_status(new_status).await?;
        let commit_date = self.ds.get_last_commit_date().await?;
        self.ds
            .save("[backups2datalad] Update embargo status", Some(commit_date))
            .await?;
        self.report.commits += 1;
        if old_status == EmbargoStatus::Embargoed && new_status == EmbargoStatus::Open {
            tracing::info!("Registering S3 URLs ...");
            register_s3urls(&self.manager, &self.dandiset, &self.ds).await?;
            tracing::info!("Disabling datalad special remote ...");
            self.ds.disable_dandi_provider().await?;
            if self.manager.config.gh_org().is_some() && self.ds.has_github_remote().await? {
                if let (Some(gh), Some(org)) =
                    (self.manager.gh.as_ref(), self.manager.config.gh_org())
                {
                    tracing::info!("Making GitHub repository public ...");
                    gh.edit_repository(
                        &GHRepo::new(org, self.dandiset.identifier().as_str()),
                        &RepoEdits {
                            private: Some(false),
                            ..RepoEdits::default()
                        },
                    )
                    .await?;
                }
                // Update GitHub access status for all Zarr repositories
                if self.manager.config.zarr_gh_org().is_some() {
                    self.update_zarr_repos_privacy(true).await?;
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn sync_assets(&mut self) -> anyhow::Result<()> {
        tracing::info!("Syncing assets...");
        let report = async_assets(
            &self.dandiset,
            &self.ds,
            &self.manager,
            &self.tracker,
            self.error_on_change,
        )
        .await?;
        tracing::info!("Asset sync complete!");
        tracing::info!("{} added", quantify(report.added, "asset"));
        tracing::info!("{} updated", quantify(report.updated, "asset"));
        tracing::info!("{} registered", quantify(report.registered, "asset"));
        tracing::info!(
            "{} successfully downloaded",
            quantify(report.downloaded, "asset")
        );
        report.check()?;
        self.report.update(&report);
        Ok(())
    }

    /// Remove assets that are in the backup but no longer on the server
    pub(crate) async fn prune_deleted(&mut self) -> anyhow::Result<()> {
        let deleted_paths = {
            let mut tracker = self.tracker.lock().expect("mutex poisoned");
            tracker.get_deleted(&self.manager.config)
        };
        for asset_path in deleted_paths {
            if self.error_on_change {
                return Err(UnexpectedChange(format!(
                    "Dandiset {}: Asset {asset_path:?} deleted from Dandiset but timestamp was not updated on server",
                    self.dandiset.identifier(),
                ))
                .into());
            }
            tracing::info!(
                asset = %asset_path,
                "Asset is in dataset but not in Dandiarchive; deleting",
            );
            self.ds.remove(&asset_path).await?;
            self.deleted += 1;
        }
        Ok(())
    }

    pub(crate) async fn dump_asset_metadata(&mut self) -> anyhow::Result<()> {
        self.garbage_assets = self
            .tracker
            .lock()
            .expect("mutex poisoned")
            .prune_metadata();
        if !self.garbage_assets.is_empty() && !self.manager.config.gc_assets {
            // to ease troubleshooting, list some of what would be GCed
            let mut listing = self
                .garbage_assets
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            if self.garbage_assets.len() > 3 {
                listing.push_str(&format!(" and {} more.", self.garbage_assets.len() - 3));
            }
            return Err(UnexpectedChange(format!(
                "Dandiset {}: {} garbage-collected from assets.json: {listing}",
                self.dandiset.identifier(),
                quantify(self.garbage_assets.len(), "asset"),
            ))
            .into());
        }
        self.tracker.lock().expect("mutex poisoned").dump()?;
        self.ds.add(".dandi/assets.json").await?;
        Ok(())
    }

    pub(crate) fn get_commit_message(&self) -> String {
        let mut msgparts = Vec::new();
        if !self.dandiset.version_id().is_draft() {
            if self.report.added > 0 {
                msgparts.push(format!("{} added", quantify(self.report.added, "file")));
            }
            if self.report.updated > 0 {
                msgparts.push(format!("{} updated", quantify(self.report.updated, "file")));
            }
        }
        if self.deleted > 0 {
            msgparts.push(format!("{} deleted", quantify(self.deleted, "file")));
        }
        if !self.garbage_assets.is_empty() {
            msgparts.push(format!(
                "{} garbage-collected from .dandi/assets.json",
                quantify(self.garbage_assets.len(), "asset"),
            ));
        }
        let futures = self.tracker.lock().expect("mutex poisoned").future_qty();
        if futures > 0 {
            msgparts.push(format!("{} not yet downloaded", quantify(futures, "asset")));
        }
        if msgparts.is_empty() {
            msgparts.push(String::from("Only some metadata updates"));
        }
        format!("[backups2datalad] {}", msgparts.join(", "))
    }

    /// Bring Zarr submodule URLs (SSH vs. HTTPS) and, optionally, the hosted
    /// repositories' privacy in line with the parent Dandiset's embargo
    /// status.  Returns `true` if any changes were made.
    pub(crate) async fn update_zarr_repos_privacy(
        &mut self,
        update_github: bool,
    ) -> anyhow::Result<bool> {
        let Some(zarr_gh_org) = self.manager.config.zarr_gh_org().map(str::to_owned) else {
            return Ok(false);
        };
        let is_embargoed = self.ds.get_embargo_status().await? == EmbargoStatus::Embargoed;
        let zarr_submodules = self
            .ds
            .get_submodules()
            .await?
            .into_iter()
            .filter(|sub| {
                let basename = Path::new(&sub.path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                crate::consts::ZARR_EXTENSIONS
                    .iter()
                    .any(|ext| basename.ends_with(ext))
            })
            .collect::<Vec<_>>();
        if zarr_submodules.is_empty() {
            return Ok(false);
        }
        let mut updates: BTreeMap<String, SubmoduleUpdate> = BTreeMap::new();
        for submodule in zarr_submodules {
            let old_url = submodule.url.clone();
            let zarr_id = extract_repo_name(&old_url);
            let is_ssh = old_url.starts_with("git@github.com:");
            let is_https = old_url.starts_with("https://github.com/");
            let (new_url, url_changed) = if is_embargoed && is_https {
                (https_to_ssh_url(&old_url), true)
            } else if !is_embargoed && is_ssh {
                (ssh_to_https_url(&old_url), true)
            } else {
                (old_url.clone(), false)
            };
            if !url_changed && !update_github {
                continue;
            }
            if update_github && self.manager.config.gh_org().is_some() {
                if let Some(gh) = self.manager.gh.as_ref() {
                    tracing::info!(
                        zarr = %zarr_id,
                        private = is_embargoed,
                        "Updating Zarr repository privacy",
                    );
                    gh.edit_repository(
                        &GHRepo::new(&zarr_gh_org, &zarr_id),
                        &RepoEdits {
                            private: Some(is_embargoed),
                            ..RepoEdits::default()
                        },
                    )
                    .await?;
                }
            }
            updates.insert(
                submodule.path.clone(),
                SubmoduleUpdate {
                    status: if is_embargoed { "private" } else { "public" },
                    new_url,
                    full_path: self.ds.path().join(&submodule.path),
                    url_changed,
                },
            );
        }
        if updates.is_empty() {
            return Ok(false);
        }
        if update_github {
            tracing::info!(
                count = updates.len(),
                "Updating github-access-status in .gitmodules for Zarr submodules",
            );
        } else {
            tracing::info!(
                count = updates.len(),
                "Fixing URLs in .gitmodules for Zarr submodules",
            );
        }
        for (path, info) in &updates {
            self.ds
                .set_repo_config(
                    &format!("submodule.{path}.github-access-status"),
                    info.status,
                    Some(".gitmodules"),
                )
                .await?;
            if info.url_changed {
                self.ds
                    .set_repo_config(
                        &format!("submodule.{path}.url"),
                        &info.new_url,
                        Some(".gitmodules"),
                    )
                    .await?;
            }
        }
        // Update local git config URLs in installed submodules too
        for (path, info) in &updates {
            if info.url_changed {
                tracing::debug!(
                    submodule = %path,
                    url = %info.new_url,
                    "Updating local git config URL",
                );
                let cfg_file = info.full_path.join(".git").join("config");
                self.ds
                    .call_git([
                        "config",
                        "--file",
                        &cfg_file.to_string_lossy(),
                        "remote.github.url",
                        &info.new_url,
                    ])
                    .await?;
            }
        }
        let commit_msg = if update_github {
            String::from("[backups2datalad] Update github-access-status for Zarr submodules")
        } else {
            let url_fix_count = updates.values().filter(|info| info.url_changed).count();
            format!("[backups2datalad] Fix {url_fix_count} Zarr submodule URL(s) for embargo status")
        };
        self.ds
            .commit_if_changed(&commit_msg, None, &[".gitmodules"], false)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("git@github.com:dandizarrs/7e10ceaf", "https://github.com/dandizarrs/7e10ceaf")]
    #[case(
        "git@github.com:dandizarrs/7e10ceaf.git",
        "https://github.com/dandizarrs/7e10ceaf"
    )]
    #[case("https://github.com/dandizarrs/7e10ceaf", "https://github.com/dandizarrs/7e10ceaf")]
    #[case("/backups/zarrs/7e10ceaf", "/backups/zarrs/7e10ceaf")]
    fn ssh_to_https(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(ssh_to_https_url(url), expected);
    }

    #[rstest]
    #[case("https://github.com/dandizarrs/7e10ceaf", "git@github.com:dandizarrs/7e10ceaf")]
    #[case(
        "https://github.com/dandizarrs/7e10ceaf.git",
        "git@github.com:dandizarrs/7e10ceaf"
    )]
    #[case("git@github.com:dandizarrs/7e10ceaf", "git@github.com:dandizarrs/7e10ceaf")]
    fn https_to_ssh(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(https_to_ssh_url(url), expected);
    }

    #[rstest]
    #[case("git@github.com:dandizarrs/7e10ceaf", "7e10ceaf")]
    #[case("https://github.com/dandizarrs/7e10ceaf.git", "7e10ceaf")]
    #[case("/backups/zarrs/7e10ceaf", "7e10ceaf")]
    fn repo_names(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(extract_repo_name(url), expected);
    }
}
