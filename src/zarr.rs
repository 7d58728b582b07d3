//! Independent sub-sync for one Zarr: reconcile the Zarr's backup repository
//! against the latest object versions under its S3 prefix, then verify the
//! tree checksum against what the Archive reports.
use crate::annex::{key2hash, AsyncAnnex};
use crate::checksum::ZarrChecksumTree;
use crate::config::ZarrMode;
use crate::consts::MAX_ZARR_SYNCS;
use crate::dandi::{Asset, EmbargoStatus, RemoteDandiset};
use crate::dataset::AsyncDataset;
use crate::downloader::annex_key_of_symlink;
use crate::github::{GHRepo, RepoEdits};
use crate::manager::Manager;
use crate::paths::PurePath;
use crate::s3::{ObjectStore, VersionEvent};
use crate::util::{is_meta_file, maxdatetime, quantify, UnexpectedChange};
use anyhow::Context;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

static CHECKSUM_FILE: &str = ".dandi/zarr-checksum";
static OLD_CHECKSUM_FILE: &str = ".zarr-checksum";
static SYNC_FILE: &str = ".dandi/s3sync.json";

/// The S3 resume cursor stored in each Zarr repository
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct SyncData {
    pub(crate) bucket: String,
    pub(crate) prefix: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub(crate) last_modified: Option<OffsetDateTime>,
}

/// Results of one Zarr sub-sync, fed back to the parent Dandiset sync
#[derive(Clone, Debug)]
pub(crate) struct ZarrLink {
    pub(crate) zarr_dspath: PathBuf,
    /// Commit timestamp of the Zarr repo's new HEAD, set only if a commit
    /// was made
    pub(crate) timestamp: Option<OffsetDateTime>,
    /// Paths in the Dandiset at which this Zarr appears
    pub(crate) asset_paths: Vec<String>,
    pub(crate) commit_hash: Option<String>,
}

/// One entry of the Zarr, as reported by the versioned S3 listing
#[derive(Clone, Debug, Eq, PartialEq)]
struct ZarrEntry {
    path: PurePath,
    size: i64,
    md5_digest: String,
    last_modified: OffsetDateTime,
    bucket_url: String,
}

/// Counters for one Zarr sub-sync
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ZarrReport {
    pub(crate) added: usize,
    pub(crate) updated: usize,
    pub(crate) deleted: usize,
    pub(crate) checksum: bool,
}

impl ZarrReport {
    pub(crate) fn is_empty(&self) -> bool {
        !(self.added > 0 || self.updated > 0 || self.deleted > 0 || self.checksum)
    }

    pub(crate) fn get_summary(&self) -> String {
        let mut msgparts = Vec::new();
        if self.added > 0 {
            msgparts.push(format!("{} added", quantify(self.added, "file")));
        }
        if self.updated > 0 {
            msgparts.push(format!("{} updated", quantify(self.updated, "file")));
        }
        if self.deleted > 0 {
            msgparts.push(format!("{} deleted", quantify(self.deleted, "file")));
        }
        if self.checksum {
            msgparts.push(String::from("checksum updated"));
        }
        if msgparts.is_empty() {
            msgparts.push(String::from("No changes"));
        }
        msgparts.join(", ")
    }
}

struct ZarrSyncer<'a> {
    asset: &'a Asset,
    zarr_id: String,
    ds: &'a AsyncDataset,
    annex: &'a AsyncAnnex,
    dandiset: &'a RemoteDandiset,
    store: Arc<ObjectStore>,
    mode: ZarrMode,
    backup_remote: Option<String>,
    /// The tree checksum the Archive reported for the Zarr asset at
    /// enumeration time, if any
    checksum: Option<String>,
    error_on_change: bool,
    last_timestamp: Option<OffsetDateTime>,
    report: ZarrReport,
    local_checksum: Option<String>,
}

impl ZarrSyncer<'_> {
    fn repo(&self) -> &Path {
        self.ds.path()
    }

    fn s3prefix(&self) -> String {
        format!("zarr/{}/", self.zarr_id)
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let last_sync = self.read_sync_file()?;
        let mut to_delete = self
            .annex
            .list_files(None)
            .await?
            .into_iter()
            .filter(|f| !is_meta_file(f, false))
            .collect::<BTreeSet<_>>();
        if !self.needs_sync(last_sync, &to_delete).await? {
            tracing::info!(zarr = %self.zarr_id, "backup up to date");
            return Ok(());
        }
        tracing::info!(zarr = %self.zarr_id, "sync needed");
        let prefix = self.s3prefix();
        let mut attempts = 0;
        let final_checksum = loop {
            let orig_checksum = self.get_local_checksum().await?;
            let mut zcc = ZarrChecksumTree::new();
            let mut to_update: Vec<ZarrEntry> = Vec::new();
            {
                let store = self.store.clone();
                let events = store.list_entry_versions(&prefix);
                let mut events = std::pin::pin!(events);
                while let Some(event) = events.try_next().await? {
                    let version = match event {
                        VersionEvent::DeleteMarker { last_modified } => {
                            self.last_timestamp =
                                Some(maxdatetime(self.last_timestamp, last_modified));
                            continue;
                        }
                        VersionEvent::Entry(v) => v,
                    };
                    self.last_timestamp =
                        Some(maxdatetime(self.last_timestamp, version.last_modified));
                    let entry_path = version
                        .key
                        .strip_prefix(&prefix)
                        .with_context(|| {
                            format!("S3 key {:?} lacks prefix {prefix:?}", version.key)
                        })?
                        .parse::<PurePath>()
                        .with_context(|| {
                            format!("S3 key {:?} is not a well-formed entry path", version.key)
                        })?;
                    if is_meta_file(entry_path.as_str(), false) {
                        anyhow::bail!(
                            "Zarr {} contains file at meta path {entry_path:?}",
                            self.zarr_id,
                        );
                    }
                    let entry = ZarrEntry {
                        bucket_url: self.store.versioned_url(&version.key, &version.version_id),
                        path: entry_path,
                        size: version.size,
                        md5_digest: version.etag,
                        last_modified: version.last_modified,
                    };
                    tracing::debug!(zarr = %self.zarr_id, entry = %entry.path, "Syncing");
                    zcc.add_leaf(
                        &entry.path,
                        u64::try_from(entry.size).unwrap_or_default(),
                        &entry.md5_digest,
                    );
                    to_delete.remove(entry.path.as_str());
                    if self.mode == ZarrMode::Timestamp {
                        if let Some(ls) = last_sync {
                            if entry.last_modified < ls {
                                tracing::debug!(
                                    zarr = %self.zarr_id,
                                    entry = %entry.path,
                                    "file not modified since last backup",
                                );
                                continue;
                            }
                        }
                        self.check_change(&format!("entry {:?} was modified/added", entry.path))?;
                    }
                    let dest = self.repo().join(entry.path.as_str());
                    let mut conflicted = false;
                    if dest.is_dir() {
                        // File path is replacing a directory, which needs to
                        // be deleted
                        self.check_change(&format!(
                            "path type conflict between server & backup for {:?}",
                            entry.path,
                        ))?;
                        tracing::debug!(
                            zarr = %self.zarr_id,
                            entry = %entry.path,
                            "deleting conflicting directory at same path",
                        );
                        to_delete.extend(self.under_tree(entry.path.as_str()).await?);
                        conflicted = true;
                    } else {
                        for ep in entry.path.parents() {
                            let pp = self.repo().join(ep);
                            let Ok(meta) = std::fs::symlink_metadata(&pp) else {
                                continue;
                            };
                            if meta.file_type().is_file() || meta.file_type().is_symlink() {
                                // Annexed file at a parent path of `entry`
                                // needs to be replaced with a directory
                                self.check_change(&format!(
                                    "backup path {ep:?} conflicts with server path {:?}",
                                    entry.path,
                                ))?;
                                tracing::debug!(
                                    zarr = %self.zarr_id,
                                    entry = %entry.path,
                                    conflict = %ep,
                                    "deleting conflicting file path",
                                );
                                to_delete.insert(ep.to_owned());
                                conflicted = true;
                                break;
                            } else if meta.is_dir() {
                                break;
                            }
                        }
                    }
                    let present =
                        std::fs::symlink_metadata(&dest).is_ok();
                    if conflicted || !present {
                        self.check_change(&format!("entry {:?} added", entry.path))?;
                        tracing::debug!(
                            zarr = %self.zarr_id,
                            entry = %entry.path,
                            "Not in dataset; will add",
                        );
                        self.report.added += 1;
                        to_update.push(entry);
                    } else {
                        tracing::debug!(
                            zarr = %self.zarr_id,
                            entry = %entry.path,
                            "About to fetch hash from annex",
                        );
                        if entry.md5_digest == self.get_annex_hash(&dest).await? {
                            tracing::debug!(
                                zarr = %self.zarr_id,
                                entry = %entry.path,
                                "File in dataset, and hash shows no modification; will not update",
                            );
                        } else {
                            self.check_change(&format!("entry {:?} modified", entry.path))?;
                            tracing::debug!(
                                zarr = %self.zarr_id,
                                entry = %entry.path,
                                "File in dataset, and hash shows modification; will update",
                            );
                            to_delete.insert(entry.path.to_string());
                            self.report.updated += 1;
                            to_update.push(entry);
                        }
                    }
                }
            }
            self.prune_deleted(std::mem::take(&mut to_delete)).await?;
            for entry in &to_update {
                let key = self
                    .annex
                    .mkkey(
                        entry.path.name_str(),
                        entry.size,
                        &entry.md5_digest,
                    )
                    .await?;
                let remotes = self.annex.get_key_remotes(&key).await?;
                self.annex.from_key(&key, entry.path.as_str()).await?;
                self.register_url(&entry.path, &key, &entry.bucket_url)
                    .await?;
                let api_url = self
                    .dandiset
                    .client()
                    .zarr_file_url(&self.zarr_id, &entry.path);
                self.register_url(&entry.path, &key, api_url.as_str())
                    .await?;
                if let (Some(remotes), Some(backup)) = (remotes, self.backup_remote.as_ref()) {
                    if !remotes.contains(backup) {
                        tracing::info!(
                            zarr = %self.zarr_id,
                            entry = %entry.path,
                            remote = %backup,
                            "Not in backup remote",
                        );
                    }
                }
            }
            let final_checksum = zcc.process()?;
            let modern_asset = self.dandiset.get_asset(self.asset.asset_id()).await?;
            let changed_during_sync = self.asset.modified() != modern_asset.modified();
            if changed_during_sync {
                tracing::info!(
                    zarr = %self.zarr_id,
                    "`modified` timestamp on server changed during backup",
                );
                if orig_checksum != final_checksum {
                    tracing::info!(zarr = %self.zarr_id, "Local content changed during sync");
                }
            }
            match modern_asset.zarr_checksum() {
                None => {
                    tracing::info!(zarr = %self.zarr_id, "Checksum still not available from server");
                }
                Some(remote_checksum) if remote_checksum != final_checksum => {
                    if changed_during_sync {
                        tracing::warn!(
                            zarr = %self.zarr_id,
                            local = %final_checksum,
                            remote = %remote_checksum,
                            "Zarr was modified during backup and there is a checksum mismatch",
                        );
                    } else {
                        attempts += 1;
                        if attempts < MAX_ZARR_SYNCS {
                            tracing::warn!(
                                zarr = %self.zarr_id,
                                local = %final_checksum,
                                remote = %remote_checksum,
                                "Local checksum differs from remote checksum after backup, and no change on server was detected; running sync again",
                            );
                            continue;
                        }
                        anyhow::bail!(
                            "Zarr {}: local checksum {final_checksum:?} differs from remote checksum {remote_checksum:?} after backup, and no change on server was detected",
                            self.zarr_id,
                        );
                    }
                }
                Some(_) => (),
            }
            break final_checksum;
        };
        if self.get_stored_checksum()?.as_deref() != Some(&final_checksum) {
            self.check_change("checksum modified")?;
            tracing::info!(zarr = %self.zarr_id, "Updating checksum file");
            let checksum_path = self.repo().join(CHECKSUM_FILE);
            if let Some(parent) = checksum_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&checksum_path, format!("{final_checksum}\n")).await?;
            self.report.checksum = true;
            self.ds.add(CHECKSUM_FILE).await?;
        }
        // Remove a possibly still-present previous location for the checksum
        // file:
        if self.repo().join(OLD_CHECKSUM_FILE).exists() {
            if self.error_on_change {
                return Err(UnexpectedChange(format!(
                    "Dandiset {}: Zarr {}: old checksum file present, but we are in verify mode",
                    self.dandiset.identifier(),
                    self.zarr_id,
                ))
                .into());
            }
            self.ds.remove(OLD_CHECKSUM_FILE).await?;
        }
        self.write_sync_file()?;
        self.ds.add(SYNC_FILE).await?;
        Ok(())
    }

    fn read_sync_file(&self) -> anyhow::Result<Option<OffsetDateTime>> {
        let sync_file_path = self.repo().join(SYNC_FILE);
        let data = match std::fs::read_to_string(&sync_file_path) {
            Ok(src) => serde_json::from_str::<SyncData>(&src)
                .with_context(|| format!("malformed {}", sync_file_path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", sync_file_path.display()))
            }
        };
        if data.bucket != self.store.bucket() {
            anyhow::bail!(
                "Bucket {:?} for Zarr {} does not match bucket in {SYNC_FILE} ({:?})",
                self.store.bucket(),
                self.zarr_id,
                data.bucket,
            );
        }
        if data.prefix != self.s3prefix() {
            anyhow::bail!(
                "Key prefix {:?} for Zarr {} does not match prefix in {SYNC_FILE} ({:?})",
                self.s3prefix(),
                self.zarr_id,
                data.prefix,
            );
        }
        Ok(data.last_modified)
    }

    fn write_sync_file(&self) -> anyhow::Result<()> {
        let data = SyncData {
            bucket: self.store.bucket().to_owned(),
            prefix: self.s3prefix(),
            last_modified: self.last_timestamp,
        };
        let path = self.repo().join(SYNC_FILE);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut blob = serde_json::to_string_pretty(&data)?;
        blob.push('\n');
        std::fs::write(&path, blob)?;
        Ok(())
    }

    /// Decide per the configured mode whether the Zarr needs a full sync
    async fn needs_sync(
        &mut self,
        last_sync: Option<OffsetDateTime>,
        local_paths: &BTreeSet<String>,
    ) -> anyhow::Result<bool> {
        match self.mode {
            ZarrMode::Force => Ok(true),
            ZarrMode::Timestamp => {
                let Some(last_sync) = last_sync else {
                    return Ok(true);
                };
                // We fetch a list of all objects from the server here (using
                // the cheap unversioned listing) in order to decide whether
                // to sync; the actual syncing then fetches all objects again
                // with `list_object_versions`, the only endpoint that
                // includes version IDs but also a considerably slower one.
                // This optimizes for the presumed-common case of Zarrs rarely
                // being modified.
                let mut local_paths = local_paths.clone();
                let prefix = self.s3prefix();
                let store = self.store.clone();
                let objects = store.list_objects(&prefix);
                let mut objects = std::pin::pin!(objects);
                while let Some(obj) = objects.try_next().await? {
                    let path = obj.key[prefix.len()..].to_owned();
                    if !local_paths.remove(&path) {
                        self.check_change(&format!("entry {path:?} added"))?;
                        tracing::info!(zarr = %self.zarr_id, %path, "on server but not in backup");
                        return Ok(true);
                    }
                    if obj.last_modified > last_sync {
                        self.check_change(&format!("entry {path:?} modified"))?;
                        tracing::info!(
                            zarr = %self.zarr_id,
                            %path,
                            modified = %obj.last_modified,
                            last_sync = %last_sync,
                            "modified on server after last sync",
                        );
                        return Ok(true);
                    }
                }
                if !local_paths.is_empty() {
                    self.check_change(&format!(
                        "{} deleted",
                        quantify(local_paths.len(), "file")
                    ))?;
                    tracing::info!(
                        zarr = %self.zarr_id,
                        "{} in local backup but no longer on server",
                        quantify(local_paths.len(), "file"),
                    );
                    return Ok(true);
                }
                Ok(false)
            }
            ZarrMode::Checksum | ZarrMode::AssetChecksum => {
                let Some(stored_checksum) = self.get_stored_checksum()? else {
                    tracing::info!(zarr = %self.zarr_id, "No checksum stored for Zarr");
                    return Ok(true);
                };
                if Some(&stored_checksum) != self.checksum.as_ref() {
                    self.check_change("Checksum on server differs from stored checksum")?;
                    tracing::info!(
                        zarr = %self.zarr_id,
                        "Checksum on server differs from stored checksum",
                    );
                    Ok(true)
                } else if stored_checksum != self.get_local_checksum().await? {
                    self.check_change("Checksum computed for local entries is not as expected")?;
                    tracing::info!(
                        zarr = %self.zarr_id,
                        "Checksum computed for local entries is not as expected",
                    );
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// All committed files under the given directory path
    async fn under_tree(&self, dirpath: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.annex.list_files(Some(dirpath)).await?)
    }

    /// Delete the given paths and prune any directories thereby left empty
    async fn prune_deleted(&mut self, to_delete: BTreeSet<String>) -> anyhow::Result<()> {
        if !to_delete.is_empty() {
            self.check_change(&format!(
                "{} deleted from Zarr",
                quantify(to_delete.len(), "file")
            ))?;
        }
        tracing::info!(zarr = %self.zarr_id, "deleting extra files");
        for p in &to_delete {
            tracing::debug!(zarr = %self.zarr_id, path = %p, "deleting");
        }
        self.report.deleted += to_delete.len();
        self.ds.remove_batch(to_delete.iter()).await?;
        for p in &to_delete {
            let mut d = self.repo().join(p);
            while d.pop() && d != self.repo() {
                let empty = std::fs::read_dir(&d)
                    .map(|mut entries| entries.next().is_none())
                    .unwrap_or(false);
                if !empty {
                    break;
                }
                let _ = std::fs::remove_dir(&d);
            }
        }
        tracing::info!(zarr = %self.zarr_id, "finished deleting extra files");
        Ok(())
    }

    /// Zarr entries must resolve into the annex; a plain file here means the
    /// backup is corrupt
    async fn get_annex_hash(&self, filepath: &Path) -> anyhow::Result<String> {
        match annex_key_of_symlink(filepath).await? {
            Some(key) => Ok(key2hash(&key).to_owned()),
            None => anyhow::bail!("{} unexpectedly not under git-annex", filepath.display()),
        }
    }

    async fn register_url(
        &self,
        path: &PurePath,
        key: &str,
        url: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(zarr = %self.zarr_id, entry = %path, url, "Registering URL");
        self.annex.register_url(key, url).await?;
        Ok(())
    }

    async fn get_local_checksum(&mut self) -> anyhow::Result<String> {
        if self.local_checksum.is_none() {
            self.local_checksum = Some(self.ds.compute_zarr_checksum().await?);
        }
        Ok(self
            .local_checksum
            .clone()
            .expect("local checksum was just computed"))
    }

    fn get_stored_checksum(&self) -> anyhow::Result<Option<String>> {
        match std::fs::read_to_string(self.repo().join(CHECKSUM_FILE)) {
            Ok(s) => Ok(Some(s.trim().to_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read stored checksum"),
        }
    }

    /// In verify mode, any would-be mutation is an unexpected change
    fn check_change(&self, event: &str) -> Result<(), UnexpectedChange> {
        if self.error_on_change {
            Err(UnexpectedChange(format!(
                "Dandiset {}: Zarr {}: {event}, but Dandiset draft timestamp was not updated on server",
                self.dandiset.identifier(),
                self.zarr_id,
            )))
        } else {
            Ok(())
        }
    }
}

/// Back up one Zarr into its own repository, bounded by the global Zarr
/// capacity limiter, and record the outcome in `link`
pub(crate) async fn sync_zarr(
    asset: Asset,
    checksum: Option<String>,
    dsdir: PathBuf,
    manager: Manager,
    dandiset: RemoteDandiset,
    link: Option<Arc<Mutex<ZarrLink>>>,
    error_on_change: bool,
) -> anyhow::Result<()> {
    let _permit = manager
        .zarr_limit
        .clone()
        .acquire_owned()
        .await
        .context("Zarr capacity limiter unexpectedly closed")?;
    let zarr_id = asset
        .zarr_id()
        .context("sync_zarr called on a non-Zarr asset")?
        .to_owned();
    let zarrs_cfg = manager
        .config
        .zarrs
        .as_ref()
        .context("Zarr backups not configured in config file")?;
    let ds = AsyncDataset::new(&dsdir);
    if error_on_change && !ds.path().exists() {
        return Err(UnexpectedChange(format!(
            "Dandiset {}: Zarr {zarr_id} added to Dandiset at {:?} but draft timestamp was not updated on server",
            dandiset.identifier(),
            asset.path().as_str(),
        ))
        .into());
    }
    ds.ensure_installed(
        &format!("Zarr {zarr_id}"),
        Some(asset.created()),
        zarrs_cfg.remote.as_ref(),
        "MD5E",
        false,
        EmbargoStatus::Open,
    )
    .await?;
    if !ds.path().join(".dandi").join(".gitattributes").exists() {
        tracing::debug!(zarr = %zarr_id, "Excluding .dandi/ from git-annex");
        tokio::fs::create_dir_all(ds.path().join(".dandi")).await?;
        tokio::fs::write(
            ds.path().join(".dandi").join(".gitattributes"),
            "* annex.largefiles=nothing\n",
        )
        .await?;
        ds.add(".dandi/.gitattributes").await?;
        ds.commit(
            "Exclude .dandi/ from git-annex",
            Some(asset.created()),
            &[".dandi/.gitattributes"],
            false,
        )
        .await?;
    }
    if let Some(zgh) = manager.config.zarr_gh_org() {
        if !ds.has_github_remote().await? {
            if let Some(gh) = manager.gh.as_ref() {
                gh.create_repository(&GHRepo::new(zgh, &zarr_id), false)
                    .await?;
            }
            ds.create_github_sibling(zgh, &zarr_id, zarrs_cfg.remote.as_ref())
                .await?;
        }
    }
    if ds.is_dirty().await? {
        anyhow::bail!(
            "Zarr {zarr_id} in Dandiset {} is dirty; clean or save before running",
            dandiset.identifier(),
        );
    }
    let annex = AsyncAnnex::new(dsdir.clone(), "MD5");
    let store = manager.object_store().await?;
    let mut zsync = ZarrSyncer {
        asset: &asset,
        zarr_id: zarr_id.clone(),
        ds: &ds,
        annex: &annex,
        dandiset: &dandiset,
        store,
        mode: manager.config.zarr_mode,
        backup_remote: zarrs_cfg.remote.as_ref().map(|r| r.name.clone()),
        checksum,
        error_on_change,
        last_timestamp: None,
        report: ZarrReport::default(),
        local_checksum: None,
    };
    let run_result = zsync.run().await;
    if run_result.is_ok() {
        annex.shutdown().await?;
    }
    run_result?;
    let report = zsync.report;
    let last_timestamp = zsync.last_timestamp;
    if !report.is_empty() || ds.is_dirty().await? {
        let summary = if report.is_empty() {
            String::from("No changes to zarr content, some other changes")
        } else {
            report.get_summary()
        };
        tracing::info!(zarr = %zarr_id, "{summary}; committing");
        let commit_ts = last_timestamp.unwrap_or_else(|| asset.created());
        ds.commit(
            &format!("[backups2datalad] {summary}"),
            Some(commit_ts),
            &[],
            true,
        )
        .await?;
        tracing::debug!(zarr = %zarr_id, "Commit made; running `git gc`");
        ds.gc().await?;
        if manager.config.zarr_gh_org().is_some() {
            tracing::debug!(zarr = %zarr_id, "Pushing to GitHub");
            ds.push(
                "github",
                manager.config.jobs,
                manager.config.should_force_push_zarrs(),
            )
            .await?;
            tracing::debug!(zarr = %zarr_id, "Finished pushing to GitHub");
        }
        if let Some(link) = link.as_ref() {
            link.lock().expect("mutex poisoned").timestamp = Some(commit_ts);
        }
    } else {
        tracing::info!(zarr = %zarr_id, "no changes; not committing");
    }
    if let Some(link) = link.as_ref() {
        if let (Some(gh), Some(zgh)) = (manager.gh.as_ref(), manager.config.zarr_gh_org()) {
            let stats = ds.get_flat_stats().await?;
            gh.edit_repository(
                &GHRepo::new(zgh, &zarr_id),
                &RepoEdits {
                    description: Some(describe_zarr(&stats)),
                    ..RepoEdits::default()
                },
            )
            .await?;
        }
        link.lock().expect("mutex poisoned").commit_hash = Some(ds.get_commit_hash().await?);
    }
    Ok(())
}

/// `"N files, X B"`
pub(crate) fn describe_zarr(stats: &crate::dataset::DatasetStats) -> String {
    let size = humansize::format_size(stats.size, humansize::DECIMAL);
    format!(
        "{}, {size}",
        quantify(usize::try_from(stats.files).unwrap_or(usize::MAX), "file")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(ZarrReport::default(), "No changes")]
    #[case(ZarrReport { added: 18, ..ZarrReport::default() }, "18 files added")]
    #[case(
        ZarrReport { added: 1, updated: 2, deleted: 3, checksum: true },
        "1 file added, 2 files updated, 3 files deleted, checksum updated"
    )]
    #[case(
        ZarrReport { deleted: 16, checksum: true, ..ZarrReport::default() },
        "16 files deleted, checksum updated"
    )]
    fn summaries(#[case] report: ZarrReport, #[case] expected: &str) {
        assert_eq!(report.get_summary(), expected);
        assert_eq!(report.is_empty(), expected == "No changes");
    }

    #[test]
    fn sync_data_roundtrip() {
        let data = SyncData {
            bucket: String::from("dandiarchive"),
            prefix: String::from("zarr/7e10ceaf-ea72-4bd0-be23-8a0a2bd4d6a7/"),
            last_modified: Some(time::macros::datetime!(2022-04-12 16:23:44 UTC)),
        };
        let blob = serde_json::to_string_pretty(&data).unwrap();
        assert!(
            blob.contains("2022-04-12T16:23:44Z"),
            "timestamp missing from {blob}"
        );
        assert_eq!(serde_json::from_str::<SyncData>(&blob).unwrap(), data);
    }

    #[test]
    fn sync_data_without_cursor() {
        let data =
            serde_json::from_str::<SyncData>(r#"{"bucket": "b", "prefix": "zarr/x/", "last_modified": null}"#)
                .unwrap();
        assert_eq!(data.last_modified, None);
    }

    #[test]
    fn describe_zarr_formats_sizes() {
        let desc = describe_zarr(&crate::dataset::DatasetStats {
            files: 18,
            size: 150,
        });
        assert_eq!(desc, "18 files, 150 B");
    }
}
