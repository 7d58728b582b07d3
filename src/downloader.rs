//! The core per-Dandiset sync engine: enumerate assets in `created` order,
//! decide per blob what to do, fan downloads into the long-lived `addurl`
//! worker, hand Zarrs off to their own syncers, and commit once per version
//! boundary.
use crate::annex::{AsyncAnnex, BatchProcess};
use crate::blob::BlobBackup;
use crate::config::ZarrMode;
use crate::consts::{MAX_TEXT_SIZE, UNHASHED_MAX_AGE};
use crate::dandi::{Asset, AssetEvent, DandisetId, DandisetVersion, RemoteDandiset};
use crate::dataset::{AssetsState, AsyncDataset};
use crate::httputil::HttpUrl;
use crate::manager::Manager;
use crate::procio::run_command;
use crate::tracker::AssetTracker;
use crate::util::{format_errors, maxdatetime, quantify, UnexpectedChange};
use crate::zarr::{sync_zarr, ZarrLink};
use anyhow::Context;
use futures_util::stream::FuturesUnordered;
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinSet;

/// Counters accumulated over one Dandiset sync
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Report {
    pub(crate) commits: usize,
    pub(crate) added: usize,
    pub(crate) updated: usize,
    pub(crate) registered: usize,
    pub(crate) downloaded: usize,
    pub(crate) failed: usize,
    pub(crate) hash_mismatches: usize,
    pub(crate) old_unhashed: usize,
}

impl Report {
    pub(crate) fn update(&mut self, other: &Report) {
        self.commits += other.commits;
        self.added += other.added;
        self.updated += other.updated;
        self.registered += other.registered;
        self.downloaded += other.downloaded;
        self.failed += other.failed;
        self.hash_mismatches += other.hash_mismatches;
        self.old_unhashed += other.old_unhashed;
    }

    pub(crate) fn get_commit_message(&self) -> String {
        let mut msgparts = Vec::new();
        if self.added > 0 {
            msgparts.push(format!("{} added", quantify(self.added, "file")));
        }
        if self.updated > 0 {
            msgparts.push(format!("{} updated", quantify(self.updated, "file")));
        }
        if msgparts.is_empty() {
            msgparts.push(String::from("Only some metadata updates"));
        }
        format!("[backups2datalad] {}", msgparts.join(", "))
    }

    /// Error out if any per-asset failures were recorded; called after all
    /// other assets have finished
    pub(crate) fn check(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        if self.failed > 0 {
            errors.push(format!(
                "{} failed to download",
                quantify(self.failed, "asset")
            ));
        }
        if self.hash_mismatches > 0 {
            errors.push(format!(
                "{} had the wrong hash after downloading",
                quantify(self.hash_mismatches, "asset")
            ));
        }
        if self.old_unhashed > 0 {
            errors.push(format!(
                "{} on server had no SHA256 hash despite advanced age",
                quantify(self.old_unhashed, "asset")
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Errors occurred while downloading: {}", errors.join("; "))
        }
    }
}

/// One unit of work for the `addurl` worker
#[derive(Clone, Debug)]
struct ToDownload {
    blob: BlobBackup,
    url: HttpUrl,
}

/// Downloads currently sitting in the `addurl` worker, plus the dataset lock
/// permit held for as long as any download is in flight (deletions must not
/// race the annex for the git index)
#[derive(Debug, Default)]
struct InProgress {
    map: HashMap<String, ToDownload>,
    permit: Option<OwnedSemaphorePermit>,
}

/// Shared state of one version segment's sync
#[derive(Debug)]
pub(crate) struct Downloader {
    dandiset_id: DandisetId,
    embargoed: bool,
    ds: Arc<AsyncDataset>,
    manager: Manager,
    dandiset: RemoteDandiset,
    tracker: Arc<Mutex<AssetTracker>>,
    annex: Arc<AsyncAnnex>,
    error_on_change: bool,
    report: Mutex<Report>,
    last_timestamp: Mutex<Option<OffsetDateTime>>,
    in_progress: Mutex<InProgress>,
    zarrs: Mutex<BTreeMap<String, Arc<Mutex<ZarrLink>>>>,
    /// Files whose `addurl` failed with exit code 123 and will be retried
    /// with a plain `git add`
    need_add: Mutex<Vec<String>>,
}

impl Downloader {
    fn update_last_timestamp(&self, candidate: OffsetDateTime) {
        let mut guard = self.last_timestamp.lock().expect("mutex poisoned");
        *guard = Some(maxdatetime(*guard, candidate));
    }

    async fn track_download(&self, td: ToDownload) {
        let need_permit = {
            let st = self.in_progress.lock().expect("mutex poisoned");
            st.permit.is_none()
        };
        if need_permit {
            let permit = self
                .ds
                .lock
                .clone()
                .acquire_owned()
                .await
                .expect("dataset lock unexpectedly closed");
            self.in_progress.lock().expect("mutex poisoned").permit = Some(permit);
        }
        let path = td.blob.path().to_string();
        self.in_progress
            .lock()
            .expect("mutex poisoned")
            .map
            .insert(path, td);
    }

    fn pop_in_progress(&self, path: &str) -> Option<ToDownload> {
        let mut st = self.in_progress.lock().expect("mutex poisoned");
        let td = st.map.remove(path);
        if st.map.is_empty() {
            st.permit = None;
        }
        td
    }
}

/// Produce the version's assets in `created` order, interleaved with
/// [`AssetEvent::Boundary`] markers wherever the stream crosses the creation
/// time of a published version.  `done` is set once the server has been
/// exhausted.
pub(crate) fn iter_assets<'a>(
    dandiset: &'a RemoteDandiset,
    done: &'a AtomicBool,
) -> impl Stream<Item = anyhow::Result<AssetEvent>> + 'a {
    async_stream::try_stream! {
        let mut versions: VecDeque<DandisetVersion> = VecDeque::new();
        if dandiset.version_id().is_draft() {
            let mut vs = dandiset
                .get_versions()
                .try_filter(|v| std::future::ready(!v.version.is_draft()))
                .try_collect::<Vec<_>>()
                .await?;
            vs.sort_by_key(|v| v.created);
            versions = vs.into();
        }
        let mut last_ts: Option<OffsetDateTime> = None;
        let assets = dandiset.stream_assets();
        let mut assets = std::pin::pin!(assets);
        while let Some(asset) = assets.try_next().await? {
            if let Some(ts) = last_ts {
                if ts > asset.created() {
                    // The server's ordering contract is asserted, not
                    // repaired; reordering would silently hide a server bug.
                    Err(anyhow::anyhow!(
                        "Asset {} created at {} but returned after an asset created at {}!",
                        asset.path(),
                        asset.created(),
                        ts,
                    ))?;
                }
            }
            if let Some(v) = versions.front() {
                if last_ts.map_or(true, |ts| ts < v.created) && asset.created() >= v.created {
                    tracing::info!(
                        dandiset = %dandiset.identifier(),
                        version = %v.version,
                        "All assets up to creation of version found; will commit soon",
                    );
                    let v = versions.pop_front().expect("front was just inspected");
                    yield AssetEvent::Boundary(v);
                }
            }
            last_ts = Some(asset.created());
            yield AssetEvent::Item(asset);
        }
        tracing::info!(
            dandiset = %dandiset.identifier(),
            "Finished getting assets from API",
        );
        done.store(true, Ordering::SeqCst);
    }
}

/// Sync all of the version's assets into the dataset, committing once per
/// version boundary, and return the accumulated counters
pub(crate) async fn async_assets(
    dandiset: &RemoteDandiset,
    ds: &Arc<AsyncDataset>,
    manager: &Manager,
    tracker: &Arc<Mutex<AssetTracker>>,
    error_on_change: bool,
) -> anyhow::Result<Report> {
    let done = AtomicBool::new(false);
    let mut total_report = Report::default();
    let mut events = std::pin::pin!(iter_assets(dandiset, &done));
    while !done.load(Ordering::SeqCst) {
        let dl = Arc::new(Downloader {
            dandiset_id: dandiset.identifier().clone(),
            embargoed: dandiset.embargo_status() == crate::dandi::EmbargoStatus::Embargoed,
            ds: ds.clone(),
            manager: manager.clone(),
            dandiset: dandiset.clone(),
            tracker: tracker.clone(),
            annex: Arc::new(AsyncAnnex::new(ds.path().to_owned(), "SHA256")),
            error_on_change,
            report: Mutex::new(Report::default()),
            last_timestamp: Mutex::new(None),
            in_progress: Mutex::new(InProgress::default()),
            zarrs: Mutex::new(BTreeMap::new()),
            need_add: Mutex::new(Vec::new()),
        });
        let segment_result = run_segment(&dl, &mut events).await;
        tracker.lock().expect("mutex poisoned").dump()?;
        segment_result?;
        ds.add(".dandi/assets.json").await?;

        let need_add = std::mem::take(&mut *dl.need_add.lock().expect("mutex poisoned"));
        for fpath in need_add {
            tracing::info!(dandiset = %dandiset.identifier(), path = %fpath, "Manually running `git add`");
            if let Err(e) = ds.call_git(["add", fpath.as_str()]).await {
                tracing::error!(path = %fpath, error = %e, "Manual `git add` failed");
                dl.report.lock().expect("mutex poisoned").failed += 1;
            }
        }

        let mut timestamp = *dl.last_timestamp.lock().expect("mutex poisoned");
        let zarrs = dl.zarrs.lock().expect("mutex poisoned").clone();
        for (zarr_id, link) in zarrs {
            // The segment's task tree has been drained, so the Zarr tasks
            // have all finished and set the link's timestamp & commit hash.
            let link = link.lock().expect("mutex poisoned").clone();
            if let Some(ts) = link.timestamp {
                timestamp = Some(maxdatetime(timestamp, ts));
            }
            for asset_path in &link.asset_paths {
                if !ds.path().join(asset_path).exists() {
                    if error_on_change {
                        return Err(UnexpectedChange(format!(
                            "Dandiset {}: Zarr asset added at {asset_path} but draft timestamp was not updated on server",
                            dandiset.identifier(),
                        ))
                        .into());
                    }
                    tracing::info!(path = %asset_path, "Zarr asset added; cloning");
                    {
                        let mut report = dl.report.lock().expect("mutex poisoned");
                        report.downloaded += 1;
                        report.added += 1;
                    }
                    let zarr_path = manager
                        .config
                        .zarr_root()
                        .context("Zarr backups not configured in config file")?
                        .join(&zarr_id);
                    let src = match manager.config.zarr_gh_org() {
                        Some(org) => format!("https://github.com/{org}/{zarr_id}"),
                        None => zarr_path.display().to_string(),
                    };
                    let dest = ds.path().join(asset_path);
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let mut cmd = Command::new("git");
                    cmd.arg("clone")
                        .arg("--")
                        .arg(&src)
                        .arg(&dest);
                    run_command(&mut cmd).await?;
                    if manager.config.zarr_gh_org().is_some() {
                        let mut cmd = Command::new("git");
                        cmd.args(["remote", "rename", "origin", "github"])
                            .current_dir(&dest);
                        run_command(&mut cmd).await?;
                    }
                    let zarr_ds = AsyncDataset::new(zarr_path);
                    ds.add_submodule(asset_path, &src, &zarr_ds.get_datalad_id().await?)
                        .await?;
                    tracing::debug!(path = %asset_path, "Finished cloning Zarr");
                } else if link.timestamp.is_some() {
                    tracing::info!(path = %asset_path, "Zarr asset modified; updating");
                    {
                        let mut report = dl.report.lock().expect("mutex poisoned");
                        report.downloaded += 1;
                        report.updated += 1;
                    }
                    let commit_hash = link
                        .commit_hash
                        .as_deref()
                        .context("Zarr sync finished without recording a commit hash")?;
                    ds.update_submodule(asset_path, commit_hash).await?;
                    tracing::debug!(path = %asset_path, "Finished updating Zarr");
                }
            }
        }

        let report = *dl.report.lock().expect("mutex poisoned");
        if dandiset.version_id().is_draft() {
            if report.registered > 0 || report.downloaded > 0 {
                tracing::info!(
                    dandiset = %dandiset.identifier(),
                    "{} registered, {} downloaded for this version segment; committing",
                    quantify(report.registered, "asset"),
                    quantify(report.downloaded, "asset"),
                );
                let timestamp = timestamp.context("segment with downloads but no timestamp")?;
                let state_ts = if done.load(Ordering::SeqCst) {
                    dandiset.version().modified
                } else {
                    timestamp
                };
                ds.set_assets_state(AssetsState { timestamp: state_ts })
                    .await?;
                tracing::debug!("Checking whether repository is dirty ...");
                if ds.is_dirty().await? {
                    tracing::info!("Committing changes");
                    ds.commit(&report.get_commit_message(), Some(timestamp), &[], true)
                        .await?;
                    tracing::debug!("Commit made; running `git gc`");
                    ds.gc().await?;
                    total_report.commits += 1;
                } else {
                    tracing::debug!("Repository is clean");
                }
            } else {
                if done.load(Ordering::SeqCst) {
                    ds.set_assets_state(AssetsState {
                        timestamp: dandiset.version().modified,
                    })
                    .await?;
                }
                tracing::info!("No assets downloaded for this version segment; not committing");
            }
        } else {
            ds.set_assets_state(AssetsState {
                timestamp: dandiset.version().created,
            })
            .await?;
        }
        total_report.update(&report);
    }
    Ok(total_report)
}

/// Drive one version segment: consume events until a boundary (or the end of
/// the stream), spawning per-asset tasks and the `addurl` worker under one
/// task tree, and drain that tree before returning
async fn run_segment<S>(
    dl: &Arc<Downloader>,
    events: &mut Pin<&mut S>,
) -> anyhow::Result<()>
where
    S: Stream<Item = anyhow::Result<AssetEvent>>,
{
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let (tx, rx) = mpsc::channel::<ToDownload>(1);
    tasks.spawn(addurl_worker(dl.clone(), rx));
    let loop_result = asset_loop(dl, events, &mut tasks, tx).await;
    if loop_result.is_err() {
        tasks.abort_all();
    }
    let mut first_err = loop_result.err();
    while let Some(joined) = tasks.join_next().await {
        let failed = match joined {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) if e.is_cancelled() => None,
            Err(e) => Some(e.into()),
        };
        if let Some(e) = failed {
            if first_err.is_none() {
                first_err = Some(e);
            }
            tasks.abort_all();
        }
    }
    if let Some(e) = first_err {
        // kill_on_drop reaps the batch workers
        return Err(e);
    }
    dl.annex.shutdown().await?;
    Ok(())
}

/// Consume asset events until a version boundary, dispatching each asset
async fn asset_loop<S>(
    dl: &Arc<Downloader>,
    events: &mut Pin<&mut S>,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    tx: mpsc::Sender<ToDownload>,
) -> anyhow::Result<()>
where
    S: Stream<Item = anyhow::Result<AssetEvent>>,
{
    let now = OffsetDateTime::now_utc();
    let mut downloading = true;
    while let Some(event) = events.try_next().await? {
        let asset = match event {
            AssetEvent::Boundary(_) => break,
            AssetEvent::Item(asset) => asset,
        };
        dl.tracker
            .lock()
            .expect("mutex poisoned")
            .add_remote(asset.path());
        if downloading {
            if asset.is_zarr() {
                if dl.embargoed {
                    anyhow::bail!(
                        "Dandiset {} is embargoed and contains a Zarr at {}; do not know how to handle",
                        dl.dandiset_id,
                        asset.path(),
                    );
                }
                match asset.zarr_checksum() {
                    Some(digest) => {
                        let digest = digest.to_owned();
                        process_zarr(dl, tasks, &asset, Some(digest))?;
                    }
                    None => {
                        tracing::info!(
                            asset = %asset.path(),
                            "Zarr checksum has not been computed yet; not downloading any more assets",
                        );
                        downloading = false;
                    }
                }
            } else {
                match asset.sha256_digest() {
                    Some(digest) => {
                        let blob = BlobBackup {
                            sha256_digest: digest.to_owned(),
                            asset: asset.clone(),
                        };
                        tasks.spawn(process_blob(dl.clone(), blob, tx.clone()));
                    }
                    None => {
                        tracing::info!(
                            asset = %asset.path(),
                            "SHA256 has not been computed yet; not downloading any more assets",
                        );
                        downloading = false;
                    }
                }
            }
        }
        // Not `else`, as we want to "fall through" if `downloading` is
        // negated above.
        if !downloading {
            tracing::info!(asset = %asset.path(), "Will download in a future run");
            dl.tracker
                .lock()
                .expect("mutex poisoned")
                .mark_future(&asset);
            if !asset.is_zarr()
                && now - asset.created() > UNHASHED_MAX_AGE
                && asset.sha256_digest().is_none()
            {
                tracing::error!(
                    asset = %asset.path(),
                    "Asset created more than a day ago but SHA256 digest has not yet been computed",
                );
                dl.report.lock().expect("mutex poisoned").old_unhashed += 1;
            }
        }
    }
    Ok(())
}

/// Register a Zarr asset with the tracker and, the first time its ID is
/// seen, spawn an independent sub-sync for it
fn process_zarr(
    dl: &Arc<Downloader>,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    asset: &Asset,
    zarr_digest: Option<String>,
) -> anyhow::Result<()> {
    let zarr_id = asset
        .zarr_id()
        .expect("process_zarr should only be called on Zarr assets")
        .to_owned();
    let path = asset.path().to_string();
    {
        let mut tracker = dl.tracker.lock().expect("mutex poisoned");
        if dl.manager.config.zarr_mode == ZarrMode::AssetChecksum {
            if !tracker.register_asset_by_timestamp(asset, dl.manager.config.forced_assets_update())
            {
                tracing::info!(zarr = %zarr_id, "asset timestamp up to date; not syncing");
                tracker.finish_asset(&path);
                return Ok(());
            }
        } else {
            tracker.register_asset(asset, dl.manager.config.forced_assets_update());
        }
        tracker.finish_asset(&path);
    }
    // In case the Zarr is empty:
    dl.update_last_timestamp(asset.created());
    let mut zarrs = dl.zarrs.lock().expect("mutex poisoned");
    if let Some(link) = zarrs.get(&zarr_id) {
        link.lock().expect("mutex poisoned").asset_paths.push(path);
        return Ok(());
    }
    let zarr_root = dl.manager.config.zarr_root().with_context(|| {
        format!(
            "Zarr encountered in Dandiset {} but Zarr backups not configured in config file",
            dl.dandiset_id,
        )
    })?;
    let zarr_dspath = zarr_root.join(&zarr_id);
    let link = Arc::new(Mutex::new(ZarrLink {
        zarr_dspath: zarr_dspath.clone(),
        timestamp: None,
        asset_paths: vec![path],
        commit_hash: None,
    }));
    zarrs.insert(zarr_id, link.clone());
    tasks.spawn(sync_zarr(
        asset.clone(),
        zarr_digest,
        zarr_dspath,
        dl.manager.clone(),
        dl.dandiset.clone(),
        Some(link),
        dl.error_on_change,
    ));
    Ok(())
}

/// Decide what to do for one blob asset and do it (except for actual
/// downloading, which is sent to the `addurl` worker)
async fn process_blob(
    dl: Arc<Downloader>,
    blob: BlobBackup,
    tx: mpsc::Sender<ToDownload>,
) -> anyhow::Result<()> {
    dl.update_last_timestamp(blob.asset.created());
    let path = blob.path().to_string();
    let md_diff = dl
        .tracker
        .lock()
        .expect("mutex poisoned")
        .register_asset(&blob.asset, dl.manager.config.forced_assets_update());
    let Some(md_diff) = md_diff else {
        tracing::debug!(asset = %path, "metadata unchanged; not taking any further action");
        dl.tracker.lock().expect("mutex poisoned").finish_asset(&path);
        return Ok(());
    };
    if !dl.manager.config.match_asset(&path) {
        tracing::debug!(asset = %path, "Skipping asset");
        dl.tracker.lock().expect("mutex poisoned").finish_asset(&path);
        return Ok(());
    }
    if dl.error_on_change {
        return Err(UnexpectedChange(format!(
            "Dandiset {}: Metadata for asset {path} was changed/added but draft timestamp was not updated on server:\n\nMetadata diff:\n\n{md_diff}\n",
            dl.dandiset_id,
        ))
        .into());
    }
    tracing::info!(asset = %path, "Syncing");
    let dest = dl.ds.path().join(&path);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let to_update;
    if tokio::fs::symlink_metadata(&dest).await.is_err() {
        tracing::info!(asset = %path, "Not in dataset; will add");
        to_update = true;
        dl.report.lock().expect("mutex poisoned").added += 1;
    } else {
        tracing::debug!(asset = %path, "About to fetch hash from annex");
        if blob.sha256_digest == get_annex_hash(&dest).await? {
            tracing::info!(
                asset = %path,
                "Asset in dataset, and hash shows no modification; will not update",
            );
            dl.tracker.lock().expect("mutex poisoned").finish_asset(&path);
            return Ok(());
        }
        tracing::info!(
            asset = %path,
            "Asset in dataset, and hash shows modification; will update",
        );
        to_update = true;
        dl.report.lock().expect("mutex poisoned").updated += 1;
    }
    debug_assert!(to_update, "all non-update paths should have returned");
    dl.ds.remove(&path).await?;
    if blob.is_binary() {
        tracing::info!(asset = %path, "File is binary; registering key with git-annex");
        let key = dl
            .annex
            .mkkey(blob.path().name_str(), blob.asset.size(), &blob.sha256_digest)
            .await?;
        dl.annex.from_key(&key, &path).await?;
        if !dl.embargoed {
            let bucket_url = blob
                .get_file_bucket_url(&dl.manager.http, &dl.manager.config)
                .await?;
            blob.register_url(&dl.annex, &key, bucket_url.as_str())
                .await?;
        }
        blob.register_url(&dl.annex, &key, blob.asset.base_download_url().as_str())
            .await?;
        let remotes = dl.annex.get_key_remotes(&key).await?;
        if let (Some(remotes), Some(backup)) =
            (remotes, dl.manager.config.dandisets.remote.as_ref())
        {
            if !remotes.contains(&backup.name) {
                tracing::info!(asset = %path, remote = %backup.name, "Not in backup remote");
            }
        }
        dl.tracker.lock().expect("mutex poisoned").finish_asset(&path);
        dl.report.lock().expect("mutex poisoned").registered += 1;
    } else if blob.asset.size() > MAX_TEXT_SIZE {
        anyhow::bail!(
            "{path} identified as text but is {} bytes!",
            blob.asset.size()
        );
    } else {
        let url = blob.asset.base_download_url().clone();
        tracing::info!(asset = %path, url = %url, "File is text; sending off for download");
        tx.send(ToDownload { blob, url })
            .await
            .map_err(|_| anyhow::anyhow!("addurl worker terminated before {path} could be queued"))?;
    }
    Ok(())
}

/// The `addurl` worker task: opened lazily on the first queued download, fed
/// by the rendezvous channel, read as a stream of JSON progress & completion
/// records
async fn addurl_worker(
    dl: Arc<Downloader>,
    mut rx: mpsc::Receiver<ToDownload>,
) -> anyhow::Result<()> {
    let Some(first) = rx.recv().await else {
        tracing::debug!("No downloads queued; addurl worker never started");
        return Ok(());
    };
    let jobs = dl.manager.config.jobs.to_string();
    let mut args = vec![
        String::from("-c"),
        String::from("annex.alwayscompact=false"),
        String::from("--batch"),
        String::from("--with-files"),
        String::from("--jobs"),
        jobs,
        String::from("--json"),
        String::from("--json-error-messages"),
        String::from("--json-progress"),
    ];
    let token;
    let mut envs: Vec<(&str, &str)> = Vec::new();
    if dl.embargoed {
        token = dl
            .manager
            .token
            .clone()
            .context("API token required to download from an embargoed Dandiset")?;
        envs.push(("DATALAD_dandi_token", &token));
        args.push(String::from("--raw-except=datalad"));
    } else {
        args.push(String::from("--raw"));
    }
    let mut proc = BatchProcess::open_git_annex(dl.ds.path(), "addurl", args, &envs)?;
    let (stdin, stdout) = proc
        .take_io()
        .context("addurl worker I/O unexpectedly unavailable")?;
    let (feed, read) = tokio::join!(
        feed_addurl(&dl, first, &mut rx, stdin),
        read_addurl(&dl, stdout),
    );
    feed?;
    read?;
    proc.shutdown().await?;
    Ok(())
}

async fn feed_addurl(
    dl: &Arc<Downloader>,
    first: ToDownload,
    rx: &mut mpsc::Receiver<ToDownload>,
    stdin: ChildStdin,
) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut stdin = stdin;
    let mut next = Some(first);
    loop {
        let td = match next.take() {
            Some(td) => td,
            None => match rx.recv().await {
                Some(td) => td,
                None => break,
            },
        };
        let line = format!("{} {}\n", td.url, td.blob.path());
        tracing::info!(asset = %td.blob.path(), url = %td.url, "Downloading");
        dl.track_download(td).await;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("error feeding URL to addurl")?;
        stdin.flush().await.context("error feeding URL to addurl")?;
    }
    // Closing stdin is what tells the worker to finish up
    drop(stdin);
    tracing::debug!("Done feeding URLs to addurl");
    Ok(())
}

#[derive(Clone, Debug, Deserialize)]
struct AddurlAction {
    file: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct AddurlLine {
    #[serde(rename = "byte-progress")]
    byte_progress: Option<u64>,
    #[serde(rename = "total-size")]
    total_size: Option<u64>,
    #[serde(rename = "percent-progress")]
    percent_progress: Option<String>,
    action: Option<AddurlAction>,
    success: Option<bool>,
    #[serde(rename = "error-messages", default)]
    error_messages: Vec<String>,
    file: Option<String>,
    key: Option<String>,
}

async fn read_addurl(
    dl: &Arc<Downloader>,
    stdout: BufReader<ChildStdout>,
) -> anyhow::Result<()> {
    let mut lines = stdout.lines();
    let mut checks = FuturesUnordered::new();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("error reading from addurl")? else {
                    break;
                };
                if let Some(blob) = handle_addurl_line(dl, &line)? {
                    let dl = dl.clone();
                    checks.push(async move { check_unannexed_hash(&dl, &blob).await });
                }
            }
            Some(r) = checks.next() => {
                let () = r?;
            }
        }
    }
    while let Some(r) = checks.next().await {
        let () = r?;
    }
    tracing::debug!("Done reading from addurl");
    Ok(())
}

/// Process one JSON record from `addurl`; a returned blob has finished
/// downloading and needs its hash verified
fn handle_addurl_line(dl: &Arc<Downloader>, line: &str) -> anyhow::Result<Option<BlobBackup>> {
    let data = serde_json::from_str::<AddurlLine>(line)
        .with_context(|| format!("unparseable JSON from addurl: {line:?}"))?;
    if let Some(progress) = data.byte_progress {
        // Progress message
        let file = data.action.and_then(|a| a.file).unwrap_or_default();
        tracing::info!(
            file = %file,
            "Downloaded {} / {} bytes ({})",
            progress,
            data.total_size
                .map_or_else(|| String::from("???"), |sz| sz.to_string()),
            data.percent_progress.unwrap_or_else(|| String::from("??.??%")),
        );
        return Ok(None);
    }
    let file = data
        .file
        .context("addurl record lacks \"file\" field")?;
    if data.success != Some(true) {
        let msg = format_errors(&data.error_messages);
        tracing::error!(%file, "download failed:{msg}");
        dl.pop_in_progress(&file);
        if msg.contains("exited 123") {
            tracing::info!(%file, "Will try `git add`ing manually later");
            dl.need_add.lock().expect("mutex poisoned").push(file);
        } else {
            dl.report.lock().expect("mutex poisoned").failed += 1;
        }
        Ok(None)
    } else {
        tracing::info!(
            %file,
            key = data.key.as_deref().unwrap_or("<none>"),
            "Finished downloading",
        );
        dl.report.lock().expect("mutex poisoned").downloaded += 1;
        let td = dl
            .pop_in_progress(&file)
            .with_context(|| format!("addurl reported completion of unknown file {file:?}"))?;
        dl.tracker.lock().expect("mutex poisoned").finish_asset(&file);
        Ok(Some(td.blob))
    }
}

/// After a download lands outside the annex (text files), re-hash the bytes
/// on disk and compare with the server's digest.  Mismatches are counted and
/// reported fatally at the end of the run, but do not abort it.
async fn check_unannexed_hash(dl: &Arc<Downloader>, blob: &BlobBackup) -> anyhow::Result<()> {
    let annex_hash = sha256_file(&dl.ds.path().join(blob.path().as_str())).await?;
    if blob.sha256_digest != annex_hash {
        tracing::error!(
            asset = %blob.path(),
            server = %blob.sha256_digest,
            local = %annex_hash,
            "Hash mismatch!",
        );
        dl.report.lock().expect("mutex poisoned").hash_mismatches += 1;
    }
    Ok(())
}

/// The file's SHA256 according to the annex: if the path is a symlink into
/// the annex object store the key embeds the hash; otherwise the bytes are
/// digested directly
pub(crate) async fn get_annex_hash(filepath: &Path) -> anyhow::Result<String> {
    if let Some(keyname) = annex_key_of_symlink(filepath).await? {
        Ok(crate::annex::key2hash(&keyname).to_owned())
    } else {
        tracing::debug!(
            path = %filepath.display(),
            "Not under annex; calculating sha256 digest ourselves",
        );
        sha256_file(filepath).await
    }
}

/// If `filepath` is a symlink resolving into `.git/annex/objects`, return
/// the key (the target's base name).  The target is resolved lexically, as
/// the object file need not exist locally.
pub(crate) async fn annex_key_of_symlink(filepath: &Path) -> anyhow::Result<Option<String>> {
    let meta = tokio::fs::symlink_metadata(filepath)
        .await
        .with_context(|| format!("failed to stat {}", filepath.display()))?;
    if !meta.file_type().is_symlink() {
        return Ok(None);
    }
    let target = tokio::fs::read_link(filepath)
        .await
        .with_context(|| format!("failed to read link {}", filepath.display()))?;
    let base = filepath.parent().unwrap_or_else(|| Path::new("."));
    let mut resolved = base.to_path_buf();
    for comp in target.components() {
        match comp {
            std::path::Component::ParentDir => {
                resolved.pop();
            }
            std::path::Component::CurDir => (),
            other => resolved.push(other),
        }
    }
    let resolved_str = resolved.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
    if resolved_str.contains(".git/annex/object") {
        Ok(resolved
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()))
    } else {
        Ok(None)
    }
}

/// SHA256 of a file's bytes, read in chunks
pub(crate) async fn sha256_file(path: &Path) -> anyhow::Result<String> {
    tracing::debug!(path = %path.display(), "Starting to compute sha256 digest");
    let mut fp = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut digester = Sha256::new();
    let mut buf = vec![0u8; 65535];
    loop {
        let n = fp
            .read(&mut buf)
            .await
            .with_context(|| format!("error reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
    }
    tracing::debug!(path = %path.display(), "Finished computing sha256 digest");
    Ok(hex::encode(digester.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(Report { added: 5, ..Report::default() }, "[backups2datalad] 5 files added")]
    #[case(Report { added: 1, ..Report::default() }, "[backups2datalad] 1 file added")]
    #[case(
        Report { added: 2, updated: 1, ..Report::default() },
        "[backups2datalad] 2 files added, 1 file updated"
    )]
    #[case(Report::default(), "[backups2datalad] Only some metadata updates")]
    fn commit_messages(#[case] report: Report, #[case] expected: &str) {
        assert_eq!(report.get_commit_message(), expected);
    }

    #[test]
    fn report_check_aggregates_errors() {
        let ok = Report {
            added: 3,
            downloaded: 2,
            ..Report::default()
        };
        assert!(ok.check().is_ok());
        let bad = Report {
            failed: 1,
            hash_mismatches: 2,
            old_unhashed: 1,
            ..Report::default()
        };
        let msg = bad.check().unwrap_err().to_string();
        assert!(msg.contains("1 asset failed to download"), "bad message: {msg}");
        assert!(
            msg.contains("2 assets had the wrong hash after downloading"),
            "bad message: {msg}"
        );
        assert!(
            msg.contains("1 asset on server had no SHA256 hash despite advanced age"),
            "bad message: {msg}"
        );
    }

    #[test]
    fn report_update_sums_fields() {
        let mut total = Report {
            commits: 1,
            added: 2,
            ..Report::default()
        };
        total.update(&Report {
            added: 3,
            downloaded: 4,
            ..Report::default()
        });
        assert_eq!(total.commits, 1);
        assert_eq!(total.added, 5);
        assert_eq!(total.downloaded, 4);
    }

    #[tokio::test]
    async fn sha256_of_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file.txt");
        tokio::fs::write(&path, "This is test text.\n").await.unwrap();
        assert_eq!(
            sha256_file(&path).await.unwrap(),
            "6fef386efa7208eaf1c596b6ab2f8a5a3583696ef8649be0552ab3effad1e191"
        );
    }

    #[tokio::test]
    async fn annex_symlink_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        let key = "SHA256E-s5--0d17cd6b4e93a6f482f9d947dbbbf175de8d951a2fab0a3e47400b5c9bb09c33.dat";
        let target = format!("../.git/annex/objects/Fj/v0/{key}/{key}");
        std::os::unix::fs::symlink(&target, root.join("sub/nulls.dat")).unwrap();
        let got = annex_key_of_symlink(&root.join("sub/nulls.dat"))
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some(key));
        assert_eq!(
            get_annex_hash(&root.join("sub/nulls.dat")).await.unwrap(),
            "0d17cd6b4e93a6f482f9d947dbbbf175de8d951a2fab0a3e47400b5c9bb09c33"
        );
    }

    #[tokio::test]
    async fn non_annex_symlink_is_hashed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("real.txt"), "Apple\n").unwrap();
        std::os::unix::fs::symlink("real.txt", root.join("link.txt")).unwrap();
        assert_eq!(
            annex_key_of_symlink(&root.join("link.txt")).await.unwrap(),
            None
        );
    }

    #[test]
    fn parse_addurl_progress_line() {
        let line = r#"{"byte-progress":1024,"total-size":4096,"percent-progress":"25%","action":{"command":"addurl","file":"file.txt","input":["https://example.test/file.txt file.txt"]}}"#;
        let data = serde_json::from_str::<AddurlLine>(line).unwrap();
        assert_eq!(data.byte_progress, Some(1024));
        assert_eq!(data.action.unwrap().file.as_deref(), Some("file.txt"));
        assert_eq!(data.success, None);
    }

    #[test]
    fn parse_addurl_completion_line() {
        let line = r#"{"command":"addurl","success":true,"error-messages":[],"file":"file.txt","key":"SHA256E-s19--66e66b2bb6d9c435d0dac265fb413f5840121afa3e4a2c6fbd17cf2b59bbf5f0.txt","note":"to file.txt"}"#;
        let data = serde_json::from_str::<AddurlLine>(line).unwrap();
        assert_eq!(data.success, Some(true));
        assert_eq!(data.file.as_deref(), Some("file.txt"));
        assert!(data.key.unwrap().starts_with("SHA256E-s19--"));
    }
}
