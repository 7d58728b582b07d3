//! Facade over one backup repository: a git repository with a git-annex,
//! driven entirely through subprocesses.
use crate::annex::key2hash;
use crate::checksum::ZarrChecksumTree;
use crate::config::Remote;
use crate::consts::{
    COMMIT_AUTHOR_EMAIL, COMMIT_AUTHOR_NAME, DEFAULT_BRANCH, EMBARGO_STATUS_KEY, GIT_OPTIONS,
    RM_RETRY_DELAYS,
};
use crate::dandi::EmbargoStatus;
use crate::procio::{
    read_command, read_command_rcs, run_command, run_command_rcs, run_command_with_input,
    stream_lines_command, stream_null_command, CommandError,
};
use crate::util::{is_meta_file, ExpWait};
use anyhow::Context;
use futures_util::TryStreamExt;
use serde::{de::Deserializer, Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::process::Command;
use tokio::sync::Semaphore;

/// UUID of the git-annex special remote through which embargoed Dandisets'
/// download credentials are provided
static DATALAD_CREDS_REMOTE_UUID: &str = "cf13d535-b47c-5df6-8590-0793cb08a90a";

/// Relative path of the sync-cursor state file
static ASSETS_STATE_FILE: &str = ".dandi/assets-state.json";

/// The server timestamp that the repository's current contents reflect
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct AssetsState {
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) timestamp: OffsetDateTime,
}

/// One file at `HEAD`, per `git ls-tree`
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct FileStat {
    pub(crate) path: String,
    pub(crate) kind: ObjectType,
    pub(crate) size: Option<i64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ObjectType {
    Commit,
    Blob,
    Tree,
}

impl FileStat {
    fn from_entry(entry: &str) -> anyhow::Result<FileStat> {
        let (stats, path) = entry
            .split_once('\t')
            .with_context(|| format!("malformed ls-tree entry: {entry:?}"))?;
        let mut fields = stats.split_whitespace();
        let _mode = fields.next();
        let typename = fields
            .next()
            .with_context(|| format!("malformed ls-tree entry: {entry:?}"))?;
        let _hash = fields.next();
        let sizestr = fields
            .next()
            .with_context(|| format!("malformed ls-tree entry: {entry:?}"))?;
        let kind = match typename {
            "commit" => ObjectType::Commit,
            "blob" => ObjectType::Blob,
            "tree" => ObjectType::Tree,
            other => anyhow::bail!("unknown object type {other:?} in ls-tree entry"),
        };
        let size = if sizestr == "-" {
            None
        } else {
            Some(sizestr.parse::<i64>().with_context(|| {
                format!("unparseable size in ls-tree entry: {entry:?}")
            })?)
        };
        Ok(FileStat {
            path: path.to_owned(),
            kind,
            size,
        })
    }
}

/// Total file count and byte size of a repository's content
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct DatasetStats {
    pub(crate) files: u64,
    pub(crate) size: u64,
}

/// A submodule registered in `.gitmodules`
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Submodule {
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) url: String,
}

/// One annexed file as reported by `git annex find --json`
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct AnnexedFile {
    pub(crate) backend: String,
    #[serde(deserialize_with = "int_or_string")]
    pub(crate) bytesize: i64,
    pub(crate) file: String,
    pub(crate) key: String,
}

/// git-annex emits numeric fields as JSON strings
fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }
    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => Ok(n),
        IntOrString::Str(s) => s.parse::<i64>().map_err(serde::de::Error::custom),
    }
}

/// Asynchronous handle for one backup repository.
///
/// The `lock` semaphore serializes explicit deletions against in-flight
/// `addurl` downloads; see the Downloader.
#[derive(Clone, Debug)]
pub(crate) struct AsyncDataset {
    path: PathBuf,
    pub(crate) lock: Arc<Semaphore>,
}

impl AsyncDataset {
    pub(crate) fn new<P: Into<PathBuf>>(path: P) -> AsyncDataset {
        AsyncDataset {
            path: path.into(),
            lock: Arc::new(Semaphore::new(1)),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.path.join(".git").exists()
    }

    fn git_cmd<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.args(GIT_OPTIONS).args(args).current_dir(&self.path);
        cmd
    }

    fn annex_cmd<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.args(GIT_OPTIONS)
            .arg("annex")
            .args(args)
            .current_dir(&self.path);
        cmd
    }

    pub(crate) async fn call_git<I, S>(&self, args: I) -> Result<(), CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        run_command(&mut self.git_cmd(args)).await
    }

    pub(crate) async fn read_git<I, S>(&self, args: I) -> Result<String, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        read_command(&mut self.git_cmd(args)).await
    }

    pub(crate) async fn call_annex<I, S>(&self, args: I) -> Result<(), CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        run_command(&mut self.annex_cmd(args)).await
    }

    /// Create the repository if it does not exist yet.
    ///
    /// Returns `true` if the dataset was freshly created.
    pub(crate) async fn ensure_installed(
        &self,
        desc: &str,
        commit_date: Option<OffsetDateTime>,
        backup_remote: Option<&Remote>,
        backend: &str,
        text2git: bool,
        embargo_status: EmbargoStatus,
    ) -> anyhow::Result<bool> {
        if self.is_installed() {
            return Ok(false);
        }
        tracing::info!(dataset = %self.path.display(), "Creating dataset for {desc}");
        tokio::fs::create_dir_all(&self.path)
            .await
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        {
            let mut cmd = Command::new("git");
            cmd.args(["-c", &format!("init.defaultBranch={DEFAULT_BRANCH}"), "init"])
                .current_dir(&self.path);
            run_command(&mut cmd).await?;
        }
        self.call_annex(["init"]).await?;
        self.set_repo_config("annex.backend", backend, None).await?;
        let dataset_id = uuid::Uuid::new_v4();
        tokio::fs::create_dir_all(self.path.join(".datalad")).await?;
        tokio::fs::write(
            self.path.join(".datalad").join("config"),
            format!("[datalad \"dataset\"]\n\tid = {dataset_id}\n"),
        )
        .await?;
        self.call_git(["add", ".datalad/config"]).await?;
        if text2git {
            tokio::fs::write(
                self.path.join(".gitattributes"),
                "* annex.largefiles=((mimeencoding=binary)and(largerthan=0))\n",
            )
            .await?;
            self.call_git(["add", ".gitattributes"]).await?;
        }
        self.commit(
            "[backups2datalad] Initialize dataset",
            commit_date,
            &[],
            false,
        )
        .await?;
        if embargo_status != EmbargoStatus::Open {
            self.set_embargo_status(embargo_status).await?;
            self.save("[backups2datalad] Set embargo status", commit_date)
                .await?;
        }
        self.call_annex([
            "initremote",
            "--sameas=web",
            "dandiapi",
            "type=web",
            "urlinclude=*//api.dandiarchive.org/*",
            "cost=300",
        ])
        .await?;
        if let Some(remote) = backup_remote {
            let mut args = vec![
                String::from("initremote"),
                remote.name.clone(),
                format!("type={}", remote.remote_type),
            ];
            args.extend(remote.options.iter().map(|(k, v)| format!("{k}={v}")));
            self.call_annex(args).await?;
            self.call_annex(["untrust", &remote.name]).await?;
            self.call_annex([
                "wanted",
                &remote.name,
                "(not metadata=distribution-restrictions=*)",
            ])
            .await?;
        }
        tracing::debug!(dataset = %self.path.display(), "Dataset for {desc} created");
        Ok(true)
    }

    pub(crate) async fn is_dirty(&self) -> Result<bool, CommandError> {
        // Forcibly use default values for these options in case they were
        // overridden by user's gitconfig:
        Ok(!self
            .read_git([
                "status",
                "--porcelain",
                "--untracked-files=normal",
                "--ignore-submodules=none",
            ])
            .await?
            .is_empty())
    }

    pub(crate) async fn has_changes(
        &self,
        paths: &[&str],
        cached: bool,
    ) -> Result<bool, CommandError> {
        let mut args = vec!["diff", "--quiet"];
        if cached {
            args.push("--cached");
        }
        if !paths.is_empty() {
            args.push("--");
            args.extend(paths);
        }
        let rc = run_command_rcs(&mut self.git_cmd(args), &[1]).await?;
        Ok(rc == 1)
    }

    pub(crate) async fn get_repo_config(
        &self,
        key: &str,
        file: Option<&str>,
    ) -> Result<Option<String>, CommandError> {
        let mut args = vec!["config"];
        if let Some(f) = file {
            args.extend(["--file", f]);
        }
        args.extend(["--get", key]);
        read_command_rcs(&mut self.git_cmd(args), &[1]).await
    }

    pub(crate) async fn set_repo_config(
        &self,
        key: &str,
        value: &str,
        file: Option<&str>,
    ) -> Result<(), CommandError> {
        let mut args = vec!["config"];
        match file {
            Some(f) => args.extend(["--file", f]),
            None => args.push("--local"),
        }
        args.extend(["--replace-all", key, value]);
        self.call_git(args).await
    }

    pub(crate) async fn get_datalad_id(&self) -> anyhow::Result<String> {
        self.get_repo_config("datalad.dataset.id", Some(".datalad/config"))
            .await?
            .with_context(|| format!("no datalad dataset ID in {}", self.path.display()))
    }

    pub(crate) async fn get_embargo_status(&self) -> anyhow::Result<EmbargoStatus> {
        match self
            .get_repo_config(EMBARGO_STATUS_KEY, Some(".datalad/config"))
            .await?
        {
            Some(value) => value
                .parse::<EmbargoStatus>()
                .with_context(|| format!("bad embargo status in {}", self.path.display())),
            None => Ok(EmbargoStatus::Open),
        }
    }

    pub(crate) async fn set_embargo_status(
        &self,
        status: EmbargoStatus,
    ) -> Result<(), CommandError> {
        self.set_repo_config(EMBARGO_STATUS_KEY, status.as_str(), Some(".datalad/config"))
            .await
    }

    fn apply_commit_env(cmd: &mut Command, commit_date: Option<OffsetDateTime>) {
        if let Some(dt) = commit_date {
            if let Ok(date) = dt.format(&Rfc3339) {
                cmd.env("GIT_AUTHOR_NAME", COMMIT_AUTHOR_NAME)
                    .env("GIT_AUTHOR_EMAIL", COMMIT_AUTHOR_EMAIL)
                    .env("GIT_AUTHOR_DATE", date);
            }
        }
    }

    /// Commit the staged changes, verifying afterwards (when `check_dirty`)
    /// that nothing was left behind
    pub(crate) async fn commit(
        &self,
        message: &str,
        commit_date: Option<OffsetDateTime>,
        paths: &[&str],
        check_dirty: bool,
    ) -> anyhow::Result<()> {
        let mut args = vec!["commit", "-m", message, "--"];
        args.extend(paths);
        let mut cmd = self.git_cmd(args);
        Self::apply_commit_env(&mut cmd, commit_date);
        run_command(&mut cmd).await?;
        if check_dirty && self.is_dirty().await? {
            anyhow::bail!(
                "{} is still dirty after committing.  Please check if all changes were staged.",
                self.path.display()
            );
        }
        Ok(())
    }

    /// Stage everything and commit if that produced any changes
    pub(crate) async fn commit_if_changed(
        &self,
        message: &str,
        commit_date: Option<OffsetDateTime>,
        paths: &[&str],
        check_dirty: bool,
    ) -> anyhow::Result<bool> {
        let mut args = vec!["add", "-A"];
        args.extend(paths);
        self.call_git(args).await?;
        if self.has_changes(paths, true).await? {
            self.commit(message, commit_date, paths, check_dirty)
                .await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) async fn save(
        &self,
        message: &str,
        commit_date: Option<OffsetDateTime>,
    ) -> anyhow::Result<bool> {
        self.commit_if_changed(message, commit_date, &[], false)
            .await
    }

    /// Push the draft and git-annex branches, retrying transient disconnects
    /// with exponential backoff
    pub(crate) async fn push(&self, to: &str, jobs: usize, force: bool) -> anyhow::Result<()> {
        let mut waits = ExpWait::new(2.1, 6);
        loop {
            let annex_jobs = format!("annex.jobs={jobs}");
            let mut args: Vec<&str> = vec!["-c", &annex_jobs, "push"];
            if force {
                args.push("--force");
            }
            args.extend([to, DEFAULT_BRANCH, "git-annex"]);
            let mut cmd = Command::new("git");
            cmd.args(GIT_OPTIONS).args(args).current_dir(&self.path);
            match run_command(&mut cmd).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let transient = matches!(
                        &e,
                        CommandError::Failed { stderr, .. }
                            if stderr.contains("unexpected disconnect")
                    );
                    if transient {
                        if let Some(delay) = waits.next() {
                            tracing::warn!(
                                dataset = %self.path.display(),
                                "Push failed with unexpected disconnect; retrying",
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    return Err(e.into());
                }
            }
        }
    }

    pub(crate) async fn gc(&self) -> anyhow::Result<()> {
        match self.call_git(["gc"]).await {
            Ok(()) => Ok(()),
            Err(CommandError::Failed { rc: 128, .. }) => {
                tracing::warn!(
                    dataset = %self.path.display(),
                    "`git gc` exited with code 128",
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `path` must be relative to the root of the dataset
    pub(crate) async fn add(&self, path: &str) -> Result<(), CommandError> {
        self.call_annex(["add", path]).await
    }

    /// Remove one path from the working tree and index, retrying losses of
    /// the race on the index lock
    pub(crate) async fn remove(&self, path: &str) -> anyhow::Result<()> {
        let _permit = self
            .lock
            .acquire()
            .await
            .context("dataset lock unexpectedly closed")?;
        let mut delays = RM_RETRY_DELAYS.iter().copied();
        loop {
            match self
                .call_git(["rm", "-f", "--ignore-unmatch", "--", path])
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        dataset = %self.path.display(),
                        path,
                        error = %e,
                        "`git rm` failed",
                    );
                    let Some(delay) = delays.next() else {
                        return Err(e.into());
                    };
                    tracing::info!(
                        dataset = %self.path.display(),
                        path,
                        "Retrying deletion in {delay} seconds",
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                }
            }
        }
    }

    pub(crate) async fn remove_batch<I>(&self, paths: I) -> anyhow::Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut spec = Vec::new();
        for p in paths {
            spec.extend_from_slice(p.as_ref().as_bytes());
            spec.push(0);
        }
        if spec.is_empty() {
            return Ok(());
        }
        let _permit = self
            .lock
            .acquire()
            .await
            .context("dataset lock unexpectedly closed")?;
        let mut pathspec = tempfile::NamedTempFile::new().context("failed to create pathspec file")?;
        std::io::Write::write_all(&mut pathspec, &spec)
            .context("failed to write pathspec file")?;
        let pathspec_path = pathspec.path().to_string_lossy().into_owned();
        self.call_git([
            "rm",
            "-f",
            "--ignore-unmatch",
            &format!("--pathspec-from-file={pathspec_path}"),
            "--pathspec-file-nul",
        ])
        .await?;
        Ok(())
    }

    pub(crate) async fn add_submodule(
        &self,
        path: &str,
        url: &str,
        datalad_id: &str,
    ) -> anyhow::Result<()> {
        self.call_git(["submodule", "add", "--", url, path]).await?;
        self.set_repo_config(
            &format!("submodule.{path}.datalad-id"),
            datalad_id,
            Some(".gitmodules"),
        )
        .await?;
        self.add(".gitmodules").await?;
        Ok(())
    }

    /// Point the submodule at `path` to `commit_hash` without the submodule
    /// having to be installed in the working tree
    pub(crate) async fn update_submodule(
        &self,
        path: &str,
        commit_hash: &str,
    ) -> anyhow::Result<()> {
        let mut cmd = self.git_cmd(["update-index", "-z", "--index-info"]);
        run_command_with_input(
            &mut cmd,
            format!("160000 commit {commit_hash}\t{path}\0").as_bytes(),
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn get_commit_hash(&self) -> Result<String, CommandError> {
        self.read_git(["show", "-s", "--format=%H"]).await
    }

    pub(crate) async fn get_last_commit_date(&self) -> anyhow::Result<OffsetDateTime> {
        let ts = self.read_git(["show", "-s", "--format=%aI"]).await?;
        OffsetDateTime::parse(&ts, &Rfc3339)
            .with_context(|| format!("unparseable commit date {ts:?}"))
    }

    /// Error out if `.gitmodules` names the same submodule twice
    pub(crate) async fn assert_no_duplicates_in_gitmodules(&self) -> anyhow::Result<()> {
        let filepath = self.path.join(".gitmodules");
        let Ok(src) = tokio::fs::read_to_string(&filepath).await else {
            return Ok(());
        };
        let rgx = regex::Regex::new(r#"^\[submodule "(.+)"\]\s*$"#)
            .expect("submodule regex should be valid");
        let mut qtys: BTreeMap<&str, usize> = BTreeMap::new();
        for line in src.lines() {
            if let Some(m) = rgx.captures(line) {
                if let Some(name) = m.get(1) {
                    *qtys.entry(name.as_str()).or_default() += 1;
                }
            }
        }
        let dupped = qtys
            .into_iter()
            .filter(|&(_, count)| count > 1)
            .map(|(name, _)| name.to_owned())
            .collect::<Vec<_>>();
        if !dupped.is_empty() {
            anyhow::bail!("Duplicates found in {}: {dupped:?}", filepath.display());
        }
        Ok(())
    }

    pub(crate) fn get_assets_state(&self) -> anyhow::Result<Option<AssetsState>> {
        match std::fs::read_to_string(self.path.join(ASSETS_STATE_FILE)) {
            Ok(src) => Ok(Some(serde_json::from_str::<AssetsState>(&src).with_context(
                || format!("malformed {ASSETS_STATE_FILE} in {}", self.path.display()),
            )?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read assets state"),
        }
    }

    pub(crate) async fn set_assets_state(&self, state: AssetsState) -> anyhow::Result<()> {
        let path = self.path.join(ASSETS_STATE_FILE);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut blob = serde_json::to_string_pretty(&state)?;
        blob.push('\n');
        tokio::fs::write(&path, blob).await?;
        self.add(ASSETS_STATE_FILE).await?;
        Ok(())
    }

    /// All annexed files at `HEAD`, via `git annex find --json`
    pub(crate) async fn annexed_files(&self) -> anyhow::Result<Vec<AnnexedFile>> {
        let cmd = self.annex_cmd(["find", "--include=*", "--json"]);
        let lines = stream_lines_command(cmd).try_collect::<Vec<_>>().await?;
        let mut files = Vec::with_capacity(lines.len());
        for line in lines {
            files.push(serde_json::from_str::<AnnexedFile>(&line).with_context(|| {
                format!("bad `git-annex find` output line for {}: {line:?}", self.path.display())
            })?);
        }
        Ok(files)
    }

    /// Compute the Zarr tree checksum over the locally-annexed files.
    ///
    /// Relies on every data component of the Zarr being annexed with an MD5
    /// backend, while `.dandi/` is kept directly in git.
    pub(crate) async fn compute_zarr_checksum(&self) -> anyhow::Result<String> {
        tracing::debug!(
            dataset = %self.path.display(),
            "Computing Zarr checksum for locally-annexed files",
        );
        let mut tree = ZarrChecksumTree::new();
        for f in self.annexed_files().await? {
            if f.backend != "MD5" && f.backend != "MD5E" {
                anyhow::bail!(
                    "{} in {} has {} backend instead of MD5 or MD5E required for Zarr checksum",
                    f.file,
                    self.path.display(),
                    f.backend,
                );
            }
            let path = f
                .file
                .parse::<crate::paths::PurePath>()
                .with_context(|| format!("annexed file has invalid path {:?}", f.file))?;
            let size = u64::try_from(f.bytesize)
                .with_context(|| format!("negative bytesize for {:?}", f.file))?;
            tree.add_leaf(&path, size, key2hash(&f.key));
        }
        let checksum = tree.process()?;
        tracing::debug!(
            dataset = %self.path.display(),
            checksum,
            "Computed Zarr checksum",
        );
        Ok(checksum)
    }

    /// Every file at `HEAD` with its object type and (for annexed files) its
    /// annexed size
    pub(crate) async fn get_file_stats(&self) -> anyhow::Result<Vec<FileStat>> {
        let cmd = self.git_cmd(["ls-tree", "-lrz", "HEAD"]);
        let entries = stream_null_command(cmd).try_collect::<Vec<_>>().await?;
        let mut filedict = BTreeMap::new();
        for entry in &entries {
            let fst = FileStat::from_entry(entry)?;
            filedict.insert(fst.path.clone(), fst);
        }
        for f in self.annexed_files().await? {
            if let Some(fst) = filedict.get_mut(&f.file) {
                fst.size = Some(f.bytesize);
            }
        }
        Ok(filedict.into_values().collect())
    }

    pub(crate) async fn get_stored_stats(&self) -> anyhow::Result<Option<DatasetStats>> {
        let Some(stored) = self.get_repo_config("dandi.stats", None).await? else {
            return Ok(None);
        };
        let mut parts = stored.splitn(3, ',');
        let (Some(commit), Some(files), Some(size)) = (parts.next(), parts.next(), parts.next())
        else {
            return Ok(None);
        };
        let (Ok(files), Ok(size)) = (files.parse::<u64>(), size.parse::<u64>()) else {
            return Ok(None);
        };
        if commit == self.get_commit_hash().await? {
            Ok(Some(DatasetStats { files, size }))
        } else {
            Ok(None)
        }
    }

    pub(crate) async fn store_stats(&self, stats: DatasetStats) -> anyhow::Result<()> {
        let commit = self.get_commit_hash().await?;
        let value = format!("{},{},{}", commit, stats.files, stats.size);
        self.set_repo_config("dandi.stats", &value, None).await?;
        Ok(())
    }

    /// Count up the files and bytes in this repository, not recursing into
    /// submodules.  Results are cached under the `dandi.stats` config key.
    pub(crate) async fn get_flat_stats(&self) -> anyhow::Result<DatasetStats> {
        if let Some(stats) = self.get_stored_stats().await? {
            return Ok(stats);
        }
        let mut files = 0;
        let mut size = 0;
        for filestat in self.get_file_stats().await? {
            if !is_meta_file(&filestat.path, true) {
                files += 1;
                size += u64::try_from(filestat.size.unwrap_or(0)).unwrap_or(0);
            }
        }
        let stats = DatasetStats { files, size };
        self.store_stats(stats).await?;
        Ok(stats)
    }

    pub(crate) async fn has_github_remote(&self) -> Result<bool, CommandError> {
        Ok(self
            .read_git(["remote"])
            .await?
            .lines()
            .any(|r| r == "github"))
    }

    /// Wire up a `github` remote for this repository.  Returns `true` iff the
    /// remote was created.  The repository on the hosting side must be
    /// created separately.
    pub(crate) async fn create_github_sibling(
        &self,
        owner: &str,
        name: &str,
        backup_remote: Option<&Remote>,
    ) -> anyhow::Result<bool> {
        if self.has_github_remote().await? {
            tracing::debug!(name, "GitHub remote already exists");
            return Ok(false);
        }
        tracing::info!(name, "Creating GitHub sibling");
        self.call_git([
            "remote",
            "add",
            "github",
            &format!("https://github.com/{owner}/{name}.git"),
        ])
        .await?;
        if let Some(remote) = backup_remote {
            self.set_repo_config("remote.github.datalad-publish-depends", &remote.name, None)
                .await?;
        }
        for (key, value) in [
            (
                String::from("remote.github.pushurl"),
                format!("git@github.com:{owner}/{name}.git"),
            ),
            (
                format!("branch.{DEFAULT_BRANCH}.remote"),
                String::from("github"),
            ),
            (
                format!("branch.{DEFAULT_BRANCH}.merge"),
                format!("refs/heads/{DEFAULT_BRANCH}"),
            ),
        ] {
            self.set_repo_config(&key, &value, None).await?;
        }
        Ok(true)
    }

    pub(crate) async fn get_remote_url(&self) -> anyhow::Result<String> {
        let upstream = self
            .get_repo_config(&format!("branch.{DEFAULT_BRANCH}.remote"), None)
            .await?
            .with_context(|| {
                format!(
                    "Upstream branch not set for {DEFAULT_BRANCH} in {}",
                    self.path.display()
                )
            })?;
        self.get_repo_config(&format!("remote.{upstream}.url"), None)
            .await?
            .with_context(|| {
                format!("{upstream:?} remote URL not set for {}", self.path.display())
            })
    }

    /// The submodules registered in `.gitmodules`
    pub(crate) async fn get_submodules(&self) -> anyhow::Result<Vec<Submodule>> {
        let mut cmd = self.git_cmd([
            "config",
            "--file",
            ".gitmodules",
            "--get-regexp",
            r"^submodule\..*\.(path|url)$",
        ]);
        let Some(listing) = read_command_rcs(&mut cmd, &[1]).await? else {
            return Ok(Vec::new());
        };
        let mut paths: BTreeMap<String, String> = BTreeMap::new();
        let mut urls: BTreeMap<String, String> = BTreeMap::new();
        for line in listing.lines() {
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            let Some(rest) = key.strip_prefix("submodule.") else {
                continue;
            };
            if let Some(name) = rest.strip_suffix(".path") {
                paths.insert(name.to_owned(), value.to_owned());
            } else if let Some(name) = rest.strip_suffix(".url") {
                urls.insert(name.to_owned(), value.to_owned());
            }
        }
        let mut submodules = Vec::new();
        for (name, path) in paths {
            let Some(url) = urls.remove(&name) else {
                anyhow::bail!("submodule {name:?} in .gitmodules lacks a url");
            };
            submodules.push(Submodule { name, path, url });
        }
        Ok(submodules)
    }

    /// Ensure the `dandi` datalad provider config and credentials remote
    /// exist, so that embargoed assets can be downloaded with the API token
    pub(crate) async fn ensure_dandi_provider(&self, api_url: &str) -> anyhow::Result<()> {
        let prov_cfg = Path::new(".datalad").join("providers").join("dandi.cfg");
        let provider_file = self.path.join(&prov_cfg);
        if !provider_file.exists() {
            let mut url_re = regex::escape(api_url);
            if let Some(stripped) = url_re
                .strip_prefix("https:")
                .or_else(|| url_re.strip_prefix("http:"))
            {
                url_re = format!("https?:{stripped}");
            }
            if !url_re.ends_with('/') {
                url_re.push('/');
            }
            url_re.push_str(".*");
            if let Some(parent) = provider_file.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(
                &provider_file,
                format!(
                    "[provider:dandi]\nurl_re = {url_re}\nauthentication_type = http_token\ncredential = dandi\n\n[credential:dandi]\ntype = token\n"
                ),
            )
            .await?;
            let prov_str = prov_cfg.to_string_lossy().into_owned();
            self.call_git(["add", &prov_str]).await?;
            self.commit(
                "[backups2datalad] Add dandi provider config",
                None,
                &[&prov_str],
                false,
            )
            .await?;
        }
        let remotes = self.read_git(["remote"]).await?;
        if remotes.lines().any(|r| r == "datalad") {
            let annex_uuid = self
                .get_repo_config("remote.datalad.annex-uuid", None)
                .await?;
            if annex_uuid.as_deref() != Some(DATALAD_CREDS_REMOTE_UUID) {
                anyhow::bail!(
                    "Dataset {}: expected remote.datalad.annex-uuid to be {DATALAD_CREDS_REMOTE_UUID:?} but got {annex_uuid:?}",
                    self.path.display()
                );
            }
        } else {
            let info = read_command(&mut self.annex_cmd(["info", "--json"])).await?;
            let info = serde_json::from_str::<serde_json::Value>(&info)
                .context("unparseable `git annex info` output")?;
            let known = info
                .get("semitrusted repositories")
                .and_then(serde_json::Value::as_array)
                .is_some_and(|repos| {
                    repos.iter().any(|sr| {
                        sr.get("uuid").and_then(serde_json::Value::as_str)
                            == Some(DATALAD_CREDS_REMOTE_UUID)
                    })
                });
            if known {
                self.call_annex(["enableremote", "datalad"]).await?;
            } else {
                self.call_annex([
                    "initremote",
                    "datalad",
                    "type=external",
                    "externaltype=datalad",
                    "encryption=none",
                    "autoenable=true",
                    &format!("uuid={DATALAD_CREDS_REMOTE_UUID}"),
                ])
                .await?;
            }
        }
        Ok(())
    }

    /// Move every key's registered URL off the datalad credentials remote and
    /// drop the remote; run when a Dandiset leaves embargo
    pub(crate) async fn disable_dandi_provider(&self) -> anyhow::Result<()> {
        let cmd = self.annex_cmd(["find", "--include=*", "--format=${key}\\n"]);
        let keys = stream_lines_command(cmd).try_collect::<Vec<_>>().await?;
        if !keys.is_empty() {
            let mut input = keys.join("\n");
            input.push('\n');
            let mut cmd = self.annex_cmd(["reregisterurl", "--batch", "--move-from=datalad"]);
            run_command_with_input(&mut cmd, input.as_bytes()).await?;
        }
        self.call_git(["remote", "remove", "datalad"]).await?;
        Ok(())
    }

    /// Walk the working tree the way the tracker expects: regular files and
    /// symlinks by relative path, git-linked subdirectories (submodules) as
    /// single entries, bookkeeping files skipped
    pub(crate) fn dataset_files(&self) -> anyhow::Result<Vec<String>> {
        let mut found = Vec::new();
        let mut queue: VecDeque<PathBuf> = VecDeque::new();
        match std::fs::read_dir(&self.path) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !is_meta_file(&name, true) {
                        queue.push_back(entry.path());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e).context("failed to read dataset directory"),
        }
        while let Some(p) = queue.pop_front() {
            let relpath = p
                .strip_prefix(&self.path)
                .expect("queued path should be under dataset root")
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            let ftype = std::fs::symlink_metadata(&p)?.file_type();
            if ftype.is_file() || ftype.is_symlink() {
                found.push(relpath);
            } else if ftype.is_dir() {
                if p.join(".git").exists() {
                    // installed subdataset (or not even added/known yet)
                    found.push(relpath);
                } else {
                    for entry in std::fs::read_dir(&p)? {
                        queue.push_back(entry?.path());
                    }
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_ls_tree_entries() {
        let fst =
            FileStat::from_entry("100644 blob 8e4a779a3a1d8a13eac1294ca0f0bd4ab5ed0ba1     371\tsub-01/sub-01.json")
                .unwrap();
        assert_eq!(
            fst,
            FileStat {
                path: String::from("sub-01/sub-01.json"),
                kind: ObjectType::Blob,
                size: Some(371),
            }
        );
        let fst = FileStat::from_entry(
            "160000 commit 66b6a326db9939196b2d74e0f85788f74ab6245d       -\tz/sample.zarr",
        )
        .unwrap();
        assert_eq!(fst.kind, ObjectType::Commit);
        assert_eq!(fst.size, None);
    }

    #[test]
    fn parse_annexed_file_with_string_bytesize() {
        let line = r#"{"backend":"MD5E","bytesize":"1516","error-messages":[],"file":"arr/0","hashdirlower":"00/00/","hashdirmixed":"00/00/","humansize":"1.52 kB","key":"MD5E-s1516--f6b1d5e8a8c2e9e7cb8bcb0a7b2f1a2e","keyname":"f6b1d5e8a8c2e9e7cb8bcb0a7b2f1a2e","mtime":"unknown"}"#;
        let f = serde_json::from_str::<AnnexedFile>(line).unwrap();
        assert_eq!(f.backend, "MD5E");
        assert_eq!(f.bytesize, 1516);
        assert_eq!(f.file, "arr/0");
    }

    #[test]
    fn parse_annexed_file_with_numeric_bytesize() {
        let line = r#"{"backend":"SHA256E","bytesize":5,"file":"nulls.dat","key":"SHA256E-s5--0d17cd6b4e93a6f482f9d947dbbbf175de8d951a2fab0a3e47400b5c9bb09c33.dat"}"#;
        let f = serde_json::from_str::<AnnexedFile>(line).unwrap();
        assert_eq!(f.bytesize, 5);
    }

    #[test]
    fn assets_state_roundtrip() {
        let state = AssetsState {
            timestamp: time::macros::datetime!(2021-01-01 12:34:56 UTC),
        };
        let blob = serde_json::to_string_pretty(&state).unwrap();
        assert!(blob.contains("2021-01-01T12:34:56Z"), "bad blob: {blob}");
        let back = serde_json::from_str::<AssetsState>(&blob).unwrap();
        assert_eq!(back, state);
    }

    #[tokio::test]
    async fn dataset_files_walk() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join(".dandi")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("subdir1")).unwrap();
        std::fs::create_dir_all(root.join("z/sample.zarr/.git")).unwrap();
        std::fs::write(root.join("dandiset.yaml"), "id: 000001\n").unwrap();
        std::fs::write(root.join(".dandi/assets.json"), "[]").unwrap();
        std::fs::write(root.join("file.txt"), "This is test text.\n").unwrap();
        std::fs::write(root.join("subdir1/apple.txt"), "Apple\n").unwrap();
        let ds = AsyncDataset::new(root);
        let mut files = ds.dataset_files().unwrap();
        files.sort();
        assert_eq!(files, ["file.txt", "subdir1/apple.txt", "z/sample.zarr"]);
    }
}
