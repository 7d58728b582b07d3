//! Mirror Dandisets as git-annex repositories.
//!
//! Visit <https://github.com/dandi/dandisync> for more information.
mod annex;
mod blob;
mod checksum;
mod config;
mod consts;
mod dandi;
mod dataset;
mod datasetter;
mod downloader;
mod github;
mod httputil;
mod manager;
mod paths;
mod procio;
mod register_s3;
mod s3;
mod syncer;
mod tracker;
mod util;
mod zarr;
use crate::config::{BackupConfig, Filter, Mode, ZarrMode};
use crate::dandi::{DandiClient, DandisetId};
use crate::datasetter::DandiDatasetter;
use crate::github::{GitHubClient, RepoHost};
use crate::manager::Manager;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Debug, Parser)]
#[command(version)]
struct Arguments {
    /// Directory under which the backup trees are placed
    #[arg(short = 'B', long)]
    backup_root: Option<PathBuf>,

    /// Path to the backup configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// How many parallel jobs to use when downloading and pushing
    #[arg(short = 'J', long)]
    jobs: Option<usize>,

    /// Set logging level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Sync the backup repositories against the remote Archive
    UpdateFromBackup {
        /// Only back up assets whose paths match the given regex
        #[arg(long)]
        asset_filter: Option<Filter>,

        /// Skip Dandisets whose identifiers match the given regex
        #[arg(long)]
        exclude: Option<Filter>,

        /// Set to "assets-update" to re-sync assets even when their metadata
        /// is unchanged
        #[arg(long)]
        force: Option<String>,

        /// Allow pruning of assets.json entries the server no longer reports
        #[arg(long)]
        gc_assets: bool,

        /// When to sync a Dandiset: 'timestamp' — only if the draft was
        /// modified since the last backup; 'force' — always; 'verify' —
        /// always, but error if anything changes
        #[arg(long)]
        mode: Option<Mode>,

        /// When to sync a Zarr
        #[arg(long)]
        zarr_mode: Option<ZarrMode>,

        /// How many Dandisets to sync at once
        #[arg(long)]
        workers: Option<usize>,

        /// The Dandisets to back up; all by default
        dandisets: Vec<DandisetId>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();
    init_logging(args.log_level);
    tracing::info!(
        "COMMAND: {}",
        std::env::args().collect::<Vec<_>>().join(" ")
    );
    let mut cfg = match &args.config {
        Some(path) => BackupConfig::load_yaml(path)?,
        None => BackupConfig::default(),
    };
    if let Some(backup_root) = args.backup_root {
        cfg.backup_root = backup_root;
    }
    if let Some(jobs) = args.jobs {
        cfg.jobs = jobs;
    }
    let api_token = std::env::var("DANDI_API_KEY")
        .ok()
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
        .context("DANDI_API_KEY environment variable not set")?;
    match args.command {
        Command::UpdateFromBackup {
            asset_filter,
            exclude,
            force,
            gc_assets,
            mode,
            zarr_mode,
            workers,
            dandisets,
        } => {
            if let Some(asset_filter) = asset_filter {
                cfg.asset_filter = Some(asset_filter);
            }
            if let Some(force) = force {
                cfg.force = Some(force);
            }
            if gc_assets {
                cfg.gc_assets = true;
            }
            if let Some(mode) = mode {
                cfg.mode = mode;
            }
            if let Some(zarr_mode) = zarr_mode {
                cfg.zarr_mode = zarr_mode;
            }
            if let Some(workers) = workers {
                cfg.workers = workers;
            }
            cfg.validate()?;
            let datasetter = build_datasetter(cfg, api_token)?;
            datasetter
                .update_from_backup(&dandisets, exclude.as_ref())
                .await
        }
    }
}

fn build_datasetter(cfg: BackupConfig, api_token: String) -> anyhow::Result<DandiDatasetter> {
    let gh: Option<Arc<dyn RepoHost>> = if cfg.gh_org().is_some() {
        let token = std::env::var("GITHUB_TOKEN")
            .ok()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .context("GITHUB_TOKEN environment variable required when a GitHub org is configured")?;
        Some(Arc::new(GitHubClient::new(&token)?))
    } else {
        None
    };
    let client = DandiClient::new(cfg.dandi_api_url.clone(), Some(&api_token))?;
    let manager = Manager::new(cfg, gh, Some(api_token))?;
    Ok(DandiDatasetter::new(client, manager))
}

fn init_logging(level: tracing::Level) {
    use tracing_subscriber::filter::{EnvFilter, LevelFilter};
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(filter)
        .init();
}
