//! Bookkeeping for which assets the backup already has, gains, and loses
//! during one sync run
use crate::config::BackupConfig;
use crate::dandi::Asset;
use crate::dataset::AsyncDataset;
use crate::util::diff_metadata;
use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

/// In-memory snapshot of the filesystem at sync start plus the evolving
/// record of what the server reports.
///
/// Lifecycle: constructed from `assets.json` and a working-tree walk, mutated
/// under the single per-Dandiset task tree, dumped at the end of each
/// version segment.
#[derive(Clone, Debug)]
pub(crate) struct AssetTracker {
    /// The path to the `.dandi/assets.json` file that this instance manages
    filepath: PathBuf,
    /// Paths of files found when the syncing started, minus the paths for
    /// any assets downloaded during syncing
    local_assets: BTreeSet<String>,
    /// Metadata for assets currently being downloaded, as a mapping from
    /// asset paths to records
    in_progress: HashMap<String, serde_json::Value>,
    /// Asset metadata from the previous sync, plus metadata for any assets
    /// completely downloaded during this sync, as a mapping from asset paths
    /// to records
    asset_metadata: BTreeMap<String, serde_json::Value>,
    /// Paths of assets that are not being downloaded this run due to a lack
    /// of SHA256 digests
    future_assets: BTreeSet<String>,
    /// Paths of assets reported by the remote server
    remote_assets: BTreeSet<String>,
}

impl AssetTracker {
    /// Construct a tracker from an existing `assets.json` (if any) and a
    /// pre-collected set of local working-tree paths
    pub(crate) fn load(
        filepath: PathBuf,
        local_assets: BTreeSet<String>,
    ) -> anyhow::Result<AssetTracker> {
        let mut asset_metadata = BTreeMap::new();
        match std::fs::read_to_string(&filepath) {
            Ok(src) => {
                let records = serde_json::from_str::<Vec<serde_json::Value>>(&src)
                    .with_context(|| format!("malformed {}", filepath.display()))?;
                for md in records {
                    let Some(path) = md.get("path").and_then(serde_json::Value::as_str) else {
                        anyhow::bail!("old assets.json format found in {}", filepath.display());
                    };
                    asset_metadata.insert(path.trim_start_matches('/').to_owned(), md);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", filepath.display()))
            }
        }
        Ok(AssetTracker {
            filepath,
            local_assets,
            in_progress: HashMap::new(),
            asset_metadata,
            future_assets: BTreeSet::new(),
            remote_assets: BTreeSet::new(),
        })
    }

    /// Construct a tracker for the given dataset, walking its working tree
    /// and including any registered-but-uninstalled submodules
    pub(crate) async fn from_dataset(ds: &AsyncDataset) -> anyhow::Result<AssetTracker> {
        let mut local_assets = ds.dataset_files()?.into_iter().collect::<BTreeSet<_>>();
        for submodule in ds.get_submodules().await? {
            local_assets.insert(submodule.path);
        }
        let filepath = ds.path().join(".dandi").join("assets.json");
        AssetTracker::load(filepath, local_assets)
    }

    /// Record that the server reported an asset at `path`
    pub(crate) fn add_remote(&mut self, path: &str) {
        self.remote_assets.insert(path.to_owned());
    }

    /// Stash the asset's current metadata and return a textual diff against
    /// the last-synced metadata, or `None` if nothing changed (unless
    /// `force_update` demands a re-sync)
    pub(crate) fn register_asset(&mut self, asset: &Asset, force_update: bool) -> Option<String> {
        let path = asset.path().to_string();
        self.local_assets.remove(&path);
        let record = asset.raw().clone();
        let old_metadata = self.asset_metadata.get(&path);
        let diff = if old_metadata != Some(&record) {
            let d = diff_metadata(old_metadata, &record);
            Some(if d.is_empty() {
                String::from("<metadata unequal but no diff generated>")
            } else {
                d
            })
        } else if force_update {
            Some(String::from("<Forced update via --force assets-update>"))
        } else {
            None
        };
        self.in_progress.insert(path, record);
        diff
    }

    /// Cheaper variant used under Zarr `asset-checksum` mode: only the
    /// `modified` timestamp is compared
    pub(crate) fn register_asset_by_timestamp(
        &mut self,
        asset: &Asset,
        force_update: bool,
    ) -> bool {
        let path = asset.path().to_string();
        self.local_assets.remove(&path);
        let record = asset.raw().clone();
        let modified = record.get("modified").cloned();
        let old_modified = self
            .asset_metadata
            .get(&path)
            .and_then(|md| md.get("modified"))
            .cloned();
        self.in_progress.insert(path, record);
        modified != old_modified || force_update
    }

    /// Promote the asset's stashed metadata into the durable map.  Must be
    /// called after the asset's bytes have materialized and before the next
    /// commit.
    pub(crate) fn finish_asset(&mut self, path: &str) {
        if let Some(md) = self.in_progress.remove(path) {
            self.asset_metadata.insert(path.to_owned(), md);
        }
    }

    /// Record that the asset is deferred to a future run
    pub(crate) fn mark_future(&mut self, asset: &Asset) {
        self.future_assets.insert(asset.path().to_string());
    }

    pub(crate) fn future_qty(&self) -> usize {
        self.future_assets.len()
    }

    /// Paths that were present locally at start, match the asset filter, and
    /// were never registered this run; their metadata is dropped
    pub(crate) fn get_deleted(&mut self, config: &BackupConfig) -> Vec<String> {
        let mut deleted = Vec::new();
        for apath in &self.local_assets {
            if config.match_asset(apath) {
                self.asset_metadata.remove(apath);
                deleted.push(apath.clone());
            }
        }
        deleted
    }

    /// Drop metadata entries whose paths the server no longer reports;
    /// returns the pruned paths
    pub(crate) fn prune_metadata(&mut self) -> Vec<String> {
        let mut pruned = Vec::new();
        self.asset_metadata.retain(|path, _| {
            if self.remote_assets.contains(path) {
                true
            } else {
                pruned.push(path.clone());
                false
            }
        });
        pruned
    }

    /// Write the durable metadata map as a JSON array sorted by path
    pub(crate) fn dump(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.filepath.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let records = self.asset_metadata.values().collect::<Vec<_>>();
        let mut blob = serde_json::to_string_pretty(&records)?;
        blob.push('\n');
        std::fs::write(&self.filepath, blob)
            .with_context(|| format!("failed to write {}", self.filepath.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httputil::HttpUrl;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn api_url() -> HttpUrl {
        "https://api.dandiarchive.org/api".parse::<HttpUrl>().unwrap()
    }

    fn asset(path: &str, size: i64) -> Asset {
        Asset::from_record(
            &api_url(),
            json!({
                "asset_id": format!("id-{path}"),
                "blob": "b0000000-0000-0000-0000-000000000000",
                "zarr": null,
                "path": path,
                "size": size,
                "created": "2021-01-01T00:00:00Z",
                "modified": "2021-01-01T00:00:00Z",
                "metadata": {"contentUrl": [], "digest": {}},
            }),
        )
        .unwrap()
    }

    fn tracker_with(locals: &[&str]) -> AssetTracker {
        let tmp = tempfile::tempdir().unwrap();
        AssetTracker::load(
            tmp.path().join("assets.json"),
            locals.iter().map(|s| String::from(*s)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn register_new_asset_yields_diff() {
        let mut tracker = tracker_with(&[]);
        let a = asset("sub-01/file.txt", 12);
        let diff = tracker.register_asset(&a, false);
        assert!(diff.is_some(), "new asset should produce a diff");
        tracker.finish_asset("sub-01/file.txt");
        let diff = tracker.register_asset(&a, false);
        assert_eq!(diff, None, "unchanged asset should not produce a diff");
    }

    #[test]
    fn force_update_overrides_equality() {
        let mut tracker = tracker_with(&[]);
        let a = asset("file.txt", 12);
        tracker.register_asset(&a, false);
        tracker.finish_asset("file.txt");
        let diff = tracker.register_asset(&a, true);
        assert_eq!(
            diff.as_deref(),
            Some("<Forced update via --force assets-update>")
        );
    }

    #[test]
    fn register_by_timestamp() {
        let mut tracker = tracker_with(&[]);
        let a = asset("z/sample.zarr", 100);
        assert!(tracker.register_asset_by_timestamp(&a, false));
        tracker.finish_asset("z/sample.zarr");
        assert!(!tracker.register_asset_by_timestamp(&a, false));
        assert!(tracker.register_asset_by_timestamp(&a, true));
    }

    #[test]
    fn deleted_assets_respect_filter() {
        let mut tracker = tracker_with(&["keep.nwb", "gone.nwb", "skipped.json"]);
        let cfg = serde_yaml::from_str::<BackupConfig>("asset_filter: '\\.nwb$'").unwrap();
        let a = asset("keep.nwb", 1);
        tracker.register_asset(&a, false);
        tracker.finish_asset("keep.nwb");
        let deleted = tracker.get_deleted(&cfg);
        assert_eq!(deleted, ["gone.nwb"]);
    }

    #[test]
    fn prune_drops_unseen_paths() {
        let mut tracker = tracker_with(&[]);
        for path in ["a.txt", "b.txt", "c.txt"] {
            let a = asset(path, 1);
            tracker.register_asset(&a, false);
            tracker.finish_asset(path);
        }
        tracker.add_remote("a.txt");
        tracker.add_remote("c.txt");
        let pruned = tracker.prune_metadata();
        assert_eq!(pruned, ["b.txt"]);
        assert_eq!(tracker.prune_metadata(), Vec::<String>::new());
    }

    #[test]
    fn dump_is_sorted_by_path() {
        let tmp = tempfile::tempdir().unwrap();
        let filepath = tmp.path().join(".dandi").join("assets.json");
        let mut tracker = AssetTracker::load(filepath.clone(), BTreeSet::new()).unwrap();
        for path in ["subdir2/banana.txt", "file.txt", "subdir1/apple.txt"] {
            let a = asset(path, 1);
            tracker.register_asset(&a, false);
            tracker.finish_asset(path);
        }
        tracker.dump().unwrap();
        let records =
            serde_json::from_str::<Vec<serde_json::Value>>(&std::fs::read_to_string(&filepath).unwrap())
                .unwrap();
        let paths = records
            .iter()
            .map(|r| r["path"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(paths, ["file.txt", "subdir1/apple.txt", "subdir2/banana.txt"]);
        let reloaded = AssetTracker::load(filepath, BTreeSet::new()).unwrap();
        assert_eq!(reloaded.asset_metadata.len(), 3);
    }

    #[test]
    fn future_assets_are_counted() {
        let mut tracker = tracker_with(&[]);
        assert_eq!(tracker.future_qty(), 0);
        tracker.mark_future(&asset("big.dat", 1 << 30));
        assert_eq!(tracker.future_qty(), 1);
        tracker.mark_future(&asset("big.dat", 1 << 30));
        assert_eq!(tracker.future_qty(), 1);
    }
}
