//! Re-registration of S3 URLs after a Dandiset leaves embargo.
//!
//! While a Dandiset is embargoed its blobs' bucket URLs are never stored, so
//! when it opens up every annexed key needs its versioned S3 URL attached.
use crate::annex::{key2hash, AsyncAnnex};
use crate::blob::BlobBackup;
use crate::dandi::RemoteDandiset;
use crate::dataset::AsyncDataset;
use crate::manager::Manager;
use futures_util::TryStreamExt;
use std::collections::BTreeMap;

pub(crate) async fn register_s3urls(
    manager: &Manager,
    dandiset: &RemoteDandiset,
    ds: &AsyncDataset,
) -> anyhow::Result<()> {
    let mut paths2keys = ds
        .annexed_files()
        .await?
        .into_iter()
        .map(|f| (f.file, f.key))
        .collect::<BTreeMap<_, _>>();
    let annex = AsyncAnnex::new(ds.path().to_owned(), "SHA256");
    {
        let assets = dandiset.stream_assets();
        let mut assets = std::pin::pin!(assets);
        while let Some(asset) = assets.try_next().await? {
            if asset.is_zarr() {
                // Zarrs cannot have been added while embargoed and thus are
                // not missing S3 URLs
                continue;
            }
            let Some(sha256_digest) = asset.sha256_digest() else {
                tracing::info!(
                    asset = %asset.path(),
                    "SHA256 has not been computed yet; not fetching any more assets",
                );
                break;
            };
            let blob = BlobBackup {
                sha256_digest: sha256_digest.to_owned(),
                asset: asset.clone(),
            };
            let Some(key) = paths2keys.remove(blob.path().as_str()) else {
                // Either the asset is text (and thus not annexed and thus not
                // eligible to have URLs registered) or it was added to the
                // Dandiset since the previous backup (and thus we don't have
                // a local backup to register any URLs on)
                continue;
            };
            if key2hash(&key) == blob.sha256_digest {
                let bucket_url = blob
                    .get_file_bucket_url(&manager.http, &manager.config)
                    .await?;
                blob.register_url(&annex, &key, bucket_url.as_str())
                    .await?;
            }
        }
    }
    annex.shutdown().await?;
    if !paths2keys.is_empty() {
        let mut listing = String::new();
        for path in paths2keys.keys() {
            listing.push_str("    ");
            listing.push_str(path);
            listing.push('\n');
        }
        tracing::warn!(
            "The following assets are no longer in the Dandiset's draft version, and thus their S3 URLs could not be determined:\n{listing}",
        );
    }
    Ok(())
}
