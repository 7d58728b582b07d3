//! Per-blob backup state and the text/binary split.
//!
//! Text-typed assets are stored inline in git and thus routed through the
//! downloading `addurl` worker; everything else only gets its key and URLs
//! registered, with the bytes left for the populate stage.
use crate::annex::AsyncAnnex;
use crate::config::BackupConfig;
use crate::dandi::Asset;
use crate::httputil::{Client, HttpUrl};
use crate::paths::PurePath;
use anyhow::Context;

/// File extensions (lowercased, without the leading period) treated as text.
///
/// This list must be kept in sorted order; this is enforced by a test below.
static TEXT_EXTENSIONS: &[&str] = &[
    "bash", "bat", "bib", "c", "cfg", "cpp", "css", "csv", "h", "htm", "html", "ini", "ipynb",
    "js", "json", "log", "m", "md", "py", "r", "rb", "rst", "sh", "svg", "tex", "toml", "tsv",
    "txt", "xml", "yaml", "yml",
];

/// Extensionless file names treated as text.
///
/// This list must be kept in sorted order; this is enforced by a test below.
static TEXT_FILENAMES: &[&str] = &["CHANGELOG", "LICENSE", "Makefile", "README"];

/// Is the file at `path` text-typed?  Anything unrecognized — including
/// extensionless files — is binary.
pub(crate) fn is_text_path(path: &PurePath) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_ascii_lowercase();
            TEXT_EXTENSIONS.binary_search(&&*ext).is_ok()
        }
        None => TEXT_FILENAMES.binary_search(&path.name_str()).is_ok(),
    }
}

/// A blob asset together with the server-reported SHA256 that syncing is
/// promising to reproduce
#[derive(Clone, Debug)]
pub(crate) struct BlobBackup {
    pub(crate) asset: Asset,
    pub(crate) sha256_digest: String,
}

impl BlobBackup {
    pub(crate) fn path(&self) -> &PurePath {
        self.asset.path()
    }

    pub(crate) fn is_binary(&self) -> bool {
        !is_text_path(self.asset.path())
    }

    /// Resolve the asset's S3 content URL to a versioned bucket URL by
    /// asking the bucket for the object's current version ID
    pub(crate) async fn get_file_bucket_url(
        &self,
        client: &Client,
        config: &BackupConfig,
    ) -> anyhow::Result<HttpUrl> {
        tracing::debug!(asset = %self.path(), "Fetching bucket URL");
        let aws_url = self
            .asset
            .content_url(&config.content_url_regex)
            .with_context(|| {
                format!(
                    "asset {} has no contentUrl matching {}",
                    self.path(),
                    config.content_url_regex,
                )
            })?;
        let key = aws_url.as_url().path().trim_start_matches('/').to_owned();
        let head_url = format!("https://{}.s3.amazonaws.com/{}", config.s3bucket, key)
            .parse::<HttpUrl>()
            .context("constructed bucket URL is invalid")?;
        let r = client.head(head_url).await?;
        let version_id = r
            .headers()
            .get("x-amz-version-id")
            .with_context(|| format!("no x-amz-version-id header for {key:?}"))?
            .to_str()
            .context("undecodable x-amz-version-id header")?
            .to_owned();
        let mut url = aws_url;
        url.set_query(Some(&format!("versionId={version_id}")));
        Ok(url)
    }

    pub(crate) async fn register_url(
        &self,
        annex: &AsyncAnnex,
        key: &str,
        url: &str,
    ) -> Result<(), crate::annex::AnnexError> {
        tracing::info!(asset = %self.path(), url, "Registering URL");
        annex.register_url(key, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use rstest::rstest;

    #[test]
    fn text_extensions_are_sorted() {
        assert!(TEXT_EXTENSIONS.iter().tuple_windows().all(|(a, b)| a < b));
    }

    #[test]
    fn text_filenames_are_sorted() {
        assert!(TEXT_FILENAMES.iter().tuple_windows().all(|(a, b)| a < b));
    }

    #[rstest]
    #[case("file.txt", true)]
    #[case("subdir2/coconut.txt", true)]
    #[case("dataset_description.json", true)]
    #[case("README", true)]
    #[case("notes.TXT", true)]
    #[case("nulls.dat", false)]
    #[case("hi.txt.gz", false)]
    #[case("img/png/pixel.png", false)]
    #[case("sub-01/sub-01.nwb", false)]
    #[case("noextension", false)]
    fn classify(#[case] path: &str, #[case] text: bool) {
        let path = path.parse::<PurePath>().unwrap();
        assert_eq!(is_text_path(&path), text, "misclassified {path}");
    }
}
