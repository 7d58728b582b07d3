use crate::config::Filter;
use crate::httputil::HttpUrl;
use crate::paths::PurePath;
use serde::{de::Deserializer, Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// One page of a paginated API response
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct Page<T> {
    pub(super) next: Option<HttpUrl>,
    pub(super) results: Vec<T>,
}

/// A Dandiset's embargo state as reported by the Archive and as recorded in
/// the repository config
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub(crate) enum EmbargoStatus {
    #[default]
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "UNEMBARGOING")]
    Unembargoing,
    #[serde(rename = "EMBARGOED")]
    Embargoed,
}

impl EmbargoStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            EmbargoStatus::Open => "OPEN",
            EmbargoStatus::Unembargoing => "UNEMBARGOING",
            EmbargoStatus::Embargoed => "EMBARGOED",
        }
    }
}

impl fmt::Display for EmbargoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmbargoStatus {
    type Err = ParseEmbargoStatusError;

    fn from_str(s: &str) -> Result<EmbargoStatus, ParseEmbargoStatusError> {
        match s {
            "OPEN" => Ok(EmbargoStatus::Open),
            "UNEMBARGOING" => Ok(EmbargoStatus::Unembargoing),
            "EMBARGOED" => Ok(EmbargoStatus::Embargoed),
            _ => Err(ParseEmbargoStatusError(s.to_owned())),
        }
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("not a valid embargo status: {0:?}")]
pub(crate) struct ParseEmbargoStatusError(String);

/// The identifier of a Dandiset: six decimal digits
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub(crate) struct DandisetId(String);

impl DandisetId {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DandisetId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DandisetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DandisetId {
    type Err = ParseDandisetIdError;

    fn from_str(s: &str) -> Result<DandisetId, ParseDandisetIdError> {
        if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(DandisetId(s.to_owned()))
        } else {
            Err(ParseDandisetIdError(s.to_owned()))
        }
    }
}

impl<'de> Deserialize<'de> for DandisetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<DandisetId>().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("not a valid Dandiset identifier: {0:?}")]
pub(crate) struct ParseDandisetIdError(String);

/// The identifier of a Dandiset version: either `draft` or a published
/// version number of the form `N.NNNNNN.NNNN`
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub(crate) struct VersionId(String);

impl VersionId {
    pub(crate) fn draft() -> VersionId {
        VersionId(String::from("draft"))
    }

    pub(crate) fn is_draft(&self) -> bool {
        self.0 == "draft"
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for VersionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for VersionId {
    type Err = ParseVersionIdError;

    fn from_str(s: &str) -> Result<VersionId, ParseVersionIdError> {
        let published = {
            let mut parts = s.split('.');
            parts.clone().count() == 3
                && parts.all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
        };
        if s == "draft" || published {
            Ok(VersionId(s.to_owned()))
        } else {
            Err(ParseVersionIdError(s.to_owned()))
        }
    }
}

impl<'de> Deserialize<'de> for VersionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<VersionId>().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("not a valid version identifier: {0:?}")]
pub(crate) struct ParseVersionIdError(String);

/// A Dandiset as returned by the Archive's Dandiset endpoints
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct Dandiset {
    pub(crate) identifier: DandisetId,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) modified: OffsetDateTime,
    #[serde(default)]
    pub(crate) embargo_status: EmbargoStatus,
    pub(crate) draft_version: Option<DandisetVersion>,
    pub(crate) most_recent_published_version: Option<DandisetVersion>,
}

/// One version of a Dandiset
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct DandisetVersion {
    pub(crate) version: VersionId,
    pub(crate) size: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) modified: OffsetDateTime,
}

/// An entry of the paginated asset list; the full record is fetched
/// separately per asset
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct AssetListItem {
    pub(super) asset_id: String,
}

/// Whether an asset is a blob or a Zarr, and the identifier of its payload
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum AssetKind {
    Blob { blob_id: String },
    Zarr { zarr_id: String },
}

/// A single asset of a Dandiset version.
///
/// The full API record is retained verbatim (`raw`) so that `assets.json`
/// stores exactly what the server reported; the parsed fields are just
/// accessors into it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Asset {
    raw: serde_json::Value,
    asset_id: String,
    path: PurePath,
    size: i64,
    created: OffsetDateTime,
    modified: OffsetDateTime,
    kind: AssetKind,
    download_url: HttpUrl,
}

impl Asset {
    /// Parse an asset record as returned by the Archive's asset endpoints
    pub(crate) fn from_record(
        api_url: &HttpUrl,
        raw: serde_json::Value,
    ) -> Result<Asset, AssetParseError> {
        fn field<'a>(raw: &'a serde_json::Value, name: &'static str) -> Result<&'a str, AssetParseError> {
            raw.get(name)
                .and_then(serde_json::Value::as_str)
                .ok_or(AssetParseError::MissingField { name })
        }

        let asset_id = field(&raw, "asset_id")?.to_owned();
        let path = field(&raw, "path")?
            .trim_start_matches('/')
            .parse::<PurePath>()
            .map_err(|source| AssetParseError::BadPath {
                asset_id: asset_id.clone(),
                source,
            })?;
        let size = raw
            .get("size")
            .and_then(serde_json::Value::as_i64)
            .ok_or(AssetParseError::MissingField { name: "size" })?;
        let created = parse_timestamp(&raw, "created", &asset_id)?;
        let modified = parse_timestamp(&raw, "modified", &asset_id)?;
        let blob = raw.get("blob").and_then(serde_json::Value::as_str);
        let zarr = raw.get("zarr").and_then(serde_json::Value::as_str);
        let kind = match (blob, zarr) {
            (Some(blob_id), None) => AssetKind::Blob {
                blob_id: blob_id.to_owned(),
            },
            (None, Some(zarr_id)) => AssetKind::Zarr {
                zarr_id: zarr_id.to_owned(),
            },
            (None, None) => return Err(AssetParseError::Neither { asset_id }),
            (Some(_), Some(_)) => return Err(AssetParseError::Both { asset_id }),
        };
        let mut download_url = api_url.clone();
        download_url
            .extend(["assets", &asset_id, "download"])
            .ensure_dirpath();
        Ok(Asset {
            raw,
            asset_id,
            path,
            size,
            created,
            modified,
            kind,
            download_url,
        })
    }

    pub(crate) fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    pub(crate) fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub(crate) fn path(&self) -> &PurePath {
        &self.path
    }

    pub(crate) fn size(&self) -> i64 {
        self.size
    }

    pub(crate) fn created(&self) -> OffsetDateTime {
        self.created
    }

    pub(crate) fn modified(&self) -> OffsetDateTime {
        self.modified
    }

    pub(crate) fn kind(&self) -> &AssetKind {
        &self.kind
    }

    pub(crate) fn is_zarr(&self) -> bool {
        matches!(self.kind, AssetKind::Zarr { .. })
    }

    pub(crate) fn zarr_id(&self) -> Option<&str> {
        match &self.kind {
            AssetKind::Zarr { zarr_id } => Some(zarr_id),
            AssetKind::Blob { .. } => None,
        }
    }

    /// The URL for downloading the asset through the Archive
    pub(crate) fn base_download_url(&self) -> &HttpUrl {
        &self.download_url
    }

    fn digest(&self, key: &str) -> Option<&str> {
        self.raw
            .get("metadata")?
            .get("digest")?
            .get(key)?
            .as_str()
    }

    /// The SHA256 digest reported by the server, if computed yet
    pub(crate) fn sha256_digest(&self) -> Option<&str> {
        self.digest("dandi:sha2-256")
    }

    pub(crate) fn dandi_etag(&self) -> Option<&str> {
        self.digest("dandi:dandi-etag")
    }

    /// The Zarr tree checksum reported by the server; absent for empty or
    /// freshly-uploaded Zarrs
    pub(crate) fn zarr_checksum(&self) -> Option<&str> {
        self.digest("dandi:dandi-zarr-checksum")
    }

    /// The first `contentUrl` matching the given regex; this is the S3
    /// variant of the asset's download URLs
    pub(crate) fn content_url(&self, rgx: &Filter) -> Option<HttpUrl> {
        self.raw
            .get("metadata")?
            .get("contentUrl")?
            .as_array()?
            .iter()
            .filter_map(serde_json::Value::as_str)
            .find(|u| rgx.is_match(u))
            .and_then(|u| u.parse::<HttpUrl>().ok())
    }
}

fn parse_timestamp(
    raw: &serde_json::Value,
    name: &'static str,
    asset_id: &str,
) -> Result<OffsetDateTime, AssetParseError> {
    let s = raw
        .get(name)
        .and_then(serde_json::Value::as_str)
        .ok_or(AssetParseError::MissingField { name })?;
    OffsetDateTime::parse(s, &Rfc3339).map_err(|source| AssetParseError::BadTimestamp {
        asset_id: asset_id.to_owned(),
        name,
        source,
    })
}

#[derive(Debug, Error)]
pub(crate) enum AssetParseError {
    #[error("asset record lacks {name:?} field")]
    MissingField { name: &'static str },
    #[error("asset {asset_id} has an invalid path")]
    BadPath {
        asset_id: String,
        source: crate::paths::ParsePurePathError,
    },
    #[error("asset {asset_id} has an unparseable {name:?} timestamp")]
    BadTimestamp {
        asset_id: String,
        name: &'static str,
        source: time::error::Parse,
    },
    #[error(r#"asset {asset_id} has neither "blob" nor "zarr" set"#)]
    Neither { asset_id: String },
    #[error(r#"asset {asset_id} has both "blob" and "zarr" set"#)]
    Both { asset_id: String },
}

/// An item of the per-version asset stream: either an asset or a marker that
/// all assets of the named published version have been yielded
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum AssetEvent {
    Item(Asset),
    Boundary(DandisetVersion),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use serde_json::json;

    fn api_url() -> HttpUrl {
        "https://api.dandiarchive.org/api".parse::<HttpUrl>().unwrap()
    }

    fn blob_record() -> serde_json::Value {
        json!({
            "asset_id": "fa0e6d2e-c73e-4191-9ca1-4d0cccb6368b",
            "blob": "5e9c1b0f-2ca6-40a9-b19d-07af1d338abc",
            "zarr": null,
            "path": "sub-01/sub-01.nwb",
            "size": 1536,
            "created": "2021-02-03T04:05:06.789012Z",
            "modified": "2021-02-03T04:05:07.000000Z",
            "metadata": {
                "contentUrl": [
                    "https://api.dandiarchive.org/api/assets/fa0e6d2e-c73e-4191-9ca1-4d0cccb6368b/download/",
                    "https://dandiarchive.s3.amazonaws.com/blobs/5e9/c1b/5e9c1b0f-2ca6-40a9-b19d-07af1d338abc",
                ],
                "digest": {
                    "dandi:dandi-etag": "f1e1b7a8b3c1700e6c6b46b0b07d9b2c-1",
                    "dandi:sha2-256": "1a0bd24a0d0ab4d50d70a0b42a1732bd7bc4c4a64623b24a42b10e0aabe0ee26",
                },
            },
        })
    }

    #[test]
    fn parse_blob_asset() {
        let asset = Asset::from_record(&api_url(), blob_record()).unwrap();
        assert_eq!(asset.asset_id(), "fa0e6d2e-c73e-4191-9ca1-4d0cccb6368b");
        assert_eq!(asset.path(), "sub-01/sub-01.nwb");
        assert_eq!(asset.size(), 1536);
        assert!(!asset.is_zarr());
        assert_matches!(
            asset.kind(),
            AssetKind::Blob { blob_id } if blob_id == "5e9c1b0f-2ca6-40a9-b19d-07af1d338abc"
        );
        assert_eq!(
            asset.sha256_digest(),
            Some("1a0bd24a0d0ab4d50d70a0b42a1732bd7bc4c4a64623b24a42b10e0aabe0ee26")
        );
        assert_eq!(
            asset.dandi_etag(),
            Some("f1e1b7a8b3c1700e6c6b46b0b07d9b2c-1")
        );
        assert_eq!(asset.zarr_checksum(), None);
        assert_eq!(
            asset.base_download_url().as_str(),
            "https://api.dandiarchive.org/api/assets/fa0e6d2e-c73e-4191-9ca1-4d0cccb6368b/download/"
        );
        let rgx = "amazonaws.com/.*blobs/".parse::<Filter>().unwrap();
        assert_eq!(
            asset.content_url(&rgx).unwrap().as_str(),
            "https://dandiarchive.s3.amazonaws.com/blobs/5e9/c1b/5e9c1b0f-2ca6-40a9-b19d-07af1d338abc"
        );
    }

    #[test]
    fn parse_zarr_asset() {
        let record = json!({
            "asset_id": "8f8f3bb2-29f3-4b37-83f0-1a1b16e2b250",
            "blob": null,
            "zarr": "7e10ceaf-ea72-4bd0-be23-8a0a2bd4d6a7",
            "path": "z/sample.zarr",
            "size": 42000,
            "created": "2021-02-03T04:05:06Z",
            "modified": "2021-02-03T04:05:07Z",
            "metadata": {
                "digest": {"dandi:dandi-zarr-checksum": "4313ab36412ffe13b6bbb4a27bbbc0a7-18--1516"},
            },
        });
        let asset = Asset::from_record(&api_url(), record).unwrap();
        assert!(asset.is_zarr());
        assert_eq!(asset.zarr_id(), Some("7e10ceaf-ea72-4bd0-be23-8a0a2bd4d6a7"));
        assert_eq!(
            asset.zarr_checksum(),
            Some("4313ab36412ffe13b6bbb4a27bbbc0a7-18--1516")
        );
        assert_eq!(asset.sha256_digest(), None);
    }

    #[test]
    fn parse_both_blob_and_zarr() {
        let mut record = blob_record();
        record["zarr"] = json!("7e10ceaf-ea72-4bd0-be23-8a0a2bd4d6a7");
        assert_matches!(
            Asset::from_record(&api_url(), record),
            Err(AssetParseError::Both { .. })
        );
    }

    #[test]
    fn parse_neither_blob_nor_zarr() {
        let mut record = blob_record();
        record["blob"] = json!(null);
        assert_matches!(
            Asset::from_record(&api_url(), record),
            Err(AssetParseError::Neither { .. })
        );
    }

    #[rstest]
    #[case("000027")]
    #[case("000001")]
    fn good_dandiset_ids(#[case] s: &str) {
        assert_matches!(s.parse::<DandisetId>(), Ok(_));
    }

    #[rstest]
    #[case("27")]
    #[case("0000027")]
    #[case("00002a")]
    #[case("")]
    fn bad_dandiset_ids(#[case] s: &str) {
        assert_matches!(s.parse::<DandisetId>(), Err(_));
    }

    #[rstest]
    #[case("draft", true)]
    #[case("0.210831.2033", false)]
    fn good_version_ids(#[case] s: &str, #[case] is_draft: bool) {
        let v = s.parse::<VersionId>().unwrap();
        assert_eq!(v.is_draft(), is_draft);
    }

    #[rstest]
    #[case("Draft")]
    #[case("0.210831")]
    #[case("0.210831.20xx")]
    #[case("")]
    fn bad_version_ids(#[case] s: &str) {
        assert_matches!(s.parse::<VersionId>(), Err(_));
    }

    #[rstest]
    #[case(EmbargoStatus::Open, "OPEN")]
    #[case(EmbargoStatus::Embargoed, "EMBARGOED")]
    fn embargo_status_roundtrip(#[case] status: EmbargoStatus, #[case] s: &str) {
        assert_eq!(status.to_string(), s);
        assert_eq!(s.parse::<EmbargoStatus>().unwrap(), status);
    }
}
