//! Client for the DANDI Archive REST API.
//!
//! Everything the sync engine knows about the remote Archive comes through
//! this module: Dandisets, their versions, their assets (in `created` order),
//! and per-asset metadata records.
mod streams;
mod types;
use self::streams::Paginate;
pub(crate) use self::types::*;
use crate::httputil::{BuildClientError, Client, HttpError, HttpUrl};
use crate::paths::PurePath;
use futures_util::{Stream, TryStreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// A client for fetching data about Dandisets, their versions, and their
/// assets from a DANDI Archive instance
#[derive(Clone, Debug)]
pub(crate) struct DandiClient {
    /// The HTTP client used for making requests to the Archive instance's API
    inner: Client,

    /// The base API URL of the Archive instance
    api_url: HttpUrl,
}

impl DandiClient {
    /// Construct a new `DandiClient` for the Archive instance with the given
    /// base API URL.  Requests are authenticated with `token` if given;
    /// embargoed Dandisets cannot be read without one.
    pub(crate) fn new(api_url: HttpUrl, token: Option<&str>) -> Result<DandiClient, BuildClientError> {
        let inner = Client::new(token)?;
        Ok(DandiClient { inner, api_url })
    }

    pub(crate) fn api_url(&self) -> &HttpUrl {
        &self.api_url
    }

    /// Return the URL formed by appending the given path segments and a
    /// trailing slash to the path of the API base URL
    fn get_url<I>(&self, segments: I) -> HttpUrl
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut url = self.api_url.clone();
        url.extend(segments).ensure_dirpath();
        url
    }

    /// Perform a `GET` request to the given URL and return the deserialized
    /// JSON response body
    async fn get<T: DeserializeOwned>(&self, url: HttpUrl) -> Result<T, DandiError> {
        self.inner.get_json(url).await.map_err(Into::into)
    }

    /// Return a [`futures_util::Stream`] that makes paginated `GET` requests
    /// to the given URL and its subsequent pages and yields a `Result<T,
    /// DandiError>` value for each item deserialized from the responses
    fn paginate<T: DeserializeOwned + 'static>(&self, url: HttpUrl) -> Paginate<T> {
        Paginate::new(self, url)
    }

    /// Return a [`futures_util::Stream`] that yields a `Dandiset` for each
    /// Dandiset on the Archive instance
    pub(crate) fn get_all_dandisets(
        &self,
    ) -> impl Stream<Item = Result<Dandiset, DandiError>> + '_ {
        self.paginate::<Dandiset>(self.get_url(["dandisets"]))
    }

    /// Retrieve information about the given Dandiset
    pub(crate) async fn get_dandiset(&self, id: &DandisetId) -> Result<Dandiset, DandiError> {
        self.get::<Dandiset>(self.get_url(["dandisets", id.as_ref()]))
            .await
    }

    /// Bind a Dandiset to the version that a sync run will operate on
    pub(crate) fn remote_dandiset(
        &self,
        dandiset: &Dandiset,
        version: DandisetVersion,
    ) -> RemoteDandiset {
        RemoteDandiset {
            client: self.clone(),
            identifier: dandiset.identifier.clone(),
            embargo_status: dandiset.embargo_status,
            version,
        }
    }

    /// The Archive download URL for the Zarr entry at `path` within the Zarr
    /// with the given ID
    pub(crate) fn zarr_file_url(&self, zarr_id: &str, path: &PurePath) -> HttpUrl {
        let mut url = self.get_url(["zarr", zarr_id, "files"]);
        url.append_query_param("prefix", path.as_ref());
        url.append_query_param("download", "true");
        url
    }
}

/// A specific version of a specific Dandiset, with the client baked in.
///
/// This is the object the sync engine passes around; all asset enumeration
/// happens through it.
#[derive(Clone, Debug)]
pub(crate) struct RemoteDandiset {
    client: DandiClient,
    identifier: DandisetId,
    embargo_status: EmbargoStatus,
    version: DandisetVersion,
}

impl RemoteDandiset {
    pub(crate) fn client(&self) -> &DandiClient {
        &self.client
    }

    pub(crate) fn identifier(&self) -> &DandisetId {
        &self.identifier
    }

    pub(crate) fn embargo_status(&self) -> EmbargoStatus {
        self.embargo_status
    }

    pub(crate) fn version(&self) -> &DandisetVersion {
        &self.version
    }

    pub(crate) fn version_id(&self) -> &VersionId {
        &self.version.version
    }

    /// Rebind to a different version (used when building release tags)
    pub(crate) fn for_version(&self, version: DandisetVersion) -> RemoteDandiset {
        RemoteDandiset {
            client: self.client.clone(),
            identifier: self.identifier.clone(),
            embargo_status: self.embargo_status,
            version,
        }
    }

    fn version_url(&self, segments: &[&str]) -> HttpUrl {
        let mut url = self.client.api_url.clone();
        url.extend([
            "dandisets",
            self.identifier.as_ref(),
            "versions",
            self.version.version.as_ref(),
        ])
        .extend(segments)
        .ensure_dirpath();
        url
    }

    /// Return a [`futures_util::Stream`] over the Dandiset's versions
    pub(crate) fn get_versions(
        &self,
    ) -> impl Stream<Item = Result<DandisetVersion, DandiError>> + '_ {
        self.client.paginate::<DandisetVersion>(self.client.get_url([
            "dandisets",
            self.identifier.as_ref(),
            "versions",
        ]))
    }

    /// Retrieve the version's raw (dandischema) metadata for `dandiset.yaml`
    pub(crate) async fn get_raw_metadata(&self) -> Result<serde_json::Value, DandiError> {
        self.client.get(self.version_url(&[])).await
    }

    /// Retrieve the full record of the asset with the given ID in this
    /// version
    pub(crate) async fn get_asset(&self, asset_id: &str) -> Result<Asset, DandiError> {
        let record = self
            .client
            .get::<serde_json::Value>(self.version_url(&["assets", asset_id]))
            .await?;
        Asset::from_record(&self.client.api_url, record).map_err(Into::into)
    }

    /// Return a [`futures_util::Stream`] over the version's assets in
    /// ascending `created` order.  The asset list endpoint is paginated and
    /// each asset's full record is then fetched individually.
    pub(crate) fn stream_assets(&self) -> impl Stream<Item = Result<Asset, DandiError>> + '_ {
        let mut url = self.version_url(&["assets"]);
        url.append_query_param("order", "created");
        let mut pages = self.paginate_assets(url);
        async_stream::try_stream! {
            while let Some(item) = pages.try_next().await? {
                let asset = self.get_asset(&item.asset_id).await?;
                yield asset;
            }
        }
    }

    fn paginate_assets(&self, url: HttpUrl) -> Paginate<AssetListItem> {
        self.client.paginate::<AssetListItem>(url)
    }
}

#[derive(Debug, Error)]
pub(crate) enum DandiError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    BadAsset(#[from] AssetParseError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mock_client(server: &MockServer) -> DandiClient {
        let api_url = format!("{}/api", server.uri()).parse::<HttpUrl>().unwrap();
        DandiClient::new(api_url, None).unwrap()
    }

    fn asset_list_item(asset_id: &str) -> serde_json::Value {
        json!({
            "asset_id": asset_id,
            "blob": "b0000000-0000-0000-0000-000000000000",
            "zarr": null,
            "path": format!("files/{asset_id}.dat"),
            "size": 4,
            "created": "2021-01-01T00:00:00Z",
            "modified": "2021-01-01T00:00:00Z",
        })
    }

    fn asset_record(asset_id: &str) -> serde_json::Value {
        let mut record = asset_list_item(asset_id);
        record["metadata"] = json!({
            "contentUrl": [],
            "digest": {"dandi:sha2-256": "00".repeat(32)},
        });
        record
    }

    #[tokio::test]
    async fn get_dandiset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/dandisets/000027/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "identifier": "000027",
                "created": "2020-07-08T21:54:42.543692Z",
                "modified": "2022-03-20T10:00:00Z",
                "embargo_status": "OPEN",
                "draft_version": {
                    "version": "draft",
                    "size": 1536,
                    "created": "2020-07-08T21:54:42.543692Z",
                    "modified": "2022-03-20T10:00:00Z",
                },
                "most_recent_published_version": null,
            })))
            .mount(&server)
            .await;
        let client = mock_client(&server);
        let id = "000027".parse::<DandisetId>().unwrap();
        let ds = client.get_dandiset(&id).await.unwrap();
        assert_eq!(ds.identifier, id);
        assert_eq!(ds.embargo_status, EmbargoStatus::Open);
        let draft = ds.draft_version.unwrap();
        assert!(draft.version.is_draft());
        assert_eq!(draft.size, 1536);
    }

    #[tokio::test]
    async fn stream_assets_paginates_and_fetches_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/dandisets/000027/versions/draft/assets/"))
            .and(query_param("order", "created"))
            .and(query_param_is_missing("page"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": format!(
                    "{}/api/dandisets/000027/versions/draft/assets/?order=created&page=2",
                    server.uri()
                ),
                "results": [asset_list_item("a1"), asset_list_item("a2")],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/dandisets/000027/versions/draft/assets/"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": null,
                "results": [asset_list_item("a3")],
            })))
            .mount(&server)
            .await;
        for aid in ["a1", "a2", "a3"] {
            Mock::given(method("GET"))
                .and(path(format!(
                    "/api/dandisets/000027/versions/draft/assets/{aid}/"
                )))
                .respond_with(ResponseTemplate::new(200).set_body_json(asset_record(aid)))
                .mount(&server)
                .await;
        }
        let client = mock_client(&server);
        let id = "000027".parse::<DandisetId>().unwrap();
        let ds = Dandiset {
            identifier: id,
            created: time::macros::datetime!(2020-07-08 21:54:42 UTC),
            modified: time::macros::datetime!(2022-03-20 10:00:00 UTC),
            embargo_status: EmbargoStatus::Open,
            draft_version: None,
            most_recent_published_version: None,
        };
        let version = DandisetVersion {
            version: VersionId::draft(),
            size: 12,
            created: time::macros::datetime!(2020-07-08 21:54:42 UTC),
            modified: time::macros::datetime!(2022-03-20 10:00:00 UTC),
        };
        let rd = client.remote_dandiset(&ds, version);
        let assets = rd
            .stream_assets()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        let ids = assets.iter().map(Asset::asset_id).collect::<Vec<_>>();
        assert_eq!(ids, ["a1", "a2", "a3"]);
        assert!(assets[0].sha256_digest().is_some());
    }

    #[tokio::test]
    async fn zarr_file_url_quotes_prefix() {
        let server = MockServer::start().await;
        let client = mock_client(&server);
        let path = "arr/0 0".parse::<PurePath>().unwrap();
        let url = client.zarr_file_url("7e10ceaf", &path);
        assert_eq!(
            url.as_str(),
            format!(
                "{}/api/zarr/7e10ceaf/files/?prefix=arr%2F0+0&download=true",
                server.uri()
            )
        );
    }
}
