//! Listing Zarr entries on the Archive's S3 bucket
use crate::config::BackupConfig;
use crate::httputil::{self, BuildClientError, HttpError, HttpUrl};
use async_stream::try_stream;
use aws_sdk_s3::operation::list_object_versions::ListObjectVersionsError;
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error;
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::{orchestrator::HttpResponse, result::SdkError};
use aws_smithy_types_convert::date_time::DateTimeExt;
use futures_util::Stream;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use smartstring::alias::CompactString;
use thiserror::Error;
use time::OffsetDateTime;

type ListObjectsError = SdkError<ListObjectsV2Error, HttpResponse>;
type ListVersionsError = SdkError<ListObjectVersionsError, HttpResponse>;

/// Percent-encoding for S3 keys embedded in URL paths: everything except
/// unreserved characters and the key's own slashes
static KEY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Read-only client for the bucket the Archive stores Zarr entries on
#[derive(Clone, Debug)]
pub(crate) struct ObjectStore {
    inner: Client,
    bucket: CompactString,
    bucket_url: String,
}

impl ObjectStore {
    /// Construct a client for the bucket named in the given config.
    ///
    /// Requests are unsigned.  Unless an explicit endpoint is configured, the
    /// bucket's region is discovered from a `HEAD` on the bucket URL.
    pub(crate) async fn for_config(cfg: &BackupConfig) -> Result<ObjectStore, S3Error> {
        let mut loader = aws_config::from_env()
            .app_name(
                aws_config::AppName::new(env!("CARGO_PKG_NAME"))
                    .expect("crate name should be a valid app name"),
            )
            .no_credentials();
        loader = match &cfg.s3endpoint {
            Some(endpoint) => loader
                .endpoint_url(endpoint.as_str())
                .region(aws_config::Region::new("us-east-1")),
            None => {
                let region = get_bucket_region(&cfg.s3bucket).await?;
                loader.region(aws_config::Region::new(region))
            }
        };
        let config = loader.load().await;
        Ok(ObjectStore {
            inner: Client::new(&config),
            bucket: cfg.s3bucket.as_str().into(),
            bucket_url: cfg.bucket_url(),
        })
    }

    pub(crate) fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Versioned download URL for an object, suitable for registration with
    /// git-annex
    pub(crate) fn versioned_url(&self, key: &str, version_id: &str) -> String {
        format!(
            "{}/{}?versionId={}",
            self.bucket_url,
            utf8_percent_encode(key, KEY_ENCODE),
            version_id,
        )
    }

    /// Cheap recursive listing of all current objects under `key_prefix`.
    ///
    /// This is the pre-flight listing: no version IDs, but one request per
    /// thousand keys instead of the considerably slower
    /// `ListObjectVersions`.
    pub(crate) fn list_objects<'a>(
        &'a self,
        key_prefix: &'a str,
    ) -> impl Stream<Item = Result<S3ObjectInfo, S3Error>> + 'a {
        try_stream! {
            let mut pages = self
                .inner
                .list_objects_v2()
                .bucket(&*self.bucket)
                .prefix(key_prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|source| S3Error::ListObjects {
                    bucket: self.bucket.clone(),
                    prefix: key_prefix.to_owned(),
                    source,
                })?;
                for obj in page.contents.unwrap_or_default() {
                    yield S3ObjectInfo::try_from_aws(obj).map_err(|source| {
                        S3Error::BadObject {
                            bucket: self.bucket.clone(),
                            prefix: key_prefix.to_owned(),
                            source,
                        }
                    })?;
                }
            }
        }
    }

    /// Full listing of object versions under `key_prefix`.
    ///
    /// Only the latest version of each key is yielded.  Delete markers are
    /// reported too, as they advance the sync cursor without contributing an
    /// entry.
    pub(crate) fn list_entry_versions<'a>(
        &'a self,
        key_prefix: &'a str,
    ) -> impl Stream<Item = Result<VersionEvent, S3Error>> + 'a {
        try_stream! {
            let mut pages = self
                .inner
                .list_object_versions()
                .bucket(&*self.bucket)
                .prefix(key_prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|source| S3Error::ListVersions {
                    bucket: self.bucket.clone(),
                    prefix: key_prefix.to_owned(),
                    source,
                })?;
                for v in page.versions.unwrap_or_default() {
                    if v.is_latest == Some(true) {
                        let version = S3Version::try_from_aws(v).map_err(|source| {
                            S3Error::BadObject {
                                bucket: self.bucket.clone(),
                                prefix: key_prefix.to_owned(),
                                source,
                            }
                        })?;
                        yield VersionEvent::Entry(version);
                    }
                }
                for dm in page.delete_markers.unwrap_or_default() {
                    if dm.is_latest == Some(true) {
                        let Some(modified) = dm.last_modified else {
                            continue;
                        };
                        let last_modified = modified.to_time().map_err(|source| {
                            S3Error::BadObject {
                                bucket: self.bucket.clone(),
                                prefix: key_prefix.to_owned(),
                                source: TryFromAwsObjectError::BadModified {
                                    key: dm.key.unwrap_or_default(),
                                    source,
                                },
                            }
                        })?;
                        yield VersionEvent::DeleteMarker { last_modified };
                    }
                }
            }
        }
    }
}

/// An object as reported by the cheap (unversioned) listing
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct S3ObjectInfo {
    pub(crate) key: String,
    pub(crate) last_modified: OffsetDateTime,
}

impl S3ObjectInfo {
    fn try_from_aws(obj: aws_sdk_s3::types::Object) -> Result<S3ObjectInfo, TryFromAwsObjectError> {
        let Some(key) = obj.key else {
            return Err(TryFromAwsObjectError::NoKey);
        };
        let Some(modified) = obj.last_modified else {
            return Err(TryFromAwsObjectError::NoLastModified { key });
        };
        let last_modified = modified
            .to_time()
            .map_err(|source| TryFromAwsObjectError::BadModified { key: key.clone(), source })?;
        Ok(S3ObjectInfo { key, last_modified })
    }
}

/// The latest version of an object under the Zarr's key prefix
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct S3Version {
    pub(crate) key: String,
    pub(crate) size: i64,
    /// The ETag with surrounding quotes stripped; for the non-multipart
    /// objects Zarr entries are uploaded as, this is the content MD5
    pub(crate) etag: String,
    pub(crate) last_modified: OffsetDateTime,
    pub(crate) version_id: String,
}

impl S3Version {
    fn try_from_aws(
        v: aws_sdk_s3::types::ObjectVersion,
    ) -> Result<S3Version, TryFromAwsObjectError> {
        let Some(key) = v.key else {
            return Err(TryFromAwsObjectError::NoKey);
        };
        let Some(modified) = v.last_modified else {
            return Err(TryFromAwsObjectError::NoLastModified { key });
        };
        let Some(etag) = v.e_tag else {
            return Err(TryFromAwsObjectError::NoETag { key });
        };
        let Some(size) = v.size else {
            return Err(TryFromAwsObjectError::NoSize { key });
        };
        let Some(version_id) = v.version_id else {
            return Err(TryFromAwsObjectError::NoVersionId { key });
        };
        let last_modified = modified
            .to_time()
            .map_err(|source| TryFromAwsObjectError::BadModified { key: key.clone(), source })?;
        Ok(S3Version {
            key,
            size,
            etag: etag.trim_matches('"').to_owned(),
            last_modified,
            version_id,
        })
    }
}

/// An item of the versioned listing
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum VersionEvent {
    Entry(S3Version),
    DeleteMarker { last_modified: OffsetDateTime },
}

#[derive(Debug, Error)]
pub(crate) enum S3Error {
    #[error("failed to list S3 objects in bucket {bucket:?} with prefix {prefix:?}")]
    ListObjects {
        bucket: CompactString,
        prefix: String,
        source: ListObjectsError,
    },
    #[error("failed to list S3 object versions in bucket {bucket:?} with prefix {prefix:?}")]
    ListVersions {
        bucket: CompactString,
        prefix: String,
        source: ListVersionsError,
    },
    #[error("invalid object found in S3 bucket {bucket:?} under prefix {prefix:?}")]
    BadObject {
        bucket: CompactString,
        prefix: String,
        source: TryFromAwsObjectError,
    },
    #[error(transparent)]
    LocateBucket(#[from] GetBucketRegionError),
}

#[derive(Debug, Error)]
pub(crate) enum TryFromAwsObjectError {
    #[error("S3 object lacks key")]
    NoKey,
    #[error("S3 object with key {key:?} lacks last_modified")]
    NoLastModified { key: String },
    #[error("S3 object with key {key:?} lacks e_tag")]
    NoETag { key: String },
    #[error("S3 object with key {key:?} lacks size")]
    NoSize { key: String },
    #[error("S3 object with key {key:?} lacks version_id")]
    NoVersionId { key: String },
    #[error("last_modified value for S3 object {key:?} is outside time library's range")]
    BadModified {
        key: String,
        source: aws_smithy_types_convert::date_time::Error,
    },
}

// The AWS SDK currently cannot be used for this:
// <https://github.com/awslabs/aws-sdk-rust/issues/1052>
pub(crate) async fn get_bucket_region(bucket: &str) -> Result<String, GetBucketRegionError> {
    let url = format!("https://{bucket}.s3.amazonaws.com")
        .parse::<HttpUrl>()
        .map_err(|source| GetBucketRegionError::BadUrl {
            bucket: bucket.to_owned(),
            source,
        })?;
    let client = httputil::Client::new(None)?;
    let r = client.head(url).await?;
    match r.headers().get("x-amz-bucket-region").map(|hv| hv.to_str()) {
        Some(Ok(region)) => Ok(region.to_owned()),
        Some(Err(e)) => Err(GetBucketRegionError::BadHeader(e)),
        None => Err(GetBucketRegionError::NoHeader),
    }
}

#[derive(Debug, Error)]
pub(crate) enum GetBucketRegionError {
    #[error(transparent)]
    BuildClient(#[from] BuildClientError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("URL constructed for bucket {bucket:?} is invalid")]
    BadUrl {
        bucket: String,
        source: httputil::ParseHttpUrlError,
    },
    #[error("S3 response lacked x-amz-bucket-region header")]
    NoHeader,
    #[error("S3 response had undecodable x-amz-bucket-region header")]
    BadHeader(#[source] reqwest::header::ToStrError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn store() -> ObjectStore {
        // An inner client is required structurally but never used by the
        // URL-building tests.
        let sdk = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_config::Region::new("us-east-2"))
            .build();
        ObjectStore {
            inner: Client::from_conf(sdk),
            bucket: "dandiarchive".into(),
            bucket_url: String::from("https://dandiarchive.s3.amazonaws.com"),
        }
    }

    #[rstest]
    #[case(
        "zarr/7e10ceaf/arr/0",
        "pd090XIsmXCQGexa.n7N8zl7",
        "https://dandiarchive.s3.amazonaws.com/zarr/7e10ceaf/arr/0?versionId=pd090XIsmXCQGexa.n7N8zl7"
    )]
    #[case(
        "zarr/7e10ceaf/arr/0 0",
        "abc",
        "https://dandiarchive.s3.amazonaws.com/zarr/7e10ceaf/arr/0%200?versionId=abc"
    )]
    fn versioned_urls(#[case] key: &str, #[case] version_id: &str, #[case] expected: &str) {
        assert_eq!(store().versioned_url(key, version_id), expected);
    }
}
