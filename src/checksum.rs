//! The DANDI Zarr tree checksum.
//!
//! Every entry of a Zarr contributes its MD5 digest; each directory's digest
//! is the MD5 of the compact JSON serialization of its sorted child
//! checksums, formatted as `{md5}-{file count}--{total size}`.  The digest of
//! an empty Zarr is `481a2f77ab786a0f45aafd5db0971caa-0--0`.
use crate::paths::PurePath;
use md5::{Digest, Md5};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Digest of a single file or directory within a Zarr
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
struct ZarrChecksum {
    digest: String,
    name: String,
    size: u64,
}

/// The sorted child checksums of one directory
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
struct ZarrChecksumManifest {
    directories: Vec<ZarrChecksum>,
    files: Vec<ZarrChecksum>,
}

impl ZarrChecksumManifest {
    /// Compute the aggregate digest of the directory this manifest describes.
    ///
    /// The JSON must be serialized without any spacing, or the MD5 will not
    /// match what the Archive computes.
    fn generate_digest(mut self) -> Result<ZarrDirectoryDigest, ChecksumError> {
        self.directories.sort_by(|a, b| a.name.cmp(&b.name));
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        let count = self
            .files
            .len()
            .try_into()
            .unwrap_or(u64::MAX)
            .checked_add(
                self.directories
                    .iter()
                    .map(|c| {
                        ZarrDirectoryDigest::parse(&c.digest)
                            .map(|d| d.count)
                            .map_err(|_| ChecksumError::BadDirectoryDigest {
                                digest: c.digest.clone(),
                            })
                    })
                    .sum::<Result<u64, _>>()?,
            )
            .unwrap_or(u64::MAX);
        let size = self
            .files
            .iter()
            .chain(self.directories.iter())
            .map(|c| c.size)
            .sum();
        let json = serde_json::to_string(&self).map_err(ChecksumError::Serialize)?;
        let md5 = hex::encode(Md5::digest(json.as_bytes()));
        Ok(ZarrDirectoryDigest { md5, count, size })
    }
}

/// A parsed `{md5}-{count}--{size}` directory digest
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ZarrDirectoryDigest {
    pub(crate) md5: String,
    pub(crate) count: u64,
    pub(crate) size: u64,
}

impl ZarrDirectoryDigest {
    pub(crate) fn parse(s: &str) -> Result<ZarrDirectoryDigest, ParseDigestError> {
        let (md5, rest) = s.split_once('-').ok_or(ParseDigestError)?;
        let (count, size) = rest.split_once("--").ok_or(ParseDigestError)?;
        if md5.len() != 32 || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseDigestError);
        }
        Ok(ZarrDirectoryDigest {
            md5: md5.to_owned(),
            count: count.parse().map_err(|_| ParseDigestError)?,
            size: size.parse().map_err(|_| ParseDigestError)?,
        })
    }
}

impl fmt::Display for ZarrDirectoryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}--{}", self.md5, self.count, self.size)
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("not a well-formed Zarr directory digest")]
pub(crate) struct ParseDigestError;

#[derive(Debug, Error)]
pub(crate) enum ChecksumError {
    #[error("child directory carries malformed digest {digest:?}")]
    BadDirectoryDigest { digest: String },
    #[error("failed to serialize checksum manifest")]
    Serialize(#[source] serde_json::Error),
}

/// Accumulates per-entry digests and rolls them up into the tree checksum
#[derive(Clone, Debug, Default)]
pub(crate) struct ZarrChecksumTree {
    // Keyed by directory path components; the root is the empty key.  A
    // BTreeMap over Vec<String> orders parents before children, so draining
    // from the back visits the deepest directories first.
    directories: BTreeMap<Vec<String>, ZarrChecksumManifest>,
}

impl ZarrChecksumTree {
    pub(crate) fn new() -> ZarrChecksumTree {
        ZarrChecksumTree::default()
    }

    /// Record the MD5 digest of the file at `path`
    pub(crate) fn add_leaf(&mut self, path: &PurePath, size: u64, md5_digest: &str) {
        let mut components = path.component_strs().map(String::from).collect::<Vec<_>>();
        let name = components.pop().expect("path should be nonempty");
        self.directories
            .entry(components)
            .or_default()
            .files
            .push(ZarrChecksum {
                digest: md5_digest.to_owned(),
                name,
                size,
            });
    }

    /// Roll all recorded leaves up into the checksum of the whole tree
    pub(crate) fn process(mut self) -> Result<String, ChecksumError> {
        loop {
            let Some((mut dirpath, manifest)) = self.directories.pop_last() else {
                // No leaves at all
                return Ok(ZarrChecksumManifest::default().generate_digest()?.to_string());
            };
            let digest = manifest.generate_digest()?;
            let Some(name) = dirpath.pop() else {
                return Ok(digest.to_string());
            };
            self.directories
                .entry(dirpath)
                .or_default()
                .directories
                .push(ZarrChecksum {
                    digest: digest.to_string(),
                    name,
                    size: digest.size,
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn p(s: &str) -> PurePath {
        s.parse::<PurePath>().unwrap()
    }

    #[test]
    fn empty_tree() {
        let tree = ZarrChecksumTree::new();
        assert_eq!(
            tree.process().unwrap(),
            "481a2f77ab786a0f45aafd5db0971caa-0--0"
        );
    }

    #[test]
    fn single_file_at_root() {
        let mut tree = ZarrChecksumTree::new();
        tree.add_leaf(&p(".zgroup"), 26, "49bbc1f1c64b5262b843decca18e5173");
        let digest = tree.process().unwrap();
        let parsed = ZarrDirectoryDigest::parse(&digest).unwrap();
        assert_eq!(parsed.count, 1);
        assert_eq!(parsed.size, 26);
    }

    #[test]
    fn counts_and_sizes_roll_up() {
        let mut tree = ZarrChecksumTree::new();
        tree.add_leaf(&p(".zgroup"), 26, "49bbc1f1c64b5262b843decca18e5173");
        tree.add_leaf(&p("arr/.zarray"), 315, "6b99c7a7b48d5d3fbaf7a1e7aaffa0cc");
        tree.add_leaf(&p("arr/0"), 4000, "cf6b3a7b71e1a2b938bcbcdcbc7e53ee");
        tree.add_leaf(&p("arr/1"), 4000, "3ddcdd36e52b8bd8b4b46912018ca3bd");
        let parsed = ZarrDirectoryDigest::parse(&tree.process().unwrap()).unwrap();
        assert_eq!(parsed.count, 4);
        assert_eq!(parsed.size, 26 + 315 + 4000 + 4000);
    }

    #[test]
    fn leaf_order_does_not_matter() {
        let mut t1 = ZarrChecksumTree::new();
        t1.add_leaf(&p("a/0"), 10, "00000000000000000000000000000001");
        t1.add_leaf(&p("a/1"), 20, "00000000000000000000000000000002");
        t1.add_leaf(&p("b"), 5, "00000000000000000000000000000003");
        let mut t2 = ZarrChecksumTree::new();
        t2.add_leaf(&p("b"), 5, "00000000000000000000000000000003");
        t2.add_leaf(&p("a/1"), 20, "00000000000000000000000000000002");
        t2.add_leaf(&p("a/0"), 10, "00000000000000000000000000000001");
        assert_eq!(t1.process().unwrap(), t2.process().unwrap());
    }

    #[test]
    fn digest_roundtrip() {
        let digest = ZarrDirectoryDigest::parse("481a2f77ab786a0f45aafd5db0971caa-0--0").unwrap();
        assert_eq!(digest.to_string(), "481a2f77ab786a0f45aafd5db0971caa-0--0");
        assert!(ZarrDirectoryDigest::parse("not-a-digest").is_err());
        assert!(ZarrDirectoryDigest::parse("49bbc1f1c64b5262b843decca18e5173").is_err());
    }
}
