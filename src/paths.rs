//! Normalized forward-slash paths for assets and Zarr entries
use derive_more::{AsRef, Deref, Display};
use serde::{
    de::{Deserializer, Unexpected, Visitor},
    ser::Serializer,
    Deserialize, Serialize,
};
use std::fmt;
use thiserror::Error;

/// A nonempty, forward-slash-separated relative path that does not contain
/// any of the following:
///
/// - a `.` or `..` component
/// - a leading or trailing forward slash
/// - two or more consecutive forward slashes
/// - NUL
#[derive(AsRef, Clone, Deref, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[as_ref(forward)]
#[deref(forward)]
pub(crate) struct PurePath(String);

impl PurePath {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    /// The final component of the path
    pub(crate) fn name_str(&self) -> &str {
        self.0
            .split('/')
            .next_back()
            .expect("path should be nonempty")
    }

    /// The final extension of the name, without the leading period, if any
    pub(crate) fn extension(&self) -> Option<&str> {
        let name = self.name_str();
        match name.rsplit_once('.') {
            Some(("", _)) | None => None,
            Some((_, ext)) => Some(ext),
        }
    }

    /// Yield each proper ancestor of the path, deepest first, ending with the
    /// topmost nonempty prefix
    pub(crate) fn parents(&self) -> Parents<'_> {
        Parents { s: Some(&self.0) }
    }

    pub(crate) fn component_strs(&self) -> std::str::Split<'_, char> {
        self.0.split('/')
    }
}

impl fmt::Debug for PurePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl PartialEq<str> for PurePath {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl<'a> PartialEq<&'a str> for PurePath {
    fn eq(&self, other: &&'a str) -> bool {
        &self.0 == other
    }
}

impl std::str::FromStr for PurePath {
    type Err = ParsePurePathError;

    fn from_str(s: &str) -> Result<PurePath, ParsePurePathError> {
        if s.is_empty() {
            Err(ParsePurePathError::Empty)
        } else if s.starts_with('/') {
            Err(ParsePurePathError::StartsWithSlash)
        } else if s.ends_with('/') {
            Err(ParsePurePathError::EndsWithSlash)
        } else if s.contains('\0') {
            Err(ParsePurePathError::Nul)
        } else if s.split('/').any(|p| p.is_empty() || p == "." || p == "..") {
            Err(ParsePurePathError::NotNormalized)
        } else {
            Ok(PurePath(s.into()))
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub(crate) enum ParsePurePathError {
    #[error("paths cannot be empty")]
    Empty,
    #[error("paths cannot start with a forward slash")]
    StartsWithSlash,
    #[error("paths cannot end with a forward slash")]
    EndsWithSlash,
    #[error("paths cannot contain NUL")]
    Nul,
    #[error("path is not normalized")]
    NotNormalized,
}

impl Serialize for PurePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for PurePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PurePathVisitor;

        impl Visitor<'_> for PurePathVisitor {
            type Value = PurePath;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a normalized relative path")
            }

            fn visit_str<E>(self, input: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                input
                    .parse::<PurePath>()
                    .map_err(|_| E::invalid_value(Unexpected::Str(input), &self))
            }
        }

        deserializer.deserialize_str(PurePathVisitor)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Parents<'a> {
    s: Option<&'a str>,
}

impl<'a> Iterator for Parents<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let s = self.s?;
        match s.rsplit_once('/') {
            Some((pre, _)) => {
                self.s = Some(pre);
                Some(pre)
            }
            None => {
                self.s = None;
                None
            }
        }
    }
}

impl std::iter::FusedIterator for Parents<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case("foo", "foo")]
    #[case("foo/bar/baz", "baz")]
    fn test_name(#[case] p: PurePath, #[case] name: &str) {
        assert_eq!(p.name_str(), name);
    }

    #[rstest]
    #[case("foo.nwb", Some("nwb"))]
    #[case("foo/bar.txt.gz", Some("gz"))]
    #[case("foo/bar", None)]
    #[case("foo.d/bar", None)]
    #[case("foo/.gitattributes", None)]
    fn test_extension(#[case] p: PurePath, #[case] ext: Option<&str>) {
        assert_eq!(p.extension(), ext);
    }

    #[rstest]
    #[case("foo.nwb")]
    #[case("foo/bar.nwb")]
    #[case("sub-01/ses-01/sub-01_ses-01.nwb")]
    fn test_good_paths(#[case] s: &str) {
        let r = s.parse::<PurePath>();
        assert_matches!(r, Ok(_));
    }

    #[rstest]
    #[case("")]
    #[case("/")]
    #[case("/foo")]
    #[case("foo/")]
    #[case("foo//bar.nwb")]
    #[case("foo/bar\0.nwb")]
    #[case("foo/./bar.nwb")]
    #[case("foo/../bar.nwb")]
    #[case("../foo/bar.nwb")]
    fn test_bad_paths(#[case] s: &str) {
        let r = s.parse::<PurePath>();
        assert_matches!(r, Err(_));
    }

    #[test]
    fn test_parents() {
        let path = "a/b/c/d".parse::<PurePath>().unwrap();
        let parents = path.parents().collect::<Vec<_>>();
        assert_eq!(parents, ["a/b/c", "a/b", "a"]);
    }

    #[test]
    fn test_parents_of_top_level() {
        let path = "a".parse::<PurePath>().unwrap();
        assert_eq!(path.parents().count(), 0);
    }
}
