//! Odds & ends shared across the sync machinery
use crate::consts::DANDISET_METADATA_FILE;
use crate::dandi::Asset;
use std::fmt::Write;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

/// Error raised in verify mode whenever the backup would be mutated even
/// though the Dandiset's draft timestamp did not advance on the server
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{0}")]
pub(crate) struct UnexpectedChange(pub(crate) String);

/// `"1 file"`, `"2 files"`, …
pub(crate) fn quantify(qty: usize, singular: &str) -> String {
    if qty == 1 {
        format!("{qty} {singular}")
    } else {
        format!("{qty} {singular}s")
    }
}

/// Return the later of `state` and `candidate`
pub(crate) fn maxdatetime(state: Option<OffsetDateTime>, candidate: OffsetDateTime) -> OffsetDateTime {
    match state {
        Some(ts) if ts >= candidate => ts,
        _ => candidate,
    }
}

/// Render a list of error messages from a `git-annex` JSON record for
/// appending to a log line
pub(crate) fn format_errors(messages: &[String]) -> String {
    match messages {
        [] => String::from(" <no error message>"),
        [msg] => format!(" {msg}"),
        _ => {
            let mut s = String::from("\n\n");
            for msg in messages {
                for line in msg.split_inclusive('\n') {
                    s.push_str("    ");
                    s.push_str(line);
                }
            }
            s.push('\n');
            s
        }
    }
}

/// Is the topmost component of `path` one of the bookkeeping files/directories
/// that syncing must never treat as asset content?
pub(crate) fn is_meta_file(path: &str, dandiset: bool) -> bool {
    let root = path.split('/').next().unwrap_or(path);
    if dandiset && root == DANDISET_METADATA_FILE {
        return true;
    }
    matches!(
        root,
        ".dandi" | ".datalad" | ".git" | ".gitattributes" | ".gitmodules"
    )
}

/// Iterator of sleep durations for retrying an operation with exponential
/// backoff.  Each value is `base^n * multiplier` seconds, jittered by
/// ±`jitter/2` so that concurrent retry tracks do not align.
#[derive(Clone, Debug)]
pub(crate) struct ExpWait {
    base: f64,
    multiplier: f64,
    attempts: Option<u32>,
    jitter: f64,
    n: u32,
}

impl ExpWait {
    pub(crate) fn new(base: f64, attempts: u32) -> ExpWait {
        ExpWait {
            base,
            multiplier: 1.0,
            attempts: Some(attempts),
            jitter: 0.1,
            n: 0,
        }
    }
}

impl Default for ExpWait {
    fn default() -> ExpWait {
        ExpWait {
            base: 1.25,
            multiplier: 1.0,
            attempts: None,
            jitter: 0.1,
            n: 0,
        }
    }
}

impl Iterator for ExpWait {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempts.is_some_and(|a| self.n >= a) {
            return None;
        }
        let Ok(n) = i32::try_from(self.n) else {
            return None;
        };
        self.n += 1;
        let secs = (self.base.powi(n) * self.multiplier)
            * (1.0 + (rand::random::<f64>() - 0.5) * self.jitter);
        Some(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Serialize a deserialized JSON value as YAML
pub(crate) fn yaml_dump(data: &serde_json::Value) -> String {
    serde_yaml::to_string(data).unwrap_or_else(|_| String::from("<unserializable>\n"))
}

/// Line diff of two metadata records, rendered as YAML.
///
/// Unchanged lines are prefixed with two spaces, removals with `-`, and
/// additions with `+`.
pub(crate) fn diff_metadata(old: Option<&serde_json::Value>, new: &serde_json::Value) -> String {
    let old_yaml = old.map(yaml_dump).unwrap_or_default();
    let new_yaml = yaml_dump(new);
    let old_lines = old_yaml.lines().collect::<Vec<_>>();
    let new_lines = new_yaml.lines().collect::<Vec<_>>();
    let mut out = String::from("--- old-metadata\n+++ new-metadata\n");
    for d in diff_lines(&old_lines, &new_lines) {
        let (marker, line) = match d {
            DiffLine::Common(line) => (' ', line),
            DiffLine::Removed(line) => ('-', line),
            DiffLine::Added(line) => ('+', line),
        };
        let _ = writeln!(out, "{marker} {line}");
    }
    out
}

enum DiffLine<'a> {
    Common(&'a str),
    Removed(&'a str),
    Added(&'a str),
}

/// Longest-common-subsequence line diff, adequate for the small YAML
/// documents asset metadata serializes to
fn diff_lines<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<DiffLine<'a>> {
    let mut lcs = vec![vec![0usize; new.len() + 1]; old.len() + 1];
    for (i, o) in old.iter().enumerate().rev() {
        for (j, n) in new.iter().enumerate().rev() {
            lcs[i][j] = if o == n {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        if old[i] == new[j] {
            out.push(DiffLine::Common(old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(DiffLine::Removed(old[i]));
            i += 1;
        } else {
            out.push(DiffLine::Added(new[j]));
            j += 1;
        }
    }
    out.extend(old[i..].iter().map(|line| DiffLine::Removed(line)));
    out.extend(new[j..].iter().map(|line| DiffLine::Added(line)));
    out
}

/// Do the given remote assets and the records in an `assets.json` describe
/// the same set of assets with the same metadata?
pub(crate) fn assets_eq(remote_assets: &[Asset], local_assets: &[serde_json::Value]) -> bool {
    if remote_assets.len() != local_assets.len() {
        return false;
    }
    remote_assets.iter().all(|asset| {
        local_assets
            .iter()
            .any(|record| record.get("asset_id").and_then(serde_json::Value::as_str) == Some(asset.asset_id()) && record == asset.raw())
    })
}

/// Decompose a dotted version string into numeric components for ordering
/// comparisons.  Non-numeric trailing matter in a component is ignored.
pub(crate) fn version_key(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| {
            let digits = part.chars().take_while(char::is_ascii_digit).count();
            part[..digits].parse::<u64>().unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(0, "0 files")]
    #[case(1, "1 file")]
    #[case(42, "42 files")]
    fn test_quantify(#[case] qty: usize, #[case] s: &str) {
        assert_eq!(quantify(qty, "file"), s);
    }

    #[rstest]
    #[case("big.dat", false)]
    #[case(".dandi/assets.json", true)]
    #[case(".datalad/config", true)]
    #[case(".gitattributes", true)]
    #[case(".gitmodules", true)]
    #[case("subdir/.dandi", false)]
    fn test_is_meta_file(#[case] path: &str, #[case] meta: bool) {
        assert_eq!(is_meta_file(path, false), meta);
    }

    #[test]
    fn test_dandiset_metadata_is_meta() {
        assert!(!is_meta_file("dandiset.yaml", false));
        assert!(is_meta_file("dandiset.yaml", true));
    }

    #[test]
    fn test_exp_wait_is_bounded() {
        let waits = ExpWait::new(2.1, 6).collect::<Vec<_>>();
        assert_eq!(waits.len(), 6);
        for (i, d) in waits.iter().enumerate() {
            let nominal = 2.1f64.powi(i32::try_from(i).unwrap());
            assert!(d.as_secs_f64() >= nominal * 0.95, "wait {i} too short: {d:?}");
            assert!(d.as_secs_f64() <= nominal * 1.05, "wait {i} too long: {d:?}");
        }
    }

    #[test]
    fn test_diff_metadata() {
        let old = json!({"path": "foo.txt", "size": 1});
        let new = json!({"path": "foo.txt", "size": 2});
        let diff = diff_metadata(Some(&old), &new);
        assert!(diff.contains("- size: 1"), "missing removal in {diff:?}");
        assert!(diff.contains("+ size: 2"), "missing addition in {diff:?}");
        assert!(diff.contains("  path: foo.txt"), "missing context in {diff:?}");
    }

    #[rstest]
    #[case("0.210831.2033", "0.210831.2034")]
    #[case("0.210831.2033", "0.220101.0001")]
    #[case("10.20220724", "10.20240831-1~ndall+1")]
    fn test_version_key_order(#[case] lo: &str, #[case] hi: &str) {
        assert!(version_key(lo) < version_key(hi));
    }

    #[rstest]
    #[case(&[], " <no error message>")]
    #[case(&[String::from("oops")], " oops")]
    fn test_format_errors(#[case] messages: &[String], #[case] expected: &str) {
        assert_eq!(format_errors(messages), expected);
    }
}
