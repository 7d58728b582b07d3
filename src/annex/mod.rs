//! Batched access to a repository's git-annex key store.
//!
//! One worker subprocess is opened lazily per operation and reused for the
//! rest of the sync; a mutex per operation keeps the request/response pairs
//! on each worker's pipes in order.
mod batch;
pub(crate) use self::batch::{BatchError, BatchProcess};
use crate::consts::GIT_OPTIONS;
use crate::procio::{stream_null_command, CommandError};
use crate::util::format_errors;
use futures_util::TryStreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

/// The hash half of an annex key: strip the backend prefix and any extension
pub(crate) fn key2hash(key: &str) -> &str {
    let hash = key.rsplit('-').next().unwrap_or(key);
    hash.split('.').next().unwrap_or(hash)
}

/// A handle for registering keys, paths, and URLs in one repository's annex
#[derive(Debug)]
pub(crate) struct AsyncAnnex {
    repo: PathBuf,
    /// Hash backend for keys made by `mkkey` ("SHA256" for blobs, "MD5" for
    /// Zarr entries); the `E` variant is what actually lands in the key
    digest_type: &'static str,
    fromkey: Mutex<Option<BatchProcess>>,
    examinekey: Mutex<Option<BatchProcess>>,
    whereis: Mutex<Option<BatchProcess>>,
    registerurl: Mutex<Option<BatchProcess>>,
}

#[derive(Clone, Debug, Deserialize)]
struct AnnexResult {
    success: bool,
    #[serde(rename = "error-messages", default)]
    error_messages: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct WhereisResult {
    success: bool,
    #[serde(default)]
    whereis: Vec<WhereisRemote>,
    #[serde(default)]
    untrusted: Vec<WhereisRemote>,
}

#[derive(Clone, Debug, Deserialize)]
struct WhereisRemote {
    description: String,
}

/// Open the worker in `slot` if it is not already running
fn ensure_worker(
    slot: &mut Option<BatchProcess>,
    open: impl FnOnce() -> Result<BatchProcess, BatchError>,
) -> Result<&mut BatchProcess, BatchError> {
    if slot.is_none() {
        *slot = Some(open()?);
    }
    Ok(slot.as_mut().expect("worker was just ensured"))
}

impl AsyncAnnex {
    pub(crate) fn new(repo: PathBuf, digest_type: &'static str) -> AsyncAnnex {
        AsyncAnnex {
            repo,
            digest_type,
            fromkey: Mutex::new(None),
            examinekey: Mutex::new(None),
            whereis: Mutex::new(None),
            registerurl: Mutex::new(None),
        }
    }

    pub(crate) fn repo(&self) -> &Path {
        &self.repo
    }

    /// Register an existing `key` under the working-tree path `path` without
    /// downloading anything
    pub(crate) async fn from_key(&self, key: &str, path: &str) -> Result<(), AnnexError> {
        let reply = {
            let mut guard = self.fromkey.lock().await;
            let p = ensure_worker(&mut guard, || {
                BatchProcess::open_git_annex(
                    &self.repo,
                    "fromkey",
                    ["--force", "--batch", "--json", "--json-error-messages"],
                    &[],
                )
            })?;
            p.chat(&format!("{key} {path}")).await?
        };
        let r = parse_reply::<AnnexResult>("fromkey", &reply)?;
        if !r.success {
            tracing::error!(
                key,
                path,
                repo = %self.repo.display(),
                "`git annex fromkey` call failed:{}",
                format_errors(&r.error_messages),
            );
        }
        Ok(())
    }

    /// Compute the canonical key for a file with the given name, size, and
    /// digest.  Purely computational; never touches files.
    pub(crate) async fn mkkey(
        &self,
        filename: &str,
        size: i64,
        digest: &str,
    ) -> Result<String, AnnexError> {
        let mut guard = self.examinekey.lock().await;
        let p = ensure_worker(&mut guard, || {
            BatchProcess::open_git_annex(
                &self.repo,
                "examinekey",
                vec![
                    String::from("--batch"),
                    format!("--migrate-to-backend={}E", self.digest_type),
                ],
                &[],
            )
        })?;
        let reply = p
            .chat(&format!("{}-s{size}--{digest} {filename}", self.digest_type))
            .await?;
        Ok(reply)
    }

    /// Return the descriptions of the remotes the key is known to be present
    /// on, or `None` if the key is unknown to git-annex
    pub(crate) async fn get_key_remotes(
        &self,
        key: &str,
    ) -> Result<Option<Vec<String>>, AnnexError> {
        let reply = {
            let mut guard = self.whereis.lock().await;
            let p = ensure_worker(&mut guard, || {
                BatchProcess::open_git_annex(
                    &self.repo,
                    "whereis",
                    ["--batch-keys", "--json", "--json-error-messages"],
                    &[],
                )
            })?;
            p.chat(key).await?
        };
        let r = parse_reply::<WhereisResult>("whereis", &reply)?;
        if r.success {
            Ok(Some(
                r.whereis
                    .into_iter()
                    .chain(r.untrusted)
                    .map(|w| w.description.trim_matches(['[', ']']).to_owned())
                    .collect(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Attach an additional download URL to a key
    pub(crate) async fn register_url(&self, key: &str, url: &str) -> Result<(), AnnexError> {
        let reply = {
            let mut guard = self.registerurl.lock().await;
            let p = ensure_worker(&mut guard, || {
                BatchProcess::open_git_annex(
                    &self.repo,
                    "registerurl",
                    [
                        "-c",
                        "annex.alwayscompact=false",
                        "--batch",
                        "--json",
                        "--json-error-messages",
                    ],
                    &[],
                )
            })?;
            p.chat(&format!("{key} {url}")).await?
        };
        let r = parse_reply::<AnnexResult>("registerurl", &reply)?;
        if !r.success {
            tracing::error!(
                key,
                url,
                repo = %self.repo.display(),
                "`git annex registerurl` call failed:{}",
                format_errors(&r.error_messages),
            );
        }
        Ok(())
    }

    /// List the files committed at `HEAD`, optionally restricted to a
    /// subdirectory; paths are reported relative to the repository root
    pub(crate) async fn list_files(
        &self,
        path: Option<&str>,
    ) -> Result<Vec<String>, AnnexError> {
        let mut cmd = Command::new("git");
        cmd.args(GIT_OPTIONS)
            .args(["ls-tree", "-r", "--name-only", "-z", "HEAD"])
            .current_dir(&self.repo);
        if let Some(p) = path {
            cmd.arg(p);
        }
        let files = stream_null_command(cmd).try_collect::<Vec<_>>().await?;
        Ok(files)
    }

    /// Gracefully close all open workers
    pub(crate) async fn shutdown(&self) -> Result<(), AnnexError> {
        for lock in [&self.fromkey, &self.examinekey, &self.whereis, &self.registerurl] {
            let worker = lock.lock().await.take();
            if let Some(p) = worker {
                p.shutdown().await?;
            }
        }
        Ok(())
    }
}

fn parse_reply<T: serde::de::DeserializeOwned>(op: &'static str, line: &str) -> Result<T, AnnexError> {
    serde_json::from_str::<T>(line).map_err(|source| AnnexError::BadJson {
        op,
        line: line.to_owned(),
        source,
    })
}

#[derive(Debug, Error)]
pub(crate) enum AnnexError {
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("unparseable JSON from `git annex {op}`: {line:?}")]
    BadJson {
        op: &'static str,
        line: String,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("SHA256E-s5--0d17cd6b4e93a6f482f9d947dbbbf175de8d951a2fab0a3e47400b5c9bb09c33.dat", "0d17cd6b4e93a6f482f9d947dbbbf175de8d951a2fab0a3e47400b5c9bb09c33")]
    #[case("MD5E-s4--d3b07384d113edec49eaa6238ad5ff00", "d3b07384d113edec49eaa6238ad5ff00")]
    #[case("MD5-s4--d3b07384d113edec49eaa6238ad5ff00", "d3b07384d113edec49eaa6238ad5ff00")]
    #[case("SHA256E-s1024--abcd.tar.gz", "abcd")]
    fn test_key2hash(#[case] key: &str, #[case] hash: &str) {
        assert_eq!(key2hash(key), hash);
    }

    #[test]
    fn parse_whereis_reply() {
        let line = r#"{"command":"whereis","success":true,"whereis":[{"description":"[dandiapi]","uuid":"00000000-0000-0000-0000-000000000001"}],"untrusted":[{"description":"[backup]","uuid":"00000000-0000-0000-0000-000000000002"}],"key":"MD5E-s4--d3b07384d113edec49eaa6238ad5ff00"}"#;
        let r = parse_reply::<WhereisResult>("whereis", line).unwrap();
        assert!(r.success);
        assert_eq!(r.whereis.len(), 1);
        assert_eq!(r.untrusted.len(), 1);
    }

    #[test]
    fn parse_failed_reply() {
        let line = r#"{"command":"fromkey","success":false,"error-messages":["key not found"]}"#;
        let r = parse_reply::<AnnexResult>("fromkey", line).unwrap();
        assert!(!r.success);
        assert_eq!(r.error_messages, ["key not found"]);
    }
}
