//! Long-lived `git-annex --batch` subprocesses.
//!
//! Each batch operation is one child process that is fed one request per
//! line on stdin and answers with one line (or, for `addurl`, a stream of
//! JSON records) on stdout.  Children are spawned with `kill_on_drop` so
//! that a cancelled task tree force-closes its workers; the graceful path is
//! [`BatchProcess::shutdown`], which closes stdin and waits.
use crate::consts::GIT_OPTIONS;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

#[derive(Debug)]
pub(crate) struct BatchProcess {
    desc: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
}

impl BatchProcess {
    /// Spawn `git annex <subcmd> <args>` in `repo` as a batch worker
    pub(crate) fn open_git_annex<I, S>(
        repo: &Path,
        subcmd: &str,
        args: I,
        envs: &[(&str, &str)],
    ) -> Result<BatchProcess, BatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.args(GIT_OPTIONS)
            .arg("annex")
            .arg(subcmd)
            .args(args)
            .current_dir(repo)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in envs {
            cmd.env(k, v);
        }
        let desc = format!("git-annex {subcmd} [cwd={}]", repo.display());
        tracing::debug!(worker = %desc, "Opening batch worker");
        let mut child = cmd.spawn().map_err(|source| BatchError::Startup {
            desc: desc.clone(),
            source,
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        Ok(BatchProcess {
            desc,
            child,
            stdin,
            stdout,
        })
    }

    pub(crate) fn desc(&self) -> &str {
        &self.desc
    }

    /// Send one request line to the worker
    pub(crate) async fn send(&mut self, line: &str) -> Result<(), BatchError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| BatchError::IoTaken {
            desc: self.desc.clone(),
        })?;
        let r = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        r.map_err(|source| BatchError::Write {
            desc: self.desc.clone(),
            source,
        })
    }

    /// Read one response line from the worker
    pub(crate) async fn receive(&mut self) -> Result<String, BatchError> {
        let stdout = self.stdout.as_mut().ok_or_else(|| BatchError::IoTaken {
            desc: self.desc.clone(),
        })?;
        let mut line = String::new();
        let n = stdout
            .read_line(&mut line)
            .await
            .map_err(|source| BatchError::Read {
                desc: self.desc.clone(),
                source,
            })?;
        if n == 0 {
            return Err(BatchError::Closed {
                desc: self.desc.clone(),
            });
        }
        Ok(line.trim_end().to_owned())
    }

    /// One request, one response
    pub(crate) async fn chat(&mut self, line: &str) -> Result<String, BatchError> {
        self.send(line).await?;
        self.receive().await
    }

    /// Detach the worker's stdin and stdout for concurrent use by separate
    /// feeder and reader tasks (`addurl`)
    pub(crate) fn take_io(&mut self) -> Option<(ChildStdin, BufReader<ChildStdout>)> {
        Some((self.stdin.take()?, self.stdout.take()?))
    }

    /// Close stdin and wait for the worker to finish
    pub(crate) async fn shutdown(mut self) -> Result<(), BatchError> {
        drop(self.stdin.take());
        drop(self.stdout.take());
        let status = self
            .child
            .wait()
            .await
            .map_err(|source| BatchError::Wait {
                desc: self.desc.clone(),
                source,
            })?;
        if !status.success() {
            tracing::warn!(worker = %self.desc, %status, "Batch worker exited non-zero");
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub(crate) enum BatchError {
    #[error("failed to start batch worker: {desc}")]
    Startup {
        desc: String,
        source: std::io::Error,
    },
    #[error("error writing to batch worker {desc}")]
    Write {
        desc: String,
        source: std::io::Error,
    },
    #[error("error reading from batch worker {desc}")]
    Read {
        desc: String,
        source: std::io::Error,
    },
    #[error("batch worker {desc} closed its output")]
    Closed { desc: String },
    #[error("I/O for batch worker {desc} was detached")]
    IoTaken { desc: String },
    #[error("error awaiting batch worker {desc}")]
    Wait {
        desc: String,
        source: std::io::Error,
    },
}
