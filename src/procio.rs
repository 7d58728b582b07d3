//! Running external commands and streaming their output
use async_stream::try_stream;
use futures_util::Stream;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Render a command line for error messages
pub(crate) fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Error)]
pub(crate) enum CommandError {
    #[error("failed to start command: {cmdline}")]
    Startup {
        cmdline: String,
        source: std::io::Error,
    },
    #[error("command {cmdline} failed with exit code {rc}{}", format_stderr(.stderr))]
    Failed {
        cmdline: String,
        rc: i32,
        stderr: String,
    },
    #[error("command {cmdline} killed by signal")]
    Signalled { cmdline: String },
    #[error("error reading output from command {cmdline}")]
    Read {
        cmdline: String,
        source: std::io::Error,
    },
    #[error("command {cmdline} emitted non-UTF-8 output")]
    Decode { cmdline: String },
}

fn format_stderr(stderr: &str) -> String {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{stderr}")
    }
}

fn exit_error(cmd: &Command, status: std::process::ExitStatus, stderr: &[u8]) -> CommandError {
    match status.code() {
        Some(rc) => CommandError::Failed {
            cmdline: describe(cmd),
            rc,
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        },
        None => CommandError::Signalled {
            cmdline: describe(cmd),
        },
    }
}

async fn output(cmd: &mut Command) -> Result<std::process::Output, CommandError> {
    cmd.stdin(Stdio::null());
    cmd.output().await.map_err(|source| CommandError::Startup {
        cmdline: describe(cmd),
        source,
    })
}

/// Run a command, discarding its output; non-zero exit is an error carrying
/// the captured stderr
pub(crate) async fn run_command(cmd: &mut Command) -> Result<(), CommandError> {
    let out = output(cmd).await?;
    if out.status.success() {
        Ok(())
    } else {
        Err(exit_error(cmd, out.status, &out.stderr))
    }
}

/// Like [`run_command`], but exit codes in `quiet_rcs` are reported in the
/// `Ok` value instead of being treated as failures
pub(crate) async fn run_command_rcs(
    cmd: &mut Command,
    quiet_rcs: &[i32],
) -> Result<i32, CommandError> {
    let out = output(cmd).await?;
    match out.status.code() {
        Some(0) => Ok(0),
        Some(rc) if quiet_rcs.contains(&rc) => Ok(rc),
        _ => Err(exit_error(cmd, out.status, &out.stderr)),
    }
}

/// Run a command and return its stdout with trailing whitespace stripped
pub(crate) async fn read_command(cmd: &mut Command) -> Result<String, CommandError> {
    let out = output(cmd).await?;
    if !out.status.success() {
        return Err(exit_error(cmd, out.status, &out.stderr));
    }
    let s = String::from_utf8(out.stdout).map_err(|_| CommandError::Decode {
        cmdline: describe(cmd),
    })?;
    Ok(s.trim_end().to_owned())
}

/// Like [`read_command`], but an exit code in `quiet_rcs` yields `None`
pub(crate) async fn read_command_rcs(
    cmd: &mut Command,
    quiet_rcs: &[i32],
) -> Result<Option<String>, CommandError> {
    let out = output(cmd).await?;
    match out.status.code() {
        Some(0) => {
            let s = String::from_utf8(out.stdout).map_err(|_| CommandError::Decode {
                cmdline: describe(cmd),
            })?;
            Ok(Some(s.trim_end().to_owned()))
        }
        Some(rc) if quiet_rcs.contains(&rc) => Ok(None),
        _ => Err(exit_error(cmd, out.status, &out.stderr)),
    }
}

/// Run a command with the given bytes as stdin, discarding its output
pub(crate) async fn run_command_with_input(
    cmd: &mut Command,
    input: &[u8],
) -> Result<(), CommandError> {
    use tokio::io::AsyncWriteExt;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| CommandError::Startup {
        cmdline: describe(cmd),
        source,
    })?;
    {
        let mut stdin = child.stdin.take().expect("child stdin should be piped");
        stdin
            .write_all(input)
            .await
            .map_err(|source| CommandError::Read {
                cmdline: describe(cmd),
                source,
            })?;
    }
    let out = child
        .wait_with_output()
        .await
        .map_err(|source| CommandError::Read {
            cmdline: describe(cmd),
            source,
        })?;
    if out.status.success() {
        Ok(())
    } else {
        Err(exit_error(cmd, out.status, &out.stderr))
    }
}

/// Stream a command's stdout one delimited item at a time.
///
/// The trailing delimiter (if any) is stripped from each item.  The child is
/// killed if the stream is dropped early; a non-zero exit surfaces as the
/// final stream item.
pub(crate) fn stream_command(
    mut cmd: Command,
    delimiter: u8,
) -> impl Stream<Item = Result<String, CommandError>> {
    try_stream! {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| CommandError::Startup {
            cmdline: describe(&cmd),
            source,
        })?;
        let stdout = child.stdout.take().expect("child stdout should be piped");
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader
                .read_until(delimiter, &mut buf)
                .await
                .map_err(|source| CommandError::Read {
                    cmdline: describe(&cmd),
                    source,
                })?;
            if n == 0 {
                break;
            }
            if buf.last() == Some(&delimiter) {
                buf.pop();
            }
            if delimiter == b'\n' && buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }
            let item = String::from_utf8(std::mem::take(&mut buf))
                .map_err(|_| CommandError::Decode {
                    cmdline: describe(&cmd),
                })?;
            yield item;
        }
        let status = child.wait().await.map_err(|source| CommandError::Read {
            cmdline: describe(&cmd),
            source,
        })?;
        if !status.success() {
            Err(exit_error(&cmd, status, b""))?;
        }
    }
}

/// Stream a command's stdout line by line
pub(crate) fn stream_lines_command(
    cmd: Command,
) -> impl Stream<Item = Result<String, CommandError>> {
    stream_command(cmd, b'\n')
}

/// Stream a command's NUL-delimited stdout (e.g. `git ls-tree -z`)
pub(crate) fn stream_null_command(
    cmd: Command,
) -> impl Stream<Item = Result<String, CommandError>> {
    stream_command(cmd, b'\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    #[tokio::test]
    async fn read_command_trims() {
        let mut cmd = Command::new("printf");
        cmd.arg("hello\\n");
        assert_eq!(read_command(&mut cmd).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn failed_command_includes_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo oops >&2; exit 3"]);
        let e = run_command(&mut cmd).await.unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("exit") || msg.contains('3'), "bad message: {msg}");
        assert!(msg.contains("oops"), "stderr missing from message: {msg}");
    }

    #[tokio::test]
    async fn quiet_rcs_are_not_errors() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 1"]);
        assert_eq!(run_command_rcs(&mut cmd, &[1]).await.unwrap(), 1);
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 1"]);
        assert_eq!(read_command_rcs(&mut cmd, &[1]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_lines() {
        let mut cmd = Command::new("printf");
        cmd.arg("one\\ntwo\\nthree\\n");
        let lines = stream_lines_command(cmd).try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(lines, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn stream_null_delimited() {
        let mut cmd = Command::new("printf");
        cmd.arg("a\\0b/c\\0");
        let items = stream_null_command(cmd).try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(items, ["a", "b/c"]);
    }
}
