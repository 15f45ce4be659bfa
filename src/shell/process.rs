//! Low-level process spawning and line reading.
//!
//! Tasks run `<shell> -c <command line>`, script sessions run `<shell> -s`.
//! The agent talks to these processes only through their standard streams and
//! exit status.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("shell {shell:?} not found: {source}")]
    NotFound {
        shell: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to spawn {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve a shell name or path to an executable path.
pub fn resolve_shell(shell: &str) -> Result<PathBuf, ShellError> {
    which::which(shell).map_err(|source| ShellError::NotFound {
        shell: shell.to_string(),
        source,
    })
}

/// Spawn `<shell> -c <command_line>` with stdout/stderr piped and stdin closed.
pub fn spawn_command(shell: &Path, command_line: &str) -> Result<Child, ShellError> {
    Command::new(shell)
        .arg("-c")
        .arg(command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ShellError::Spawn {
            shell: shell.display().to_string(),
            source,
        })
}

/// Spawn `<shell> -s` reading its script from piped stdin.
///
/// `kill_on_drop` is set: a script session owns its shell outright and the
/// process must not outlive a session that is torn down early.
pub fn spawn_script_shell(shell: &Path) -> Result<Child, ShellError> {
    Command::new(shell)
        .arg("-s")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ShellError::Spawn {
            shell: shell.display().to_string(),
            source,
        })
}

/// Read one line without its terminator (`\n` or `\r\n`), lossily decoded.
///
/// Returns `None` at EOF or on a read error. A final line without a trailing
/// newline is still returned.
pub async fn next_line<R>(reader: &mut R, scratch: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    scratch.clear();
    match reader.read_until(b'\n', scratch).await {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            if scratch.last() == Some(&b'\n') {
                scratch.pop();
                if scratch.last() == Some(&b'\r') {
                    scratch.pop();
                }
            }
            Some(String::from_utf8_lossy(scratch).into_owned())
        }
    }
}

/// Human-readable description of a non-successful exit.
pub fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit status {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    status.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_next_line_strips_terminators() {
        let data: &[u8] = b"one\r\ntwo\n\nlast";
        let mut reader = BufReader::new(data);
        let mut scratch = Vec::new();
        let mut lines = Vec::new();
        while let Some(line) = next_line(&mut reader, &mut scratch).await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two", "", "last"]);
    }

    #[tokio::test]
    async fn test_spawn_command_captures_exit_code() {
        let sh = resolve_shell("sh").unwrap();
        let mut child = spawn_command(&sh, "exit 3").unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(describe_exit(status), "exit status 3");
    }

    #[test]
    fn test_resolve_unknown_shell_fails() {
        assert!(matches!(
            resolve_shell("definitely-not-a-shell-xyz"),
            Err(ShellError::NotFound { .. })
        ));
    }
}
