//! Bounded subprocess execution. Every external process the daemon starts
//! carries a caller-supplied timeout; on expiry the process is killed and
//! the call reports a timeout instead of running unbounded.

use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("command binary not found: {0}")]
    MissingBinary(String),
    #[error("command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("io error running command: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs `sh -c <command>` in `cwd` with a hard timeout.
pub fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, SubprocessError> {
    run_with_timeout("sh", &["-c".to_string(), command.to_string()], cwd, timeout)
}

pub fn run_with_timeout(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, SubprocessError> {
    let mut command = Command::new(program);
    command
        .current_dir(cwd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SubprocessError::MissingBinary(program.to_string()))
        }
        Err(err) => return Err(SubprocessError::Io(err)),
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("missing stdout pipe"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("missing stderr pipe"))?;

    let stdout_reader = thread::spawn(move || {
        let mut buf = String::new();
        let _ = BufReader::new(stdout).read_to_string(&mut buf);
        buf
    });
    let stderr_reader = thread::spawn(move || {
        let mut buf = String::new();
        let _ = BufReader::new(stderr).read_to_string(&mut buf);
        buf
    });

    let start = Instant::now();
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_reader.join();
                    let _ = stderr_reader.join();
                    return Err(SubprocessError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(SubprocessError::Io(err)),
        }
    };

    Ok(CommandOutput {
        stdout: stdout_reader.join().unwrap_or_default(),
        stderr: stderr_reader.join().unwrap_or_default(),
        exit_code: exit_status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run_shell("echo hello", Path::new("."), Duration::from_secs(5)).expect("run");
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn nonzero_exit_is_reported_not_an_error() {
        let out = run_shell("exit 3", Path::new("."), Duration::from_secs(5)).expect("run");
        assert_eq!(out.exit_code, 3);
    }

    #[test]
    fn timeout_kills_the_process() {
        let err = run_shell("sleep 5", Path::new("."), Duration::from_millis(100))
            .expect_err("must time out");
        assert!(matches!(err, SubprocessError::Timeout { .. }));
    }
}
