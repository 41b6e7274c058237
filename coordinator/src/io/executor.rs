//! Shell execution of one automatable check under a deterministic timeout.
//!
//! The contract with the OS boundary is "produce exit code + combined output,
//! honoring the timeout". Exit 0 is `pass`, non-zero is `fail`, and a timeout
//! or launch failure is `error` — a first-class outcome distinguishable from
//! "the check said no".

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::ledger::CheckStatus;

/// Default per-check timeout when the definition carries no override.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(120);
/// Output tail caps: the smaller of these wins.
pub const MAX_TAIL_LINES: usize = 50;
pub const MAX_TAIL_BYTES: usize = 4096;
const TRUNCATION_MARKER: &str = "[output truncated]\n";
/// Bytes of content kept when truncating, leaving room for the marker.
const TAIL_CONTENT_BUDGET: usize = MAX_TAIL_BYTES - TRUNCATION_MARKER.len() - 1;

/// Bytes of raw output drained per stream before tail truncation applies.
const DEFAULT_DRAIN_LIMIT_BYTES: usize = 65_536;

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub workdir: PathBuf,
    pub cmd: String,
    pub timeout: Duration,
}

/// Result of executing one check. Always produced; failures to even launch
/// the command are reported through `status: Error`, not as an orchestration
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckExecution {
    pub status: CheckStatus,
    pub exit_code: Option<i32>,
    pub output_tail: String,
    pub truncated: bool,
}

/// Seam for check execution so the recorder can be tested without spawning
/// processes.
pub trait CheckRunner {
    fn run(&self, request: &CheckRequest) -> CheckExecution;
}

/// Executes checks via `sh -c`, capturing combined stdout/stderr.
#[derive(Debug, Clone)]
pub struct ShellCheckRunner {
    drain_limit_bytes: usize,
}

impl Default for ShellCheckRunner {
    fn default() -> Self {
        Self {
            drain_limit_bytes: DEFAULT_DRAIN_LIMIT_BYTES,
        }
    }
}

impl ShellCheckRunner {
    pub fn new(drain_limit_bytes: usize) -> Self {
        Self { drain_limit_bytes }
    }
}

impl CheckRunner for ShellCheckRunner {
    #[instrument(skip_all, fields(cmd = %request.cmd, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &CheckRequest) -> CheckExecution {
        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&request.cmd)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                warn!(err = %err, "failed to spawn check command");
                return error_execution(format!("failed to launch: {err}"));
            }
        };

        // Drain both pipes concurrently while the child runs to avoid pipe
        // deadlocks on chatty commands.
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let limit = self.drain_limit_bytes;
        let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

        let status = match child.wait_timeout(request.timeout) {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                warn!(timeout_secs = request.timeout.as_secs(), "check timed out, killing");
                if let Err(err) = child.kill() {
                    warn!(err = %err, "failed to kill timed-out check");
                }
                let _ = child.wait();
                None
            }
            Err(err) => {
                warn!(err = %err, "failed waiting for check");
                let _ = child.kill();
                let _ = child.wait();
                None
            }
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        let combined = combine_output(&stdout, &stderr);
        let (output_tail, truncated) = truncate_tail(&combined);

        match status {
            Some(status) => {
                let exit_code = status.code();
                let check_status = if status.success() {
                    CheckStatus::Pass
                } else {
                    CheckStatus::Fail
                };
                debug!(exit_code = ?exit_code, status = ?check_status, "check finished");
                CheckExecution {
                    status: check_status,
                    exit_code,
                    output_tail,
                    truncated,
                }
            }
            None => {
                let (output_tail, truncated) = if combined.is_empty() {
                    (format!("timed out after {}s", request.timeout.as_secs()), false)
                } else {
                    (output_tail, truncated)
                };
                CheckExecution {
                    status: CheckStatus::Error,
                    exit_code: None,
                    output_tail,
                    truncated,
                }
            }
        }
    }
}

fn error_execution(message: String) -> CheckExecution {
    CheckExecution {
        status: CheckStatus::Error,
        exit_code: None,
        output_tail: message,
        truncated: false,
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(stderr));
    }
    combined
}

/// Drain a stream to EOF, retaining only the newest `limit` bytes.
fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit {
            buf.drain(..buf.len() - limit);
        }
    }
    buf
}

/// Truncate output to the smaller of [`MAX_TAIL_LINES`] lines or the byte
/// budget, always keeping the newest output. A leading marker shows when
/// anything was cut; byte cuts land on a char boundary only.
pub fn truncate_tail(output: &str) -> (String, bool) {
    let trimmed = output.trim_end_matches('\n');
    let mut truncated = false;

    let lines: Vec<&str> = trimmed.lines().collect();
    let mut kept: String = if lines.len() > MAX_TAIL_LINES {
        truncated = true;
        lines[lines.len() - MAX_TAIL_LINES..].join("\n")
    } else {
        trimmed.to_string()
    };

    if kept.len() > TAIL_CONTENT_BUDGET {
        let mut cut = kept.len() - TAIL_CONTENT_BUDGET;
        while !kept.is_char_boundary(cut) {
            cut += 1;
        }
        kept = kept.split_off(cut);
        truncated = true;
    }

    if truncated {
        kept.insert_str(0, TRUNCATION_MARKER);
    }
    (kept, truncated)
}
