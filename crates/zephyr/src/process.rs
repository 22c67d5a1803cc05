//! External command execution for source acquisition.
//!
//! Acquisition commands (git clones) always run under a hard deadline;
//! an unbounded fetch would wedge the install pipeline. Output is
//! streamed off the child on reader threads so a chatty clone cannot
//! fill the pipe and stall, and only a bounded tail of each stream is
//! retained for failure messages and audit reasons.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Most bytes retained per output stream.
const OUTPUT_TAIL_BYTES: usize = 8 * 1024;

/// How often the deadline loop checks on the child.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How an acquisition command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    Completed { exit_code: i32 },
    /// Killed when the deadline passed.
    TimedOut { after: Duration },
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub status: ExecStatus,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn ok(&self) -> bool {
        matches!(self.status, ExecStatus::Completed { exit_code: 0 })
    }

    /// Last non-blank stderr line, the part worth surfacing to a user.
    pub fn stderr_last_line(&self) -> &str {
        self.stderr_tail
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
    }

    /// A one-line reason suitable for failure messages and audit
    /// events.
    pub fn failure_reason(&self) -> String {
        match &self.status {
            ExecStatus::TimedOut { after } => {
                format!("killed after {}", humantime::format_duration(*after))
            }
            ExecStatus::Completed { exit_code } => {
                let line = self.stderr_last_line();
                if line.is_empty() {
                    format!("exited with status {exit_code}")
                } else {
                    line.to_string()
                }
            }
        }
    }
}

/// Run `program` in `working_dir`, killing it once `deadline` has
/// elapsed.
pub fn run_with_deadline(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    deadline: Duration,
) -> Result<ExecResult> {
    let started = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute {program}"))?;

    let stdout_reader = spawn_tail_reader(child.stdout.take());
    let stderr_reader = spawn_tail_reader(child.stderr.take());

    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to poll {program}"))?
        {
            break ExecStatus::Completed {
                exit_code: status.code().unwrap_or(-1),
            };
        }
        if started.elapsed() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            break ExecStatus::TimedOut { after: deadline };
        }
        thread::sleep(POLL_INTERVAL);
    };

    // Readers finish once the child's pipes close.
    let stdout_tail = stdout_reader
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    let stderr_tail = stderr_reader
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();

    Ok(ExecResult {
        status,
        stdout_tail,
        stderr_tail,
        duration: started.elapsed(),
    })
}

fn spawn_tail_reader<R>(stream: Option<R>) -> Option<thread::JoinHandle<String>>
where
    R: Read + Send + 'static,
{
    let mut stream = stream?;
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        let start = buf.len().saturating_sub(OUTPUT_TAIL_BYTES);
        String::from_utf8_lossy(&buf[start..]).into_owned()
    }))
}
