//! Subprocess helpers.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

/// Poll interval while waiting on a child with a deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long to keep reading after the child is gone. A grandchild that
/// inherited the pipes can hold them open long after the child exits.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Output of a subprocess run with a deadline.
#[derive(Debug, Clone)]
pub struct TimedOutput {
    /// `None` when the process was killed at the deadline
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl TimedOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }
}

/// Run a command, killing it when `timeout` elapses.
///
/// Both pipes are drained on background threads so a chatty child never
/// blocks on a full pipe; output captured before a kill is kept. Readers
/// still blocked after [`DRAIN_GRACE`] are left detached.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> io::Result<TimedOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!("Running {} {}", program, args.join(" "));
    let mut child = cmd.spawn()?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let (status, timed_out) = wait_with_deadline(&mut child, timeout)?;

    let drain_deadline = Instant::now() + DRAIN_GRACE;
    let stdout = stdout_reader.finish(drain_deadline);
    let stderr = stderr_reader.finish(drain_deadline);

    Ok(TimedOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<(Option<ExitStatus>, bool)> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((Some(status), false));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok((None, true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Pipe drained on a background thread into a shared buffer.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: thread::JoinHandle<()>,
}

impl PipeReader {
    /// Whatever was read by `deadline`.
    fn finish(self, deadline: Instant) -> String {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if self.handle.is_finished() {
            let _ = self.handle.join();
        } else {
            debug!("Pipe still held open after the child exited, keeping partial output");
        }
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> PipeReader {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buf);
    let handle = thread::spawn(move || {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    PipeReader { buf, handle }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_output() {
        let out = run_with_timeout("sh", &["-c", "echo hi; echo err >&2"], None, Duration::from_secs(5))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn test_timeout_keeps_partial_output() {
        let out = run_with_timeout(
            "sh",
            &["-c", "echo partial; exec sleep 5"],
            None,
            Duration::from_millis(300),
        )
        .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.status.is_none());
        assert_eq!(out.stdout.trim(), "partial");
    }

    #[test]
    fn test_grandchild_holding_pipes_does_not_block() {
        let started = Instant::now();
        let out = run_with_timeout(
            "sh",
            &["-c", "sleep 5 & echo partial; exec sleep 5"],
            None,
            Duration::from_millis(300),
        )
        .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.stdout.trim(), "partial");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_missing_binary() {
        assert!(run_with_timeout("definitely-not-a-binary-xyz", &[], None, Duration::from_secs(1)).is_err());
    }
}
