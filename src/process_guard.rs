//! Process lifecycle management for provisioning commands
//!
//! Package managers occasionally hang on a stalled mirror. Every command is
//! therefore spawned in its own process group and waited on with a deadline;
//! when the deadline passes the whole group (yum and any rpm/curl children)
//! receives SIGTERM, then SIGKILL after a grace period.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{self, Read};
use std::process::{Child, ExitStatus};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period between SIGTERM and SIGKILL on timeout
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Result of waiting on a child with a deadline
#[derive(Debug)]
pub struct TimedOutput {
    /// Exit status, None only if the child could not be reaped
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// True if the deadline elapsed and the group was killed
    pub timed_out: bool,
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    /// so the whole tree can be signalled at once
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                // PGID = child PID
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(io::Error::other)?;

                // Child dies with the provisioner instead of mutating the host unsupervised
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

/// Which pipe a reader thread drained
#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Wait for `child` to exit, killing its process group after `timeout`.
///
/// stdout and stderr (if piped) are drained on helper threads so a chatty
/// child cannot block on a full pipe while we poll. The deadline also covers
/// draining: a group member that outlives the leader and keeps the pipes
/// open is killed once the deadline passes.
pub fn wait_with_timeout(
    mut child: Child,
    timeout: Duration,
    grace: Duration,
) -> io::Result<TimedOutput> {
    let pgid = child.id();
    let (tx, rx) = mpsc::channel();
    let mut pending = 0;
    if let Some(pipe) = child.stdout.take() {
        spawn_reader(pipe, Stream::Stdout, tx.clone());
        pending += 1;
    }
    if let Some(pipe) = child.stderr.take() {
        spawn_reader(pipe, Stream::Stderr, tx.clone());
        pending += 1;
    }
    drop(tx);

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            timed_out = true;
            tracing::warn!(pid = pgid, ?timeout, "Command exceeded timeout, terminating process group");
            break terminate_group(&mut child, grace);
        }
        thread::sleep(POLL_INTERVAL);
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while pending > 0 {
        let wait = if timed_out {
            grace
        } else {
            deadline.saturating_duration_since(Instant::now())
        };
        match rx.recv_timeout(wait) {
            Ok((Stream::Stdout, buf)) => {
                stdout = buf;
                pending -= 1;
            }
            Ok((Stream::Stderr, buf)) => {
                stderr = buf;
                pending -= 1;
            }
            Err(RecvTimeoutError::Timeout) if !timed_out => {
                timed_out = true;
                tracing::warn!(
                    pid = pgid,
                    ?timeout,
                    "Process group still holds output pipes after timeout, terminating"
                );
                terminate_stragglers(pgid, grace);
            }
            // Pipes held by something outside the group; give up on them
            Err(_) => break,
        }
    }

    Ok(TimedOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// SIGTERM the child's group, wait up to `grace`, then SIGKILL and reap
fn terminate_group(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();

    if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM to process group");
        let _ = send_signal(pid, Signal::SIGTERM);
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        match child.try_wait() {
            Ok(Some(status)) => {
                // Leader is gone; make sure stragglers in the group follow
                let _ = send_signal_to_group(pid, Signal::SIGKILL);
                return Some(status);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }

    tracing::warn!(pid, "Process group did not terminate, sending SIGKILL");
    if send_signal_to_group(pid, Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
    child.wait().ok()
}

/// Terminate what is left of a group whose leader was already reaped
fn terminate_stragglers(pgid: u32, grace: Duration) {
    if send_signal_to_group(pgid, Signal::SIGTERM).is_err() {
        return;
    }
    let start = Instant::now();
    while start.elapsed() < grace {
        // ESRCH once every member is gone
        if signal::kill(Pid::from_raw(-(pgid as i32)), None).is_err() {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    tracing::warn!(pgid, "Process group did not terminate, sending SIGKILL");
    let _ = send_signal_to_group(pgid, Signal::SIGKILL);
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID signals every process in the group
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

fn spawn_reader<R: Read + Send + 'static>(
    mut pipe: R,
    stream: Stream,
    tx: Sender<(Stream, Vec<u8>)>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send((stream, buf));
    });
}
