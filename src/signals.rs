//! Process-wide shutdown signaling and subprocess supervision (§4.9, §7).
//! Generalizes the process-group isolation/escalation idiom so both the AI
//! collaborator invocation (`ai.rs`) and the check runner (`checks.rs`) share
//! one implementation instead of duplicating `pre_exec`/`killpg` logic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;

use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
/// Call once at program startup; subsequent calls re-register the handlers
/// harmlessly.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {e}"))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {e}"))?;
    Ok(())
}

#[cfg(test)]
pub fn set_shutdown_flag_for_testing(value: bool) {
    shutdown_flag().store(value, Ordering::Relaxed);
}

// --- Process registry ---

/// Global registry of active child process group IDs, used so a SIGINT/SIGTERM
/// to the orchestrator can sweep every in-flight subprocess regardless of
/// which stage spawned it.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

pub fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

pub fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Sends SIGTERM to every registered process group, waits for the grace
/// period, then SIGKILLs any survivors. Clears the registry when done.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

/// SIGTERMs a single process group, polls for exit, then SIGKILLs survivors.
/// Runs the blocking poll-and-sleep loop on the blocking thread pool so it
/// never stalls an async worker thread.
pub async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

/// Outcome of a supervised subprocess run.
pub struct SubprocessOutcome {
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubprocessError {
    Spawn(String),
    Timeout,
    ShutdownRequested,
    Wait(String),
}

impl std::fmt::Display for SubprocessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubprocessError::Spawn(msg) => write!(f, "failed to spawn subprocess: {msg}"),
            SubprocessError::Timeout => write!(f, "subprocess timed out"),
            SubprocessError::ShutdownRequested => write!(f, "shutdown requested"),
            SubprocessError::Wait(msg) => write!(f, "error waiting for subprocess: {msg}"),
        }
    }
}

impl std::error::Error for SubprocessError {}

/// Runs `cmd` in its own process group (so a timeout or shutdown kill sweeps
/// every descendant it spawns), enforcing `timeout` and registering/
/// unregistering it with the global process registry for `kill_all_children`.
///
/// stdin is always null: under `setpgid` the child sits in a background
/// process group, and any read from the controlling terminal would raise
/// SIGTTIN and silently stop it.
pub async fn run_supervised(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> Result<SubprocessOutcome, SubprocessError> {
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec(), where only
    // async-signal-safe functions are permitted. setpgid is async-signal-safe
    // per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[signals] spawning supervised subprocess");
    let mut child = cmd
        .spawn()
        .map_err(|e| SubprocessError::Spawn(e.to_string()))?;

    let child_pid = child
        .id()
        .ok_or_else(|| SubprocessError::Spawn("failed to get child PID".to_string()))? as i32;
    let pgid = Pid::from_raw(child_pid);
    register_child(pgid);

    let wait_result = tokio::time::timeout(timeout, child.wait_with_output()).await;

    match wait_result {
        Err(_) => {
            log_debug!("[signals] timeout after {}s, killing process group", timeout.as_secs());
            kill_process_group(child_pid).await;
            unregister_child(pgid);
            Err(SubprocessError::Timeout)
        }
        Ok(Err(e)) => {
            unregister_child(pgid);
            Err(SubprocessError::Wait(e.to_string()))
        }
        Ok(Ok(output)) => {
            unregister_child(pgid);

            if is_shutdown_requested() {
                return Err(SubprocessError::ShutdownRequested);
            }

            Ok(SubprocessOutcome {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_supervised_captures_stdout_of_successful_command() {
        let mut cmd = tokio::process::Command::new("echo");
        cmd.arg("hello");
        let outcome = run_supervised(cmd, Duration::from_secs(5)).await.unwrap();
        assert!(outcome.status.success());
        assert_eq!(outcome.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_supervised_times_out_long_running_command() {
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30");
        let result = run_supervised(cmd, Duration::from_millis(50)).await;
        assert_eq!(result.unwrap_err(), SubprocessError::Timeout);
    }

    #[tokio::test]
    async fn run_supervised_errors_when_shutdown_requested() {
        set_shutdown_flag_for_testing(true);
        let cmd = tokio::process::Command::new("true");
        let result = run_supervised(cmd, Duration::from_secs(5)).await;
        set_shutdown_flag_for_testing(false);
        assert_eq!(result.unwrap_err(), SubprocessError::ShutdownRequested);
    }

    #[test]
    fn kill_all_children_on_empty_registry_is_a_no_op() {
        kill_all_children();
    }
}
