//! Process lifecycle: spawns backends and takes them down again.
//!
//! Every backend runs in its own process group so that signals reach the
//! children it forks (engine workers, tokenizer servers). Termination is
//! SIGTERM to the group, a polling grace period, then SIGKILL to the group
//! and a bounded confirmation poll. The child handle is always reaped.

use crate::registry::ModelDescriptor;
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Result of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process and its group are confirmed gone
    Terminated,
    /// Still present after SIGKILL and the confirmation window
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn process for {model}: {reason}")]
    SpawnFailed { model: String, reason: String },
}

/// Operations the swap orchestrator needs from the process layer.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Spawn the backend. Returns as soon as the OS accepted the spawn.
    async fn start(&self, descriptor: &ModelDescriptor) -> Result<u32, ProcessError>;

    /// Take the process group down, escalating after `grace_period`.
    async fn terminate(&self, pid: u32, grace_period: Duration) -> Termination;

    /// `Some(status)` once the process has exited on its own.
    async fn exit_status(&self, pid: u32) -> Option<String>;

    /// Whether the backend answers its health endpoint with a 2xx.
    async fn check_health(&self, descriptor: &ModelDescriptor) -> bool;
}

/// Strip ANSI escape sequences from a string.
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip until we hit a letter (end of escape sequence)
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Deliver a signal to the whole process group led by `pgid`.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal, _child: Option<&mut Child>) {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: negative pid targets the process group we created at spawn.
    unsafe {
        libc::kill(-(pgid as libc::pid_t), signo);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: Signal, child: Option<&mut Child>) {
    if let Some(child) = child {
        let _ = child.start_kill();
    }
}

/// Whether any member of the process group still exists.
#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), 0) };
    let exists = rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    // Orphaned members linger as zombies until init reaps them; those hold
    // no memory and must not count as alive.
    #[cfg(target_os = "linux")]
    let exists = exists && group_has_live_members(pgid);
    exists
}

/// Scan /proc for a non-zombie process whose process group is `pgid`.
#[cfg(target_os = "linux")]
fn group_has_live_members(pgid: u32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };
    entries.flatten().any(|entry| {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            return false;
        };
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| parse_stat_state_and_pgrp(&stat))
            .is_some_and(|(state, pgrp)| pgrp == pgid && state != 'Z')
    })
}

/// Extract (state, pgrp) from a `/proc/PID/stat` line. The command name is
/// parenthesised and may itself contain spaces or parentheses.
#[cfg(any(target_os = "linux", test))]
fn parse_stat_state_and_pgrp(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

#[cfg(not(unix))]
fn group_alive(_pgid: u32) -> bool {
    false
}

/// Whether a single process exists (used for pids we did not spawn).
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

/// Spawns and supervises backend processes.
pub struct ProcessManager {
    /// Child handles keyed by pid (which is also the process group id)
    children: DashMap<u32, Child>,
    /// How long to wait for exit after SIGKILL
    kill_timeout: Duration,
    /// Interval between exit checks while terminating
    poll_interval: Duration,
    /// Timeout of a single health request
    health_timeout: Duration,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(5),
            Duration::from_millis(50),
            Duration::from_secs(5),
        )
    }
}

impl ProcessManager {
    pub fn new(kill_timeout: Duration, poll_interval: Duration, health_timeout: Duration) -> Self {
        Self {
            children: DashMap::new(),
            kill_timeout,
            poll_interval,
            health_timeout,
        }
    }

    /// Pids of every backend this manager still holds a handle for.
    pub fn managed_pids(&self) -> Vec<u32> {
        self.children.iter().map(|entry| *entry.key()).collect()
    }

    /// Terminate every managed backend. Used on shutdown.
    pub async fn shutdown_all(&self, grace_period: Duration) {
        for pid in self.managed_pids() {
            info!(pid, "Terminating backend left at shutdown");
            if self.terminate(pid, grace_period).await == Termination::TimedOut {
                warn!(pid, "Backend survived shutdown");
            }
        }
    }

    /// Poll until the leader has been reaped and the group is empty, or the
    /// deadline passes. Returns true when everything is gone.
    async fn wait_for_exit(&self, pid: u32, child: &mut Option<Child>, deadline: Instant) -> bool {
        loop {
            // Without a handle the leader is covered by the group check,
            // since it leads its own group.
            let leader_gone = match child.as_mut() {
                Some(c) => matches!(c.try_wait(), Ok(Some(_))),
                None => true,
            };
            if leader_gone && !group_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Forward backend stdout/stderr as debug logs under the "backend"
    /// target, filterable via RUST_LOG (e.g. RUST_LOG=info,backend=debug).
    fn forward_output(model: &str, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let name = model.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "backend", model = %name, stream = "stdout", "{}", strip_ansi(&line));
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let name = model.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "backend", model = %name, stream = "stderr", "{}", strip_ansi(&line));
                }
            });
        }
    }
}

#[async_trait]
impl Lifecycle for ProcessManager {
    async fn start(&self, descriptor: &ModelDescriptor) -> Result<u32, ProcessError> {
        let launch = &descriptor.launch;
        info!(
            model = %descriptor.model_id,
            port = descriptor.port,
            program = %launch.program,
            "Starting backend process"
        );
        debug!(model = %descriptor.model_id, args = ?launch.args, "Backend command args");

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .envs(&launch.env)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = launch.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            model: descriptor.model_id.clone(),
            reason: e.to_string(),
        })?;

        let Some(pid) = child.id() else {
            return Err(ProcessError::SpawnFailed {
                model: descriptor.model_id.clone(),
                reason: "process exited before its pid could be read".to_string(),
            });
        };

        Self::forward_output(&descriptor.model_id, &mut child);
        self.children.insert(pid, child);

        info!(model = %descriptor.model_id, pid, "Backend process spawned");
        Ok(pid)
    }

    async fn terminate(&self, pid: u32, grace_period: Duration) -> Termination {
        let mut child = self.children.remove(&pid).map(|(_, child)| child);
        if child.is_none() {
            debug!(pid, "Terminating a process without a managed handle");
        }

        info!(pid, grace_ms = grace_period.as_millis(), "Sending SIGTERM to process group");
        signal_group(pid, Signal::Term, child.as_mut());

        if self
            .wait_for_exit(pid, &mut child, Instant::now() + grace_period)
            .await
        {
            info!(pid, "Process group exited gracefully");
            return Termination::Terminated;
        }

        warn!(pid, "Grace period elapsed, sending SIGKILL to process group");
        signal_group(pid, Signal::Kill, child.as_mut());

        if self
            .wait_for_exit(pid, &mut child, Instant::now() + self.kill_timeout)
            .await
        {
            info!(pid, "Process group killed");
            return Termination::Terminated;
        }

        // Keep the handle so a later attempt can still reap it.
        if let Some(child) = child {
            self.children.insert(pid, child);
        }
        warn!(pid, "Process group still present after SIGKILL");
        Termination::TimedOut
    }

    async fn exit_status(&self, pid: u32) -> Option<String> {
        match self.children.get_mut(&pid) {
            Some(mut child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => {
                    warn!(pid, error = %e, "Failed to check process status");
                    None
                }
            },
            None => (!pid_alive(pid)).then(|| "exited".to_string()),
        }
    }

    async fn check_health(&self, descriptor: &ModelDescriptor) -> bool {
        let url = format!(
            "http://127.0.0.1:{}{}",
            descriptor.port, descriptor.health_path
        );
        match probe_health(&url, self.health_timeout).await {
            Ok(healthy) => healthy,
            Err(e) => {
                debug!(model = %descriptor.model_id, error = %e, "Health check failed");
                false
            }
        }
    }
}

/// GET `url`, returning whether the response was a success.
async fn probe_health(url: &str, timeout: Duration) -> Result<bool, String> {
    use http_body_util::Empty;

    let client: hyper_util::client::legacy::Client<_, Empty<bytes::Bytes>> =
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build_http();

    let uri: hyper::Uri = url.parse().map_err(|e| format!("Invalid URL: {}", e))?;

    let request = hyper::Request::builder()
        .method("GET")
        .uri(uri)
        .body(Empty::new())
        .map_err(|e| format!("Failed to build request: {}", e))?;

    match tokio::time::timeout(timeout, client.request(request)).await {
        Ok(Ok(response)) => Ok(response.status().is_success()),
        Ok(Err(e)) => Err(format!("Request failed: {}", e)),
        Err(_) => Err("Health check timeout".to_string()),
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        // Never leave backends behind when the manager goes away
        for mut entry in self.children.iter_mut() {
            let pid = *entry.key();
            signal_group(pid, Signal::Kill, Some(entry.value_mut()));
            let _ = entry.value_mut().start_kill();
        }
    }
}
