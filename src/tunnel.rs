//! Tunnel subprocess supervision.
//!
//! One tunnel per (build, feature) pair, keyed by its deterministic tunnel
//! name: `Idle → Starting → Running → Closing → Idle`. The start phase
//! launches the tunnel binary, forwards its output line-by-line into the
//! build log (agent processes have no conventional stdout surface), and
//! blocks until the readiness line appears or the startup timeout elapses.
//! The close phase targets the same name, delivers SIGINT first so the
//! binary can deregister its tunnel server-side, and escalates to SIGKILL
//! after a grace period.
//!
//! A startup failure is converted into a structured build problem by the
//! caller; it never aborts the build.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Credentials, TunnelOptions};
use crate::lifecycle::LogSink;

/// Line the tunnel binary prints once the tunnel is established.
pub const READY_MARKER: &str = "Sauce Connect is up";

/// Build-problem category for tunnel startup failures.
pub const PROBLEM_CATEGORY: &str = "SAUCE_CONNECT";

/// Build-problem identifier for tunnel startup failures.
pub const PROBLEM_IDENTIFIER: &str = "FAILED_TO_START_SAUCE_CONNECT";

/// Grace period between SIGINT and SIGKILL at close.
const CLOSE_GRACE: Duration = Duration::from_secs(30);

/// Supervision state of one named tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Starting,
    Running,
    Closing,
}

enum TunnelEntry {
    Starting,
    Running(ActiveTunnel),
    Closing,
}

struct ActiveTunnel {
    child: Child,
    pump: JoinHandle<()>,
}

/// Supervises tunnel subprocesses, keyed by tunnel name.
#[derive(Default)]
pub struct TunnelSupervisor {
    tunnels: Mutex<HashMap<String, TunnelEntry>>,
}

impl TunnelSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for a tunnel name. [`TunnelState::Idle`] when unknown.
    pub async fn state(&self, tunnel_name: &str) -> TunnelState {
        match self.tunnels.lock().await.get(tunnel_name) {
            None => TunnelState::Idle,
            Some(TunnelEntry::Starting) => TunnelState::Starting,
            Some(TunnelEntry::Running(_)) => TunnelState::Running,
            Some(TunnelEntry::Closing) => TunnelState::Closing,
        }
    }

    /// Launch the tunnel and block until it signals readiness or the startup
    /// timeout elapses. Credentials are passed through the environment, not
    /// argv, so the access key never shows up in a process listing.
    pub async fn start(
        &self,
        credentials: &Credentials,
        options: &TunnelOptions,
        sink: Arc<dyn LogSink>,
    ) -> Result<(), TunnelStartError> {
        let name = options.tunnel_name.clone();
        {
            let mut tunnels = self.tunnels.lock().await;
            if tunnels.contains_key(&name) {
                warn!(tunnel = %name, "Tunnel already active, skipping start");
                return Ok(());
            }
            tunnels.insert(name.clone(), TunnelEntry::Starting);
        }

        let result = self
            .launch_and_wait_ready(credentials, options, Arc::clone(&sink))
            .await;

        let mut tunnels = self.tunnels.lock().await;
        match result {
            Ok(active) => {
                info!(tunnel = %name, "Tunnel is up");
                tunnels.insert(name, TunnelEntry::Running(active));
                Ok(())
            }
            Err(err) => {
                tunnels.remove(&name);
                Err(err)
            }
        }
    }

    async fn launch_and_wait_ready(
        &self,
        credentials: &Credentials,
        options: &TunnelOptions,
        sink: Arc<dyn LogSink>,
    ) -> Result<ActiveTunnel, TunnelStartError> {
        let args = options.command_line_args();
        let binary = options.launch_binary();
        info!(binary = %binary, tunnel = %options.tunnel_name, "Starting tunnel");
        sink.line(&format!(
            "Starting Sauce Connect: {} {}",
            binary,
            args.join(" ")
        ));

        let mut child = Command::new(binary)
            .args(&args)
            .env("SAUCE_USERNAME", &credentials.username)
            .env("SAUCE_ACCESS_KEY", &credentials.access_key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TunnelStartError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TunnelStartError::Exited("stdout pipe unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TunnelStartError::Exited("stderr pipe unavailable".to_string()))?;

        // Stderr goes to the build log for the whole tunnel lifetime.
        let stderr_sink = Arc::clone(&sink);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_sink.line(&line);
            }
        });

        let mut stdout_lines = BufReader::new(stdout).lines();
        let ready_sink = Arc::clone(&sink);
        let readiness = async {
            loop {
                match stdout_lines.next_line().await {
                    Ok(Some(line)) => {
                        ready_sink.line(&line);
                        if line.contains(READY_MARKER) {
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        // EOF before readiness: the process is gone.
                        let status = child
                            .wait()
                            .await
                            .map(|s| s.to_string())
                            .unwrap_or_else(|e| e.to_string());
                        return Err(TunnelStartError::Exited(status));
                    }
                    Err(e) => return Err(TunnelStartError::Exited(e.to_string())),
                }
            }
        };

        match tokio::time::timeout(options.startup_timeout, readiness).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                let _ = child.kill().await;
                return Err(TunnelStartError::Timeout(options.startup_timeout));
            }
        }

        // Keep forwarding the remaining output in the background.
        let pump_sink = Arc::clone(&sink);
        let pump = tokio::spawn(async move {
            while let Ok(Some(line)) = stdout_lines.next_line().await {
                pump_sink.line(&line);
            }
        });

        Ok(ActiveTunnel { child, pump })
    }

    /// Close the tunnel whose name matches the (deterministically re-derived)
    /// options. A no-op when no such tunnel is active.
    pub async fn stop(&self, options: &TunnelOptions, sink: Arc<dyn LogSink>) {
        let name = &options.tunnel_name;
        let entry = {
            let mut tunnels = self.tunnels.lock().await;
            match tunnels.remove(name) {
                Some(TunnelEntry::Running(active)) => {
                    tunnels.insert(name.clone(), TunnelEntry::Closing);
                    Some(active)
                }
                Some(other) => {
                    // Starting/Closing entries have no child to reap here.
                    tunnels.insert(name.clone(), other);
                    None
                }
                None => None,
            }
        };

        let Some(mut active) = entry else {
            info!(tunnel = %name, "No active tunnel to close");
            return;
        };

        sink.line(&format!("Closing Sauce Connect tunnel {name}"));
        if let Some(pid) = active.child.id() {
            // SIGINT lets the binary deregister the tunnel server-side.
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
        match tokio::time::timeout(CLOSE_GRACE, active.child.wait()).await {
            Ok(Ok(status)) => info!(tunnel = %name, %status, "Tunnel closed"),
            Ok(Err(e)) => warn!(tunnel = %name, error = %e, "Tunnel wait failed"),
            Err(_) => {
                warn!(tunnel = %name, "Tunnel ignored SIGINT, killing");
                let _ = active.child.kill().await;
            }
        }
        // Give the pump a moment to drain the final lines.
        let _ = tokio::time::timeout(Duration::from_secs(5), active.pump).await;

        self.tunnels.lock().await.remove(name);
    }
}

impl TunnelOptions {
    /// [`TunnelOptions::command_line`] split for `Command::args`.
    fn command_line_args(&self) -> Vec<String> {
        self.command_line()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// Tunnel launch/readiness failure. Reported as a non-fatal build problem.
#[derive(Debug)]
pub enum TunnelStartError {
    /// The tunnel binary could not be started.
    Spawn(std::io::Error),
    /// The process exited before signaling readiness.
    Exited(String),
    /// No readiness signal within the startup timeout.
    Timeout(Duration),
}

impl fmt::Display for TunnelStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStartError::Spawn(e) => write!(f, "Failed to launch tunnel binary: {e}"),
            TunnelStartError::Exited(status) => {
                write!(f, "Tunnel process exited before readiness: {status}")
            }
            TunnelStartError::Timeout(timeout) => write!(
                f,
                "Tunnel did not signal readiness within {}s",
                timeout.as_secs()
            ),
        }
    }
}

impl std::error::Error for TunnelStartError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataCenter;
    use std::sync::Mutex as StdMutex;

    struct CollectSink(StdMutex<Vec<String>>);

    impl LogSink for CollectSink {
        fn line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "u".to_string(),
            access_key: "k".to_string(),
            data_center: DataCenter::UsWest,
        }
    }

    fn options(binary: &str, raw: &str, timeout: Duration) -> TunnelOptions {
        TunnelOptions {
            raw_options: raw.to_string(),
            tunnel_name: "teamcity-test".to_string(),
            region: None,
            binary: binary.to_string(),
            use_latest: false,
            startup_timeout: timeout,
        }
    }

    #[tokio::test]
    async fn test_start_succeeds_on_readiness_line() {
        let supervisor = TunnelSupervisor::new();
        let sink = Arc::new(CollectSink(StdMutex::new(Vec::new())));
        // echo prints its arguments, which include the readiness marker.
        let opts = options(
            "echo",
            "Sauce Connect is up, you may start your tests.",
            Duration::from_secs(10),
        );
        supervisor
            .start(&credentials(), &opts, sink.clone())
            .await
            .unwrap();
        assert_eq!(supervisor.state("teamcity-test").await, TunnelState::Running);

        supervisor.stop(&opts, sink.clone()).await;
        assert_eq!(supervisor.state("teamcity-test").await, TunnelState::Idle);

        let lines = sink.0.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains(READY_MARKER)));
    }

    #[tokio::test]
    async fn test_start_fails_when_process_exits_silently() {
        let supervisor = TunnelSupervisor::new();
        let sink = Arc::new(CollectSink(StdMutex::new(Vec::new())));
        let opts = options("true", "", Duration::from_secs(10));
        let err = supervisor
            .start(&credentials(), &opts, sink)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelStartError::Exited(_)));
        assert_eq!(supervisor.state("teamcity-test").await, TunnelState::Idle);
    }

    #[tokio::test]
    async fn test_start_times_out_without_readiness() {
        let supervisor = TunnelSupervisor::new();
        let sink = Arc::new(CollectSink(StdMutex::new(Vec::new())));
        let opts = options("sleep", "30", Duration::from_millis(200));
        let err = supervisor
            .start(&credentials(), &opts, sink)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelStartError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_binary() {
        let supervisor = TunnelSupervisor::new();
        let sink = Arc::new(CollectSink(StdMutex::new(Vec::new())));
        let opts = options(
            "definitely-not-a-tunnel-binary",
            "",
            Duration::from_secs(1),
        );
        let err = supervisor
            .start(&credentials(), &opts, sink)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelStartError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let supervisor = TunnelSupervisor::new();
        let sink = Arc::new(CollectSink(StdMutex::new(Vec::new())));
        let opts = options("echo", "", Duration::from_secs(1));
        supervisor.stop(&opts, sink).await;
        assert_eq!(supervisor.state("teamcity-test").await, TunnelState::Idle);
    }
}
