//! Build lifecycle orchestration.
//!
//! The host CI server drives three hooks, in order: build started, before
//! build finish, build finished. [`Orchestrator`] implements them over an
//! abstract [`BuildHandle`] so the same logic serves the agent integration
//! and the local harness. Per feature instance the hooks resolve
//! configuration, project the environment, supervise the tunnel, and run
//! session correlation.
//!
//! Nothing in here fails the build. Configuration and tunnel problems are
//! logged or reported as structured build problems and the remaining
//! features keep processing.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::browsers::BrowserRegistry;
use crate::config::{
    derive_tunnel_options, resolve_credentials, FeatureParams, ResolvedConfig,
};
use crate::correlate;
use crate::env;
use crate::rest::SauceRest;
use crate::tunnel::{self, TunnelStartError, TunnelSupervisor};

/// Receives build log lines. Implementations must be cheap and non-blocking;
/// tunnel output is forwarded through this from background tasks.
pub trait LogSink: Send + Sync {
    fn line(&self, line: &str);
}

/// Terminal verdict of a CI build as seen at the finish hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Failure,
    /// Interrupted, still running, or otherwise undecided.
    Unknown,
}

impl BuildStatus {
    /// Pass/fail to record on remote jobs. `None` for non-terminal statuses,
    /// which omits the field so a later verdict is not pre-empted.
    pub fn passed_flag(self) -> Option<bool> {
        match self {
            BuildStatus::Success => Some(true),
            BuildStatus::Failure => Some(false),
            BuildStatus::Unknown => None,
        }
    }
}

/// A structured, non-fatal problem surfaced on the build report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildProblem {
    pub category: String,
    pub identifier: String,
    pub message: String,
}

impl BuildProblem {
    /// Problem describing a failed tunnel startup.
    pub fn tunnel_start(err: &TunnelStartError) -> Self {
        Self {
            category: tunnel::PROBLEM_CATEGORY.to_string(),
            identifier: tunnel::PROBLEM_IDENTIFIER.to_string(),
            message: format!("Failed to start sauce connect: {err}"),
        }
    }
}

/// One running build as seen by the lifecycle hooks. Object-safe so the
/// orchestrator can hold `&dyn BuildHandle` from any host.
pub trait BuildHandle: Send + Sync {
    /// Name of the agent executing the build, when known.
    fn agent_name(&self) -> Option<String>;
    /// The build's counter, e.g. `"17"`.
    fn build_number(&self) -> String;
    /// External id of the build configuration, e.g. `"bt42"`.
    fn build_type_external_id(&self) -> String;
    /// Verdict at the time of the call.
    fn status(&self) -> BuildStatus;
    /// Parameter maps of every feature instance attached to this build.
    fn features(&self) -> Vec<FeatureParams>;
    /// Publish one environment variable into the build's shared environment.
    fn publish_env(&self, name: &str, value: &str);
    /// Sink for tunnel and orchestrator output into the build log.
    fn log_sink(&self) -> Arc<dyn LogSink>;
    /// Surface a structured problem on the build report.
    fn report_problem(&self, problem: BuildProblem);
    /// Full build log so far, one entry per line.
    fn log_lines(&self) -> Vec<String>;
}

/// Drives the lifecycle hooks for every feature instance of a build.
pub struct Orchestrator {
    registry: Arc<dyn BrowserRegistry>,
    tunnels: TunnelSupervisor,
}

impl Orchestrator {
    pub fn new(registry: Arc<dyn BrowserRegistry>) -> Self {
        Self {
            registry,
            tunnels: TunnelSupervisor::new(),
        }
    }

    /// Build-started hook: project the environment and bring up tunnels.
    pub async fn on_build_started(&self, build: &dyn BuildHandle) {
        let agent_name = build.agent_name();
        let build_name = self.build_name(build);

        for params in build.features() {
            let config = match ResolvedConfig::resolve(&params, agent_name.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "Skipping feature with incomplete configuration");
                    continue;
                }
            };

            let sink = build.log_sink();
            for (name, value) in
                env::projected_environment(&config, self.registry.as_ref(), &build_name)
            {
                // Names only, in both logs; the access key is among the values.
                info!(variable = %name, "Publishing environment variable");
                sink.line(&format!("Publishing environment variable {name}"));
                build.publish_env(&name, &value);
            }

            if config.tunnel_enabled {
                if let Err(e) = self
                    .tunnels
                    .start(&config.credentials, &config.tunnel, Arc::clone(&sink))
                    .await
                {
                    error!(error = %e, "Tunnel startup failed");
                    sink.line(&format!("Failed to start sauce connect: {e}"));
                    build.report_problem(BuildProblem::tunnel_start(&e));
                }
            }
        }
    }

    /// Before-finish hook: close tunnels while the build is still attributable.
    pub async fn on_before_build_finish(&self, build: &dyn BuildHandle) {
        let agent = build.agent_name().unwrap_or_default();
        for params in build.features() {
            if !params.get_bool(crate::config::keys::TUNNEL_ENABLED) {
                continue;
            }
            // Re-derived deterministically, so this targets the tunnel the
            // started hook created.
            let options = derive_tunnel_options(&params, &agent);
            self.tunnels.stop(&options, build.log_sink()).await;
        }
    }

    /// Build-finished hook: scan the log for session ids and correlate them
    /// with remote jobs.
    pub async fn on_build_finished(&self, build: &dyn BuildHandle) {
        let sessions = correlate::scan_sessions(build.log_lines());
        if sessions.is_empty() {
            info!("No remote sessions found in build log");
            return;
        }

        let agent_name = build.agent_name();
        let build_name = self.build_name(build);
        let build_number = build.build_number();
        let passed = build.status().passed_flag();

        for params in build.features() {
            let credentials = match resolve_credentials(&params, agent_name.as_deref()) {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!(error = %e, "Skipping feature with incomplete configuration");
                    continue;
                }
            };
            let api = SauceRest::new(&credentials);
            let summary = correlate::correlate_sessions(
                &api,
                &credentials,
                &build_name,
                Some(&build_number),
                passed,
                &sessions,
            )
            .await;
            info!(
                sessions = summary.sessions,
                updated = summary.updated_jobs,
                failures = summary.failures,
                "Session correlation finished"
            );
        }
    }

    /// Build-name key shared by the environment projection and correlation.
    fn build_name(&self, build: &dyn BuildHandle) -> String {
        correlate::build_name(&build.build_type_external_id(), &build.build_number())
    }
}
