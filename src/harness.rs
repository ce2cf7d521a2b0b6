//! Local build harness.
//!
//! Runs the full lifecycle around an arbitrary test command, outside any CI
//! server: resolve configuration from a TOML file, project the environment,
//! bring up the tunnel, execute the command with the projected variables,
//! and correlate sessions from its output afterwards. The harness is the
//! [`BuildHandle`] implementation behind the `run` and `report` CLI
//! subcommands.
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [sauce]
//! username = "my-user"            # or "%teamcity.agent.name%"
//! access_key = "secret"
//! data_center = "eu"
//! browsers = ["chrome", "firefox"]
//! results_disabled = false
//! browsers_file = "platforms.json"  # optional registry override
//!
//! [tunnel]
//! enabled = true
//! options = "-v --shared-tunnel"
//! binary = "sc"
//! timeout_secs = 120
//!
//! [build]
//! type_id = "local"
//! number = "1"
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::warn;

use crate::browsers::StaticBrowserRegistry;
use crate::config::{keys, FeatureParams, ResolvedConfig};
use crate::correlate;
use crate::lifecycle::{BuildHandle, BuildProblem, BuildStatus, LogSink, Orchestrator};
use crate::rest::SauceRest;

/// Top-level harness configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    pub sauce: SauceConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub build: BuildConfig,
}

/// Account and browser selection.
#[derive(Debug, Clone, Deserialize)]
pub struct SauceConfig {
    pub username: String,
    pub access_key: String,
    /// Region name; absent means us-west.
    #[serde(default)]
    pub data_center: Option<String>,
    #[serde(default)]
    pub browsers: Vec<String>,
    #[serde(default)]
    pub results_disabled: bool,
    /// JSON registry file; the built-in desktop set is used when absent.
    #[serde(default)]
    pub browsers_file: Option<PathBuf>,
}

/// Tunnel settings; disabled entirely by default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Raw pass-through options for the tunnel binary.
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub binary: Option<String>,
    /// Prefer the newest PATH-resolved `sc` over a pinned `binary`.
    #[serde(default)]
    pub use_latest: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Identity of the local "build", feeding the build-name key.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_type_id")]
    pub type_id: String,
    #[serde(default = "default_build_number")]
    pub number: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            type_id: default_build_type_id(),
            number: default_build_number(),
        }
    }
}

fn default_build_type_id() -> String {
    "local".to_string()
}

fn default_build_number() -> String {
    "1".to_string()
}

impl HarnessConfig {
    /// Load and parse the TOML config file. `SAUCE_USERNAME` and
    /// `SAUCE_ACCESS_KEY` in the harness's own environment win over the file,
    /// so credentials can stay out of checked-in configs.
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let raw = std::fs::read_to_string(path).map_err(HarnessError::Io)?;
        let mut config: Self = toml::from_str(&raw).map_err(HarnessError::Parse)?;
        if let Ok(username) = std::env::var("SAUCE_USERNAME") {
            config.sauce.username = username;
        }
        if let Ok(access_key) = std::env::var("SAUCE_ACCESS_KEY") {
            config.sauce.access_key = access_key;
        }
        Ok(config)
    }

    /// Flatten into the feature-parameter map the lifecycle hooks consume.
    pub fn feature_params(&self) -> FeatureParams {
        let mut pairs: Vec<(String, String)> = vec![
            (keys::USERNAME.to_string(), self.sauce.username.clone()),
            (keys::ACCESS_KEY.to_string(), self.sauce.access_key.clone()),
            (
                keys::SELECTED_BROWSERS.to_string(),
                self.sauce.browsers.join(","),
            ),
        ];
        if let Some(dc) = &self.sauce.data_center {
            pairs.push((keys::DATA_CENTER.to_string(), dc.clone()));
        }
        if self.sauce.results_disabled {
            pairs.push((keys::RESULTS_DISABLED.to_string(), "true".to_string()));
        }
        if self.tunnel.enabled {
            pairs.push((keys::TUNNEL_ENABLED.to_string(), "true".to_string()));
            pairs.push((keys::TUNNEL_OPTIONS.to_string(), self.tunnel.options.clone()));
            if let Some(binary) = &self.tunnel.binary {
                pairs.push((keys::TUNNEL_BINARY.to_string(), binary.clone()));
            }
            if self.tunnel.use_latest {
                pairs.push((keys::TUNNEL_USE_LATEST.to_string(), "true".to_string()));
            }
            if let Some(secs) = self.tunnel.timeout_secs {
                pairs.push((keys::TUNNEL_TIMEOUT_SECS.to_string(), secs.to_string()));
            }
        }
        pairs.into_iter().collect()
    }

    fn registry(&self) -> Result<StaticBrowserRegistry, HarnessError> {
        match &self.sauce.browsers_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(HarnessError::Io)?;
                StaticBrowserRegistry::from_json(&raw).map_err(HarnessError::Registry)
            }
            None => Ok(StaticBrowserRegistry::with_defaults()),
        }
    }
}

/// Log sink that echoes to stdout and keeps the lines for the finish-time
/// session scan.
struct CliLog {
    lines: Mutex<Vec<String>>,
}

impl CliLog {
    fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
        }
    }
}

impl LogSink for CliLog {
    fn line(&self, line: &str) {
        println!("{line}");
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// [`BuildHandle`] over one local harness run.
struct CliBuild {
    config: HarnessConfig,
    status: Mutex<BuildStatus>,
    env: Mutex<Vec<(String, String)>>,
    log: Arc<CliLog>,
}

impl CliBuild {
    fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            status: Mutex::new(BuildStatus::Unknown),
            env: Mutex::new(Vec::new()),
            log: Arc::new(CliLog::new()),
        }
    }

    fn set_status(&self, status: BuildStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }

    fn env_overlay(&self) -> Vec<(String, String)> {
        self.env.lock().map(|env| env.clone()).unwrap_or_default()
    }
}

impl BuildHandle for CliBuild {
    fn agent_name(&self) -> Option<String> {
        std::env::var("HOSTNAME").ok().or_else(|| Some("local".to_string()))
    }

    fn build_number(&self) -> String {
        self.config.build.number.clone()
    }

    fn build_type_external_id(&self) -> String {
        self.config.build.type_id.clone()
    }

    fn status(&self) -> BuildStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(BuildStatus::Unknown)
    }

    fn features(&self) -> Vec<FeatureParams> {
        vec![self.config.feature_params()]
    }

    fn publish_env(&self, name: &str, value: &str) {
        if let Ok(mut env) = self.env.lock() {
            env.push((name.to_string(), value.to_string()));
        }
    }

    fn log_sink(&self) -> Arc<dyn LogSink> {
        self.log.clone()
    }

    fn report_problem(&self, problem: BuildProblem) {
        warn!(
            category = %problem.category,
            identifier = %problem.identifier,
            "{}", problem.message
        );
    }

    fn log_lines(&self) -> Vec<String> {
        self.log
            .lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

/// Run the full lifecycle around `command`, returning its exit code.
pub async fn run_build(config: HarnessConfig, command: &[String]) -> Result<i32, HarnessError> {
    let (program, args) = command.split_first().ok_or(HarnessError::MissingCommand)?;
    let registry = Arc::new(config.registry()?);
    let build = CliBuild::new(config);
    let orchestrator = Orchestrator::new(registry);

    orchestrator.on_build_started(&build).await;

    let exit_code = match spawn_test_command(program, args, &build).await {
        Ok(code) => {
            build.set_status(if code == 0 {
                BuildStatus::Success
            } else {
                BuildStatus::Failure
            });
            code
        }
        Err(e) => {
            build.set_status(BuildStatus::Failure);
            build
                .log_sink()
                .line(&format!("Failed to run test command: {e}"));
            // Tunnels still need closing before we bail.
            orchestrator.on_before_build_finish(&build).await;
            return Err(HarnessError::Io(e));
        }
    };

    orchestrator.on_before_build_finish(&build).await;
    orchestrator.on_build_finished(&build).await;
    Ok(exit_code)
}

/// Spawn the test command with the projected environment applied on top of
/// the harness's own, piping its output into the build log.
async fn spawn_test_command(
    program: &str,
    args: &[String],
    build: &CliBuild,
) -> Result<i32, std::io::Error> {
    let mut child = Command::new(program)
        .args(args)
        .envs(build.env_overlay())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_pump = pump_lines(stdout, build.log.clone());
    let err_pump = pump_lines(stderr, build.log.clone());

    let status = child.wait().await?;
    out_pump.await.ok();
    err_pump.await.ok();

    Ok(status.code().unwrap_or(-1))
}

fn pump_lines<R>(reader: Option<R>, sink: Arc<CliLog>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else { return };
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.line(&line);
        }
    })
}

/// Fetch and print the job report for the configured build name. Gated by
/// the resolved `results_disabled` setting.
pub async fn print_report(config: &HarnessConfig) -> Result<(), HarnessError> {
    let params = config.feature_params();
    let resolved =
        ResolvedConfig::resolve(&params, None).map_err(|e| HarnessError::Config(e.to_string()))?;
    let build_name = correlate::build_name(&config.build.type_id, &config.build.number);
    let api = SauceRest::new(&resolved.credentials);
    let jobs =
        correlate::job_report_for_build(&api, &resolved, &build_name, Some(&config.build.number))
            .await;

    if jobs.is_empty() {
        if resolved.results_disabled {
            println!("Results display is disabled by configuration");
        } else {
            println!("No jobs found for build {build_name}");
        }
        return Ok(());
    }
    for job in jobs {
        let verdict = match job.passed {
            Some(true) => "passed",
            Some(false) => "failed",
            None => "unknown",
        };
        println!(
            "{}  {}  {} on {}  {}",
            job.job_id,
            verdict,
            job.browser.as_deref().unwrap_or("?"),
            job.os.as_deref().unwrap_or("?"),
            job.embed_url()
        );
    }
    Ok(())
}

/// Harness-level failure. Unlike the lifecycle hooks, these are fatal: the
/// CLI cannot proceed without a config or a runnable command.
#[derive(Debug)]
pub enum HarnessError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Registry(serde_json::Error),
    Config(String),
    MissingCommand,
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Io(e) => write!(f, "I/O error: {e}"),
            HarnessError::Parse(e) => write!(f, "Invalid config file: {e}"),
            HarnessError::Registry(e) => write!(f, "Invalid browsers file: {e}"),
            HarnessError::Config(msg) => write!(f, "Incomplete configuration: {msg}"),
            HarnessError::MissingCommand => write!(f, "No test command given"),
        }
    }
}

impl std::error::Error for HarnessError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::vars;

    fn minimal_config() -> HarnessConfig {
        toml::from_str(
            r#"
            [sauce]
            username = "u"
            access_key = "k"
            browsers = ["chrome"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = minimal_config();
        assert_eq!(config.build.type_id, "local");
        assert_eq!(config.build.number, "1");
        assert!(!config.tunnel.enabled);
        assert!(!config.sauce.results_disabled);
    }

    #[test]
    fn test_feature_params_flatten() {
        let config: HarnessConfig = toml::from_str(
            r#"
            [sauce]
            username = "u"
            access_key = "k"
            data_center = "eu"
            browsers = ["chrome", "firefox"]

            [tunnel]
            enabled = true
            options = "-v"
            timeout_secs = 60
            "#,
        )
        .unwrap();
        let params = config.feature_params();
        assert_eq!(params.get(keys::USERNAME), Some("u"));
        assert_eq!(params.get(keys::DATA_CENTER), Some("eu"));
        assert_eq!(params.get(keys::SELECTED_BROWSERS), Some("chrome,firefox"));
        assert!(params.get_bool(keys::TUNNEL_ENABLED));
        assert_eq!(params.get(keys::TUNNEL_TIMEOUT_SECS), Some("60"));
    }

    #[test]
    fn test_use_latest_flattens_into_params() {
        let config: HarnessConfig = toml::from_str(
            r#"
            [sauce]
            username = "u"
            access_key = "k"

            [tunnel]
            enabled = true
            use_latest = true
            "#,
        )
        .unwrap();
        assert!(config.feature_params().get_bool(keys::TUNNEL_USE_LATEST));
    }

    #[tokio::test]
    async fn test_print_report_gated_when_results_disabled() {
        let config: HarnessConfig = toml::from_str(
            r#"
            [sauce]
            username = "u"
            access_key = "k"
            results_disabled = true
            "#,
        )
        .unwrap();
        print_report(&config).await.unwrap();
    }

    #[test]
    fn test_tunnel_params_absent_when_disabled() {
        let params = minimal_config().feature_params();
        assert!(!params.get_bool(keys::TUNNEL_ENABLED));
        assert!(params.get(keys::TUNNEL_OPTIONS).is_none());
    }

    #[tokio::test]
    async fn test_run_build_propagates_exit_code_and_env() {
        let config = minimal_config();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("test -n \"${}\" && exit 7", vars::SAUCE_USERNAME),
        ];
        let code = run_build(config, &command).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_run_build_maps_failure_exit_code() {
        let config = minimal_config();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo running tests >&2; exit 1".to_string(),
        ];
        let code = run_build(config, &command).await.unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_run_build_without_command_fails() {
        let err = run_build(minimal_config(), &[]).await.unwrap_err();
        assert!(matches!(err, HarnessError::MissingCommand));
    }
}
