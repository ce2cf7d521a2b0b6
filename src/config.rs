//! Feature-parameter resolution.
//!
//! A build feature arrives as a flat `key → value` string map configured in
//! the CI UI. This module resolves that map, plus the executing agent's name,
//! into an immutable [`ResolvedConfig`] that every downstream component
//! consumes — nothing else in the crate reads raw parameter strings.
//!
//! Resolution rules:
//!
//! 1. **Username** — the literal placeholder [`AGENT_NAME_PLACEHOLDER`] is
//!    substituted with the agent's name; any other value passes through.
//! 2. **Data center** — case-insensitive, `-`/`_` interchangeable, with the
//!    short aliases `US` → us-west and `EU` → eu-central. Unknown values fall
//!    back to us-west; resolution never fails.
//! 3. **Host/port** — when absent or empty, defaults depend on whether the
//!    tunnel is enabled: `localhost:4445` through the tunnel,
//!    `ondemand.saucelabs.com:80` direct.
//! 4. **Tunnel name** — taken from a name flag inside the raw option string
//!    if the user supplied one, otherwise derived as
//!    `teamcity-<agent-name-with-whitespace-stripped>`. The derivation is
//!    deterministic so the close phase targets the tunnel the start phase
//!    created.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Build-feature type string under which the host files our parameters.
pub const FEATURE_TYPE: &str = "sauce";

/// Placeholder username that resolves to the executing agent's name.
pub const AGENT_NAME_PLACEHOLDER: &str = "%teamcity.agent.name%";

/// Default Sauce Connect startup timeout (seconds).
const DEFAULT_TUNNEL_TIMEOUT_SECS: u64 = 120;

/// Feature-parameter keys as configured in the build feature UI.
pub mod keys {
    pub const USERNAME: &str = "sauce.user.id";
    pub const ACCESS_KEY: &str = "sauce.access.key";
    pub const DATA_CENTER: &str = "sauce.data.center";
    pub const TUNNEL_ENABLED: &str = "sauce.connect";
    pub const TUNNEL_OPTIONS: &str = "sauce.connect.options";
    pub const TUNNEL_BINARY: &str = "sauce.connect.binary";
    pub const TUNNEL_USE_LATEST: &str = "sauce.connect.use.latest";
    pub const TUNNEL_TIMEOUT_SECS: &str = "sauce.connect.timeout";
    pub const RESULTS_DISABLED: &str = "sauce.results.disabled";
    pub const SELENIUM_HOST: &str = "selenium.host";
    pub const SELENIUM_PORT: &str = "selenium.port";
    pub const SELECTED_BROWSERS: &str = "selenium.selected.browsers";
    pub const WEBDRIVER_BROWSERS: &str = "selenium.webdriver.browsers";
    pub const STARTING_URL: &str = "selenium.starting.url";
    pub const MAX_DURATION: &str = "selenium.max.duration";
    pub const IDLE_TIMEOUT: &str = "selenium.idle.timeout";
}

/// One build feature's raw parameter map.
///
/// Thin wrapper so call sites read `params.get(keys::USERNAME)` instead of
/// poking a bare map, and so empty strings are uniformly treated as absent.
#[derive(Debug, Clone, Default)]
pub struct FeatureParams {
    values: BTreeMap<String, String>,
}

impl FeatureParams {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    /// Parameter value, with empty/whitespace-only values treated as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// `true` only for the literal string `"true"`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FeatureParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A Sauce Labs deployment zone. Affects the REST endpoint, the report URL,
/// and the tunnel's `--region` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCenter {
    UsWest,
    UsEast,
    EuCentral,
}

impl DataCenter {
    /// Resolve a user-supplied region string. Total: unknown or absent values
    /// fall back to [`DataCenter::UsWest`] rather than failing.
    pub fn resolve(value: Option<&str>) -> Self {
        let Some(raw) = value else {
            return Self::UsWest;
        };
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .replace('_', "-");
        match normalized.as_str() {
            "us" | "us-west" | "us-west-1" => Self::UsWest,
            "us-east" | "us-east-4" => Self::UsEast,
            "eu" | "eu-central" | "eu-central-1" => Self::EuCentral,
            _ => Self::UsWest,
        }
    }

    /// Canonical lower-case name, also used as the tunnel `--region` value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UsWest => "us-west",
            Self::UsEast => "us-east",
            Self::EuCentral => "eu-central",
        }
    }

    /// Base URL of the REST API for this data center.
    pub fn api_base_url(self) -> &'static str {
        match self {
            Self::UsWest => "https://api.us-west-1.saucelabs.com",
            Self::UsEast => "https://api.us-east-4.saucelabs.com",
            Self::EuCentral => "https://api.eu-central-1.saucelabs.com",
        }
    }

    /// Base URL of the web app, used for embedded job reports.
    pub fn app_base_url(self) -> &'static str {
        match self {
            Self::UsWest | Self::UsEast => "https://app.saucelabs.com",
            Self::EuCentral => "https://app.eu-central-1.saucelabs.com",
        }
    }
}

/// Remote-service credentials plus the data center they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub access_key: String,
    pub data_center: DataCenter,
}

/// Everything needed to start (and later target for close) one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Raw pass-through option string from the feature parameters.
    pub raw_options: String,
    /// Tunnel name — user-supplied via a name flag in `raw_options`, or the
    /// deterministic `teamcity-<agent>` default.
    pub tunnel_name: String,
    /// Region flag value, present only when the feature set one explicitly.
    pub region: Option<DataCenter>,
    /// Tunnel binary to launch (default `sc`).
    pub binary: String,
    /// Prefer the latest tunnel binary release where the launcher supports it.
    pub use_latest: bool,
    /// Bound on the wait for the readiness signal.
    pub startup_timeout: Duration,
}

impl TunnelOptions {
    /// Binary to launch. `use_latest` wins over a pinned binary override:
    /// the plain `sc` resolves through the PATH, so the newest installed
    /// release is picked up without editing the feature.
    pub fn launch_binary(&self) -> &str {
        if self.use_latest {
            "sc"
        } else {
            &self.binary
        }
    }

    /// Full CLI argument string: region flag (if any), then the tunnel-name
    /// flag unless the raw options already carry one, then the raw options.
    pub fn command_line(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(region) = self.region {
            parts.push(format!("--region {}", region.as_str()));
        }
        if extract_tunnel_name(&self.raw_options).is_none() {
            parts.push(format!("--tunnel-name {}", self.tunnel_name));
        }
        let raw = self.raw_options.trim();
        if !raw.is_empty() {
            parts.push(raw.to_string());
        }
        parts.join(" ")
    }
}

/// Typed configuration produced once per (build, feature) and passed by
/// reference to every downstream component.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub credentials: Credentials,
    /// Ordered browser keys; empty is valid (no driver injection).
    pub browsers: Vec<String>,
    pub tunnel_enabled: bool,
    pub tunnel: TunnelOptions,
    pub selenium_host: String,
    pub selenium_port: String,
    pub starting_url: Option<String>,
    pub max_duration: Option<String>,
    pub idle_timeout: Option<String>,
    /// Suppresses the results display path when set.
    pub results_disabled: bool,
}

impl ResolvedConfig {
    /// Resolve a feature-parameter map against the executing agent's name.
    pub fn resolve(params: &FeatureParams, agent_name: Option<&str>) -> Result<Self, ConfigError> {
        let credentials = resolve_credentials(params, agent_name)?;
        let tunnel_enabled = params.get_bool(keys::TUNNEL_ENABLED);
        let agent = agent_name.unwrap_or("");
        let tunnel = derive_tunnel_options(params, agent);

        let (default_host, default_port) = if tunnel_enabled {
            ("localhost", "4445")
        } else {
            ("ondemand.saucelabs.com", "80")
        };

        Ok(Self {
            credentials,
            browsers: selected_browsers(params),
            tunnel_enabled,
            tunnel,
            selenium_host: params
                .get(keys::SELENIUM_HOST)
                .unwrap_or(default_host)
                .to_string(),
            selenium_port: params
                .get(keys::SELENIUM_PORT)
                .unwrap_or(default_port)
                .to_string(),
            starting_url: params.get(keys::STARTING_URL).map(str::to_string),
            max_duration: params.get(keys::MAX_DURATION).map(str::to_string),
            idle_timeout: params.get(keys::IDLE_TIMEOUT).map(str::to_string),
            results_disabled: params.get_bool(keys::RESULTS_DISABLED),
        })
    }
}

/// Resolve username, access key and data center from the parameter map.
pub fn resolve_credentials(
    params: &FeatureParams,
    agent_name: Option<&str>,
) -> Result<Credentials, ConfigError> {
    let raw_username = params
        .get(keys::USERNAME)
        .ok_or(ConfigError::MissingField(keys::USERNAME))?;
    let username = match (raw_username, agent_name) {
        (AGENT_NAME_PLACEHOLDER, Some(agent)) => agent.to_string(),
        _ => raw_username.to_string(),
    };
    let access_key = params
        .get(keys::ACCESS_KEY)
        .ok_or(ConfigError::MissingField(keys::ACCESS_KEY))?
        .to_string();
    let data_center = DataCenter::resolve(params.get(keys::DATA_CENTER));
    Ok(Credentials {
        username,
        access_key,
        data_center,
    })
}

/// Derive the tunnel options for one (build, feature) pair.
///
/// Deterministic over its inputs: the start and close phases call this with
/// the same parameters and must obtain the same tunnel name.
pub fn derive_tunnel_options(params: &FeatureParams, agent_name: &str) -> TunnelOptions {
    let raw_options = params.get(keys::TUNNEL_OPTIONS).unwrap_or("").to_string();
    let tunnel_name = match extract_tunnel_name(&raw_options) {
        Some(name) => name.to_string(),
        None => default_tunnel_name(agent_name),
    };
    let region = params
        .get(keys::DATA_CENTER)
        .map(|value| DataCenter::resolve(Some(value)));
    let startup_timeout = params
        .get(keys::TUNNEL_TIMEOUT_SECS)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(
            Duration::from_secs(DEFAULT_TUNNEL_TIMEOUT_SECS),
            Duration::from_secs,
        );
    TunnelOptions {
        raw_options,
        tunnel_name,
        region,
        binary: params.get(keys::TUNNEL_BINARY).unwrap_or("sc").to_string(),
        use_latest: params.get_bool(keys::TUNNEL_USE_LATEST),
        startup_timeout,
    }
}

/// Default tunnel name: `teamcity-<agent-name-with-whitespace-stripped>`.
pub fn default_tunnel_name(agent_name: &str) -> String {
    let stripped: String = agent_name.chars().filter(|c| !c.is_whitespace()).collect();
    format!("teamcity-{stripped}")
}

/// Extract a user-supplied tunnel name from a raw option string, honoring
/// the name flags the tunnel binary understands.
pub fn extract_tunnel_name(options: &str) -> Option<&str> {
    let mut tokens = options.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if matches!(token, "-i" | "--tunnel-identifier" | "--tunnel-name") {
            return tokens.peek().copied();
        }
    }
    None
}

/// Ordered browser selection: primary parameter first, fallback parameter if
/// the primary is absent. Empty selections are valid, not an error.
pub fn selected_browsers(params: &FeatureParams) -> Vec<String> {
    let raw = params
        .get(keys::SELECTED_BROWSERS)
        .or_else(|| params.get(keys::WEBDRIVER_BROWSERS))
        .unwrap_or("");
    raw.split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect()
}

/// Malformed or missing feature parameter. Callers log a warning and either
/// fall back to a default or skip the dependent step — never fail the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required parameter is absent (or blank) in the feature map.
    MissingField(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingField(key) => write!(f, "Missing feature parameter: {key}"),
        }
    }
}

impl std::error::Error for ConfigError {}
