//! Environment projection.
//!
//! Derives the full set of environment variables a build's test process
//! needs: credentials (canonical and legacy-alias names), endpoint host and
//! port, a single-browser fast path with a driver URI, and a multi-browser
//! JSON descriptor. The projection is a pure function over the resolved
//! configuration and the browser registry; publishing (and the info-level
//! logging of each variable name) happens at the build-handle boundary.
//!
//! A variable with no computed value is simply not emitted — absence is
//! silent, never an error.

use serde_json::json;
use tracing::info;

use crate::browsers::BrowserRegistry;
use crate::config::ResolvedConfig;

/// Environment variable names published into the build.
pub mod vars {
    pub const SELENIUM_BROWSER: &str = "SELENIUM_BROWSER";
    pub const SELENIUM_VERSION: &str = "SELENIUM_VERSION";
    pub const SELENIUM_PLATFORM: &str = "SELENIUM_PLATFORM";
    pub const SELENIUM_DRIVER: &str = "SELENIUM_DRIVER";
    pub const SELENIUM_DEVICE: &str = "SELENIUM_DEVICE";
    pub const SELENIUM_DEVICE_TYPE: &str = "SELENIUM_DEVICE_TYPE";
    pub const SELENIUM_DEVICE_ORIENTATION: &str = "SELENIUM_DEVICE_ORIENTATION";
    pub const SELENIUM_HOST: &str = "SELENIUM_HOST";
    pub const SELENIUM_PORT: &str = "SELENIUM_PORT";
    pub const SELENIUM_STARTING_URL: &str = "SELENIUM_STARTING_URL";
    pub const SELENIUM_MAX_DURATION: &str = "SELENIUM_MAX_DURATION";
    pub const SELENIUM_IDLE_TIMEOUT: &str = "SELENIUM_IDLE_TIMEOUT";
    /// Canonical credential names.
    pub const SAUCE_USERNAME: &str = "SAUCE_USERNAME";
    pub const SAUCE_ACCESS_KEY: &str = "SAUCE_ACCESS_KEY";
    /// Legacy-compatible aliases, always published alongside the canonical
    /// names for older test harnesses.
    pub const SAUCE_USER_NAME: &str = "SAUCE_USER_NAME";
    pub const SAUCE_API_KEY: &str = "SAUCE_API_KEY";
    pub const SAUCE_DATA_CENTER: &str = "SAUCE_DATA_CENTER";
    pub const SAUCE_BUILD_NUMBER: &str = "SAUCE_BUILD_NUMBER";
    /// JSON array of every resolvable selected browser.
    pub const SAUCE_ONDEMAND_BROWSERS: &str = "SAUCE_ONDEMAND_BROWSERS";
    pub const TUNNEL_IDENTIFIER: &str = "TUNNEL_IDENTIFIER";
}

/// Compute the ordered key/value set to publish into the build's shared
/// environment.
pub fn projected_environment(
    config: &ResolvedConfig,
    registry: &dyn BrowserRegistry,
    build_name: &str,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut push = |name: &str, value: &str| {
        if !value.is_empty() {
            env.push((name.to_string(), value.to_string()));
        }
    };

    let username = &config.credentials.username;
    let access_key = &config.credentials.access_key;

    if config.browsers.is_empty() {
        info!("No selected browsers found");
    } else {
        if let [only] = config.browsers.as_slice() {
            match registry.browser_for_key(only) {
                Some(browser) => {
                    push(vars::SELENIUM_BROWSER, &browser.browser_name);
                    push(vars::SELENIUM_VERSION, &browser.version);
                    push(vars::SELENIUM_PLATFORM, &browser.os);
                    push(vars::SELENIUM_DRIVER, &driver_uri(config, &browser));
                    if let Some(device) = &browser.device {
                        push(vars::SELENIUM_DEVICE, device);
                    }
                    if let Some(device_type) = &browser.device_type {
                        push(vars::SELENIUM_DEVICE_TYPE, device_type);
                    }
                    if let Some(orientation) = &browser.device_orientation {
                        push(vars::SELENIUM_DEVICE_ORIENTATION, orientation);
                    }
                }
                None => info!(key = %only, "No browser found for selection"),
            }
        }

        let mut descriptors = Vec::new();
        for key in &config.browsers {
            let Some(browser) = registry.browser_for_key(key) else {
                info!(key = %key, "No browser found for selection");
                continue;
            };
            let mut descriptor = json!({
                "os": browser.os,
                "browser": browser.browser_name,
                "browser-version": browser.version,
                "long-name": browser.long_name,
                "long-version": browser.long_version,
                "url": browser.driver_url(username, access_key),
            });
            if let Some(device) = &browser.device {
                descriptor["device"] = json!(device);
            }
            if let Some(device_type) = &browser.device_type {
                descriptor["device-type"] = json!(device_type);
            }
            if let Some(orientation) = &browser.device_orientation {
                descriptor["device-orientation"] = json!(orientation);
            }
            descriptors.push(descriptor);
        }
        push(
            vars::SAUCE_ONDEMAND_BROWSERS,
            &serde_json::Value::Array(descriptors).to_string(),
        );
    }

    push(vars::SAUCE_USERNAME, username);
    push(vars::SAUCE_ACCESS_KEY, access_key);
    push(vars::SAUCE_USER_NAME, username);
    push(vars::SAUCE_API_KEY, access_key);
    push(vars::SAUCE_DATA_CENTER, config.credentials.data_center.as_str());

    push(vars::SELENIUM_HOST, &config.selenium_host);
    push(vars::SELENIUM_PORT, &config.selenium_port);
    if let Some(url) = &config.starting_url {
        push(vars::SELENIUM_STARTING_URL, url);
    }
    if let Some(duration) = &config.max_duration {
        push(vars::SELENIUM_MAX_DURATION, duration);
    }
    if let Some(timeout) = &config.idle_timeout {
        push(vars::SELENIUM_IDLE_TIMEOUT, timeout);
    }
    push(vars::SAUCE_BUILD_NUMBER, build_name);

    if config.tunnel_enabled {
        push(vars::TUNNEL_IDENTIFIER, &config.tunnel.tunnel_name);
    }

    env
}

/// Driver URI consumed by selenium-client-factory style launchers:
/// `sauce-ondemand:?username=<u>&access-key=<k>&os=..&browser=..&...`
fn driver_uri(config: &ResolvedConfig, browser: &crate::browsers::Browser) -> String {
    let mut uri = format!(
        "sauce-ondemand:?username={}&access-key={}&os={}&browser={}&browser-version={}",
        config.credentials.username,
        config.credentials.access_key,
        browser.os,
        browser.browser_name,
        browser.version,
    );
    if let Some(duration) = &config.max_duration {
        uri.push_str("&max-duration=");
        uri.push_str(duration);
    }
    if let Some(timeout) = &config.idle_timeout {
        uri.push_str("&idle-timeout=");
        uri.push_str(timeout);
    }
    uri
}
