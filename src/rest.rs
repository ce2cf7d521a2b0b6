//! Remote service API.
//!
//! The device cloud is consumed as an opaque REST surface behind the
//! [`RemoteApi`] trait: build lookup by name, job listing per build, job
//! detail fetch, and job update. [`SauceRest`] is the production
//! implementation wrapping `reqwest::Client`; correlation tests inject a
//! mock instead.
//!
//! Every failure is a recoverable [`RemoteError`] — a broken remote call is
//! downgraded and logged at the call site, never allowed to fail the build.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Credentials;

/// Remote build/job operations used by correlation and display.
#[allow(async_fn_in_trait)]
pub trait RemoteApi {
    /// Most recent remote build whose name matches, if any.
    async fn lookup_build_by_name(&self, name: &str) -> Result<Option<String>, RemoteError>;
    /// Ids of the jobs attached to a remote build.
    async fn list_jobs_for_build(&self, build_id: &str) -> Result<Vec<String>, RemoteError>;
    /// Full job records for the given ids.
    async fn get_job_details(&self, job_ids: &[String]) -> Result<Vec<Job>, RemoteError>;
    /// Attach a build name (and optionally pass/fail) to a job.
    async fn update_job(&self, job_id: &str, update: &JobUpdate) -> Result<(), RemoteError>;
}

/// A remote job record. Fields we do not consume are left to the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub browser_short_version: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
}

/// Mutation submitted to a job at build finish.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobUpdate {
    /// Build-name key correlating the job back to the CI build.
    pub build: String,
    /// Pass/fail derived from the CI build status; omitted when the CI
    /// status is neither success nor failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
}

/// reqwest-backed [`RemoteApi`] implementation for one set of credentials.
pub struct SauceRest {
    http: reqwest::Client,
    base_url: String,
    username: String,
    access_key: String,
}

impl SauceRest {
    /// Build a client for the credentials' data center.
    pub fn new(credentials: &Credentials) -> Self {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(concat!(
                "saucebridge/",
                env!("CARGO_PKG_VERSION")
            )),
        );
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            http,
            base_url: credentials.data_center.api_base_url().to_string(),
            username: credentials.username.clone(),
            access_key: credentials.access_key.clone(),
        }
    }

    async fn get_json(&self, url: reqwest::Url) -> Result<serde_json::Value, RemoteError> {
        let resp = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.access_key))
            .send()
            .await
            .map_err(RemoteError::Request)?;
        Self::handle_response(resp).await
    }

    /// Parse an HTTP response — JSON body on success, [`RemoteError`] with
    /// the service's message on failure.
    async fn handle_response(resp: reqwest::Response) -> Result<serde_json::Value, RemoteError> {
        let status = resp.status();
        let body = resp.text().await.map_err(RemoteError::Request)?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| RemoteError::Protocol(format!("Invalid JSON from service: {e}")))
        } else {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["message"].as_str().map(String::from))
                .unwrap_or(body);
            Err(RemoteError::Service {
                status: status.as_u16(),
                message,
            })
        }
    }
}

impl RemoteApi for SauceRest {
    /// `GET /v2/builds/vdc/?name=<name>&limit=1`
    async fn lookup_build_by_name(&self, name: &str) -> Result<Option<String>, RemoteError> {
        let mut url = reqwest::Url::parse(&format!("{}/v2/builds/vdc/", self.base_url))
            .map_err(|e| RemoteError::Protocol(format!("Invalid base URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("limit", "1");
        let body = self.get_json(url).await?;
        let id = body["builds"]
            .as_array()
            .and_then(|builds| builds.first())
            .and_then(|build| build["id"].as_str())
            .map(String::from);
        Ok(id)
    }

    /// `GET /v2/builds/vdc/<build_id>/jobs/`
    async fn list_jobs_for_build(&self, build_id: &str) -> Result<Vec<String>, RemoteError> {
        let url = reqwest::Url::parse(&format!("{}/v2/builds/vdc/{build_id}/jobs/", self.base_url))
            .map_err(|e| RemoteError::Protocol(format!("Invalid build id: {e}")))?;
        let body = self.get_json(url).await?;
        let jobs = body["jobs"]
            .as_array()
            .map(|jobs| {
                jobs.iter()
                    .filter_map(|job| job["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Ok(jobs)
    }

    /// `GET /rest/v1/<username>/jobs/<job_id>` per id.
    async fn get_job_details(&self, job_ids: &[String]) -> Result<Vec<Job>, RemoteError> {
        let mut jobs = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let url = reqwest::Url::parse(&format!(
                "{}/rest/v1/{}/jobs/{job_id}",
                self.base_url, self.username
            ))
            .map_err(|e| RemoteError::Protocol(format!("Invalid job id: {e}")))?;
            let body = self.get_json(url).await?;
            let job: Job = serde_json::from_value(body)
                .map_err(|e| RemoteError::Protocol(format!("Unexpected job record: {e}")))?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// `PUT /rest/v1/<username>/jobs/<job_id>`
    async fn update_job(&self, job_id: &str, update: &JobUpdate) -> Result<(), RemoteError> {
        let resp = self
            .http
            .put(format!(
                "{}/rest/v1/{}/jobs/{job_id}",
                self.base_url, self.username
            ))
            .basic_auth(&self.username, Some(&self.access_key))
            .json(update)
            .send()
            .await
            .map_err(RemoteError::Request)?;
        Self::handle_response(resp).await?;
        Ok(())
    }
}

/// Network or protocol failure talking to the remote service. Always
/// recoverable: callers log and continue with the remaining work.
#[derive(Debug)]
pub enum RemoteError {
    /// HTTP transport error (connection refused, timeout, DNS failure).
    Request(reqwest::Error),
    /// The service returned a non-2xx status.
    Service { status: u16, message: String },
    /// The response body did not match the expected shape.
    Protocol(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Request(e) => write!(f, "HTTP request failed: {e}"),
            RemoteError::Service { status, message } => {
                write!(f, "Service error (HTTP {status}): {message}")
            }
            RemoteError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_update_omits_unset_passed() {
        let update = JobUpdate {
            build: "bt12".to_string(),
            passed: None,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert_eq!(json, r#"{"build":"bt12"}"#);

        let update = JobUpdate {
            build: "bt12".to_string(),
            passed: Some(true),
        };
        let json = serde_json::to_string(&update).unwrap();
        assert_eq!(json, r#"{"build":"bt12","passed":true}"#);
    }

    #[test]
    fn test_job_record_tolerates_extra_fields() {
        let job: Job = serde_json::from_str(
            r#"{"id": "j1", "passed": true, "proxied": false, "tags": []}"#,
        )
        .unwrap();
        assert_eq!(job.id, "j1");
        assert_eq!(job.passed, Some(true));
        assert!(job.name.is_none());
    }
}
