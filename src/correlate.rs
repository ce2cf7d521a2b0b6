//! Session correlation and job reporting.
//!
//! Test frameworks print an opaque session id into the build log
//! (`SauceOnDemandSessionID=<id> job-name=<name>`). At build finish the log
//! is scanned once, in log order, and each distinct session id drives a
//! remote update chain: resolve the remote build by its build-name key, list
//! its jobs, and stamp each job with the build name and (when not already
//! recorded) a pass/fail derived from the CI build status.
//!
//! Every remote step is independently recoverable: one broken session id is
//! logged and skipped, the rest continue.
//!
//! The display path ([`job_report`]) is separate and on-demand: it performs
//! the same build lookup, fetches full job details, mints a fresh embed
//! token per job, and reverses the most-recent-first API order into
//! chronological order.

use tracing::{error, info, warn};

use crate::config::{Credentials, ResolvedConfig};
use crate::rest::{Job, JobUpdate, RemoteApi, RemoteError};
use crate::token;

/// Marker preceding a session id in build log output. Matched
/// case-insensitively.
pub const SESSION_ID_MARKER: &str = "SauceOnDemandSessionID";

/// Build-name key correlating CI builds with remote builds:
/// `<externalTypeId><buildNumber>`.
pub fn build_name(build_type_external_id: &str, build_number: &str) -> String {
    format!("{build_type_external_id}{build_number}")
}

/// Extract a session id from one log line.
///
/// The id is the substring between the marker's `=` and the next whitespace,
/// or the rest of the line when no whitespace follows. A missing, empty, or
/// literal `"null"` id yields `None`.
pub fn extract_session_id(line: &str) -> Option<&str> {
    let lower = line.to_ascii_lowercase();
    let marker = SESSION_ID_MARKER.to_ascii_lowercase();
    let start = lower.find(&marker)? + marker.len();
    let rest = line.get(start..)?.strip_prefix('=')?;
    let id = match rest.find(char::is_whitespace) {
        Some(end) => &rest[..end],
        None => rest,
    };
    if id.is_empty() || id.eq_ignore_ascii_case("null") {
        return None;
    }
    Some(id)
}

/// Scan log lines for session ids, preserving first-seen order and dropping
/// duplicates. Pure: scanning twice yields the same result.
pub fn scan_sessions<I, S>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: Vec<String> = Vec::new();
    for line in lines {
        if let Some(id) = extract_session_id(line.as_ref()) {
            if !seen.iter().any(|s| s == id) {
                seen.push(id.to_string());
            }
        }
    }
    seen
}

/// Outcome counts of one correlation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationSummary {
    /// Distinct session ids found in the log.
    pub sessions: usize,
    /// Jobs successfully updated.
    pub updated_jobs: usize,
    /// Session ids whose remote chain failed.
    pub failures: usize,
}

/// Run the remote update chain for every session id, tolerating per-id
/// failures. `passed` carries the CI build's own verdict; `None` omits the
/// pass/fail field from updates.
pub async fn correlate_sessions<R: RemoteApi>(
    api: &R,
    credentials: &Credentials,
    build_name: &str,
    fallback_name: Option<&str>,
    passed: Option<bool>,
    session_ids: &[String],
) -> CorrelationSummary {
    let mut summary = CorrelationSummary {
        sessions: session_ids.len(),
        ..CorrelationSummary::default()
    };

    for session_id in session_ids {
        match correlate_one(api, build_name, fallback_name, passed).await {
            Ok(updated) => {
                info!(
                    session_id = %session_id,
                    build = %build_name,
                    updated,
                    "Recorded build for session"
                );
                summary.updated_jobs += updated;
            }
            Err(e) => {
                error!(
                    session_id = %session_id,
                    username = %credentials.username,
                    error = %e,
                    "Failed to update remote job for session"
                );
                summary.failures += 1;
            }
        }
    }
    summary
}

/// One session id's update chain. Returns the number of jobs updated.
async fn correlate_one<R: RemoteApi>(
    api: &R,
    build_name: &str,
    fallback_name: Option<&str>,
    passed: Option<bool>,
) -> Result<usize, RemoteError> {
    let Some(build_id) = lookup_build(api, build_name, fallback_name).await? else {
        warn!(build = %build_name, "No remote build found for name");
        return Ok(0);
    };

    let job_ids = api.list_jobs_for_build(&build_id).await?;
    if job_ids.is_empty() {
        warn!(build_id = %build_id, "Remote build has no jobs");
        return Ok(0);
    }

    let mut updated = 0;
    for job in api.get_job_details(&job_ids).await? {
        let update = JobUpdate {
            build: build_name.to_string(),
            // Keep a verdict the job already carries.
            passed: if job.passed.is_none() { passed } else { None },
        };
        api.update_job(&job.id, &update).await?;
        updated += 1;
    }
    Ok(updated)
}

/// Build lookup with the legacy fallback: composite name first, plain build
/// number second (naming-convention drift across integration versions).
async fn lookup_build<R: RemoteApi>(
    api: &R,
    primary: &str,
    fallback: Option<&str>,
) -> Result<Option<String>, RemoteError> {
    if let Some(id) = api.lookup_build_by_name(primary).await? {
        return Ok(Some(id));
    }
    if let Some(name) = fallback {
        info!(primary = %primary, fallback = %name, "Retrying build lookup with fallback name");
        return api.lookup_build_by_name(name).await;
    }
    Ok(None)
}

/// One job's display record: remote fields plus a freshly minted embed token.
/// Rebuilt on every display request so tokens stay within their UTC hour.
#[derive(Debug, Clone)]
pub struct JobInformation {
    pub job_id: String,
    pub hmac_token: String,
    /// Report base URL for the job's data center.
    pub log_url: String,
    pub name: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub passed: Option<bool>,
}

impl JobInformation {
    fn from_job(job: Job, token: String, log_url: &str) -> Self {
        Self {
            job_id: job.id,
            hmac_token: token,
            log_url: log_url.to_string(),
            name: job.name,
            browser: job.browser,
            os: job.os,
            passed: job.passed,
        }
    }

    /// URL of the embeddable job report, authorized by the token.
    pub fn embed_url(&self) -> String {
        format!("{}/job-embed/{}?auth={}", self.log_url, self.job_id, self.hmac_token)
    }
}

/// [`job_report`] gated by the feature's display setting: a feature with
/// results disabled yields an empty list without touching the remote
/// service.
pub async fn job_report_for_build<R: RemoteApi>(
    api: &R,
    config: &ResolvedConfig,
    build_name: &str,
    fallback_name: Option<&str>,
) -> Vec<JobInformation> {
    if config.results_disabled {
        info!(build = %build_name, "Results display is disabled for this feature");
        return Vec::new();
    }
    job_report(api, &config.credentials, build_name, fallback_name).await
}

/// Fetch the job list for display, in chronological order. Failures are
/// logged and yield a partial or empty list, never an error to the caller.
pub async fn job_report<R: RemoteApi>(
    api: &R,
    credentials: &Credentials,
    build_name: &str,
    fallback_name: Option<&str>,
) -> Vec<JobInformation> {
    let build_id = match lookup_build(api, build_name, fallback_name).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!(build = %build_name, "No remote build found for name");
            return Vec::new();
        }
        Err(e) => {
            error!(build = %build_name, username = %credentials.username, error = %e,
                "Build lookup failed");
            return Vec::new();
        }
    };

    let job_ids = match api.list_jobs_for_build(&build_id).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(build_id = %build_id, error = %e, "Job listing failed");
            return Vec::new();
        }
    };

    let jobs = match api.get_job_details(&job_ids).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(build_id = %build_id, error = %e, "Job detail fetch failed");
            return Vec::new();
        }
    };

    let log_url = credentials.data_center.app_base_url();
    let mut report = Vec::with_capacity(jobs.len());
    for job in jobs {
        let token = match token::job_token(&credentials.username, &credentials.access_key, &job.id)
        {
            Ok(token) => token,
            Err(e) => {
                // Fatal for this display request only.
                error!(job_id = %job.id, error = %e, "Embed token computation failed");
                return Vec::new();
            }
        };
        report.push(JobInformation::from_job(job, token, log_url));
    }

    // The API returns most-recent-first; display expects chronological.
    report.reverse();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataCenter;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_extract_session_id_with_trailing_text() {
        assert_eq!(
            extract_session_id("SauceOnDemandSessionID=abc123 job-name=foo"),
            Some("abc123")
        );
    }

    #[test]
    fn test_extract_session_id_at_end_of_line() {
        assert_eq!(
            extract_session_id("SauceOnDemandSessionID=abc123"),
            Some("abc123")
        );
    }

    #[test]
    fn test_extract_session_id_null_is_absent() {
        assert_eq!(extract_session_id("SauceOnDemandSessionID=null"), None);
        assert_eq!(extract_session_id("SauceOnDemandSessionID=NULL x"), None);
        assert_eq!(extract_session_id("SauceOnDemandSessionID="), None);
    }

    #[test]
    fn test_extract_session_id_case_insensitive_marker() {
        assert_eq!(
            extract_session_id("[info] sauceondemandsessionid=abc123 done"),
            Some("abc123")
        );
    }

    #[test]
    fn test_extract_session_id_ignores_unrelated_lines() {
        assert_eq!(extract_session_id("compiling module 3 of 7"), None);
        assert_eq!(extract_session_id("SauceOnDemandSessionID abc"), None);
    }

    #[test]
    fn test_scan_is_ordered_distinct_and_idempotent() {
        let lines = [
            "SauceOnDemandSessionID=aaa job-name=first",
            "noise",
            "SauceOnDemandSessionID=bbb",
            "SauceOnDemandSessionID=aaa job-name=repeat",
        ];
        let first = scan_sessions(lines);
        let second = scan_sessions(lines);
        assert_eq!(first, vec!["aaa", "bbb"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_build_name_composite() {
        assert_eq!(build_name("bt42", "17"), "bt4217");
    }

    /// In-memory remote service. `fail_lookups` makes the first N build
    /// lookups fail with a transport-level error.
    #[derive(Default)]
    struct MockApi {
        builds: HashMap<String, String>,
        jobs: HashMap<String, Vec<String>>,
        details: HashMap<String, Job>,
        fail_lookups: AtomicUsize,
        updates: Mutex<Vec<(String, JobUpdate)>>,
        looked_up: Mutex<Vec<String>>,
    }

    impl RemoteApi for MockApi {
        async fn lookup_build_by_name(&self, name: &str) -> Result<Option<String>, RemoteError> {
            self.looked_up.lock().unwrap().push(name.to_string());
            if self
                .fail_lookups
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RemoteError::Protocol("injected failure".to_string()));
            }
            Ok(self.builds.get(name).cloned())
        }

        async fn list_jobs_for_build(&self, build_id: &str) -> Result<Vec<String>, RemoteError> {
            Ok(self.jobs.get(build_id).cloned().unwrap_or_default())
        }

        async fn get_job_details(&self, job_ids: &[String]) -> Result<Vec<Job>, RemoteError> {
            Ok(job_ids
                .iter()
                .filter_map(|id| self.details.get(id).cloned())
                .collect())
        }

        async fn update_job(&self, job_id: &str, update: &JobUpdate) -> Result<(), RemoteError> {
            self.updates
                .lock()
                .unwrap()
                .push((job_id.to_string(), update.clone()));
            Ok(())
        }
    }

    fn mock_with_build(name: &str, job_ids: &[&str]) -> MockApi {
        let mut api = MockApi::default();
        api.builds.insert(name.to_string(), "build-1".to_string());
        api.jobs.insert(
            "build-1".to_string(),
            job_ids.iter().map(|s| s.to_string()).collect(),
        );
        for id in job_ids {
            api.details.insert(
                id.to_string(),
                Job {
                    id: id.to_string(),
                    ..Job::default()
                },
            );
        }
        api
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "u".to_string(),
            access_key: "k".to_string(),
            data_center: DataCenter::UsWest,
        }
    }

    #[tokio::test]
    async fn test_correlation_updates_jobs_with_verdict() {
        let api = mock_with_build("bt4217", &["job-1", "job-2"]);
        let sessions = vec!["s1".to_string()];
        let summary =
            correlate_sessions(&api, &credentials(), "bt4217", None, Some(true), &sessions).await;

        assert_eq!(summary.updated_jobs, 2);
        assert_eq!(summary.failures, 0);
        let updates = api.updates.lock().unwrap();
        assert_eq!(updates[0].1.build, "bt4217");
        assert_eq!(updates[0].1.passed, Some(true));
    }

    #[tokio::test]
    async fn test_correlation_keeps_recorded_verdict() {
        let mut api = mock_with_build("bt4217", &["job-1"]);
        api.details.get_mut("job-1").unwrap().passed = Some(false);
        let sessions = vec!["s1".to_string()];
        correlate_sessions(&api, &credentials(), "bt4217", None, Some(true), &sessions).await;

        let updates = api.updates.lock().unwrap();
        assert_eq!(updates[0].1.passed, None);
        assert_eq!(updates[0].1.build, "bt4217");
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_lose_second_session() {
        let mut api = mock_with_build("bt4217", &["job-1"]);
        api.fail_lookups = AtomicUsize::new(1);
        let sessions = vec!["s1".to_string(), "s2".to_string()];
        let summary =
            correlate_sessions(&api, &credentials(), "bt4217", None, Some(false), &sessions).await;

        assert_eq!(summary.failures, 1);
        assert_eq!(summary.updated_jobs, 1);
        let updates = api.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.passed, Some(false));
    }

    #[tokio::test]
    async fn test_build_lookup_fallback_name() {
        let api = mock_with_build("17", &["job-1"]);
        let sessions = vec!["s1".to_string()];
        let summary =
            correlate_sessions(&api, &credentials(), "bt4217", Some("17"), None, &sessions).await;

        assert_eq!(summary.updated_jobs, 1);
        let looked_up = api.looked_up.lock().unwrap();
        assert_eq!(*looked_up, vec!["bt4217", "17"]);
    }

    #[tokio::test]
    async fn test_job_report_is_chronological() {
        let mut api = mock_with_build("bt4217", &["newest", "older", "oldest"]);
        for id in ["newest", "older", "oldest"] {
            api.details.get_mut(id).unwrap().name = Some(format!("run {id}"));
        }
        let report = job_report(&api, &credentials(), "bt4217", None).await;

        let order: Vec<&str> = report.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(order, vec!["oldest", "older", "newest"]);
        assert!(report.iter().all(|j| j.hmac_token.len() == 32));
        assert!(report[0]
            .embed_url()
            .starts_with("https://app.saucelabs.com/job-embed/oldest?auth="));
    }

    #[tokio::test]
    async fn test_report_disabled_skips_remote_calls() {
        use crate::config::{keys, FeatureParams};

        let api = mock_with_build("bt4217", &["job-1"]);
        let params = FeatureParams::from_iter([
            (keys::USERNAME, "u"),
            (keys::ACCESS_KEY, "k"),
            (keys::RESULTS_DISABLED, "true"),
        ]);
        let config = ResolvedConfig::resolve(&params, None).unwrap();
        assert!(config.results_disabled);

        let report = job_report_for_build(&api, &config, "bt4217", None).await;
        assert!(report.is_empty());
        assert!(api.looked_up.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_report_swallows_remote_failure() {
        let api = MockApi {
            fail_lookups: AtomicUsize::new(1),
            ..MockApi::default()
        };
        let report = job_report(&api, &credentials(), "bt4217", None).await;
        assert!(report.is_empty());
    }
}
