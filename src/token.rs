//! Time-scoped embed tokens for job reports.
//!
//! Embedded job reports are authorized with a keyed hash instead of a
//! server-side session: the key is `username:accessKey:<UTC hour>`, so a
//! token is valid only within the UTC hour it was minted in and cannot be
//! replayed later. The digest follows the remote service's embed contract.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use md5::Md5;
use std::fmt;

/// Hour-resolution key timestamp format (UTC).
const KEY_TIME_FORMAT: &str = "%Y-%m-%d-%H";

/// Compute the embed token for a job, scoped to the current UTC hour.
///
/// Pure over (inputs, current hour): identical inputs within the same hour
/// yield identical tokens.
pub fn job_token(username: &str, access_key: &str, job_id: &str) -> Result<String, SigningError> {
    job_token_at(username, access_key, job_id, Utc::now())
}

/// [`job_token`] with an explicit timestamp, for hour-boundary tests.
pub fn job_token_at(
    username: &str,
    access_key: &str,
    job_id: &str,
    at: DateTime<Utc>,
) -> Result<String, SigningError> {
    let key = format!("{username}:{access_key}:{}", at.format(KEY_TIME_FORMAT));
    let mut mac =
        Hmac::<Md5>::new_from_slice(key.as_bytes()).map_err(|_| SigningError::InvalidKeyLength)?;
    mac.update(job_id.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Failure to compute an embed token. Fatal only for the display request in
/// progress, never for the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    /// The derived key material was rejected by the MAC primitive.
    InvalidKeyLength,
}

impl fmt::Display for SigningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningError::InvalidKeyLength => write!(f, "Invalid HMAC key length"),
        }
    }
}

impl std::error::Error for SigningError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, h, m, 0).unwrap()
    }

    #[test]
    fn test_token_deterministic_within_hour() {
        let a = job_token_at("u", "k", "job1", at(9, 5)).unwrap();
        let b = job_token_at("u", "k", "job1", at(9, 59)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_token_changes_across_hour_boundary() {
        let a = job_token_at("u", "k", "job1", at(9, 59)).unwrap();
        let b = job_token_at("u", "k", "job1", at(10, 0)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_depends_on_all_inputs() {
        let base = job_token_at("u", "k", "job1", at(9, 0)).unwrap();
        assert_ne!(job_token_at("u2", "k", "job1", at(9, 0)).unwrap(), base);
        assert_ne!(job_token_at("u", "k2", "job1", at(9, 0)).unwrap(), base);
        assert_ne!(job_token_at("u", "k", "job2", at(9, 0)).unwrap(), base);
    }
}
