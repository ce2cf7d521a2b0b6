#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! saucebridge library — brokers a CI build lifecycle against the Sauce Labs
//! device cloud.
//!
//! The key building blocks:
//! - `config` — feature-parameter resolution (credentials, data center, tunnel)
//! - `browsers` — browser registry seam and selection descriptors
//! - `env` — environment projection for test processes
//! - `tunnel` — Sauce Connect subprocess supervision
//! - `rest` — REST client for builds and jobs
//! - `correlate` — session-id scanning and job correlation
//! - `token` — time-scoped HMAC tokens for embedded job reports
//! - `lifecycle` — build lifecycle hooks over an abstract build handle
//! - `harness` — local CLI build harness

pub mod browsers;
pub mod config;
pub mod correlate;
pub mod env;
pub mod harness;
pub mod lifecycle;
pub mod rest;
pub mod token;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use browsers::{Browser, BrowserRegistry, StaticBrowserRegistry};
pub use config::{Credentials, DataCenter, FeatureParams, ResolvedConfig, TunnelOptions};
pub use lifecycle::{BuildHandle, BuildProblem, BuildStatus, LogSink, Orchestrator};
pub use rest::{RemoteApi, SauceRest};
pub use tunnel::TunnelSupervisor;
