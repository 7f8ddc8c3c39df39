//! This module controls configuration parsing from the end user. A barrage
//! run reads its configuration exactly once, at startup, and every problem
//! with it is fatal there rather than later in the run.
//!
//! Configuration comes from a YAML file or, when `BARRAGE_CONFIG` is set,
//! from the contents of that variable. `FAULT_RATE` and `EXTRA_LATENCY_MS`
//! then override the fault settings of whichever was used.

use std::{
    fmt, fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use barrage_payload::{Workload, workload};
use barrage_stage::{Profile, Ramp, Stage};
use http::Uri;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::debug;

use crate::fault::{self, Fault};

/// Environment variable holding the full configuration.
pub const CONFIG_ENV: &str = "BARRAGE_CONFIG";
/// Environment variable overriding [`fault::Config::rate`].
pub const FAULT_RATE_ENV: &str = "FAULT_RATE";
/// Environment variable overriding [`fault::Config::extra_latency`], in
/// milliseconds.
pub const EXTRA_LATENCY_ENV: &str = "EXTRA_LATENCY_MS";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// An override variable held something other than a number in `[0, 1]`.
    #[error("FAULT_RATE must be a number within [0, 1], got '{0}'")]
    FaultRateEnv(String),
    /// An override variable held something other than a whole number.
    #[error("EXTRA_LATENCY_MS must be a non-negative integer, got '{0}'")]
    ExtraLatencyEnv(String),
    /// See [`barrage_stage::Error`]
    #[error("Invalid stages: {0}")]
    Stages(#[from] barrage_stage::Error),
    /// See [`workload::Error`]
    #[error("Invalid workload: {0}")]
    Workload(#[from] workload::Error),
    /// See [`fault::Error`]
    #[error("Invalid fault injection: {0}")]
    Fault(#[from] fault::Error),
    /// A zero interval would spin.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

fn default_target_uri() -> Uri {
    Uri::from_static("http://nginx")
}

fn default_pacing() -> Duration {
    Duration::from_secs(1)
}

fn default_adjust_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URI requests are sent to. Request paths are appended to its
    /// path.
    #[serde(with = "http_serde::uri", default = "default_target_uri")]
    pub target_uri: Uri,
    /// The load profile
    pub stages: Vec<Stage>,
    /// How concurrency moves within a stage
    #[serde(default)]
    pub ramp: Ramp,
    /// How often the concurrency target is re-evaluated
    #[serde(with = "humantime_serde", default = "default_adjust_interval")]
    pub adjust_interval: Duration,
    /// Sleep between the iterations of one virtual user
    #[serde(with = "humantime_serde", default = "default_pacing")]
    pub pacing: Duration,
    /// Upper bound on a single request, response body included
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Request kinds and the bounds of the values placed in them
    #[serde(default)]
    pub workload: workload::Config,
    /// Fault injection
    #[serde(default)]
    pub fault: fault::Config,
    /// Seed for every random choice in the run. Drawn from the operating
    /// system when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

/// Defines the manner of barrage's own telemetry.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Telemetry {
    /// Emit telemetry for scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Config {
    /// Apply the environment overrides. `lookup` returns the value of a
    /// variable, an empty value counts as unset.
    ///
    /// # Errors
    ///
    /// Returns an error if an override is present but malformed.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(raw) = present(FAULT_RATE_ENV) {
            let rate = f64::from_str(raw.trim()).map_err(|_| Error::FaultRateEnv(raw.clone()))?;
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::FaultRateEnv(raw));
            }
            debug!("fault rate overridden by {FAULT_RATE_ENV}: {rate}");
            self.fault.rate = rate;
        }
        if let Some(raw) = present(EXTRA_LATENCY_ENV) {
            let millis =
                u64::from_str(raw.trim()).map_err(|_| Error::ExtraLatencyEnv(raw.clone()))?;
            debug!("extra latency overridden by {EXTRA_LATENCY_ENV}: {millis}ms");
            self.fault.extra_latency = Duration::from_millis(millis);
        }
        Ok(())
    }

    /// The load profile.
    ///
    /// # Errors
    ///
    /// See [`Profile::new`].
    pub fn profile(&self) -> Result<Profile, Error> {
        Ok(Profile::new(self.stages.clone(), self.ramp)?)
    }

    /// The request generator.
    ///
    /// # Errors
    ///
    /// See [`Workload::new`].
    pub fn workload(&self) -> Result<Workload, Error> {
        Ok(Workload::new(&self.workload)?)
    }

    /// The fault injector.
    ///
    /// # Errors
    ///
    /// See [`Fault::new`].
    pub fn fault(&self) -> Result<Fault, Error> {
        Ok(Fault::new(self.fault)?)
    }

    /// Check everything that can be checked without running.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        self.profile()?;
        self.workload()?;
        self.fault()?;
        if self.adjust_interval.is_zero() {
            return Err(Error::ZeroInterval("adjust_interval"));
        }
        if self.pacing.is_zero() {
            return Err(Error::ZeroInterval("pacing"));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::ZeroInterval("request_timeout"));
        }
        Ok(())
    }
}

/// Read the configuration text, preferring [`CONFIG_ENV`] over the file.
///
/// # Errors
///
/// Returns an error if the file is consulted and cannot be read.
pub fn load_contents<F>(path: &Path, lookup: F) -> Result<String, Error>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(contents) = lookup(CONFIG_ENV) {
        debug!("Using config from env var '{CONFIG_ENV}'");
        return Ok(contents);
    }
    debug!("Attempting to open configuration file at: {}", path.display());
    fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

/// Parse, override and validate configuration text.
///
/// # Errors
///
/// Returns an error if the text is not a valid configuration, an override is
/// malformed or validation fails.
pub fn parse<F>(contents: &str, lookup: F) -> Result<Config, Error>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = serde_yaml::from_str(contents)?;
    config.apply_env(lookup)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from `path` or the environment.
///
/// # Errors
///
/// See [`load_contents`] and [`parse`].
pub fn load<F>(path: &Path, lookup: F) -> Result<Config, Error>
where
    F: Fn(&str) -> Option<String>,
{
    let contents = load_contents(path, &lookup)?;
    parse(&contents, lookup)
}

/// Comma separated `KEY=VAL` pairs, as given on the command line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyValues {
    inner: FxHashMap<String, String>,
}

impl KeyValues {
    /// Consume into the underlying map.
    #[must_use]
    pub fn into_inner(self) -> FxHashMap<String, String> {
        self.inner
    }
}

impl fmt::Display for KeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.inner {
            write!(f, "{k}={v},")?;
        }
        Ok(())
    }
}

impl FromStr for KeyValues {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut inner = FxHashMap::default();
        for pair in input.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("'{pair}' is not of the form KEY=VAL"))?;
            inner.insert(key.to_string(), value.to_string());
        }
        Ok(Self { inner })
    }
}
