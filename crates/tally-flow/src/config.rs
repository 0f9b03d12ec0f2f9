//! Engine configuration.
//!
//! Runtime limits for chunking, fan-out, retries, and the impact-creation
//! loop are environment-driven with strict validation, so a deployment's
//! effective limits are explicit and reproducible.

use std::time::Duration;

use crate::error::{Error, Result};

const ENV_CHUNK_SIZE_BYTES: &str = "TALLY_FLOW_CHUNK_SIZE_BYTES";
const ENV_MAX_CONCURRENT_CHUNKS: &str = "TALLY_FLOW_MAX_CONCURRENT_CHUNKS";
const ENV_CALCULATOR_RETRY_BASE_SECS: &str = "TALLY_FLOW_CALCULATOR_RETRY_BASE_SECS";
const ENV_CALCULATOR_RETRY_MULTIPLIER: &str = "TALLY_FLOW_CALCULATOR_RETRY_MULTIPLIER";
const ENV_CALCULATOR_MAX_ATTEMPTS: &str = "TALLY_FLOW_CALCULATOR_MAX_ATTEMPTS";
const ENV_IMPACT_POLL_INTERVAL_SECS: &str = "TALLY_FLOW_IMPACT_POLL_INTERVAL_SECS";
const ENV_MAX_IMPACT_ITERATIONS: &str = "TALLY_FLOW_MAX_IMPACT_ITERATIONS";
const ENV_LOCK_TTL_SECS: &str = "TALLY_FLOW_LOCK_TTL_SECS";

const DEFAULT_CHUNK_SIZE_BYTES: u64 = 1_000_000;
const DEFAULT_MAX_CONCURRENT_CHUNKS: u64 = 10;
const DEFAULT_CALCULATOR_RETRY_BASE_SECS: u64 = 2;
const DEFAULT_CALCULATOR_RETRY_MULTIPLIER: u64 = 2;
const DEFAULT_CALCULATOR_MAX_ATTEMPTS: u64 = 6;
const DEFAULT_IMPACT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_IMPACT_ITERATIONS: u64 = 100;
const DEFAULT_LOCK_TTL_SECS: u64 = 300;

/// Runtime limit configuration for the execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Size of each source-data chunk in bytes.
    pub chunk_size_bytes: u64,
    /// Maximum simultaneous chunk invocations during the calculate step.
    ///
    /// A backpressure control, not a correctness requirement - chunks have
    /// no ordering dependency on each other.
    pub max_concurrent_chunks: usize,
    /// Base delay before the first calculator retry.
    pub calculator_retry_base: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub calculator_retry_multiplier: u32,
    /// Total invocation attempts (first try included) before a chunk fails.
    pub calculator_max_attempts: u32,
    /// Wait between impact-creation iterations.
    pub impact_poll_interval: Duration,
    /// Safety cap on impact-creation iterations for one execution.
    pub max_impact_iterations: u32,
    /// TTL for aggregation and export locks.
    pub lock_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            max_concurrent_chunks: 10,
            calculator_retry_base: Duration::from_secs(DEFAULT_CALCULATOR_RETRY_BASE_SECS),
            calculator_retry_multiplier: 2,
            calculator_max_attempts: 6,
            impact_poll_interval: Duration::from_secs(DEFAULT_IMPACT_POLL_INTERVAL_SECS),
            max_impact_iterations: 100,
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        }
    }
}

impl EngineConfig {
    /// Loads engine config from the process environment with strict
    /// validation.
    ///
    /// Values must be positive integers when provided.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer or exceeds the supported range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads engine config with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer or exceeds the supported range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let chunk_size_bytes =
            parse_positive_u64_env(&get_env, ENV_CHUNK_SIZE_BYTES, DEFAULT_CHUNK_SIZE_BYTES)?;
        let max_concurrent_chunks = parse_positive_u64_env(
            &get_env,
            ENV_MAX_CONCURRENT_CHUNKS,
            DEFAULT_MAX_CONCURRENT_CHUNKS,
        )?;
        let retry_base_secs = parse_positive_u64_env(
            &get_env,
            ENV_CALCULATOR_RETRY_BASE_SECS,
            DEFAULT_CALCULATOR_RETRY_BASE_SECS,
        )?;
        let retry_multiplier = parse_positive_u64_env(
            &get_env,
            ENV_CALCULATOR_RETRY_MULTIPLIER,
            DEFAULT_CALCULATOR_RETRY_MULTIPLIER,
        )?;
        let max_attempts = parse_positive_u64_env(
            &get_env,
            ENV_CALCULATOR_MAX_ATTEMPTS,
            DEFAULT_CALCULATOR_MAX_ATTEMPTS,
        )?;
        let impact_poll_secs = parse_positive_u64_env(
            &get_env,
            ENV_IMPACT_POLL_INTERVAL_SECS,
            DEFAULT_IMPACT_POLL_INTERVAL_SECS,
        )?;
        let max_impact_iterations = parse_positive_u64_env(
            &get_env,
            ENV_MAX_IMPACT_ITERATIONS,
            DEFAULT_MAX_IMPACT_ITERATIONS,
        )?;
        let lock_ttl_secs =
            parse_positive_u64_env(&get_env, ENV_LOCK_TTL_SECS, DEFAULT_LOCK_TTL_SECS)?;

        Ok(Self {
            chunk_size_bytes,
            max_concurrent_chunks: to_bounded_usize(ENV_MAX_CONCURRENT_CHUNKS, max_concurrent_chunks)?,
            calculator_retry_base: Duration::from_secs(retry_base_secs),
            calculator_retry_multiplier: to_bounded_u32(
                ENV_CALCULATOR_RETRY_MULTIPLIER,
                retry_multiplier,
            )?,
            calculator_max_attempts: to_bounded_u32(ENV_CALCULATOR_MAX_ATTEMPTS, max_attempts)?,
            impact_poll_interval: Duration::from_secs(impact_poll_secs),
            max_impact_iterations: to_bounded_u32(
                ENV_MAX_IMPACT_ITERATIONS,
                max_impact_iterations,
            )?,
            lock_ttl: Duration::from_secs(lock_ttl_secs),
        })
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn to_bounded_u32(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::configuration(format!("{key} value {value} exceeds supported range")))
}

fn to_bounded_usize(key: &str, value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::configuration(format!("{key} value {value} exceeds supported range")))
}
