use crate::scheduler::SelectionPolicy;
use crate::schema::TransportHint;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("'{key}' must be within 0.0..=1.0, got {value}")]
    ProbabilityOutOfRange { key: &'static str, value: f64 },
    #[error("'{0}' must be at least 1")]
    ZeroNotAllowed(&'static str),
}

/// What a session does after an oracle raises instead of answering.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OracleErrorPolicy {
    /// End the session immediately.
    AbortSession,
    /// Record the pair as a logical failure and keep going.
    #[default]
    Flag,
}

/// What a session does after a decode anomaly or a protocol violation.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyPolicy {
    #[default]
    Continue,
    AbortSession,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl From<TransportHint> for TransportKind {
    fn from(hint: TransportHint) -> Self {
        match hint {
            TransportHint::Tcp => TransportKind::Tcp,
            TransportHint::Udp => TransportKind::Udp,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Transitions fired per session at most.
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    #[serde(default = "default_sessions")]
    pub sessions: usize,
    /// Sessions allowed to run at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Session `i` seeds its RNG with `rng_seed + i`.
    #[serde(default)]
    pub rng_seed: u64,
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    #[serde(default = "default_corrupt_size_rate")]
    pub corrupt_size_rate: f64,
}

pub fn default_iterations() -> u64 {
    1_000
}
pub fn default_sessions() -> usize {
    1
}
pub fn default_concurrency() -> usize {
    4
}
fn default_mutation_rate() -> f64 {
    0.5
}
fn default_corrupt_size_rate() -> f64 {
    0.05
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            sessions: default_sessions(),
            concurrency: default_concurrency(),
            rng_seed: 0,
            mutation_rate: default_mutation_rate(),
            corrupt_size_rate: default_corrupt_size_rate(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub selection: SelectionPolicy,
    /// Retries of a timed-out transition before the session ends.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub on_oracle_error: OracleErrorPolicy,
    #[serde(default)]
    pub on_decode_error: AnomalyPolicy,
    #[serde(default)]
    pub on_violation: AnomalyPolicy,
}

fn default_timeout_ms() -> u64 {
    2000
}
fn default_max_retries() -> u32 {
    2
}

impl SessionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            selection: SelectionPolicy::default(),
            max_retries: default_max_retries(),
            on_oracle_error: OracleErrorPolicy::default(),
            on_decode_error: AnomalyPolicy::default(),
            on_violation: AnomalyPolicy::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    /// `host:port` of the system under test.
    pub address: Option<String>,
    /// Overrides the protocol's transport hint.
    pub transport: Option<TransportKind>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    /// Raw message files (or directories of them) added to every session's corpus.
    pub initial_seed_paths: Option<Vec<PathBuf>>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WirefuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
}

impl WirefuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: WirefuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("mutation-rate", self.fuzzer.mutation_rate),
            ("corrupt-size-rate", self.fuzzer.corrupt_size_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { key, value });
            }
        }
        if self.fuzzer.concurrency == 0 {
            return Err(ConfigError::ZeroNotAllowed("concurrency"));
        }
        if self.fuzzer.sessions == 0 {
            return Err(ConfigError::ZeroNotAllowed("sessions"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wirefuzz.toml");
        fs::write(&path, "").unwrap();
        let config = WirefuzzConfig::load_from_file(&path).unwrap();
        assert_eq!(config, WirefuzzConfig::default());
        assert_eq!(config.session.on_oracle_error, OracleErrorPolicy::Flag);
        assert_eq!(config.session.selection, SelectionPolicy::Guided);
        assert_eq!(config.fuzzer.max_iterations, 1_000);
    }

    #[test]
    fn kebab_case_keys_are_parsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wirefuzz.toml");
        fs::write(
            &path,
            r#"
[fuzzer]
max-iterations = 50
sessions = 8
concurrency = 2
rng-seed = 1234
mutation-rate = 0.25

[session]
timeout-ms = 150
selection = "weighted"
on-oracle-error = "abort-session"
on-violation = "abort-session"

[target]
address = "127.0.0.1:9000"
transport = "udp"
"#,
        )
        .unwrap();
        let config = WirefuzzConfig::load_from_file(&path).unwrap();
        assert_eq!(config.fuzzer.sessions, 8);
        assert_eq!(config.fuzzer.rng_seed, 1234);
        assert_eq!(config.session.timeout(), Duration::from_millis(150));
        assert_eq!(config.session.selection, SelectionPolicy::Weighted);
        assert_eq!(config.session.on_oracle_error, OracleErrorPolicy::AbortSession);
        assert_eq!(config.session.on_decode_error, AnomalyPolicy::Continue);
        assert_eq!(config.target.transport, Some(TransportKind::Udp));
    }

    #[test]
    fn unknown_keys_and_bad_rates_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[fuzzer]\nthreads = 3\n").unwrap();
        assert!(WirefuzzConfig::load_from_file(&path).is_err());

        fs::write(&path, "[fuzzer]\nmutation-rate = 1.5\n").unwrap();
        let err = WirefuzzConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("mutation-rate"), "unexpected error: {err}");
    }
}
