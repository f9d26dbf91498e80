use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::WaitIndex;

const DEFAULT_CONFIG_FILE: &str = "deltastreamer.toml";
const DEFAULT_JSON_FILE: &str = "deltastreamer.json";

/// What the monitor watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Service registrations and deregistrations.
    Services,
    /// Instance membership and health of the named services.
    Instances,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub registry_address: String,
    pub poll_interval_secs: u64,
    pub wait_index: u64,
    pub max_wait_secs: u64,
    pub mode: Mode,
    pub services: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    pub output: OutputFormat,
    pub report_initial: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_address: "http://localhost:8500".into(),
            poll_interval_secs: 10,
            wait_index: 0,
            // Consul's own cap on blocking queries.
            max_wait_secs: 300,
            mode: Mode::Services,
            services: Vec::new(),
            token: None,
            datacenter: None,
            output: OutputFormat::Text,
            report_initial: false,
        }
    }
}

impl Config {
    /// Layer defaults, config files, `DELTASTREAMER_*` variables and
    /// finally `overrides` (usually the command line).
    pub fn load<T: Serialize>(config_file: Option<&str>, overrides: T) -> anyhow::Result<Self> {
        if let Some(path) = config_file {
            if !Path::new(path).exists() {
                anyhow::bail!("Config file {} not found", path);
            }
        }

        let figment = Figment::from(Serialized::defaults(Config::default()));
        let figment = match config_file {
            Some(path) if is_json(path) => figment.merge(Json::file(path)),
            Some(path) => figment.merge(Toml::file(path)),
            None => figment
                .merge(Toml::file(DEFAULT_CONFIG_FILE))
                .merge(Json::file(DEFAULT_JSON_FILE)),
        };

        let mut config: Config = figment
            .merge(Env::prefixed("DELTASTREAMER_"))
            .merge(Serialized::defaults(overrides))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(token_file) = std::env::var("DELTASTREAMER_TOKEN_FILE") {
            config.token = Some(std::fs::read_to_string(token_file)?.trim().to_string());
        }

        config.services.sort();
        config.services.dedup();

        Ok(config)
    }

    /// Reject settings the monitors cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Misconfiguration(
                "poll interval must be at least one second".into(),
            ));
        }
        if self.max_wait_secs == 0 {
            return Err(Error::Misconfiguration(
                "max wait must be at least one second".into(),
            ));
        }
        if self.mode == Mode::Instances && self.services.is_empty() {
            return Err(Error::Misconfiguration(
                "instances mode needs at least one target service".into(),
            ));
        }

        if self.mode == Mode::Services && !self.services.is_empty() {
            warn!("Ignoring target services {:?} in services mode", self.services);
        }
        if self.max_wait_secs <= self.poll_interval_secs {
            warn!(
                "Max wait ({}s) is not longer than the poll interval ({}s); expect redundant polling",
                self.max_wait_secs, self.poll_interval_secs
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn initial_index(&self) -> WaitIndex {
        WaitIndex(self.wait_index)
    }
}

fn is_json(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}
