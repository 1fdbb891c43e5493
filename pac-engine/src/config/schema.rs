//! Configuration schema types

use crate::health::HealthSettings;
use crate::resolver::ResolverOptions;
use crate::sandbox::SandboxLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete pacproxy configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pac: PacConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Config {
    /// Resolver options for this configuration, with the system clock and
    /// plain TCP dialing.
    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            health: self.health.settings(),
            limits: self.sandbox.limits(),
            reset_health_on_reload: self.health.reset_on_reload,
            ..ResolverOptions::default()
        }
    }
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:12345".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Where to load the PAC script from
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PacConfig {
    /// Inline script, http(s) URL or file path
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "proxy.pac".to_string()
}

impl Default for PacConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
        }
    }
}

/// Upstream health tracking
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_blacklist_ms")]
    pub blacklist_ms: u64,
    /// Forget upstream failures when the script is reloaded
    #[serde(default = "default_true")]
    pub reset_on_reload: bool,
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    10_000
}

fn default_blacklist_ms() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            blacklist_ms: default_blacklist_ms(),
            reset_on_reload: true,
        }
    }
}

impl HealthConfig {
    pub fn settings(&self) -> HealthSettings {
        HealthSettings {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            blacklist: Duration::from_millis(self.blacklist_ms),
        }
    }
}

/// Script engine resource limits
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SandboxConfig {
    #[serde(default = "default_loop_iteration_limit")]
    pub loop_iteration_limit: u64,
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
}

fn default_loop_iteration_limit() -> u64 {
    SandboxLimits::default().loop_iteration_limit
}

fn default_recursion_limit() -> usize {
    SandboxLimits::default().recursion_limit
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            loop_iteration_limit: default_loop_iteration_limit(),
            recursion_limit: default_recursion_limit(),
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            loop_iteration_limit: self.loop_iteration_limit,
            recursion_limit: self.recursion_limit,
        }
    }
}
