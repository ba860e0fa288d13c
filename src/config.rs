//! Runtime configuration.
//!
//! `Settings` holds the read-only values shared by all runs (attempt
//! ceiling, confidence threshold, sandbox limits). It is loaded once from
//! the environment at process start and passed into the orchestrator —
//! nothing here is a mutable global.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default container image for sandboxed execution.
pub const DEFAULT_SANDBOX_IMAGE: &str = "python:3.12-slim";

/// Environment variable name prefixes forwarded into the sandbox. Only
/// known service-credential prefixes are allowed through — never the full
/// process environment.
pub const ENV_ALLOW_PREFIXES: &[&str] = &[
    "SLACK_", "GMAIL_", "GOOGLE_", "DERIV_", "SHEETS_", "WEBHOOK_", "API_", "AUTH_", "TOKEN_",
];

/// Read-only pipeline settings shared across runs.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum automated repair cycles before giving up.
    pub max_debug_attempts: u32,
    /// Requirement-extraction confidence below which a clarification round
    /// is requested.
    pub confidence_threshold: f64,
    /// Per-run broadcast channel capacity; slow subscribers past this lag
    /// drop events instead of stalling the pipeline.
    pub event_buffer: usize,
    pub sandbox: SandboxConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_debug_attempts: 3,
            confidence_threshold: 0.75,
            event_buffer: 256,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from the environment (a `.env` file is honored).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut settings = Self::default();

        if let Ok(v) = std::env::var("MAX_DEBUG_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                settings.max_debug_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("SANDBOX_TIMEOUT") {
            if let Ok(n) = v.parse() {
                settings.sandbox.timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SANDBOX_IMAGE") {
            settings.sandbox.image = v;
        }

        settings
    }
}

/// Resource and isolation limits for one sandbox invocation.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    /// Memory ceiling, e.g. "256m" or "1g".
    pub memory: String,
    /// CPU share, e.g. 0.5 cores.
    pub cpus: f64,
    /// Hard wall-clock timeout in seconds; the container is force-killed
    /// when it elapses.
    pub timeout_secs: u64,
    /// Whether outbound network is allowed. Integration tests need to reach
    /// real APIs, so this defaults to true.
    pub network: bool,
    /// Extra env vars injected verbatim, on top of the allow-listed ones.
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_SANDBOX_IMAGE.to_string(),
            memory: "256m".to_string(),
            cpus: 0.5,
            timeout_secs: 60,
            network: true,
            env: HashMap::new(),
        }
    }
}

/// Raw TOML structure for `sandbox.toml`.
#[derive(Debug, Deserialize)]
struct SandboxToml {
    sandbox: Option<SandboxSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    image: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
    timeout: Option<u64>,
    network: Option<bool>,
    env: Option<HashMap<String, String>>,
}

impl SandboxConfig {
    /// Load sandbox config from `sandbox.toml` in the given directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("sandbox.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let parsed: SandboxToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        if let Some(section) = parsed.sandbox {
            if let Some(image) = section.image {
                config.image = image;
            }
            if let Some(memory) = section.memory {
                config.memory = memory;
            }
            if let Some(cpus) = section.cpus {
                config.cpus = cpus;
            }
            if let Some(timeout) = section.timeout {
                config.timeout_secs = timeout;
            }
            if let Some(network) = section.network {
                config.network = network;
            }
            if let Some(env) = section.env {
                config.env = env;
            }
        }

        Ok(config)
    }

    /// Parse the memory string into bytes. Supports k/m/g suffixes.
    pub fn memory_bytes(&self) -> i64 {
        let s = self.memory.trim().to_lowercase();
        let (num, mult) = match s.chars().last() {
            Some('k') => (&s[..s.len() - 1], 1024i64),
            Some('m') => (&s[..s.len() - 1], 1024 * 1024),
            Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
            _ => (s.as_str(), 1),
        };
        num.parse::<i64>().unwrap_or(256) * mult
    }

    /// CPU share expressed in Docker nano-CPUs.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

/// Collect `KEY=value` pairs from the process environment whose names match
/// the credential allow-list. Everything else stays out of the sandbox.
pub fn allow_listed_env(extra: &HashMap<String, String>) -> Vec<String> {
    let mut env: Vec<String> = std::env::vars()
        .filter(|(key, _)| ENV_ALLOW_PREFIXES.iter().any(|p| key.starts_with(p)))
        .map(|(key, val)| format!("{}={}", key, val))
        .collect();
    for (key, val) in extra {
        env.push(format!("{}={}", key, val));
    }
    env.sort();
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_settings_defaults() {
        let s = Settings::default();
        assert_eq!(s.max_debug_attempts, 3);
        assert_eq!(s.confidence_threshold, 0.75);
        assert_eq!(s.sandbox.timeout_secs, 60);
        assert_eq!(s.sandbox.memory, "256m");
        assert_eq!(s.sandbox.cpus, 0.5);
        assert!(s.sandbox.network);
    }

    #[test]
    fn test_sandbox_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig::load(dir.path()).unwrap();
        assert_eq!(config.image, DEFAULT_SANDBOX_IMAGE);
        assert_eq!(config.memory, "256m");
    }

    #[test]
    fn test_sandbox_config_load_full() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sandbox.toml"),
            r#"
[sandbox]
image = "python:3.11-slim"
memory = "1g"
cpus = 2.0
timeout = 120
network = false

[sandbox.env]
PYTHONUNBUFFERED = "1"
"#,
        )
        .unwrap();

        let config = SandboxConfig::load(dir.path()).unwrap();
        assert_eq!(config.image, "python:3.11-slim");
        assert_eq!(config.memory, "1g");
        assert_eq!(config.cpus, 2.0);
        assert_eq!(config.timeout_secs, 120);
        assert!(!config.network);
        assert_eq!(config.env.get("PYTHONUNBUFFERED").unwrap(), "1");
    }

    #[test]
    fn test_sandbox_config_load_partial_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sandbox.toml"), "[sandbox]\nmemory = \"512m\"\n").unwrap();
        let config = SandboxConfig::load(dir.path()).unwrap();
        assert_eq!(config.memory, "512m");
        assert_eq!(config.cpus, 0.5);
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_sandbox_config_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sandbox.toml"), "not valid toml {{{{").unwrap();
        assert!(SandboxConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_memory_bytes_suffixes() {
        let mut c = SandboxConfig::default();
        assert_eq!(c.memory_bytes(), 256 * 1024 * 1024);
        c.memory = "1g".into();
        assert_eq!(c.memory_bytes(), 1024 * 1024 * 1024);
        c.memory = "64k".into();
        assert_eq!(c.memory_bytes(), 64 * 1024);
        c.memory = "1048576".into();
        assert_eq!(c.memory_bytes(), 1_048_576);
    }

    #[test]
    fn test_nano_cpus() {
        let c = SandboxConfig::default();
        assert_eq!(c.nano_cpus(), 500_000_000);
    }

    #[test]
    fn test_allow_listed_env_filters_prefixes() {
        // Only inspect behavior against the extra map to avoid mutating the
        // process environment in a threaded test runner.
        let mut extra = HashMap::new();
        extra.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        let env = allow_listed_env(&extra);
        assert!(env.contains(&"PYTHONUNBUFFERED=1".to_string()));
        for entry in &env {
            let key = entry.split('=').next().unwrap();
            let allowed = ENV_ALLOW_PREFIXES.iter().any(|p| key.starts_with(p))
                || key == "PYTHONUNBUFFERED";
            assert!(allowed, "unexpected env var leaked: {}", key);
        }
    }
}
