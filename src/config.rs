//! Service settings.
//!
//! Layered the same way at every startup: compiled-in defaults, then an
//! optional TOML file, then environment variables, then validation. The
//! resulting [`Settings`] is built once and handed to each component.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Environment variable naming the TOML settings file.
pub const CONFIG_ENV: &str = "JOBRUN_CONFIG";

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub title: String,
    pub version: String,
    /// Only affects defaults (CORS origins), never core behavior.
    pub runtime_env: RuntimeEnv,
    pub host: String,
    pub port: u16,
    /// Extra CORS origins; dev adds the local dashboard ports on top.
    pub cors_origin_list: Vec<String>,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    /// File the settings were read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            title: "jobrun".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_env: RuntimeEnv::Dev,
            host: "0.0.0.0".to_string(),
            port: 9090,
            cors_origin_list: Vec::new(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
            source: None,
        }
    }
}

impl Settings {
    /// Parse settings from a TOML file, without env overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        let mut settings: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse settings file: {}", path.display()))?;
        settings.source = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Build the effective settings.
    ///
    /// `path` wins over `JOBRUN_CONFIG`; with neither, compiled-in defaults
    /// are the base. Environment overrides are applied on top, then the
    /// result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let mut settings = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RUNTIME_ENV") {
            self.runtime_env = v.parse()?;
        }
        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.port = v.parse().with_context(|| format!("invalid PORT: {v}"))?;
        }

        let db = &mut self.database;
        if let Some(v) = lookup("DB_DRIVER") {
            db.driver = v;
        }
        for (key, slot) in [
            ("DB_HOST", &mut db.host),
            ("DB_PORT", &mut db.port),
            ("DB_USER", &mut db.user),
            ("DB_PASS", &mut db.pass),
            ("DB_SCHEMA", &mut db.schema),
        ] {
            if let Some(v) = lookup(key) {
                *slot = Some(v);
            }
        }
        if let Some(v) = lookup("DB_PATH") {
            db.path = Some(PathBuf::from(v));
        }

        if let Some(v) = lookup("SCHEDULER_INTERVAL_SECS") {
            self.scheduler.interval_secs = v
                .parse()
                .with_context(|| format!("invalid SCHEDULER_INTERVAL_SECS: {v}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be greater than zero");
        }
        if self.database.pool_size < 2 {
            // One connection is pinned by the background scope for the
            // process lifetime.
            bail!("database.pool_size must be at least 2");
        }
        if self.database.acquire_timeout_ms == 0 {
            bail!("database.acquire_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// Log where the settings came from and any fallback taken while
    /// resolving them. Called once, after the subscriber is installed.
    pub fn log_effective(&self) {
        match &self.source {
            Some(path) => info!(path = %path.display(), env = %self.runtime_env, "Loaded settings file"),
            None => info!(env = %self.runtime_env, "Using built-in settings"),
        }
        if self.database.falls_back_to_memory() {
            warn!(driver = %self.database.driver, "No database provided, using in-memory sqlite");
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// CORS origins including the runtime-env defaults.
    pub fn cors_origins(&self) -> Vec<String> {
        let mut origins = self.cors_origin_list.clone();
        if self.runtime_env == RuntimeEnv::Dev {
            // Dashboard (9095) and a local web frontend (3000).
            for dev in ["http://localhost:9095", "http://localhost:3000"] {
                if !origins.iter().any(|o| o == dev) {
                    origins.push(dev.to_string());
                }
            }
        }
        origins
    }

    /// Settings rendered as TOML with the database password masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut copy = self.clone();
        if copy.database.pass.is_some() {
            copy.database.pass = Some("********".to_string());
        }
        Ok(toml::to_string_pretty(&copy)?)
    }
}

// ---------------------------------------------------------------------------
// Runtime environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnv {
    Dev,
    Stg,
    Prd,
}

impl fmt::Display for RuntimeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuntimeEnv::Dev => "dev",
            RuntimeEnv::Stg => "stg",
            RuntimeEnv::Prd => "prd",
        })
    }
}

impl FromStr for RuntimeEnv {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(RuntimeEnv::Dev),
            "stg" => Ok(RuntimeEnv::Stg),
            "prd" => Ok(RuntimeEnv::Prd),
            other => bail!("invalid runtime_env: {other} (expected dev, stg or prd)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: String,
    pub host: Option<String>,
    pub port: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub schema: Option<String>,
    /// Database file for the `sqlite` driver. Unset means in-memory.
    pub path: Option<PathBuf>,
    /// Maximum pooled connections, shared by request and background scopes.
    pub pool_size: u32,
    /// How long an acquisition may wait for a free connection.
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            host: None,
            port: None,
            user: None,
            pass: None,
            schema: None,
            path: None,
            pool_size: 8,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    /// Render the connection URI.
    ///
    /// Network drivers need host, port, user and schema; if any is missing
    /// the in-memory `sqlite://` URI is returned instead.
    pub fn uri(&self) -> String {
        if self.driver == "sqlite" {
            return match &self.path {
                Some(p) => format!("sqlite://{}", p.display()),
                None => "sqlite://".to_string(),
            };
        }

        match (&self.host, &self.port, &self.user, &self.schema) {
            (Some(host), Some(port), Some(user), Some(schema)) => {
                let pass = self
                    .pass
                    .as_deref()
                    .map(|p| format!(":{p}"))
                    .unwrap_or_default();
                format!("{}://{user}{pass}@{host}:{port}/{schema}", self.driver)
            }
            _ => "sqlite://".to_string(),
        }
    }

    /// A non-sqlite driver without a complete address.
    pub fn falls_back_to_memory(&self) -> bool {
        self.driver != "sqlite"
            && (self.host.is_none()
                || self.port.is_none()
                || self.user.is_none()
                || self.schema.is_none())
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// How long an in-flight invocation may run after shutdown before it
    /// is aborted.
    pub shutdown_grace_secs: u64,
    /// Job names dispatched on every tick.
    pub jobs: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            shutdown_grace_secs: 10,
            jobs: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
