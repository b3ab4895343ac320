use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::base::{data_dir, ConfigError, ConfigManager};
use crate::backends::streaming::StreamingConfig;
use crate::backends::subprocess::SubprocessConfig;
use crate::model::{BackendKind, ResourceLimits};
use crate::permission::{validate_limits, PolicySource, RunPolicy, ToolPolicy};

/// Shorthand for the streaming API key, checked after every other layer.
pub const API_KEY_ENV: &str = "CONDUIT_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_turns: u32,
    pub timeout_secs: u64,
    pub max_cost_usd: f64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            max_turns: limits.max_turns,
            timeout_secs: limits.timeout.as_secs(),
            max_cost_usd: limits.max_cost_usd,
        }
    }
}

impl From<&LimitSettings> for ResourceLimits {
    fn from(settings: &LimitSettings) -> Self {
        ResourceLimits {
            max_turns: settings.max_turns,
            timeout: Duration::from_secs(settings.timeout_secs),
            max_cost_usd: settings.max_cost_usd,
        }
    }
}

/// Everything the runtime reads from `config.yaml` and the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub primary_backend: BackendKind,
    pub fallback_enabled: bool,
    pub session_idle_timeout_secs: u64,
    pub sessions_dir: Option<PathBuf>,
    pub streaming: StreamingConfig,
    pub subprocess: SubprocessConfig,
    pub limits: LimitSettings,
    pub tools: ToolPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            primary_backend: BackendKind::Streaming,
            fallback_enabled: true,
            session_idle_timeout_secs: 24 * 60 * 60,
            sessions_dir: None,
            streaming: StreamingConfig::default(),
            subprocess: SubprocessConfig::default(),
            limits: LimitSettings::default(),
            tools: ToolPolicy::default(),
        }
    }
}

impl Settings {
    /// Loads and validates settings from every layer of `manager`.
    pub fn load(manager: &ConfigManager) -> Result<Self, ConfigError> {
        let mut settings: Settings = manager.load(&Settings::default())?;
        if let Ok(key) = env::var(API_KEY_ENV) {
            if !key.is_empty() {
                settings.streaming.api_key = Some(key);
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_limits(&self.resource_limits())?;
        self.tools.validate()?;
        if self.session_idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "session_idle_timeout_secs must be at least 1".into(),
            ));
        }
        self.streaming.validate()?;
        self.subprocess.validate()?;
        Ok(())
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::from(&self.limits)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    /// The configured sessions directory, or `<data dir>/sessions`.
    pub fn sessions_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.sessions_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("sessions")),
        }
    }

    /// The backend used when the primary hits a structural fault.
    pub fn fallback_backend(&self) -> Option<BackendKind> {
        if !self.fallback_enabled {
            return None;
        }
        match self.primary_backend {
            BackendKind::Streaming => Some(BackendKind::Subprocess),
            BackendKind::Subprocess => None,
        }
    }
}

impl PolicySource for Settings {
    fn snapshot(&self) -> Result<RunPolicy, ConfigError> {
        let limits = self.resource_limits();
        validate_limits(&limits)?;
        Ok(RunPolicy {
            tools: self.tools.clone(),
            limits,
        })
    }
}
