use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.dataforseo.com/v3/serp/google/organic/";
pub const DEFAULT_TOKEN_ENV: &str = "DATAFORSEO_BASIC";

/// Largest batch the provider accepts in one task_post call.
pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub provider: ProviderSettings,
    pub orchestrator: OrchestratorSettings,
    pub logging: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    /// Name of the environment variable holding the Basic auth token.
    pub token_env: String,
    pub target_domain: String,
    pub language_code: String,
    pub device: String,
    pub os: String,
    pub depth: u32,
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            base_url: DEFAULT_BASE_URL.to_string(),
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            target_domain: "aaacwildliferemoval.com".to_string(),
            language_code: "en".to_string(),
            device: "desktop".to_string(),
            os: "windows".to_string(),
            depth: 30,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub batch_size: usize,
    pub dwell_secs: u64,
    pub retry_rounds: u32,
    pub retry_interval_secs: u64,
    /// Cap on jobs handled per run, handy for trial runs. `None` processes everything.
    pub limit: Option<usize>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            batch_size: 100,
            dwell_secs: 300,
            retry_rounds: 8,
            retry_interval_secs: 30,
            limit: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn dwell(&self) -> Duration {
        Duration::from_secs(self.dwell_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings { level: "info".to_string() }
    }
}

impl Settings {
    /// Reads a TOML settings file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults.", path);
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(path)?;
        let settings = Self::from_toml(&content)?;
        info!("Loaded config from {:?}", path);
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.batch_size == 0 || o.batch_size > MAX_BATCH_SIZE {
            return Err(Error::configuration(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, o.batch_size
            )));
        }
        if o.limit == Some(0) {
            return Err(Error::configuration("limit must be positive when set"));
        }
        let p = &self.provider;
        if p.target_domain.trim().is_empty() {
            return Err(Error::configuration("provider.target_domain is empty"));
        }
        if p.token_env.trim().is_empty() {
            return Err(Error::configuration("provider.token_env is empty"));
        }
        url::Url::parse(&p.base_url).map_err(|e| {
            Error::configuration(format!("provider.base_url {:?} is invalid: {}", p.base_url, e))
        })?;
        Ok(())
    }

    /// Reads the provider token from the configured environment variable.
    pub fn auth_token(&self) -> Result<String> {
        let name = &self.provider.token_env;
        match env::var(name) {
            Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
            _ => Err(Error::configuration(format!(
                "provider token not found, set the {} environment variable",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_behaviour() {
        let s = Settings::default();
        assert_eq!(s.orchestrator.batch_size, 100);
        assert_eq!(s.orchestrator.dwell(), Duration::from_secs(300));
        assert_eq!(s.orchestrator.retry_rounds, 8);
        assert_eq!(s.orchestrator.retry_interval(), Duration::from_secs(30));
        assert_eq!(s.provider.depth, 30);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let s = Settings::from_toml(
            r#"
[orchestrator]
batch_size = 250
dwell_secs = 60

[provider]
target_domain = "example.com"
"#,
        )
        .unwrap();
        assert_eq!(s.orchestrator.batch_size, 250);
        assert_eq!(s.orchestrator.dwell_secs, 60);
        assert_eq!(s.orchestrator.retry_rounds, 8);
        assert_eq!(s.provider.target_domain, "example.com");
        assert_eq!(s.provider.device, "desktop");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Settings::from_toml("[orchestrator]\nbatch_size = 0\n"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Settings::from_toml("[provider]\ntarget_domain = \" \"\n"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(Settings::from_toml("[orchestrator\n"), Err(Error::Toml(_))));
    }

    #[test]
    fn missing_token_is_a_configuration_error() {
        let mut s = Settings::default();
        s.provider.token_env = "RANK_TRACKER_TEST_TOKEN_THAT_IS_NEVER_SET".to_string();
        assert!(matches!(s.auth_token(), Err(Error::Configuration(_))));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let s = Settings::load(Path::new("/nonexistent/rank_tracker.toml")).unwrap();
        assert_eq!(s, Settings::default());
    }
}
