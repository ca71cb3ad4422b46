use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::elo::EloConfig;
use crate::quality::QualityConfig;
use crate::rate_limit::RetryPolicy;

const ENV_PREFIX: &str = "RALLY_ELO_";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub elo: EloSettings,
    pub pipeline: PipelineSettings,
    pub storage: StorageSettings,
    pub quality: QualitySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub rate_limit_delay_seconds: f64,
    pub max_retries: u32,
    pub retry_backoff_base: f64,
    pub request_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.fivb.org/vis/api".to_string(),
            rate_limit_delay_seconds: 0.5,
            max_retries: 3,
            retry_backoff_base: 2.0,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EloSettings {
    pub base_rating: f64,
    pub k_factor: f64,
}

impl Default for EloSettings {
    fn default() -> Self {
        Self {
            base_rating: 1500.0,
            k_factor: 20.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub rolling_window_days: u32,
    pub backfill_window_days: u32,
    pub views_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            rolling_window_days: 365,
            backfill_window_days: 3650,
            views_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub lake_root: PathBuf,
    pub warehouse_path: PathBuf,
    pub state_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            lake_root: PathBuf::from("data/lake"),
            warehouse_path: PathBuf::from("data/warehouse.sqlite"),
            state_path: PathBuf::from("data/pipeline_state.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub fail_on_critical: bool,
    pub max_orphan_ratio: f64,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            fail_on_critical: true,
            max_orphan_ratio: 0.05,
        }
    }
}

impl Settings {
    /// Loads `.env` files, then the optional TOML file, then `RALLY_ELO_*`
    /// overrides, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::from_filename(".env");

        let mut settings = match path {
            Some(path) => Settings::from_toml_file(path)?,
            None => Settings::default(),
        };
        settings.apply_env(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_file(path: &Path) -> Result<Settings> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read settings file {}", path.display()))?;
        toml::from_str::<Settings>(&raw)
            .with_context(|| format!("parse settings file {}", path.display()))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {ENV_PREFIX}{key}={raw}: {e}"))
        }

        if let Some(v) = lookup("API_BASE_URL") {
            self.api.base_url = v.trim().to_string();
        }
        if let Some(v) = lookup("API_RATE_LIMIT_DELAY_SECONDS") {
            self.api.rate_limit_delay_seconds = parsed("API_RATE_LIMIT_DELAY_SECONDS", v)?;
        }
        if let Some(v) = lookup("API_MAX_RETRIES") {
            self.api.max_retries = parsed("API_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("API_RETRY_BACKOFF_BASE") {
            self.api.retry_backoff_base = parsed("API_RETRY_BACKOFF_BASE", v)?;
        }
        if let Some(v) = lookup("API_REQUEST_TIMEOUT_SECS") {
            self.api.request_timeout_secs = parsed("API_REQUEST_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("ELO_BASE_RATING") {
            self.elo.base_rating = parsed("ELO_BASE_RATING", v)?;
        }
        if let Some(v) = lookup("ELO_K_FACTOR") {
            self.elo.k_factor = parsed("ELO_K_FACTOR", v)?;
        }
        if let Some(v) = lookup("PIPELINE_ROLLING_WINDOW_DAYS") {
            self.pipeline.rolling_window_days = parsed("PIPELINE_ROLLING_WINDOW_DAYS", v)?;
        }
        if let Some(v) = lookup("PIPELINE_BACKFILL_WINDOW_DAYS") {
            self.pipeline.backfill_window_days = parsed("PIPELINE_BACKFILL_WINDOW_DAYS", v)?;
        }
        if let Some(v) = lookup("PIPELINE_VIEWS_DIR") {
            // Empty disables views.
            self.pipeline.views_dir = Some(v.trim())
                .filter(|d| !d.is_empty())
                .map(PathBuf::from);
        }
        if let Some(v) = lookup("STORAGE_LAKE_ROOT") {
            self.storage.lake_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("STORAGE_WAREHOUSE_PATH") {
            self.storage.warehouse_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("STORAGE_STATE_PATH") {
            self.storage.state_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUALITY_FAIL_ON_CRITICAL") {
            self.quality.fail_on_critical = parsed("QUALITY_FAIL_ON_CRITICAL", v)?;
        }
        if let Some(v) = lookup("QUALITY_MAX_ORPHAN_RATIO") {
            self.quality.max_orphan_ratio = parsed("QUALITY_MAX_ORPHAN_RATIO", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let api = &self.api;
        if api.base_url.trim().is_empty() {
            bail!("api.base_url must not be empty");
        }
        if api.max_retries == 0 {
            bail!("api.max_retries must be at least 1");
        }
        if !api.rate_limit_delay_seconds.is_finite() || api.rate_limit_delay_seconds < 0.0 {
            bail!("api.rate_limit_delay_seconds must be a non-negative number");
        }
        if !api.retry_backoff_base.is_finite() || api.retry_backoff_base < 1.0 {
            bail!("api.retry_backoff_base must be >= 1");
        }
        if !(self.elo.k_factor.is_finite() && self.elo.k_factor > 0.0) {
            bail!("elo.k_factor must be positive");
        }
        if !(self.elo.base_rating.is_finite() && self.elo.base_rating > 0.0) {
            bail!("elo.base_rating must be positive");
        }
        if self.pipeline.rolling_window_days == 0 || self.pipeline.backfill_window_days == 0 {
            bail!("pipeline window sizes must be at least one day");
        }
        if !(0.0..=1.0).contains(&self.quality.max_orphan_ratio) {
            bail!("quality.max_orphan_ratio must be within [0, 1]");
        }
        for (name, path) in [
            ("storage.lake_root", &self.storage.lake_root),
            ("storage.warehouse_path", &self.storage.warehouse_path),
            ("storage.state_path", &self.storage.state_path),
        ] {
            if path.as_os_str().is_empty() {
                bail!("{name} must not be empty");
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.api.max_retries,
            backoff_base: self.api.retry_backoff_base,
            backoff_unit: Duration::from_secs(1),
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(self.api.rate_limit_delay_seconds)
    }

    pub fn elo_config(&self) -> EloConfig {
        EloConfig {
            base_rating: self.elo.base_rating,
            k_factor: self.elo.k_factor,
        }
    }

    pub fn quality_config(&self) -> QualityConfig {
        QualityConfig::staging_defaults(self.quality.fail_on_critical, self.quality.max_orphan_ratio)
    }

    pub fn window_days(&self, backfill: bool) -> u32 {
        if backfill {
            self.pipeline.backfill_window_days
        } else {
            self.pipeline.rolling_window_days
        }
    }
}
