use anyhow::{Context, anyhow, ensure};
use harvest_core::TraversalConfig;
use harvest_core::schedule::install_default_retry_delay;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Path to a TOML or JSON settings file.
pub const CONFIG_PATH_ENV: &str = "HARVEST_CONFIG_PATH";
/// Inline JSON settings.
pub const CONFIG_JSON_ENV: &str = "HARVEST_CONFIG_JSON";

const DEFAULT_CANDIDATES: &[&str] = &["harvest.toml", "harvest.json", "config/harvest.toml"];

/// Where the settings came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HarvestSettingsSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Process-level settings for a Harvest deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HarvestSettings {
    /// Scheduler, pool and batch tuning.
    pub traversal: TraversalConfig,
    /// JSON file holding checkpoints, schedules and generations. Connector
    /// state is kept in memory when unset.
    pub state_path: Option<PathBuf>,
}

impl HarvestSettings {
    /// Load settings using environment variables.
    /// Evaluation order:
    /// 1) `$HARVEST_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$HARVEST_CONFIG_JSON` (inline JSON),
    /// 3) the first default file found in the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, HarvestSettingsSource)> {
        Self::load_from_sources(
            env::var(CONFIG_PATH_ENV).ok(),
            env::var(CONFIG_JSON_ENV).ok(),
            Path::new("."),
        )
    }

    /// Same resolution as [`HarvestSettings::load_from_env`] with the
    /// variables passed in and default files looked up under `search_root`.
    pub fn load_from_sources(
        config_path: Option<String>,
        inline_json: Option<String>,
        search_root: &Path,
    ) -> anyhow::Result<(Self, HarvestSettingsSource)> {
        if let Some(path_str) = config_path
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let settings = Self::load_from_file(&path)?;
            return Ok((settings, HarvestSettingsSource::EnvPath(path)));
        }

        if let Some(raw) = inline_json
            && !raw.trim().is_empty()
        {
            let parsed =
                Self::parse_json(&raw).with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((parsed, HarvestSettingsSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(search_root) {
            let settings = Self::load_from_file(&path)?;
            return Ok((settings, HarvestSettingsSource::File(path)));
        }

        Ok((Self::default(), HarvestSettingsSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read harvest settings from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid harvest settings {}", path.display())),
            Some("toml") | Some("tml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid harvest settings {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // TOML first, then JSON.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse harvest settings {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid harvest settings json: {err}"))
    }

    fn find_default_file(search_root: &Path) -> Option<PathBuf> {
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| search_root.join(candidate))
            .find(|path| path.exists())
    }

    /// Rejects settings the scheduler cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let traversal = &self.traversal;
        ensure!(
            traversal.worker_pool_size > 0,
            "traversal.worker_pool_size must be at least 1"
        );
        ensure!(
            traversal.tick_interval_ms > 0,
            "traversal.tick_interval_ms must be positive"
        );
        ensure!(
            traversal.max_batch_size > 0,
            "traversal.max_batch_size must be at least 1"
        );
        if let Some(path) = &self.state_path {
            ensure!(
                path.file_name().is_some(),
                "state_path {} does not name a file",
                path.display()
            );
        }
        Ok(())
    }

    /// Installs process-wide defaults derived from these settings. Must run
    /// before any schedule is parsed to take effect.
    pub fn apply_process_defaults(&self) {
        let delay = self.traversal.default_retry_delay();
        if install_default_retry_delay(delay) {
            tracing::debug!(
                retry_delay_ms = delay.as_millis() as u64,
                "installed default retry delay"
            );
        } else {
            tracing::debug!("default retry delay already resolved; keeping it");
        }
    }
}
