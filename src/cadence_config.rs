//! Unified configuration system for Cadence.
//!
//! Reads from `.cadence/cadence.toml` with sensible defaults for every
//! section and environment-variable overrides layered on top
//! (file → environment).
//!
//! # Configuration File Format
//!
//! ```toml
//! [defaults]
//! max_retries = 3
//! approval_mode = "auto"
//! approval_timeout_secs = 0     # 0 waits indefinitely
//!
//! [export]
//! enabled = true
//!
//! [queue.normal]
//! concurrency = 4
//! rate_limit = { max_jobs = 20, window_secs = 60 }
//!
//! [queue.elevated]
//! concurrency = 2
//!
//! [queue.commit]
//! concurrency = 1               # must stay 1; the loader rejects anything else
//!
//! [queue.retry]
//! max_retries = 3
//! base_delay_secs = 5
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::queue::{LaneConfig, QueueConfig, RetryPolicy};
use crate::task::ApprovalMode;

pub const CONFIG_DIR: &str = ".cadence";
pub const CONFIG_FILE: &str = "cadence.toml";

/// Default settings for orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// In-process phase retry budget (attempts per phase invocation).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// Deadline for approval waits in seconds; 0 waits indefinitely.
    #[serde(default)]
    pub approval_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            approval_mode: ApprovalMode::default(),
            approval_timeout_secs: 0,
        }
    }
}

/// ML-export section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_enabled")]
    pub enabled: bool,
}

fn default_export_enabled() -> bool {
    true
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: default_export_enabled(),
        }
    }
}

/// Rate limit in file form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSection {
    pub max_jobs: u32,
    pub window_secs: u64,
}

/// One lane's settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneSection {
    pub concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSection>,
    /// Stall timeout in seconds; 0 disables stall detection.
    #[serde(default)]
    pub stall_timeout_secs: u64,
}

impl LaneSection {
    fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            rate_limit: None,
            stall_timeout_secs: 0,
        }
    }
}

/// Queue-level retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_queue_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
}

fn default_queue_retries() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    5
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_queue_retries(),
            base_delay_secs: default_base_delay_secs(),
        }
    }
}

/// Queue section: one entry per lane plus the shared retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_normal_lane")]
    pub normal: LaneSection,
    #[serde(default = "default_elevated_lane")]
    pub elevated: LaneSection,
    #[serde(default = "default_commit_lane")]
    pub commit: LaneSection,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_normal_lane() -> LaneSection {
    LaneSection::with_concurrency(4)
}

fn default_elevated_lane() -> LaneSection {
    LaneSection::with_concurrency(2)
}

fn default_commit_lane() -> LaneSection {
    LaneSection::with_concurrency(1)
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            normal: default_normal_lane(),
            elevated: default_elevated_lane(),
            commit: default_commit_lane(),
            retry: RetrySection::default(),
        }
    }
}

/// The full configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub queue: QueueSection,
}

impl CadenceConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CadenceConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<project_dir>/.cadence/cadence.toml` if present, otherwise
    /// defaults. Environment overrides apply either way.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Layer environment variables over the file values.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("CADENCE_MAX_RETRIES")
            && let Ok(parsed) = value.parse::<u32>()
        {
            self.defaults.max_retries = parsed;
        }
        if let Ok(value) = std::env::var("CADENCE_APPROVAL_MODE")
            && let Ok(parsed) = value.parse::<ApprovalMode>()
        {
            self.defaults.approval_mode = parsed;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.commit.concurrency != 1 {
            anyhow::bail!(
                "queue.commit.concurrency must be 1 (got {}): commit operations on a checkout do not tolerate concurrency",
                self.queue.commit.concurrency
            );
        }
        if self.defaults.max_retries == 0 {
            anyhow::bail!("defaults.max_retries must be at least 1");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.queue.retry.max_retries,
            Duration::from_secs(self.queue.retry.base_delay_secs),
        )
    }

    /// Approval deadline, `None` when unset (wait indefinitely).
    pub fn approval_timeout(&self) -> Option<Duration> {
        match self.defaults.approval_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Materialize the queue configuration.
    pub fn queue_config(&self) -> QueueConfig {
        let retry = self.retry_policy();
        let lane = |base: LaneConfig, section: &LaneSection| {
            let mut lane = base.with_concurrency(section.concurrency).with_retry(retry);
            if let Some(limit) = section.rate_limit {
                lane = lane.with_rate_limit(limit.max_jobs, Duration::from_secs(limit.window_secs));
            }
            if section.stall_timeout_secs > 0 {
                lane = lane.with_stall_timeout(Duration::from_secs(section.stall_timeout_secs));
            }
            lane
        };
        QueueConfig {
            lanes: vec![
                lane(LaneConfig::normal(), &self.queue.normal),
                lane(LaneConfig::elevated(), &self.queue.elevated),
                lane(LaneConfig::commit(), &self.queue.commit),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    use crate::queue::LaneKind;

    #[test]
    fn test_defaults() {
        let config = CadenceConfig::default();
        assert_eq!(config.defaults.max_retries, 3);
        assert_eq!(config.defaults.approval_mode, ApprovalMode::Auto);
        assert!(config.approval_timeout().is_none());
        assert!(config.export.enabled);
        assert_eq!(config.queue.normal.concurrency, 4);
        assert_eq!(config.queue.elevated.concurrency, 2);
        assert_eq!(config.queue.commit.concurrency, 1);
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(3, Duration::from_secs(5))
        );
    }

    #[test]
    fn test_load_full_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        fs::write(
            &path,
            r#"
[defaults]
max_retries = 5
approval_mode = "manual"
approval_timeout_secs = 120

[export]
enabled = false

[queue.normal]
concurrency = 8
rate_limit = { max_jobs = 10, window_secs = 30 }
stall_timeout_secs = 600

[queue.retry]
max_retries = 2
base_delay_secs = 1
"#,
        )
        .unwrap();

        let config = CadenceConfig::load(&path).unwrap();
        assert_eq!(config.defaults.max_retries, 5);
        assert_eq!(config.defaults.approval_mode, ApprovalMode::Manual);
        assert_eq!(config.approval_timeout(), Some(Duration::from_secs(120)));
        assert!(!config.export.enabled);
        assert_eq!(config.queue.normal.concurrency, 8);
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(2, Duration::from_secs(1))
        );

        let queue = config.queue_config();
        let normal = queue
            .lanes
            .iter()
            .find(|l| l.kind == LaneKind::Normal)
            .unwrap();
        assert_eq!(normal.concurrency, 8);
        assert!(normal.rate_limit.is_some());
        assert_eq!(normal.stall_timeout, Some(Duration::from_secs(600)));
        // Unspecified sections keep their defaults.
        let commit = queue
            .lanes
            .iter()
            .find(|l| l.kind == LaneKind::Commit)
            .unwrap();
        assert_eq!(commit.concurrency, 1);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        fs::write(&path, "defaults = nonsense").unwrap();
        let err = CadenceConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_commit_lane_concurrency_is_pinned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        fs::write(&path, "[queue.commit]\nconcurrency = 4\n").unwrap();
        let err = CadenceConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("queue.commit.concurrency"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = CadenceConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.defaults.max_retries, 3);
    }

    #[test]
    fn test_load_or_default_reads_project_config() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join(CONFIG_FILE),
            "[defaults]\nmax_retries = 7\n",
        )
        .unwrap();
        let config = CadenceConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.defaults.max_retries, 7);
    }

    #[test]
    fn test_zero_phase_retries_rejected() {
        let config = CadenceConfig {
            defaults: DefaultsConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
