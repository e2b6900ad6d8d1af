//! Engine configuration.
//!
//! Configuration is built once at process start and handed to
//! [`crate::engine::CheckpointingQueryEngine::new`]; nothing here is
//! global. Every field has a default so partial JSON documents work.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::engine::entity::Uri;
use crate::engine::mitigation::Mitigation;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::ResultExt;
use crate::recovery::CheckpointKind;
use crate::scheduler::task::ACTION_TASK_PRIORITY;
use crate::scheduler::task::DEFAULT_BATCH_SIZE;
use crate::scheduler::task::ITEM_TASK_PRIORITY;

/// Environment variable overriding [`EngineConfig::log_level`].
pub const LOG_LEVEL_ENV: &str = "RXQE_LOG_LEVEL";

/// Environment variable overriding [`EngineConfig::uri`].
pub const ENGINE_URI_ENV: &str = "RXQE_ENGINE_URI";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Items per quantum for item-processing tasks.
    pub batch_size: usize,
    pub action_priority: u32,
    pub item_priority: u32,
    /// How long an idle worker thread parks before checking again.
    pub cooldown_ms: u64,
}

impl SchedulerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            action_priority: ACTION_TASK_PRIORITY,
            item_priority: ITEM_TASK_PRIORITY,
            cooldown_ms: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Mitigation proposed to load-failure handlers.
    pub default_mitigation: Mitigation,
    /// Kind requested from stores that let the engine choose.
    pub checkpoint_kind: CheckpointKind,
    /// SQLite file for the checkpoint store, if persistent.
    pub db_path: Option<PathBuf>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_mitigation: Mitigation::Ignore,
            checkpoint_kind: CheckpointKind::Full,
            db_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub uri: Uri,
    pub log_level: Option<String>,
    pub scheduler: SchedulerConfig,
    pub recovery: RecoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            uri: Uri::new("qe://engine/default"),
            log_level: None,
            scheduler: SchedulerConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_uri(mut self, uri: impl Into<Uri>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json).reraise("error parsing engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|err| EngineError::Config(format!("can't read {path:?}: {err}")))?;
        Self::from_json_str(&json)
    }

    /// Apply `RXQE_*` environment variables on top of this config.
    pub fn with_env_overrides(self) -> EngineResult<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        if let Some(level) = var(LOG_LEVEL_ENV) {
            self.log_level = Some(level);
        }
        if let Some(uri) = var(ENGINE_URI_ENV) {
            self.uri = Uri::new(uri);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.uri.as_str().is_empty() {
            return Err(EngineError::Config("engine uri must not be empty".to_owned()));
        }
        if self.scheduler.batch_size == 0 {
            return Err(EngineError::Config(
                "scheduler batch_size must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[test]
fn partial_json_uses_defaults() {
    let config = EngineConfig::from_json_str(
        r#"{"uri": "qe://engine/1", "scheduler": {"batch_size": 16}}"#,
    )
    .unwrap();
    assert_eq!(config.uri, Uri::new("qe://engine/1"));
    assert_eq!(config.scheduler.batch_size, 16);
    assert_eq!(config.scheduler.item_priority, ITEM_TASK_PRIORITY);
    assert_eq!(config.recovery.default_mitigation, Mitigation::Ignore);
    assert_eq!(config.scheduler.cooldown(), Duration::from_millis(1));
}

#[test]
fn zero_batch_size_is_rejected() {
    let err = EngineConfig::from_json_str(r#"{"scheduler": {"batch_size": 0}}"#).unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[test]
fn overrides_apply() {
    let config = EngineConfig::default()
        .with_overrides(|name| match name {
            LOG_LEVEL_ENV => Some("debug".to_owned()),
            ENGINE_URI_ENV => Some("qe://engine/env".to_owned()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.log_level.as_deref(), Some("debug"));
    assert_eq!(config.uri, Uri::new("qe://engine/env"));
}

#[test]
fn mitigation_parses_from_json() {
    let config =
        EngineConfig::from_json_str(r#"{"recovery": {"default_mitigation": "regenerate"}}"#)
            .unwrap();
    assert_eq!(config.recovery.default_mitigation, Mitigation::Regenerate);
}
