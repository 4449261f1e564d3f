//! ActionTrack configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TrackerError};
use crate::types::{Entity, EntityKind};

/// Environment variable overriding `notifications.delay_secs`.
pub const DELAY_ENV: &str = "TASK_NOTIFICATION_DELAY";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub types: TypeRegistry,
}

impl TrackerConfig {
    /// Load config from the default path (~/.actiontrack/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TrackerError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Apply `TASK_NOTIFICATION_DELAY` if set to a valid number of seconds.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(DELAY_ENV) {
            self.notifications.apply_delay_override(&raw);
        }
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TrackerError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ActionTrack home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".actiontrack")
    }
}

/// Task notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Debounce window between the last change and the e-mail.
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

fn bool_true() -> bool { true }
fn default_delay_secs() -> u64 { 20 }

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: default_delay_secs(),
        }
    }
}

impl NotificationConfig {
    pub fn delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.delay_secs)
    }

    fn apply_delay_override(&mut self, raw: &str) {
        match raw.trim().parse::<u64>() {
            Ok(secs) => self.delay_secs = secs,
            Err(_) => tracing::warn!("⚠️ Ignoring invalid {DELAY_ENV}={raw:?}"),
        }
    }
}

/// Notification worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max jobs claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// A job left `running` this long is handed back to `pending`.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_poll_interval() -> u64 { 5 }
fn default_batch_size() -> usize { 50 }
fn default_db_path() -> String { "~/.actiontrack/actiontrack.db".into() }
fn default_lease_secs() -> u64 { 300 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            db_path: default_db_path(),
            lease_secs: default_lease_secs(),
        }
    }
}

/// Outgoing mail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// When false, mail goes to the in-memory outbox.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_smtp_port() -> u16 { 587 }
fn default_from_email() -> String { "no-reply@actiontrack.local".into() }
fn default_from_name() -> String { "ActionTrack".into() }

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_email: default_from_email(),
            from_name: default_from_name(),
        }
    }
}

/// Measure type (activity, task, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureTypeConfig {
    pub id: i64,
    pub title: String,
    /// Measures of this type take part in task notifications.
    #[serde(default)]
    pub notifications: bool,
    #[serde(default)]
    pub has_parent: bool,
    /// Measures of this type may target actors.
    #[serde(default)]
    pub has_target: bool,
}

/// Actor type (country, organisation, group, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorTypeConfig {
    pub id: i64,
    pub title: String,
    /// Actors of this type may be targeted by measures.
    #[serde(default)]
    pub is_target: bool,
}

/// Category taxonomy and the types it is enabled for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyConfig {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub actortype_ids: Vec<i64>,
    #[serde(default)]
    pub measuretype_ids: Vec<i64>,
}

/// Read-only type configuration.
///
/// Each list falls back to the stock one on its own, so a config that only
/// adds `[[types.taxonomies]]` keeps the stock measure and actor types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeRegistry {
    #[serde(default = "default_measure_types")]
    pub measure_types: Vec<MeasureTypeConfig>,
    #[serde(default = "default_actor_types")]
    pub actor_types: Vec<ActorTypeConfig>,
    #[serde(default)]
    pub taxonomies: Vec<TaxonomyConfig>,
}

/// Measure type id of tasks in the stock configuration.
pub const TASK_MEASURETYPE_ID: i64 = 5;

fn default_measure_types() -> Vec<MeasureTypeConfig> {
    vec![
        MeasureTypeConfig {
            id: 1,
            title: "Activity".into(),
            notifications: false,
            has_parent: true,
            has_target: true,
        },
        MeasureTypeConfig {
            id: TASK_MEASURETYPE_ID,
            title: "Task".into(),
            notifications: true,
            has_parent: true,
            has_target: false,
        },
    ]
}

fn default_actor_types() -> Vec<ActorTypeConfig> {
    vec![ActorTypeConfig {
        id: 1,
        title: "Country".into(),
        is_target: true,
    }]
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self {
            measure_types: default_measure_types(),
            actor_types: default_actor_types(),
            taxonomies: Vec::new(),
        }
    }
}

impl TypeRegistry {
    pub fn measure_type(&self, id: i64) -> Option<&MeasureTypeConfig> {
        self.measure_types.iter().find(|t| t.id == id)
    }

    pub fn actor_type(&self, id: i64) -> Option<&ActorTypeConfig> {
        self.actor_types.iter().find(|t| t.id == id)
    }

    pub fn taxonomy(&self, id: i64) -> Option<&TaxonomyConfig> {
        self.taxonomies.iter().find(|t| t.id == id)
    }

    /// Whether the entity's kind and type take part in task notifications.
    pub fn notifications_enabled(&self, entity: &Entity) -> bool {
        entity.kind == EntityKind::Measure
            && entity
                .type_id
                .and_then(|id| self.measure_type(id))
                .is_some_and(|t| t.notifications)
    }

    /// Human label for an entity's type, falling back to its kind.
    pub fn type_label(&self, entity: &Entity) -> String {
        let label = match (entity.kind, entity.type_id) {
            (EntityKind::Measure, Some(id)) => self.measure_type(id).map(|t| t.title.clone()),
            (EntityKind::Actor, Some(id)) => self.actor_type(id).map(|t| t.title.clone()),
            _ => None,
        };
        label.unwrap_or_else(|| entity.kind.to_string())
    }
}
