use std::path::{Path, PathBuf};
use std::time::Duration;

use delay_queue::{DEFAULT_QUEUE_NAME, RetryPolicy, SchedulerConfig};
use lifecycle::{ControllerConfig, ProviderConfig};
use sandbox_daytona::{DEFAULT_API_URL, DaytonaConfig};
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, DaemonResult};

pub(crate) const DEFAULT_RECORDS_DIR: &str = "records";

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub records: RecordsSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Memory,
    Daytona,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub kind: ProviderKind,
    pub api_url: String,
    /// Falls back to `DAYTONA_API_KEY` when empty.
    pub api_key: String,
    pub target: Option<String>,
    pub default_template: Option<String>,
    pub request_timeout_secs: u64,
    pub ready_timeout_secs: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Memory,
            api_url: DEFAULT_API_URL.to_string(),
            api_key: String::new(),
            target: None,
            default_template: None,
            request_timeout_secs: 60,
            ready_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub kind: QueueKind,
    /// Falls back to `REDIS_URL` when unset.
    pub url: Option<String>,
    pub name: String,
    pub max_retries: u32,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub retry_base_delay_secs: u64,
    pub claim_lease_secs: u64,
    pub store_attempts: u32,
}

impl Default for QueueSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            kind: QueueKind::Memory,
            url: None,
            name: DEFAULT_QUEUE_NAME.to_string(),
            max_retries: defaults.max_retries,
            batch_size: defaults.batch_size,
            poll_interval_ms: millis(defaults.poll_interval),
            error_backoff_ms: millis(defaults.error_backoff),
            retry_base_delay_secs: defaults.retry_base_delay.as_secs(),
            claim_lease_secs: defaults.claim_lease.as_secs(),
            store_attempts: defaults.store_retry.attempts,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordsKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsSection {
    pub kind: RecordsKind,
    /// Record directory for the file store; defaults to `records` next to
    /// the config file.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub idle_timeout_secs: u64,
    pub pause_buffer_secs: u64,
    pub rearm_on_activity: bool,
    /// Shared flock directory. Defaults to `<records dir>/locks` for the
    /// file store, in-process locking otherwise.
    pub lock_dir: Option<PathBuf>,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        let defaults = ControllerConfig::default();
        Self {
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            pause_buffer_secs: defaults.pause_buffer.as_secs(),
            rearm_on_activity: defaults.rearm_on_activity,
            lock_dir: None,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Load a daemon config from a YAML file.
///
/// Relative paths are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> DaemonResult<DaemonConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DaemonError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: DaemonConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| DaemonError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}

impl DaemonConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        if self.records.kind == RecordsKind::File {
            resolve(
                self.records
                    .dir
                    .get_or_insert_with(|| PathBuf::from(DEFAULT_RECORDS_DIR)),
            );
        }
        if let Some(dir) = &mut self.lifecycle.lock_dir {
            resolve(dir);
        }
    }

    /// Fill secrets the file left empty from the environment-backed CLI flags.
    pub fn apply_overrides(&mut self, api_key: Option<String>, redis_url: Option<String>) {
        if self.provider.api_key.is_empty()
            && let Some(key) = api_key
        {
            self.provider.api_key = key;
        }
        if self.queue.url.is_none() {
            self.queue.url = redis_url;
        }
    }

    pub fn provider_config(&self) -> DaemonResult<ProviderConfig> {
        let p = &self.provider;
        match p.kind {
            ProviderKind::Memory => Ok(ProviderConfig::Memory),
            ProviderKind::Daytona => {
                if p.api_key.is_empty() {
                    return Err(DaemonError::Config(
                        "provider.api_key (or DAYTONA_API_KEY) is required for daytona".into(),
                    ));
                }
                let mut config = DaytonaConfig::new(p.api_key.clone());
                config.api_url = p.api_url.trim_end_matches('/').to_string();
                config.target = p.target.clone();
                config.default_template = p.default_template.clone();
                config.request_timeout = Duration::from_secs(p.request_timeout_secs);
                config.ready_timeout = Duration::from_secs(p.ready_timeout_secs);
                Ok(ProviderConfig::Daytona(config))
            }
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let q = &self.queue;
        SchedulerConfig {
            queue_name: q.name.clone(),
            max_retries: q.max_retries,
            batch_size: q.batch_size,
            poll_interval: Duration::from_millis(q.poll_interval_ms),
            error_backoff: Duration::from_millis(q.error_backoff_ms),
            retry_base_delay: Duration::from_secs(q.retry_base_delay_secs),
            claim_lease: Duration::from_secs(q.claim_lease_secs),
            store_retry: RetryPolicy {
                attempts: q.store_attempts.max(1),
                ..RetryPolicy::default()
            },
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let l = &self.lifecycle;
        let lock_dir = l.lock_dir.clone().or_else(|| match self.records.kind {
            RecordsKind::File => self.records.dir.as_ref().map(|d| d.join("locks")),
            RecordsKind::Memory => None,
        });
        ControllerConfig {
            idle_timeout: Duration::from_secs(l.idle_timeout_secs),
            pause_buffer: Duration::from_secs(l.pause_buffer_secs),
            rearm_on_activity: l.rearm_on_activity,
            lock_dir,
        }
    }

    pub fn redis_url(&self) -> DaemonResult<&str> {
        self.queue
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DaemonError::Config("queue.url (or REDIS_URL) is required for redis".into()))
    }
}
