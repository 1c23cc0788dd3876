use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Inactivity after which a sandbox is paused.
    pub idle_timeout: Duration,
    /// Extra time the provider's native timer waits past `idle_timeout`, so
    /// the scheduled pause normally wins and the native timer is a backstop.
    pub pause_buffer: Duration,
    /// Re-arm the idle timeout every time a sandbox is used.
    pub rearm_on_activity: bool,
    /// Directory for cross-process per-sandbox flocks. `None` locks in
    /// process only.
    pub lock_dir: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            pause_buffer: Duration::from_secs(5 * 60),
            rearm_on_activity: true,
            lock_dir: None,
        }
    }
}
