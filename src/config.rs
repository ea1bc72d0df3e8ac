use std::sync::LazyLock;
use std::time::Duration;

use shm_bus::control::RedactionMode;
use shm_bus::names::Namespace;

use crate::vision::SourceSelector;

pub struct RedactdConfig {
    pub namespace: Namespace,
    pub source: SourceSelector,
    /// Frame rate cap applied until the first command arrives.
    pub default_fps: u32,
    /// Slack subtracted from the gate interval so jittery arrivals just
    /// under the boundary are not rejected.
    pub gate_tolerance: Duration,
    pub default_mode: RedactionMode,
    /// Renderer waits for the detector's per-result signal.
    pub sync_detect_render: bool,
    /// How long the supervisor waits for each worker's readiness token
    /// before giving up on the launch.
    pub ready_timeout: Duration,
    /// Retry schedule used by the downstream stages while the upstream
    /// stage is still creating its channels.
    pub open_attempts: u32,
    pub open_backoff: Duration,
}

pub fn config() -> &'static RedactdConfig {
    static CONFIG: LazyLock<RedactdConfig> = LazyLock::new(|| RedactdConfig {
        namespace: Namespace::default(),
        source: SourceSelector::from_env(),
        default_fps: 30,
        gate_tolerance: Duration::from_millis(5),
        default_mode: RedactionMode::Fill,
        sync_detect_render: true,
        ready_timeout: Duration::from_secs(5),
        open_attempts: 50,
        open_backoff: Duration::from_millis(100),
    });
    &CONFIG
}
