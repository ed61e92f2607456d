use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub health: HealthConfig,
    pub bot: BotConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub ffmpeg_binary: String,
    /// Scheduler tick, drives the retention sweep.
    pub supervisor_interval_ms: u64,

    /// Application log and per-job diagnostic files.
    /// Must be writable by the (non-root) service account.
    pub logs_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            supervisor_interval_ms: 1000,
            logs_dir: "logs".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Jobs allowed to run at the same time; the rest wait in FIFO order.
    pub max_concurrent: usize,
    /// Pending jobs allowed before submissions are rejected.
    pub max_queue: usize,
    /// Hard wall-clock limit per job.
    pub job_timeout_sec: u64,
    /// Time FFmpeg gets to quit after `q` before it is killed.
    pub stop_grace_sec: u64,
    /// Stderr lines kept per job.
    pub diagnostic_lines: usize,
    /// How long terminal jobs stay queryable.
    pub retention_sec: u64,
    /// Spawning is refused below this much available memory (KB).
    pub min_free_memory_kb: u64,
    /// Cap on file outputs, passed to FFmpeg as `-fs`.
    pub max_output_size_mb: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_queue: 8,
            job_timeout_sec: 6 * 60 * 60,
            stop_grace_sec: 5,
            diagnostic_lines: 50,
            retention_sec: 60 * 60,
            min_free_memory_kb: 5120,
            max_output_size_mb: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_sec)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_sec)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_sec)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    /// Automatic restarts of a failed job (0 disables restarts)
    pub max_attempts: u32,
    /// Initial backoff (seconds)
    pub initial_backoff_sec: u64,
    /// Maximum backoff (seconds)
    pub max_backoff_sec: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_sec: 2,
            max_backoff_sec: 60,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before restart number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_secs(std::cmp::min(
            self.max_backoff_sec,
            self.initial_backoff_sec.saturating_mul(factor),
        ))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of most recent terminal jobs considered.
    pub window: usize,
    /// Unhealthy once the failed share of the window exceeds this.
    pub max_failure_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 20,
            max_failure_ratio: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BotConfig {
    /// Source used by `/stream` when none is given.
    pub default_source: Option<String>,
    /// Destination used by `/stream` when none is given.
    pub default_destination: Option<String>,
    /// Only whether it is set matters here; the transport owns the token.
    #[serde(skip)]
    pub token_configured: bool,
}

impl AppConfig {
    /// Loads the YAML file if it exists, otherwise starts from defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config {:?}", path))?;
        Ok(config)
    }

    /// Applies environment overrides on top of the file values.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STREAM_BOT_LISTEN") {
            self.server.listen = v;
        }
        if let Some(v) = lookup("FFMPEG_BINARY") {
            self.server.ffmpeg_binary = v;
        }
        if let Some(v) = lookup("STREAM_BOT_LOGS_DIR") {
            self.server.logs_dir = v;
        }
        if let Some(v) = parse_env(&lookup, "STREAM_BOT_MAX_CONCURRENT")? {
            self.supervisor.max_concurrent = v;
        }
        if let Some(v) = parse_env(&lookup, "STREAM_BOT_MAX_QUEUE")? {
            self.supervisor.max_queue = v;
        }
        if let Some(v) = parse_env(&lookup, "STREAM_BOT_JOB_TIMEOUT_SECS")? {
            self.supervisor.job_timeout_sec = v;
        }
        if let Some(v) = parse_env(&lookup, "STREAM_BOT_RETENTION_SECS")? {
            self.supervisor.retention_sec = v;
        }
        if let Some(v) = parse_env(&lookup, "STREAM_BOT_FAILURE_THRESHOLD")? {
            self.health.max_failure_ratio = v;
        }
        if let Some(v) = parse_env(&lookup, "STREAM_BOT_HEALTH_WINDOW")? {
            self.health.window = v;
        }
        if let Some(v) = lookup("STREAM_INPUT").filter(|v| !v.is_empty()) {
            self.bot.default_source = Some(v);
        }
        if let Some(v) = lookup("RTMP").filter(|v| !v.is_empty()) {
            self.bot.default_destination = Some(v);
        }
        self.bot.token_configured = lookup("BOT_TOKEN").is_some_and(|v| !v.is_empty());
        self.validate()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.supervisor_interval_ms > 0,
            "server.supervisor_interval_ms must be at least 1"
        );
        anyhow::ensure!(
            self.supervisor.max_concurrent > 0,
            "supervisor.max_concurrent must be at least 1"
        );
        anyhow::ensure!(
            self.supervisor.job_timeout_sec > 0,
            "supervisor.job_timeout_sec must be at least 1"
        );
        anyhow::ensure!(
            self.supervisor.diagnostic_lines > 0,
            "supervisor.diagnostic_lines must be at least 1"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.health.max_failure_ratio),
            "health.max_failure_ratio must be within [0, 1]"
        );
        anyhow::ensure!(self.health.window > 0, "health.window must be at least 1");
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}={:?}: {}", key, raw, e)),
        None => Ok(None),
    }
}
