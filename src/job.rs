use crate::builder::CommandSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Process-unique job identifier, allocated by the registry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(JobId)
    }
}

/// Chat the request came from, used to route notifications back.
pub type ChatId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Monotonic lattice: Pending -> Running -> terminal, with Pending allowed
    /// to jump straight to Failed (spawn error) or Cancelled.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" | "canceled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Option value as it arrives from a chat command or JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Text(String),
    Number(f64),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Text(s) => f.write_str(s),
            OptionValue::Number(n) if n.fract() == 0.0 => write!(f, "{}", *n as i64),
            OptionValue::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Text(s.to_string())
    }
}

/// An unvalidated request to relay or transcode a stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamRequest {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
    #[serde(default)]
    pub requested_by: Option<ChatId>,
}

impl StreamRequest {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            options: BTreeMap::new(),
            requested_by: None,
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    SpawnError(String),
    Timeout,
    ProcessExitNonZero,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::SpawnError(msg) => write!(f, "SpawnError: {}", msg),
            FailureReason::Timeout => f.write_str("Timeout"),
            FailureReason::ProcessExitNonZero => f.write_str("ProcessExitNonZero"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// None when the process was killed by a signal or never started.
    pub code: Option<i32>,
    pub reason: Option<FailureReason>,
    pub diagnostic_tail: Vec<String>,
}

/// Registry record for one stream job. The process handle never lives here;
/// it is owned by the runner task while the job is running.
#[derive(Debug, Clone, Serialize)]
pub struct StreamJob {
    pub id: JobId,
    pub source: String,
    pub destination: String,
    pub options: BTreeMap<String, String>,
    #[serde(skip)]
    pub command: CommandSpec,
    pub state: JobState,
    pub requested_by: Option<ChatId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub exit_info: Option<ExitInfo>,
    /// 1 for the first run, incremented by each automatic restart.
    pub attempt: u32,
    pub retry_of: Option<JobId>,
}

impl StreamJob {
    /// One-line human summary, used for chat replies.
    pub fn summary(&self) -> String {
        let mut line = format!("Job {}: {}", self.id, self.state.as_str().to_uppercase());
        if let Some(info) = &self.exit_info {
            if let Some(reason) = &info.reason {
                line.push_str(&format!(" ({})", reason));
            } else if let Some(code) = info.code {
                line.push_str(&format!(" (exit {})", code));
            }
        }
        line.push_str(&format!("\nInput: {}", truncate(&self.source, 50)));
        line.push_str(&format!("\nOutput: {}", truncate(&self.destination, 50)));
        line
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_is_monotonic() {
        use JobState::*;
        let all = [Pending, Running, Completed, Failed, Cancelled];
        for from in all {
            for to in all {
                if from.is_terminal() || from == to || to == Pending {
                    assert!(!from.can_transition_to(to), "{from} -> {to}");
                }
            }
        }
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn job_id_parses_with_hash_prefix() {
        assert_eq!("#12".parse::<JobId>().unwrap(), JobId(12));
        assert_eq!(" 7 ".parse::<JobId>().unwrap(), JobId(7));
        assert!("abc".parse::<JobId>().is_err());
    }

    #[test]
    fn numeric_option_values_render_without_fraction() {
        assert_eq!(OptionValue::Number(2000.0).to_string(), "2000");
        assert_eq!(OptionValue::Number(1.5).to_string(), "1.5");
    }

    #[test]
    fn summary_truncates_long_sources() {
        let job = StreamJob {
            id: JobId(3),
            source: "x".repeat(80),
            destination: "rtmp://live/key".into(),
            options: BTreeMap::new(),
            command: CommandSpec::default(),
            state: JobState::Failed,
            requested_by: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            pid: None,
            exit_info: Some(ExitInfo {
                code: None,
                reason: Some(FailureReason::Timeout),
                diagnostic_tail: vec![],
            }),
            attempt: 1,
            retry_of: None,
        };
        let text = job.summary();
        assert!(text.starts_with("Job 3: FAILED (Timeout)"));
        assert!(text.contains(&format!("{}...", "x".repeat(50))));
    }
}
