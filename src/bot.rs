//! Boundary between the chat transport and the streaming core.
//!
//! The adapter only sees the [`StreamControl`] capability, so the core has no
//! dependency on any particular bot platform.

use crate::config::BotConfig;
use crate::error::SubmitError;
use crate::job::{ChatId, JobId, JobState, OptionValue, StreamJob, StreamRequest};
use crate::registry::{JobEvent, JobFilter};
use crate::supervisor::{CancelOutcome, Supervisor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Diagnostic lines included in a failure notification.
const NOTIFY_TAIL_LINES: usize = 5;
const STATUS_LIST_LIMIT: usize = 10;

const HELP_TEXT: &str = "Stream Control Bot

Available commands:
/stream [source] [destination] [key=value ...] - Start FFmpeg streaming
/stop [job] - Stop FFmpeg streaming
/status [job] - Check current stream status

Options: format, videoCodec, audioCodec, videoBitrate, audioBitrate, resolution, preset";

#[async_trait]
pub trait StreamControl: Send + Sync {
    fn submit(&self, request: StreamRequest) -> Result<StreamJob, SubmitError>;
    async fn cancel(&self, id: JobId) -> Result<CancelOutcome, SubmitError>;
    fn job(&self, id: JobId) -> Option<StreamJob>;
    fn jobs(&self, filter: JobFilter) -> Vec<StreamJob>;
    fn on_status_change(&self) -> broadcast::Receiver<JobEvent>;
}

#[async_trait]
impl StreamControl for Supervisor {
    fn submit(&self, request: StreamRequest) -> Result<StreamJob, SubmitError> {
        Supervisor::submit(self, request)
    }

    async fn cancel(&self, id: JobId) -> Result<CancelOutcome, SubmitError> {
        Supervisor::cancel(self, id).await
    }

    fn job(&self, id: JobId) -> Option<StreamJob> {
        self.get(id)
    }

    fn jobs(&self, filter: JobFilter) -> Vec<StreamJob> {
        self.list(filter).iter().cloned().collect()
    }

    fn on_status_change(&self) -> broadcast::Receiver<JobEvent> {
        self.subscribe()
    }
}

/// A message to relay back to a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub chat_id: ChatId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BotCommand {
    Help,
    Stream {
        source: Option<String>,
        destination: Option<String>,
        options: Vec<(String, String)>,
    },
    Stop(Option<String>),
    Status(Option<String>),
    Unknown(String),
}

impl BotCommand {
    /// Parses `/command@botname args...`. Plain text is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let mut tokens = text.split_whitespace();
        let head = tokens.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
        let args: Vec<&str> = tokens.collect();

        let command = match name.as_str() {
            "start" | "help" => BotCommand::Help,
            "stream" => {
                let mut positional = Vec::new();
                let mut options = Vec::new();
                for arg in args {
                    match arg.split_once('=') {
                        // URLs carry '=' in their query, options never contain "://"
                        Some((key, value)) if !arg.contains("://") => {
                            options.push((key.to_string(), value.to_string()))
                        }
                        _ => positional.push(arg.to_string()),
                    }
                }
                let mut positional = positional.into_iter();
                BotCommand::Stream {
                    source: positional.next(),
                    destination: positional.next(),
                    options,
                }
            }
            "stop" => BotCommand::Stop(args.first().map(|s| s.to_string())),
            "status" => BotCommand::Status(args.first().map(|s| s.to_string())),
            other => BotCommand::Unknown(other.to_string()),
        };
        Some(command)
    }
}

/// Translates chat commands into core operations and formats the replies.
pub struct BotAdapter {
    control: Arc<dyn StreamControl>,
    defaults: BotConfig,
}

impl BotAdapter {
    pub fn new(control: Arc<dyn StreamControl>, defaults: BotConfig) -> Self {
        Self { control, defaults }
    }

    /// Handles one inbound message and returns the reply text.
    pub async fn handle(&self, chat_id: ChatId, text: &str) -> String {
        let Some(command) = BotCommand::parse(text) else {
            return "Send /start to see the available commands".to_string();
        };
        info!("Chat [{}] command: {:?}", chat_id, command);

        match command {
            BotCommand::Help => HELP_TEXT.to_string(),
            BotCommand::Stream {
                source,
                destination,
                options,
            } => self.start_stream(chat_id, source, destination, options),
            BotCommand::Stop(arg) => self.stop_stream(chat_id, arg).await,
            BotCommand::Status(arg) => self.status(chat_id, arg),
            BotCommand::Unknown(name) => format!("Unknown command /{}. Send /start for help", name),
        }
    }

    fn start_stream(
        &self,
        chat_id: ChatId,
        source: Option<String>,
        destination: Option<String>,
        options: Vec<(String, String)>,
    ) -> String {
        let Some(source) = source.or_else(|| self.defaults.default_source.clone()) else {
            return "No source given and no default source configured".to_string();
        };
        let Some(destination) = destination.or_else(|| self.defaults.default_destination.clone()) else {
            return "No destination given and no default destination configured".to_string();
        };

        let mut request = StreamRequest::new(source, destination);
        request.requested_by = Some(chat_id);
        for (key, value) in options {
            request.options.insert(key, OptionValue::Text(value));
        }

        match self.control.submit(request) {
            Ok(job) => format!("STREAM STARTED\nJob {} ({})", job.id, job.state),
            Err(e) => format!("Failed to start stream: {}", e),
        }
    }

    async fn stop_stream(&self, chat_id: ChatId, arg: Option<String>) -> String {
        let id = match arg {
            Some(raw) => match raw.parse::<JobId>() {
                Ok(id) => id,
                Err(_) => return format!("'{}' is not a job id", raw),
            },
            None => match self.latest_active(chat_id) {
                Some(job) => job.id,
                None => return "No active stream to stop".to_string(),
            },
        };
        if !self.owned_by(id, chat_id) {
            return format!("Job {} not found", id);
        }

        match self.control.cancel(id).await {
            Ok(CancelOutcome::Cancelled) => format!("STOP STREAM\nJob {} cancelled", id),
            Ok(CancelOutcome::Stopping) => format!("STOP STREAM\nJob {} is stopping", id),
            Ok(CancelOutcome::AlreadyFinished(state)) => format!("Job {} already {}", id, state),
            Err(e) => format!("Failed to stop stream: {}", e),
        }
    }

    fn status(&self, chat_id: ChatId, arg: Option<String>) -> String {
        if let Some(raw) = arg {
            return match raw.parse::<JobId>() {
                Ok(id) if self.owned_by(id, chat_id) => match self.control.job(id) {
                    Some(job) => job.summary(),
                    None => format!("Job {} not found", id),
                },
                Ok(id) => format!("Job {} not found", id),
                Err(_) => format!("'{}' is not a job id", raw),
            };
        }

        let mut jobs = self.control.jobs(JobFilter {
            state: None,
            requested_by: Some(chat_id),
        });
        jobs.sort_by(|a, b| b.id.cmp(&a.id));
        let streaming = jobs.iter().any(|job| job.state == JobState::Running);

        let mut text = format!(
            "Current Status\nStream: {}",
            if streaming { "STREAMING" } else { "STOPPED" }
        );
        if jobs.is_empty() {
            text.push_str("\nNo jobs yet");
        }
        for job in jobs.iter().take(STATUS_LIST_LIMIT) {
            text.push_str(&format!("\n- Job {}: {}", job.id, job.state));
        }
        text.push_str("\nWeb App: LIVE");
        text
    }

    fn latest_active(&self, chat_id: ChatId) -> Option<StreamJob> {
        self.control
            .jobs(JobFilter {
                state: None,
                requested_by: Some(chat_id),
            })
            .into_iter()
            .filter(|job| !job.state.is_terminal())
            .max_by_key(|job| job.id)
    }

    /// Jobs started from a chat are only visible to that chat.
    fn owned_by(&self, id: JobId, chat_id: ChatId) -> bool {
        match self.control.job(id) {
            Some(job) => job.requested_by.map_or(true, |owner| owner == chat_id),
            // unknown ids fall through to the core's NotFound
            None => true,
        }
    }

    /// Relays terminal job states back to the chats that requested them.
    pub fn spawn_notifier(&self) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = self.control.on_status_change();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(message) = notification_for(&event.job) {
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notifier lagged, {} job events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

/// Message for a job that just reached a terminal state.
pub fn notification_for(job: &StreamJob) -> Option<OutboundMessage> {
    let chat_id = job.requested_by?;
    let text = match job.state {
        JobState::Completed => format!("Job {} completed", job.id),
        JobState::Cancelled => format!("Job {} cancelled", job.id),
        JobState::Failed => {
            let mut text = format!("Job {} failed", job.id);
            if let Some(info) = &job.exit_info {
                if let Some(reason) = &info.reason {
                    text.push_str(&format!(": {}", reason));
                }
                let skip = info.diagnostic_tail.len().saturating_sub(NOTIFY_TAIL_LINES);
                for line in &info.diagnostic_tail[skip..] {
                    text.push_str("\n> ");
                    text.push_str(line);
                }
            }
            text
        }
        JobState::Pending | JobState::Running => return None,
    };
    Some(OutboundMessage { chat_id, text })
}
