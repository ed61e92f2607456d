use crate::bot::{BotAdapter, OutboundMessage};
use crate::config::AppConfig;
use crate::supervisor::Supervisor;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Undelivered chat messages kept for the transport to collect.
const OUTBOX_CAPACITY: usize = 100;

/// Application context shared by the HTTP handlers.
pub struct AppState {
    pub config: AppConfig,
    pub supervisor: Supervisor,
    pub bot: BotAdapter,
    /// Outbound chat messages waiting for the transport (oldest dropped first).
    pub outbox: Mutex<VecDeque<OutboundMessage>>,
    /// Process start time, reported as uptime.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, supervisor: Supervisor) -> Self {
        let bot = BotAdapter::new(Arc::new(supervisor.clone()), config.bot.clone());
        Self {
            config,
            supervisor,
            bot,
            outbox: Mutex::new(VecDeque::new()),
            started_at: Instant::now(),
        }
    }

    pub fn push_outbound(&self, message: OutboundMessage) {
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        if outbox.len() == OUTBOX_CAPACITY {
            outbox.pop_front();
        }
        outbox.push_back(message);
    }

    pub fn drain_outbound(&self) -> Vec<OutboundMessage> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

pub type SharedState = Arc<AppState>;
