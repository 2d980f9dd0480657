mod smtp;

pub use smtp::SmtpRelayTransport;

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub from: String,
    pub to: Vec<String>,
}

/// How the far side answered. `Temporary` is retried with backoff,
/// `Permanent` bounces the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Delivered,
    Temporary(String),
    Permanent(String),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, envelope: &OutboundEnvelope, message: &[u8]) -> TransportOutcome;
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub envelope: OutboundEnvelope,
    pub data: Vec<u8>,
}

impl SentMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Keeps every message in memory and answers with scripted outcomes,
/// `Delivered` once the script runs out.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    script: Mutex<VecDeque<TransportOutcome>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: TransportOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, envelope: &OutboundEnvelope, message: &[u8]) -> TransportOutcome {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentMessage {
                envelope: envelope.clone(),
                data: message.to_vec(),
            });
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(TransportOutcome::Delivered)
    }
}
