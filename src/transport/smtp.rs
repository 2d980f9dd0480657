use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

use super::{MailTransport, OutboundEnvelope, TransportOutcome};
use crate::config::SmtpConfig;

/// Submits signed messages to a relay over SMTP.
pub struct SmtpRelayTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelayTransport {
    pub fn new(config: &SmtpConfig, timeout: std::time::Duration) -> Result<Self, String> {
        let mut builder = match config.tls_mode.as_str() {
            "tls" => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| format!("SMTP relay error: {e}"))?,
            "none" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            "starttls" => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| format!("SMTP starttls error: {e}"))?,
            other => return Err(format!("Unknown COURIER_SMTP_TLS mode '{other}'")),
        }
        .port(config.port)
        .timeout(Some(timeout));

        if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

fn envelope(envelope: &OutboundEnvelope) -> Result<Envelope, String> {
    let from: Address = envelope
        .from
        .parse()
        .map_err(|e| format!("Invalid sender address '{}': {e}", envelope.from))?;
    let to = envelope
        .to
        .iter()
        .map(|addr| {
            addr.parse::<Address>()
                .map_err(|e| format!("Invalid recipient address '{addr}': {e}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Envelope::new(Some(from), to).map_err(|e| format!("Invalid envelope: {e}"))
}

#[async_trait]
impl MailTransport for SmtpRelayTransport {
    async fn send(&self, outbound: &OutboundEnvelope, message: &[u8]) -> TransportOutcome {
        let envelope = match envelope(outbound) {
            Ok(envelope) => envelope,
            Err(e) => return TransportOutcome::Permanent(e),
        };

        match self.transport.send_raw(&envelope, message).await {
            Ok(_) => TransportOutcome::Delivered,
            Err(e) if e.is_permanent() => TransportOutcome::Permanent(e.to_string()),
            Err(e) => TransportOutcome::Temporary(e.to_string()),
        }
    }
}
