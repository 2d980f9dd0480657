use lettre::message::header::{
    self, ContentType, Header, HeaderName, HeaderValue, Headers, MIME_VERSION_1_0,
};
use lettre::message::{Mailbox, Mailboxes};

use crate::models::{DeliveryJob, MessageHeader};

/// Headers the engine writes itself; a job cannot override them.
const RESERVED_HEADERS: &[&str] = &["from", "to", "subject", "date", "message-id", "dkim-signature"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    headers: Vec<MessageHeader>,
    body: String,
}

impl OutboundMessage {
    pub fn new(headers: Vec<MessageHeader>, body: impl Into<String>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Build the message for a queued job. Header values are RFC 2047
    /// encoded and folded by lettre. `sender_domain` qualifies the
    /// Message-ID when the client id is not already an addr-spec.
    pub fn from_job(
        job: &DeliveryJob,
        from: &Mailbox,
        to: &Mailbox,
        sender_domain: &str,
    ) -> Result<Self, String> {
        let message_id = if job.message_id.contains('@') {
            format!("<{}>", job.message_id.trim_matches(|c| c == '<' || c == '>'))
        } else {
            format!("<{}@{}>", job.message_id, sender_domain)
        };

        let mut headers = vec![
            typed(header::From::from(Mailboxes::from(from.clone()))),
            typed(header::To::from(Mailboxes::from(to.clone()))),
            typed(header::Subject::from(job.subject.clone())),
            raw(HeaderName::new_from_ascii_str("Date"), job.created_at.to_rfc2822()),
            typed(header::MessageId::from(message_id)),
        ];

        let custom: Vec<&MessageHeader> = job
            .headers
            .0
            .iter()
            .filter(|h| !RESERVED_HEADERS.contains(&h.name.to_ascii_lowercase().as_str()))
            .collect();
        let has = |name: &str| custom.iter().any(|h| h.name.eq_ignore_ascii_case(name));

        if !has("MIME-Version") {
            headers.push(typed(MIME_VERSION_1_0));
        }
        if !has("Content-Type") {
            headers.push(typed(ContentType::TEXT_PLAIN));
        }
        for h in custom {
            let name = HeaderName::new_from_ascii(h.name.clone())
                .map_err(|_| format!("Invalid header name '{}'", h.name))?;
            headers.push(raw(name, h.value.clone()));
        }

        Ok(Self::new(headers, job.body.clone()))
    }

    pub fn headers(&self) -> &[MessageHeader] {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Value of the last instance of a header, matching the name
    /// case-insensitively.
    pub fn last_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Insert a header whose value is already in wire form.
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        self.headers.insert(
            0,
            MessageHeader {
                name: name.to_string(),
                value: value.to_string(),
            },
        );
    }

    /// RFC 5322 bytes with CRLF line endings.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for h in &self.headers {
            out.push_str(&h.name);
            out.push_str(": ");
            out.push_str(&h.value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body.replace("\r\n", "\n").replace('\n', "\r\n"));
        out.into_bytes()
    }
}

fn typed<H: Header>(header: H) -> MessageHeader {
    let mut headers = Headers::new();
    headers.set(header);
    wire_form(H::name(), &headers)
}

fn raw(name: HeaderName, value: String) -> MessageHeader {
    let mut headers = Headers::new();
    headers.insert_raw(HeaderValue::new(name.clone(), value));
    wire_form(name, &headers)
}

/// Split lettre's rendered `Name: value\r\n` back into name and encoded value.
fn wire_form(name: HeaderName, headers: &Headers) -> MessageHeader {
    let rendered = headers.to_string();
    let value = rendered
        .strip_prefix(&*name)
        .and_then(|rest| rest.strip_prefix(": "))
        .unwrap_or_default()
        .trim_end_matches("\r\n");
    MessageHeader {
        name: name.to_string(),
        value: value.to_string(),
    }
}
