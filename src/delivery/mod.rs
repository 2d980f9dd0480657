pub mod message;
pub mod retry;
pub mod worker;

use lettre::message::Mailbox;

/// Exactly one mailbox, optionally with a display name, e.g.
/// `Support <help@example.com>`. Address lists and trailing text are refused.
pub fn parse_mailbox(address: &str) -> Option<Mailbox> {
    if address.contains(['\r', '\n']) {
        return None;
    }
    address.parse().ok()
}

pub fn mailbox_domain(mailbox: &Mailbox) -> String {
    mailbox.email.domain().trim_end_matches('.').to_ascii_lowercase()
}

/// Lowercased domain of a single-mailbox address.
pub fn address_domain(address: &str) -> Option<String> {
    parse_mailbox(address).map(|mailbox| mailbox_domain(&mailbox))
}
