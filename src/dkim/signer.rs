use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::Sha256;

use super::DkimError;
use super::canonical::{body_hash, relaxed_header};
use crate::delivery::message::OutboundMessage;

pub const SIGNATURE_HEADER: &str = "DKIM-Signature";

/// Headers covered by the signature, in `h=` order, when present.
pub const SIGNED_HEADERS: &[&str] = &[
    "from",
    "to",
    "subject",
    "date",
    "message-id",
    "mime-version",
    "content-type",
    "reply-to",
    "cc",
];

/// Compute the `DKIM-Signature` header value for `message`.
///
/// No `t=` tag is emitted, so the same message and key always yield the same
/// header.
pub fn signature_header(
    message: &OutboundMessage,
    domain: &str,
    selector: &str,
    key: &RsaPrivateKey,
) -> Result<String, DkimError> {
    let signed: Vec<&str> = SIGNED_HEADERS
        .iter()
        .copied()
        .filter(|name| message.last_header(name).is_some())
        .collect();
    if !signed.contains(&"from") {
        return Err(DkimError::Signing("message has no From header".to_string()));
    }

    let unsigned = format!(
        "v=1; a=rsa-sha256; c=relaxed/relaxed; d={domain}; s={selector}; h={}; bh={}; b=",
        signed.join(":"),
        body_hash(message.body()),
    );

    let data = signing_input(message, &signed, &unsigned);
    let signature = SigningKey::<Sha256>::new(key.clone())
        .try_sign(data.as_bytes())
        .map_err(|e| DkimError::Signing(e.to_string()))?;

    Ok(format!("{unsigned}{}", STANDARD.encode(signature.to_bytes())))
}

/// Return a copy of `message` with the signature header prepended.
pub fn sign_message(
    message: &OutboundMessage,
    domain: &str,
    selector: &str,
    key: &RsaPrivateKey,
) -> Result<OutboundMessage, DkimError> {
    let value = signature_header(message, domain, selector, key)?;
    let mut signed = message.clone();
    signed.prepend_header(SIGNATURE_HEADER, &value);
    Ok(signed)
}

fn signing_input(message: &OutboundMessage, signed: &[&str], unsigned_value: &str) -> String {
    let mut data = String::new();
    for name in signed {
        if let Some(value) = message.last_header(name) {
            data.push_str(&relaxed_header(name, value));
            data.push_str("\r\n");
        }
    }
    data.push_str(&relaxed_header(SIGNATURE_HEADER, unsigned_value));
    data
}
