use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use sha2::{Digest, Sha256};

static WSP_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());

/// `name:value` with the name lowercased, the value unfolded, runs of
/// whitespace reduced to one space and surrounding whitespace removed.
pub fn relaxed_header(name: &str, value: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    let unfolded = value.replace("\r\n", "").replace(['\r', '\n'], "");
    let collapsed = WSP_RUN.replace_all(&unfolded, " ");
    format!("{name}:{}", collapsed.trim())
}

pub fn relaxed_body(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n");
    let mut lines: Vec<String> = normalized
        .split('\n')
        .map(|line| {
            let line = line.trim_end_matches('\r');
            WSP_RUN.replace_all(line, " ").trim_end().to_string()
        })
        .collect();

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    if lines.is_empty() {
        return String::new();
    }

    let mut canonical = lines.join("\r\n");
    canonical.push_str("\r\n");
    canonical
}

/// Base64 SHA-256 of the relaxed body, the `bh=` tag value.
pub fn body_hash(body: &str) -> String {
    let digest = Sha256::digest(relaxed_body(body).as_bytes());
    STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_lowercased_unfolded_and_collapsed() {
        assert_eq!(
            relaxed_header("Subject ", " Hello \r\n\t  World  "),
            "subject:Hello World"
        );
        assert_eq!(relaxed_header("FROM", "a@b.example"), "from:a@b.example");
    }

    #[test]
    fn body_trailing_whitespace_and_empty_lines_are_dropped() {
        let body = "Hi  there \t\r\nsecond\tline\r\n\r\n\r\n";
        assert_eq!(relaxed_body(body), "Hi there\r\nsecond line\r\n");
    }

    #[test]
    fn bare_newlines_are_treated_as_crlf() {
        assert_eq!(relaxed_body("a\nb"), relaxed_body("a\r\nb\r\n"));
    }

    #[test]
    fn empty_body_canonicalizes_to_nothing() {
        assert_eq!(relaxed_body(""), "");
        assert_eq!(relaxed_body("\r\n\r\n"), "");
        // SHA-256 of the empty string.
        assert_eq!(body_hash(""), "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
    }
}
