use std::net::IpAddr;

use ipnet::IpNet;

use crate::dns::DnsError;
use crate::models::RecordCheck;

pub const DMARC_POLICIES: &[&str] = &["none", "quarantine", "reject"];

pub const OWNERSHIP_PREFIX: &str = "courier-verification=";

pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Lowercased, dot-separated name of valid labels, at least two deep.
pub fn normalize_domain(name: &str) -> Option<String> {
    let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = name.split('.').collect();
    if name.len() > 253 || labels.len() < 2 || !labels.iter().all(|l| is_valid_label(l)) {
        return None;
    }
    Some(name)
}

pub fn spf_record(sending_ips: &[IpNet], include: Option<&str>) -> String {
    let mut record = String::from("v=spf1");
    for net in sending_ips {
        let mechanism = match net.addr() {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        if net.prefix_len() == net.max_prefix_len() {
            record.push_str(&format!(" {mechanism}:{}", net.addr()));
        } else {
            record.push_str(&format!(" {mechanism}:{net}"));
        }
    }
    if let Some(include) = include {
        record.push_str(&format!(" include:{include}"));
    }
    record.push_str(" ~all");
    record
}

pub fn dkim_record_name(selector: &str, domain: &str) -> String {
    format!("{selector}._domainkey.{domain}")
}

pub fn dkim_record(public_key: &str) -> String {
    format!("v=DKIM1; k=rsa; p={public_key}")
}

pub fn dmarc_record_name(domain: &str) -> String {
    format!("_dmarc.{domain}")
}

pub fn dmarc_record(policy: &str, rua: &str) -> String {
    format!("v=DMARC1; p={policy}; rua=mailto:{rua}")
}

/// Apex TXT value carrying a domain's verification token.
pub fn ownership_record(token: &str) -> String {
    format!("{OWNERSHIP_PREFIX}{token}")
}

/// `tag=value` pairs of a DKIM or DMARC record; tag names lowercased.
pub fn parse_tags(record: &str) -> Vec<(String, String)> {
    record
        .split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

fn tag<'a>(tags: &'a [(String, String)], name: &str) -> Option<&'a str> {
    tags.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
}

/// The `p=` key of a `v=DKIM1` record, with embedded whitespace removed.
pub fn dkim_public_key(record: &str) -> Option<String> {
    let tags = parse_tags(record);
    if !tag(&tags, "v").is_some_and(|v| v.eq_ignore_ascii_case("DKIM1")) {
        return None;
    }
    tag(&tags, "p").map(|p| p.chars().filter(|c| !c.is_whitespace()).collect())
}

/// The `p=` policy of a `v=DMARC1` record, lowercased.
pub fn dmarc_policy(record: &str) -> Option<String> {
    let tags = parse_tags(record);
    if !tag(&tags, "v").is_some_and(|v| v.eq_ignore_ascii_case("DMARC1")) {
        return None;
    }
    tag(&tags, "p").map(str::to_ascii_lowercase)
}

pub fn is_spf(record: &str) -> bool {
    let record = record.trim();
    let Some(prefix) = record.get(..6) else {
        return false;
    };
    prefix.eq_ignore_ascii_case("v=spf1") && record[6..].chars().next().is_none_or(|c| c == ' ')
}

enum SpfTerm {
    Network(IpNet),
    Platform,
}

/// Whether an SPF record passes every platform sending address, either
/// through `ip4:`/`ip6:` mechanisms or through the platform include.
/// Terms are evaluated in order: the first one matching an address decides
/// it, and nothing after the first `all` is looked at.
pub fn spf_authorizes(record: &str, sending_ips: &[IpNet], include: Option<&str>) -> bool {
    let mut terms: Vec<(bool, SpfTerm)> = Vec::new();

    for term in record.split_whitespace().skip(1) {
        let (pass, mechanism) = match term.as_bytes().first() {
            Some(b'+') => (true, &term[1..]),
            Some(b'-' | b'~' | b'?') => (false, &term[1..]),
            _ => (true, term),
        };
        let mechanism = mechanism.to_ascii_lowercase();
        if mechanism == "all" {
            break;
        }
        if let Some(net) = mechanism
            .strip_prefix("ip4:")
            .or_else(|| mechanism.strip_prefix("ip6:"))
        {
            let parsed = net
                .parse::<IpNet>()
                .or_else(|_| net.parse::<IpAddr>().map(IpNet::from));
            if let Ok(parsed) = parsed {
                terms.push((pass, SpfTerm::Network(parsed)));
            }
        } else if let (Some(target), Some(include)) = (mechanism.strip_prefix("include:"), include) {
            if target.eq_ignore_ascii_case(include) {
                terms.push((pass, SpfTerm::Platform));
            }
        }
    }

    let passes = |ip: Option<&IpNet>| {
        terms
            .iter()
            .find(|(_, term)| match term {
                SpfTerm::Platform => true,
                SpfTerm::Network(net) => ip.is_some_and(|ip| net.contains(ip)),
            })
            .is_some_and(|(pass, _)| *pass)
    };

    if sending_ips.is_empty() {
        return passes(None);
    }
    sending_ips.iter().all(|ip| passes(Some(ip)))
}

fn resolution_failure(expected: &str, err: &DnsError) -> Option<RecordCheck> {
    if err.is_inconclusive() {
        Some(RecordCheck::unresolved(expected, err.to_string()))
    } else {
        None
    }
}

pub fn check_spf(
    answer: &Result<Vec<String>, DnsError>,
    sending_ips: &[IpNet],
    include: Option<&str>,
) -> RecordCheck {
    let expected = spf_record(sending_ips, include);
    let txt = match answer {
        Ok(txt) => txt,
        Err(e) => {
            return resolution_failure(&expected, e)
                .unwrap_or_else(|| RecordCheck::mismatch(&expected, None));
        }
    };

    let spf: Vec<&String> = txt.iter().filter(|r| is_spf(r)).collect();
    match spf.as_slice() {
        [] => RecordCheck::mismatch(&expected, None),
        [record] if spf_authorizes(record, sending_ips, include) => {
            RecordCheck::valid(&expected, Some(record.to_string()))
        }
        [record] => RecordCheck::mismatch(&expected, Some(record.to_string())),
        // More than one SPF record is a permanent error for receivers.
        many => RecordCheck::mismatch(
            &expected,
            Some(many.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(" | ")),
        ),
    }
}

pub fn check_dkim(answer: &Result<Vec<String>, DnsError>, public_key: &str) -> RecordCheck {
    let expected = dkim_record(public_key);
    let txt = match answer {
        Ok(txt) => txt,
        Err(e) => {
            return resolution_failure(&expected, e)
                .unwrap_or_else(|| RecordCheck::mismatch(&expected, None));
        }
    };

    let dkim: Vec<(&String, String)> = txt
        .iter()
        .filter_map(|r| dkim_public_key(r).map(|p| (r, p)))
        .collect();

    match dkim.iter().find(|(_, p)| p == public_key) {
        Some((record, _)) => RecordCheck::valid(&expected, Some(record.to_string())),
        None => RecordCheck::mismatch(&expected, dkim.first().map(|(r, _)| r.to_string())),
    }
}

/// DMARC is valid when a `v=DMARC1` record declares a recognised policy;
/// which policy is informational. Returns the declared policy as well.
pub fn check_dmarc(
    answer: &Result<Vec<String>, DnsError>,
    rua: &str,
) -> (RecordCheck, Option<String>) {
    let expected = dmarc_record("quarantine", rua);
    let txt = match answer {
        Ok(txt) => txt,
        Err(e) => {
            let check = resolution_failure(&expected, e)
                .unwrap_or_else(|| RecordCheck::mismatch(&expected, None));
            return (check, None);
        }
    };

    let Some((record, policy)) = txt
        .iter()
        .find_map(|r| dmarc_policy(r).map(|p| (r, p)))
        .or_else(|| {
            txt.iter()
                .find(|r| r.to_ascii_lowercase().contains("v=dmarc1"))
                .map(|r| (r, String::new()))
        })
    else {
        return (RecordCheck::mismatch(&expected, None), None);
    };

    if DMARC_POLICIES.contains(&policy.as_str()) {
        (RecordCheck::valid(&expected, Some(record.to_string())), Some(policy))
    } else {
        (RecordCheck::mismatch(&expected, Some(record.to_string())), None)
    }
}

/// Proof that the registering tenant controls the zone: its verification
/// token published at the apex, or its own DKIM key published under its
/// selector. Shared records such as SPF and DMARC prove nothing.
pub fn check_ownership(
    apex: &Result<Vec<String>, DnsError>,
    token: &str,
    dkim: &RecordCheck,
) -> RecordCheck {
    let expected = ownership_record(token);
    if dkim.evaluated && dkim.valid {
        return RecordCheck::valid(&expected, dkim.actual.clone());
    }

    let dkim_unresolved = || {
        dkim.error
            .as_ref()
            .filter(|_| dkim.is_inconclusive())
            .map(|error| RecordCheck::unresolved(&expected, error.clone()))
    };

    match apex {
        Ok(txt) => {
            if let Some(record) = txt.iter().find(|r| r.trim() == expected) {
                return RecordCheck::valid(&expected, Some(record.to_string()));
            }
            dkim_unresolved().unwrap_or_else(|| {
                let other = txt.iter().find(|r| r.trim().starts_with(OWNERSHIP_PREFIX));
                RecordCheck::mismatch(&expected, other.cloned())
            })
        }
        Err(e) => resolution_failure(&expected, e)
            .or_else(dkim_unresolved)
            .unwrap_or_else(|| RecordCheck::mismatch(&expected, None)),
    }
}
