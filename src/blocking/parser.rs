/// Blocklist line parser for the formats found in the wild
use std::borrow::Cow;
use std::net::IpAddr;

/// Hosts-file entries pointing at the local machine itself are never
/// blocklist material.
const LOCALHOST_DENYLIST: [&str; 2] = ["localhost", "localhost.localdomain"];

/// Extract a canonical domain name from one line of blocklist text.
///
/// Line shapes are tried in order; the first matching shape wins and its
/// extracted domain is normalized (lowercase ASCII, trailing dot) or
/// rejected. Lines matching no shape yield `None`; this function never fails.
///
/// Recognized shapes:
/// - empty / whitespace-only
/// - comments (`# …` or `! …`)
/// - Adblock rules (`||domain^` with optional modifiers after `^`)
/// - hosts entries (`<ip> <domain> [ignored…]`)
/// - plain domain tokens
pub fn extract_domain(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }

    if let Some(domain) = parse_adblock(line) {
        return canonicalize(domain);
    }
    if let Some(domain) = parse_hosts(line) {
        return canonicalize(domain);
    }
    if let Some(domain) = parse_plain(line) {
        return canonicalize(domain);
    }

    None
}

/// Parse an Adblock-style rule: `||domain^` with anything after the caret
/// treated as modifiers and ignored.
fn parse_adblock(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("||")?;
    let caret = rest.find('^')?;
    Some(&rest[..caret])
}

/// Parse a hosts-file entry: `<ip> <domain> [aliases…]`. The first field must
/// be an IPv4/IPv6 literal; fields past the second are ignored.
fn parse_hosts(line: &str) -> Option<&str> {
    let mut parts = line.split_whitespace();
    let addr = parts.next()?;
    let domain = parts.next()?;
    if addr.parse::<IpAddr>().is_err() {
        return None;
    }
    Some(domain)
}

/// Parse a bare domain token: a single field containing at least one dot and
/// only domain characters.
fn parse_plain(line: &str) -> Option<&str> {
    if line.split_whitespace().count() != 1 {
        return None;
    }
    if !line.contains('.') {
        return None;
    }
    if !line
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return None;
    }
    Some(line)
}

/// Normalize an extracted domain to canonical FQDN form, or reject it.
fn canonicalize(domain: &str) -> Option<String> {
    let lower = domain.to_ascii_lowercase();
    let bare = lower.strip_suffix('.').unwrap_or(&lower);

    if LOCALHOST_DENYLIST.contains(&bare) {
        return None;
    }
    if !is_valid_domain(bare) {
        return None;
    }

    let mut canonical = String::with_capacity(bare.len() + 1);
    canonical.push_str(bare);
    canonical.push('.');
    Some(canonical)
}

/// Check that a lowercased, dot-stripped name is syntactically a domain.
fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return false;
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        let bytes = label.as_bytes();
        if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
            return false;
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_'))
        {
            return false;
        }
    }

    true
}

/// Bring a query name into canonical form without allocating when the input
/// is already lowercase with a trailing dot.
pub(crate) fn canonical_query(domain: &str) -> Cow<'_, str> {
    let needs_case = domain.bytes().any(|b| b.is_ascii_uppercase());
    let needs_dot = !domain.ends_with('.');
    if !needs_case && !needs_dot {
        return Cow::Borrowed(domain);
    }

    let mut owned = domain.to_ascii_lowercase();
    if needs_dot {
        owned.push('.');
    }
    Cow::Owned(owned)
}
