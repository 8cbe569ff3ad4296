/// Multi-tier domain pattern matcher: exact names, wildcards, and regexes
use crate::blocking::parser::canonical_query;
use crate::error::PatternError;
use regex::Regex;
use rustc_hash::FxHashSet;

/// Summary counts of a compiled matcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternStats {
    pub exact: usize,
    pub wildcard: usize,
    pub regex: usize,
    pub total: usize,
}

/// Compiled pattern set answering `matches(domain)` in bounded time.
///
/// Classification of raw pattern strings:
/// - `/…/` (slash-delimited) compiles as a regex against the canonical form
/// - anything containing `*` compiles as an anchored wildcard
/// - everything else is an exact name, stored canonicalized
///
/// The matcher is immutable after construction and safe to share across
/// threads; `matches` is pure.
#[derive(Debug, Default)]
pub struct PatternMatcher {
    exact: FxHashSet<String>,
    wildcards: Vec<Regex>,
    regexes: Vec<Regex>,
}

impl PatternMatcher {
    /// Compile a list of raw pattern strings. The first pattern that fails to
    /// compile aborts construction with its index and cause.
    pub fn new(patterns: &[String]) -> Result<Self, PatternError> {
        let mut exact = FxHashSet::default();
        let mut wildcards = Vec::new();
        let mut regexes = Vec::new();

        for (index, raw) in patterns.iter().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }

            if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
                let re = Regex::new(&raw[1..raw.len() - 1])
                    .map_err(|source| PatternError::InvalidPattern { index, source })?;
                regexes.push(re);
            } else if raw.contains('*') {
                let re = Regex::new(&wildcard_to_regex(raw))
                    .map_err(|source| PatternError::InvalidPattern { index, source })?;
                wildcards.push(re);
            } else {
                exact.insert(canonical_query(raw).into_owned());
            }
        }

        Ok(Self {
            exact,
            wildcards,
            regexes,
        })
    }

    /// Test a domain against all tiers; first hit wins.
    pub fn matches(&self, domain: &str) -> bool {
        let domain = canonical_query(domain);

        if self.exact.contains(domain.as_ref()) {
            return true;
        }
        if self.wildcards.iter().any(|re| re.is_match(&domain)) {
            return true;
        }
        self.regexes.iter().any(|re| re.is_match(&domain))
    }

    pub fn stats(&self) -> PatternStats {
        PatternStats {
            exact: self.exact.len(),
            wildcard: self.wildcards.len(),
            regex: self.regexes.len(),
            total: self.exact.len() + self.wildcards.len() + self.regexes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty() && self.regexes.is_empty()
    }
}

/// Translate a wildcard pattern into an anchored regex over canonical names.
///
/// A `*` bracketed by dots on both sides stands for exactly one label
/// (`[^.]+`); a `*` at either end of the pattern spans one or more labels
/// (`.+`), so `*.ads.com.` matches `a.ads.com.` and `a.b.ads.com.` but never
/// the bare `ads.com.`.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut pattern = pattern.to_ascii_lowercase();
    if !pattern.ends_with('.') && !pattern.ends_with('*') {
        pattern.push('.');
    }

    let bytes = pattern.as_bytes();
    let mut re = String::with_capacity(pattern.len() + 8);
    let mut literal = String::new();
    re.push('^');

    for (i, ch) in pattern.char_indices() {
        if ch != '*' {
            literal.push(ch);
            continue;
        }
        re.push_str(&regex::escape(&literal));
        literal.clear();

        let dot_before = i > 0 && bytes[i - 1] == b'.';
        let dot_after = i + 1 < bytes.len() && bytes[i + 1] == b'.';
        if dot_before && dot_after {
            re.push_str("[^.]+");
        } else {
            re.push_str(".+");
        }
    }

    re.push_str(&regex::escape(&literal));
    re.push('$');
    re
}
