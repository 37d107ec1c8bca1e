//! ## pixelguard-detection::rules
//! **Line-based blocklist rules converted to (domain, matcher) pairs**
//!
//! Recognized forms:
//! - `||tracker.com^$third-party` network rules
//! - `|https://tracker.com/p.gif` and `://tracker.com/` URL rules
//! - `tracker.com` / `tracker.com^` bare hostnames
//! - `0.0.0.0 tracker.com` hosts-file lines
//! - `/regex/` delimited expressions
//!
//! Any other line is a domain-less fragment: a literal when it has no regex
//! metacharacters, otherwise a regular expression used verbatim. Cosmetic
//! (`##`) and exception (`@@`) rules are skipped.

use std::borrow::Cow;

use pixelguard_core::events::is_significant_line;
use serde::{Deserialize, Serialize};

use crate::domain;

/// How a rule is matched against a URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Matcher {
    /// Case-insensitive substring.
    Literal(String),
    /// Regular expression source.
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// The line as it appeared in the source.
    pub raw: String,
    /// Base domain the rule is keyed under, if it names one.
    pub domain: Option<String>,
    pub matcher: Matcher,
}

const HOSTS_ADDRESSES: [&str; 5] = ["0.0.0.0", "127.0.0.1", "::", "::1", "0"];
const LOCAL_HOSTS: [&str; 4] = ["localhost", "localhost.localdomain", "local", "broadcasthost"];
const RESOURCE_SUFFIXES: [&str; 12] = [
    "gif", "png", "jpg", "jpeg", "svg", "webp", "js", "css", "php", "html", "htm", "aspx",
];

impl Rule {
    /// Parses one line. Returns `None` for lines that carry no network rule.
    pub fn parse(line: &str) -> Option<Rule> {
        let line = line.trim();
        if !is_significant_line(line) || is_cosmetic(line) || line.starts_with("@@") {
            return None;
        }

        if let Some(hosts) = parse_hosts_line(line) {
            return hosts;
        }

        if line.len() > 2 && line.starts_with('/') && line.ends_with('/') {
            return Some(Rule {
                raw: line.to_string(),
                domain: None,
                matcher: Matcher::Expression(line[1..line.len() - 1].to_string()),
            });
        }

        let body = strip_options(line);
        if body.is_empty() {
            return None;
        }

        if let Some(rest) = body.strip_prefix("||") {
            let end = rest.find(['^', '/', '*', '|', ':', '?']).unwrap_or(rest.len());
            return Some(Rule {
                raw: line.to_string(),
                domain: domain::base_domain(&rest[..end]),
                matcher: Matcher::Expression(to_expression(body)),
            });
        }

        if body.starts_with('|') || body.contains("://") {
            let url = body.trim_start_matches('|');
            return Some(Rule {
                raw: line.to_string(),
                domain: domain::base_domain(url),
                matcher: Matcher::Expression(to_expression(body)),
            });
        }

        let bare = body.trim_end_matches('^').to_ascii_lowercase();
        if looks_like_hostname(&bare) {
            let key = domain::base_domain(&bare).unwrap_or_else(|| bare.clone());
            return Some(Rule {
                raw: line.to_string(),
                domain: Some(key),
                matcher: Matcher::Literal(bare),
            });
        }

        let matcher = if body.bytes().all(is_literal_byte) {
            Matcher::Literal(body.to_string())
        } else {
            Matcher::Expression(line.to_string())
        };
        Some(Rule {
            raw: line.to_string(),
            domain: None,
            matcher,
        })
    }

    /// Regular expression source equivalent to the matcher.
    pub fn expression(&self) -> Cow<'_, str> {
        match &self.matcher {
            Matcher::Literal(text) => Cow::Owned(format!("(?i){}", regex::escape(text))),
            Matcher::Expression(expr) => Cow::Borrowed(expr),
        }
    }
}

/// Parses every rule-bearing line of `lines`.
pub fn parse_rules<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<Rule> {
    lines.into_iter().filter_map(Rule::parse).collect()
}

fn is_cosmetic(line: &str) -> bool {
    ["##", "#@#", "#?#", "#$#"].iter().any(|m| line.contains(m))
}

/// `None` when `line` is not a hosts entry, `Some(None)` when it names a local or invalid host.
fn parse_hosts_line(line: &str) -> Option<Option<Rule>> {
    let mut tokens = line.split_whitespace();
    let address = tokens.next()?;
    if !HOSTS_ADDRESSES.contains(&address) {
        return None;
    }
    let host = tokens.next()?.to_ascii_lowercase();
    if LOCAL_HOSTS.contains(&host.as_str()) || !domain::is_valid_host(&host) {
        return Some(None);
    }
    Some(Some(Rule {
        raw: line.to_string(),
        domain: domain::base_domain(&host),
        matcher: Matcher::Literal(host),
    }))
}

fn strip_options(line: &str) -> &str {
    match line.rfind('$') {
        Some(idx) if !line[idx + 1..].contains('/') => &line[..idx],
        _ => line,
    }
}

fn looks_like_hostname(text: &str) -> bool {
    let Some((_, last)) = text.rsplit_once('.') else {
        return false;
    };
    domain::is_valid_host(text)
        && last.bytes().all(|b| b.is_ascii_alphabetic())
        && !RESOURCE_SUFFIXES.contains(&last)
}

fn is_literal_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"/._-=&%~,;@?:".contains(&b)
}

/// Converts network-rule syntax (`||`, `|`, `*`, `^`) to a case-insensitive expression.
fn to_expression(body: &str) -> String {
    let mut out = String::from("(?i)");
    let mut rest = body;
    if let Some(stripped) = rest.strip_prefix("||") {
        out.push_str(r"^[a-z][a-z0-9+.-]*://([^/?#]*\.)?");
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('|') {
        out.push('^');
        rest = stripped;
    }
    let anchored_end = rest.ends_with('|');
    let rest = rest.trim_end_matches('|');

    for ch in rest.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '^' => out.push_str(r"(?:[^a-z0-9_.%-]|$)"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    if anchored_end {
        out.push('$');
    }
    out
}
