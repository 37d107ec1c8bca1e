//! ## pixelguard-detection::scan
//! **Per-email scan on top of the pattern index**
//!
//! Resource URLs are pulled out of a decoded HTML body, looked up in the index,
//! checked against the entry's sub-patterns and the domain-less rules, and
//! combined with the pluggable [`ContentClassifier`].

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use pixelguard_core::model::{Confidence, ThreatLevel};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::domain;
use crate::index::PatternIndex;

static IMG_SRC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).expect("valid img pattern")
});
static BACKGROUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bbackground\s*=\s*["']([^"']+)["']"#).expect("valid background pattern")
});
static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*["']?([^"')\s]+)["']?\s*\)"#).expect("valid css url pattern")
});

/// Verdict of the external URL classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub is_tracking: bool,
    pub domain: Option<String>,
    pub threat_contribution: u32,
}

/// Opaque scoring heuristics plugged in by the caller.
pub trait ContentClassifier: Send + Sync {
    fn classify(&self, url: &str) -> Classification;
}

/// Classifier that never flags anything; the index alone decides.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClassifier;

impl ContentClassifier for NullClassifier {
    fn classify(&self, url: &str) -> Classification {
        Classification {
            is_tracking: false,
            domain: domain::base_domain(url),
            threat_contribution: 0,
        }
    }
}

/// Where in the markup a URL was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlOrigin {
    Image,
    Background,
    Css,
}

/// One suspicious resource of an email.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub url: String,
    pub origin: UrlOrigin,
    pub domain: Option<String>,
    pub threat_level: Option<ThreatLevel>,
    pub source: Option<String>,
    pub matched_patterns: Vec<String>,
    pub classification: Classification,
    pub threat_score: u32,
}

impl Finding {
    pub fn is_malicious(&self) -> bool {
        self.threat_score >= 10
    }
}

/// Overall risk of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Clean,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub urls_extracted: usize,
    pub findings: Vec<Finding>,
    pub total_threat_score: u32,
    pub risk: RiskLevel,
}

/// Resource URLs of `body`, deduplicated, first origin wins.
pub fn extract_urls(body: &str) -> Vec<(String, UrlOrigin)> {
    let mut seen = BTreeSet::new();
    let mut urls = Vec::new();
    let sources: [(&Regex, UrlOrigin); 3] = [
        (&*IMG_SRC, UrlOrigin::Image),
        (&*BACKGROUND, UrlOrigin::Background),
        (&*CSS_URL, UrlOrigin::Css),
    ];
    for (pattern, origin) in sources {
        for capture in pattern.captures_iter(body) {
            let url = capture[1].trim().to_string();
            if url.starts_with("data:") || url.starts_with("cid:") {
                continue;
            }
            if seen.insert(url.clone()) {
                urls.push((url, origin));
            }
        }
    }
    urls
}

/// Scans a decoded email body.
#[instrument(skip_all, fields(body_len = body.len()))]
pub fn scan_body(index: &PatternIndex, classifier: &dyn ContentClassifier, body: &str) -> ScanReport {
    let urls = extract_urls(body);
    let mut findings = Vec::new();

    for (url, origin) in &urls {
        let classification = classifier.classify(url);
        let entry = index.lookup(url);
        let mut matched = index.match_global(url);
        let mut score = classification.threat_contribution;

        if let Some(entry) = &entry {
            matched.extend(index.match_sub_patterns(url, entry));
            score += entry_score(entry.threat_level, entry.confidence);
        }
        if !matched.is_empty() {
            score += 12;
        }
        if entry.is_none() && matched.is_empty() && !classification.is_tracking {
            continue;
        }

        findings.push(Finding {
            url: url.clone(),
            origin: *origin,
            domain: entry
                .as_ref()
                .map(|e| e.base_domain.clone())
                .or_else(|| classification.domain.clone()),
            threat_level: entry.as_ref().map(|e| e.threat_level),
            source: entry.as_ref().map(|e| e.source.clone()),
            matched_patterns: matched,
            classification,
            threat_score: score,
        });
    }

    let total: u32 = findings.iter().map(|f| f.threat_score).sum();
    let risk = assess_risk(&findings, total);
    debug!(urls = urls.len(), findings = findings.len(), ?risk, "Body scanned");

    ScanReport {
        urls_extracted: urls.len(),
        findings,
        total_threat_score: total,
        risk,
    }
}

fn entry_score(level: ThreatLevel, confidence: Confidence) -> u32 {
    let base = 20.0_f64;
    let scaled = match level {
        ThreatLevel::Critical => base * 2.0,
        ThreatLevel::High => base * 1.5,
        ThreatLevel::Medium | ThreatLevel::Low => base,
    };
    let bonus = if confidence == Confidence::High { 10.0 } else { 0.0 };
    (scaled + bonus) as u32
}

fn assess_risk(findings: &[Finding], total: u32) -> RiskLevel {
    let malicious = findings.iter().filter(|f| f.is_malicious()).count();
    let css = findings.iter().filter(|f| f.origin == UrlOrigin::Css).count();
    let adjusted = total + css as u32 * 10;

    if malicious >= 3 || adjusted >= 60 || css >= 2 {
        RiskLevel::Critical
    } else if malicious >= 2 || adjusted >= 30 || css >= 1 {
        RiskLevel::High
    } else if malicious >= 1 || adjusted >= 15 {
        RiskLevel::Medium
    } else if adjusted > 0 {
        RiskLevel::Low
    } else {
        RiskLevel::Clean
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pixelguard_core::model::{Priority, Snapshot};

    use super::*;

    fn index() -> PatternIndex {
        let index = PatternIndex::new(HashMap::from([("mt".to_string(), Priority::High)]));
        index
            .rebuild(&Snapshot::from_sources([(
                "mt",
                vec!["||mailtrack.io^", "/open.gif"],
            )]))
            .unwrap();
        index
    }

    struct KeywordClassifier;

    impl ContentClassifier for KeywordClassifier {
        fn classify(&self, url: &str) -> Classification {
            let hit = url.contains("pixel");
            Classification {
                is_tracking: hit,
                domain: domain::base_domain(url),
                threat_contribution: if hit { 5 } else { 0 },
            }
        }
    }

    #[test]
    fn extracts_img_background_and_css_urls() {
        let body = r#"
            <img width="1" height="1" src="https://mailtrack.io/t/1.gif">
            <td background='https://cdn.example.com/bg.png'>
            <div style="background-image: url(https://px.example.net/a.png)"></div>
            <img src="cid:logo">
        "#;
        let urls = extract_urls(body);
        assert_eq!(
            urls,
            vec![
                ("https://mailtrack.io/t/1.gif".to_string(), UrlOrigin::Image),
                ("https://cdn.example.com/bg.png".to_string(), UrlOrigin::Background),
                ("https://px.example.net/a.png".to_string(), UrlOrigin::Css),
            ]
        );
    }

    #[test]
    fn indexed_domain_is_reported() {
        let index = index();
        let report = scan_body(
            &index,
            &NullClassifier,
            r#"<p>Hi</p><img src="https://www.mailtrack.io/open.gif?u=1">"#,
        );
        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings[0];
        assert_eq!(finding.domain.as_deref(), Some("mailtrack.io"));
        assert_eq!(finding.threat_level, Some(ThreatLevel::High));
        assert!(finding.matched_patterns.contains(&"/open.gif".to_string()));
        assert!(finding.is_malicious());
        assert!(report.risk >= RiskLevel::Medium);
    }

    #[test]
    fn clean_body_is_clean() {
        let report = scan_body(
            &index(),
            &NullClassifier,
            r#"<img src="https://static.example.com/logo.png">"#,
        );
        assert!(report.findings.is_empty());
        assert_eq!(report.risk, RiskLevel::Clean);
        assert_eq!(report.urls_extracted, 1);
    }

    #[test]
    fn classifier_contributes_unknown_domains() {
        let report = scan_body(
            &index(),
            &KeywordClassifier,
            r#"<img src="https://unknown.example.org/pixel.png">"#,
        );
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].threat_score, 5);
        assert_eq!(report.risk, RiskLevel::Low);
    }
}
